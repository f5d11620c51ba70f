//! HCA-registered buffer pools.
//!
//! Each pool allocates one contiguous, page-aligned arena, registers it with
//! the protection domain once, and slices it into fixed-size descriptors.
//! Registration is expensive (tens of microseconds per page), so it happens
//! only at startup.
//!
//! Descriptors are identified by their pool index; the index rides in the
//! `wr_id` of every work request so a completion can name its buffer.
//! Ownership follows the free-list / posted-queue discipline: an index is
//! held by exactly one of the free list, the HCA, or a live message wrapper.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::error::{Error, Result};
use crate::hca::{Hca, MemoryRegion};

/// Buffer alignment; one page, which also keeps descriptors cache-aligned.
pub const ARENA_ALIGN: usize = 4096;

/// A contiguous, page-aligned allocation backing one buffer pool.
///
/// The arena is shared (via `Arc`) with every chunk loaned out of the pool,
/// so the memory cannot disappear under a response buffer that outlives the
/// transport.
pub struct Arena {
    base: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// Safety: the arena is a plain byte allocation; synchronization of access to
// disjoint slices is the pool's and the HCA's responsibility.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Allocate `len` zeroed bytes.
    pub fn new(len: usize) -> Result<Arc<Self>> {
        let layout = Layout::from_size_align(len, ARENA_ALIGN)
            .map_err(|e| Error::Setup(format!("bad arena layout: {e}")))?;
        // Safety: layout has non-zero size for every pool this crate builds.
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw)
            .ok_or_else(|| Error::Setup(format!("failed to allocate {len} byte arena")))?;
        Ok(Arc::new(Self { base, len, layout }))
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Safety: allocated with the stored layout in `new`.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// Identifies one registered buffer: its arena slice and the local key
/// needed to reference it in work requests.
#[derive(Clone)]
pub struct BufferDescriptor {
    arena: Arc<Arena>,
    offset: usize,
    capacity: u32,
    lkey: u32,
    index: u32,
}

impl BufferDescriptor {
    /// Pool index; stashed as `wr_id` in work requests.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Buffer start address as the HCA sees it.
    pub fn addr(&self) -> u64 {
        self.arena.as_ptr() as u64 + self.offset as u64
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    /// The arena backing this descriptor.
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// Raw pointer to byte `offset` of the buffer.
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.capacity as usize);
        // Safety: offset is within the descriptor's slice of the arena.
        unsafe { self.arena.as_ptr().add(self.offset + offset) }
    }

    /// View the first `len` received bytes.
    ///
    /// The caller must hold the descriptor (not posted to the HCA).
    pub fn bytes(&self, len: usize) -> &[u8] {
        debug_assert!(len <= self.capacity as usize);
        // Safety: in-bounds slice of the arena; holder has exclusive use.
        unsafe { std::slice::from_raw_parts(self.ptr_at(0), len) }
    }

    /// Copy `src` into the buffer at `offset`.
    ///
    /// The caller must hold the descriptor (not posted to the HCA).
    pub fn copy_in(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.capacity as usize);
        // Safety: in-bounds, and the holder has exclusive use of the slice.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr_at(offset), src.len());
        }
    }
}

/// A pool of `count` fixed-size registered buffers over one arena.
pub struct RegisteredBufferPool {
    arena: Arc<Arena>,
    _mr: MemoryRegion,
    lkey: u32,
    buffer_size: u32,
    count: u32,
}

impl RegisteredBufferPool {
    /// Allocate and register `count` buffers of `buffer_size` bytes each.
    pub fn new(hca: &Hca, buffer_size: u32, count: u32) -> Result<Self> {
        let total = buffer_size as usize * count as usize;
        let arena = Arena::new(total)?;
        // Safety: the arena is owned by the pool and outlives the
        // registration.
        let mr = unsafe { hca.register_region(arena.as_ptr(), total)? };
        let lkey = mr.lkey();
        Ok(Self {
            arena,
            _mr: mr,
            lkey,
            buffer_size,
            count,
        })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// The descriptor for pool slot `index`.
    pub fn descriptor(&self, index: u32) -> BufferDescriptor {
        assert!(index < self.count, "buffer index {index} out of range");
        BufferDescriptor {
            arena: self.arena.clone(),
            offset: index as usize * self.buffer_size as usize,
            capacity: self.buffer_size,
            lkey: self.lkey,
            index,
        }
    }
}

/// Receive buffers on their way back to a shared receive queue.
///
/// A loaned chunk cannot touch the HCA from an arbitrary thread, so dropping
/// it pushes the buffer index here; the dispatcher drains this queue in its
/// poll loop and performs the actual re-post (and kicks any deferred client
/// send).
pub struct RxReturnQueue {
    returns: SegQueue<u32>,
}

impl RxReturnQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            returns: SegQueue::new(),
        })
    }

    /// Hand a buffer index back for re-posting.
    pub fn push(&self, index: u32) {
        self.returns.push(index);
    }

    /// Next buffer awaiting re-post, if any.
    pub fn pop(&self) -> Option<u32> {
        self.returns.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_is_aligned_and_zeroed() {
        let arena = Arena::new(8192).unwrap();
        assert_eq!(arena.len(), 8192);
        assert_eq!(arena.as_ptr() as usize % ARENA_ALIGN, 0);
        // Safety: freshly allocated arena, exclusively owned here.
        let bytes = unsafe { std::slice::from_raw_parts(arena.as_ptr(), arena.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn return_queue_is_fifo() {
        let queue = RxReturnQueue::new();
        queue.push(3);
        queue.push(9);
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(9));
        assert_eq!(queue.pop(), None);
    }
}
