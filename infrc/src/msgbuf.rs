//! Scatter-gather message buffers.
//!
//! A [`Buffer`] is an ordered list of byte chunks. Request buffers are
//! usually a single owned chunk, optionally followed by a reference into an
//! externally registered region (the zero-copy send path). Response and
//! request-payload buffers may end with a chunk loaned out of the receive
//! pool; dropping such a chunk hands its buffer back for re-posting to the
//! shared receive queue.

use std::sync::Arc;

use bytes::BytesMut;

use crate::buffer::{Arena, RxReturnQueue};

/// A receive-pool buffer loaned into a message.
///
/// Holds the backing arena alive, but not the transport: when the chunk is
/// dropped, it only enqueues the buffer index on the return queue. The
/// dispatcher performs the actual SRQ re-post.
pub struct LoanedRx {
    ptr: *const u8,
    len: usize,
    index: u32,
    _arena: Arc<Arena>,
    returns: Arc<RxReturnQueue>,
}

// Safety: the pointed-to bytes live in the arena held alive by `_arena`, the
// chunk has exclusive use of them until re-post, and the return queue is
// thread-safe.
unsafe impl Send for LoanedRx {}

impl LoanedRx {
    pub(crate) fn new(
        ptr: *const u8,
        len: usize,
        index: u32,
        arena: Arc<Arena>,
        returns: Arc<RxReturnQueue>,
    ) -> Self {
        Self {
            ptr,
            len,
            index,
            _arena: arena,
            returns,
        }
    }

    fn as_slice(&self) -> &[u8] {
        // Safety: construction guarantees ptr/len name live arena bytes.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for LoanedRx {
    fn drop(&mut self) {
        self.returns.push(self.index);
    }
}

enum Chunk {
    Owned(BytesMut),
    External { ptr: *const u8, len: usize },
    Loaned(LoanedRx),
}

// Safety: owned chunks are heap bytes; loaned chunks are Send by their own
// impl; external chunks are covered by the `append_external` contract.
unsafe impl Send for Chunk {}

impl Chunk {
    fn as_slice(&self) -> &[u8] {
        match self {
            Chunk::Owned(bytes) => bytes,
            // Safety: append_external's contract keeps the region alive.
            Chunk::External { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
            Chunk::Loaned(loaned) => loaned.as_slice(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Chunk::Owned(bytes) => bytes.len(),
            Chunk::External { len, .. } => *len,
            Chunk::Loaned(loaned) => loaned.len,
        }
    }
}

/// An ordered list of byte chunks forming one RPC message.
#[derive(Default)]
pub struct Buffer {
    chunks: Vec<Chunk>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total message length across all chunks.
    pub fn total_length(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    pub fn number_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_length() == 0
    }

    /// Append a copy of `data` as an owned chunk.
    pub fn append_bytes(&mut self, data: &[u8]) {
        self.append_owned(BytesMut::from(data));
    }

    /// Append an owned chunk without copying.
    pub fn append_owned(&mut self, data: BytesMut) {
        if !data.is_empty() {
            self.chunks.push(Chunk::Owned(data));
        }
    }

    /// Append a reference to `len` bytes at `ptr` without copying.
    ///
    /// Used for data living in a caller-registered region (see the
    /// transport's zero-copy send path).
    ///
    /// # Safety
    /// The region must stay valid and unmodified for the buffer's lifetime.
    pub unsafe fn append_external(&mut self, ptr: *const u8, len: usize) {
        if len > 0 {
            self.chunks.push(Chunk::External { ptr, len });
        }
    }

    pub(crate) fn append_loaned(&mut self, loaned: LoanedRx) {
        self.chunks.push(Chunk::Loaned(loaned));
    }

    /// Iterate the chunk byte slices in order.
    pub fn chunk_slices(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(Chunk::as_slice)
    }

    /// If chunk `index` is an external-region reference, its address and
    /// length.
    pub(crate) fn external_chunk(&self, index: usize) -> Option<(u64, u32)> {
        match self.chunks.get(index) {
            Some(Chunk::External { ptr, len }) => Some((*ptr as u64, *len as u32)),
            _ => None,
        }
    }

    /// Copy `dst.len()` bytes starting at message offset `offset` into
    /// `dst`. Returns false if the message is too short.
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) -> bool {
        if offset + dst.len() > self.total_length() {
            return false;
        }
        let mut skip = offset;
        let mut filled = 0;
        for chunk in self.chunk_slices() {
            if filled == dst.len() {
                break;
            }
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            let avail = &chunk[skip..];
            skip = 0;
            let take = avail.len().min(dst.len() - filled);
            dst[filled..filled + take].copy_from_slice(&avail[..take]);
            filled += take;
        }
        filled == dst.len()
    }

    /// Drop all chunks. Loaned chunks hand their buffers back.
    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Flatten the whole message into a vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_length());
        for chunk in self.chunk_slices() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("chunks", &self.number_chunks())
            .field("total_length", &self.total_length())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_flatten() {
        let mut buf = Buffer::new();
        buf.append_bytes(b"hello ");
        buf.append_bytes(b"world");
        assert_eq!(buf.number_chunks(), 2);
        assert_eq!(buf.total_length(), 11);
        assert_eq!(buf.to_vec(), b"hello world");
    }

    #[test]
    fn empty_appends_are_dropped() {
        let mut buf = Buffer::new();
        buf.append_bytes(b"");
        assert_eq!(buf.number_chunks(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn copy_out_crosses_chunk_boundaries() {
        let mut buf = Buffer::new();
        buf.append_bytes(b"abc");
        buf.append_bytes(b"defg");
        buf.append_bytes(b"hi");

        let mut out = [0u8; 5];
        assert!(buf.copy_out(2, &mut out));
        assert_eq!(&out, b"cdefg");

        let mut all = [0u8; 9];
        assert!(buf.copy_out(0, &mut all));
        assert_eq!(&all, b"abcdefghi");

        let mut too_far = [0u8; 3];
        assert!(!buf.copy_out(8, &mut too_far));
    }

    #[test]
    fn external_chunks_are_referenced_not_copied() {
        let backing = [7u8; 32];
        let mut buf = Buffer::new();
        buf.append_bytes(b"hdr");
        // Safety: `backing` outlives `buf` in this scope.
        unsafe { buf.append_external(backing.as_ptr(), backing.len()) };

        assert_eq!(buf.number_chunks(), 2);
        assert_eq!(buf.total_length(), 3 + backing.len());
        assert_eq!(
            buf.external_chunk(1),
            Some((backing.as_ptr() as u64, backing.len() as u32))
        );
        assert_eq!(&buf.to_vec()[3..], &backing[..]);
    }

    #[test]
    fn external_chunk_names_only_external_chunks() {
        let backing = [1u8; 8];
        let mut buf = Buffer::new();
        buf.append_bytes(b"hdr");
        buf.append_bytes(b"owned");
        assert_eq!(buf.external_chunk(0), None);
        assert_eq!(buf.external_chunk(1), None);

        // Safety: `backing` outlives `buf` in this scope.
        unsafe { buf.append_external(backing.as_ptr(), backing.len()) };
        assert_eq!(buf.external_chunk(1), None);
        assert_eq!(
            buf.external_chunk(2),
            Some((backing.as_ptr() as u64, backing.len() as u32))
        );
        assert_eq!(buf.external_chunk(3), None);
    }

    #[test]
    fn dropping_a_loaned_chunk_returns_its_buffer() {
        let arena = Arena::new(4096).unwrap();
        let returns = RxReturnQueue::new();

        {
            let mut buf = Buffer::new();
            // Safety: ptr/len are in-bounds of the arena held by the chunk.
            let loaned = LoanedRx::new(arena.as_ptr(), 16, 7, arena.clone(), returns.clone());
            buf.append_loaned(loaned);
            assert_eq!(buf.total_length(), 16);
            assert_eq!(returns.pop(), None);
        }

        assert_eq!(returns.pop(), Some(7));
        assert_eq!(returns.pop(), None);
    }
}
