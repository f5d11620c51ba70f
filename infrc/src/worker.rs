//! The worker-dispatch engine.
//!
//! The dispatcher accepts inbound RPCs from the transport and multiplexes
//! their execution over short-lived worker threads. Admission is FIFO: once
//! any request is waiting for a worker, later requests queue behind it, so
//! replies under overload leave in arrival order. Workers run exactly one
//! service handler invocation and then terminate; they communicate with the
//! dispatcher only through the spin-locked completed queue, which keeps
//! every other structure here dispatcher-private.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{error, trace, warn};

use crate::msgbuf::Buffer;
use crate::server::ServerRpc;
use crate::wire::{RequestCommon, ResponseCommon, Status, ILLEGAL_RPC_TYPE, REQUEST_COMMON_LEN};

/// The external request handler contract.
///
/// `request` starts with the already-validated [`RequestCommon`]; the
/// handler fills `reply`, which must start with a [`ResponseCommon`]. A
/// panicking handler is a programming error and aborts the process.
pub trait Service: Send + Sync + 'static {
    fn handle_rpc(&self, opcode: u16, request: &Buffer, reply: &mut Buffer);
}

/// Replace `reply` with a well-formed error response.
pub fn prepare_error_response(reply: &mut Buffer, status: Status) {
    reply.clear();
    reply.append_bytes(&ResponseCommon::new(status).to_bytes());
}

/// State shared between the dispatcher and worker threads.
struct WorkerShared {
    /// RPCs whose handler has finished, awaiting `send_reply` on the
    /// dispatcher. The only cross-thread queue in the engine.
    completed: spin::Mutex<VecDeque<ServerRpc>>,
    /// Live worker threads; bounds spawning.
    active_workers: AtomicUsize,
}

/// Aborts the process if dropped during a panic. Armed around the service
/// handler call: a handler that unwinds would otherwise strand its RPC and
/// leak its receive buffer accounting.
struct AbortOnPanic;

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("service handler panicked; aborting");
            process::abort();
        }
    }
}

/// Dispatcher-side manager for the worker pool.
pub struct WorkerManager {
    service: Arc<dyn Service>,
    shared: Arc<WorkerShared>,
    /// RPCs accepted but not yet running on a worker. Dispatcher only.
    waiting: RefCell<VecDeque<ServerRpc>>,
    /// RPCs handed to workers whose reply has not been transmitted yet.
    outstanding: Cell<usize>,
    next_id: Cell<u64>,
    max_workers: usize,
}

impl WorkerManager {
    pub fn new(service: Arc<dyn Service>, max_workers: usize) -> Self {
        Self {
            service,
            shared: Arc::new(WorkerShared {
                completed: spin::Mutex::new(VecDeque::new()),
                active_workers: AtomicUsize::new(0),
            }),
            waiting: RefCell::new(VecDeque::new()),
            outstanding: Cell::new(0),
            next_id: Cell::new(0),
            max_workers,
        }
    }

    /// Accept a fully-received RPC for servicing. Dispatcher thread only.
    ///
    /// Requests without a parseable header and requests naming an opcode no
    /// service implements are answered immediately through `reply_now` with
    /// a structured error status; no worker is involved.
    pub fn handle_rpc(&self, mut rpc: ServerRpc, reply_now: &mut dyn FnMut(ServerRpc)) {
        let mut raw = [0u8; REQUEST_COMMON_LEN];
        let header = if rpc.request.copy_out(0, &mut raw) {
            RequestCommon::read_from(&raw)
        } else {
            None
        };

        let opcode = match header {
            None => {
                warn!(
                    len = rpc.request.total_length(),
                    "incoming rpc contains no request header"
                );
                prepare_error_response(&mut rpc.reply, Status::MessageTooShort);
                reply_now(rpc);
                return;
            }
            Some(common) if common.opcode >= ILLEGAL_RPC_TYPE => {
                warn!(opcode = common.opcode, "incoming rpc contained unknown opcode");
                prepare_error_response(&mut rpc.reply, Status::UnimplementedRequest);
                reply_now(rpc);
                return;
            }
            Some(common) => common.opcode,
        };

        rpc.opcode = opcode;
        self.outstanding.set(self.outstanding.get() + 1);

        // FIFO discipline: anything already waiting goes first.
        if !self.waiting.borrow().is_empty() {
            trace!(opcode, "rpc deferred; workers busy");
            self.waiting.borrow_mut().push_back(rpc);
            return;
        }

        rpc.id = self.next_id.get();
        self.next_id.set(rpc.id + 1);
        if let Err(rpc) = self.try_spawn(rpc) {
            trace!("rpc deferred; worker pool saturated");
            self.waiting.borrow_mut().push_back(rpc);
        }
    }

    /// Spawn a worker for `rpc`, or hand it back if the pool is saturated.
    fn try_spawn(&self, rpc: ServerRpc) -> std::result::Result<(), ServerRpc> {
        if self.shared.active_workers.load(Ordering::Acquire) >= self.max_workers {
            return Err(rpc);
        }
        self.shared.active_workers.fetch_add(1, Ordering::AcqRel);

        let shared = self.shared.clone();
        let service = self.service.clone();
        let id = rpc.id;
        let spawned = thread::Builder::new()
            .name(format!("infrc-worker-{id}"))
            .spawn(move || worker_main(shared, service, rpc));
        if let Err(e) = spawned {
            // The rpc moved into the closure and is gone; the peer will time
            // out. Spawn failure below the cap means the OS is out of
            // threads, which is not recoverable by queueing.
            self.shared.active_workers.fetch_sub(1, Ordering::AcqRel);
            self.outstanding.set(self.outstanding.get() - 1);
            error!(error = %e, "failed to spawn worker thread; dropping rpc");
        }
        Ok(())
    }

    /// Drain completed RPCs: transmit each reply through `send_reply` and
    /// refill the worker pool from the waiting FIFO. Dispatcher thread only.
    ///
    /// Returns true if any reply was sent.
    pub fn poll(&self, send_reply: &mut dyn FnMut(ServerRpc)) -> bool {
        let mut found_work = false;
        loop {
            // Hold the spinlock only for the pop.
            let rpc = self.shared.completed.lock().pop_front();
            let Some(rpc) = rpc else { break };
            found_work = true;

            // Highest priority: a completion means a worker slot freed, so
            // start the waiting head. Dequeue only on spawn success.
            let waiting_head = self.waiting.borrow_mut().pop_front();
            if let Some(waiting) = waiting_head {
                if let Err(back) = self.try_spawn(waiting) {
                    self.waiting.borrow_mut().push_front(back);
                }
            }

            trace!(id = rpc.id, opcode = rpc.opcode, "dispatch thread sending reply");
            send_reply(rpc);
            self.outstanding.set(self.outstanding.get() - 1);
        }
        found_work
    }

    /// True when no accepted RPC is awaiting a worker or a reply.
    pub fn idle(&self) -> bool {
        self.outstanding.get() == 0
    }

    /// RPCs handed to the engine whose reply has not been transmitted.
    pub fn num_outstanding(&self) -> usize {
        self.outstanding.get()
    }
}

/// Top-level worker thread body: run the handler once, then hand the RPC
/// back to the dispatcher.
fn worker_main(shared: Arc<WorkerShared>, service: Arc<dyn Service>, mut rpc: ServerRpc) {
    trace!(id = rpc.id, opcode = rpc.opcode, "worker thread received rpc");

    {
        let _bomb = AbortOnPanic;
        service.handle_rpc(rpc.opcode, &rpc.request, &mut rpc.reply);
    }

    // Release the execution slot before the handoff so the dispatcher can
    // spawn a replacement the moment it sees this completion.
    shared.active_workers.fetch_sub(1, Ordering::AcqRel);
    shared.completed.lock().push_back(rpc);
    trace!(id = rpc.id, "worker thread completed rpc; dispatch signaled");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RESPONSE_COMMON_LEN;
    use crossbeam::channel::{unbounded, Receiver, Sender};
    use std::time::{Duration, Instant};

    fn request(opcode: u16, payload: &[u8]) -> Buffer {
        let mut raw = [0u8; REQUEST_COMMON_LEN];
        RequestCommon { opcode }.write_to(&mut raw);
        let mut buf = Buffer::new();
        buf.append_bytes(&raw);
        buf.append_bytes(payload);
        buf
    }

    fn response_status(reply: &Buffer) -> Option<Status> {
        let mut raw = [0u8; RESPONSE_COMMON_LEN];
        if !reply.copy_out(0, &mut raw) {
            return None;
        }
        ResponseCommon::read_from(&raw).and_then(|c| Status::from_u32(c.status))
    }

    /// Echoes the request payload behind an OK status.
    struct EchoService;

    impl Service for EchoService {
        fn handle_rpc(&self, _opcode: u16, request: &Buffer, reply: &mut Buffer) {
            reply.append_bytes(&ResponseCommon::new(Status::Ok).to_bytes());
            reply.append_bytes(&request.to_vec()[REQUEST_COMMON_LEN..]);
        }
    }

    /// Blocks each invocation until the test releases it.
    struct GatedService {
        gate: Receiver<()>,
    }

    impl Service for GatedService {
        fn handle_rpc(&self, _opcode: u16, request: &Buffer, reply: &mut Buffer) {
            self.gate.recv().unwrap();
            reply.append_bytes(&ResponseCommon::new(Status::Ok).to_bytes());
            reply.append_bytes(&request.to_vec()[REQUEST_COMMON_LEN..]);
        }
    }

    fn drain_until(
        manager: &WorkerManager,
        replies: &mut Vec<ServerRpc>,
        count: usize,
        release: Option<&Sender<()>>,
    ) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while replies.len() < count {
            if let Some(gate) = release {
                // Keep a token available so whichever worker is running can
                // finish.
                let _ = gate.try_send(());
            }
            manager.poll(&mut |rpc| replies.push(rpc));
            assert!(Instant::now() < deadline, "timed out waiting for replies");
            thread::yield_now();
        }
    }

    #[test]
    fn short_request_gets_error_reply_without_worker() {
        let manager = WorkerManager::new(Arc::new(EchoService), 4);
        let mut buf = Buffer::new();
        buf.append_bytes(&[0x01]); // one byte: too short for a header
        let rpc = ServerRpc::new(7, 1, buf);

        let mut replies = Vec::new();
        manager.handle_rpc(rpc, &mut |r| replies.push(r));

        assert_eq!(replies.len(), 1);
        assert_eq!(response_status(&replies[0].reply), Some(Status::MessageTooShort));
        assert_eq!(manager.num_outstanding(), 0);
        assert!(manager.idle());
    }

    #[test]
    fn unknown_opcode_gets_error_reply_without_worker() {
        let manager = WorkerManager::new(Arc::new(EchoService), 4);
        let rpc = ServerRpc::new(7, 1, request(ILLEGAL_RPC_TYPE, b""));

        let mut replies = Vec::new();
        manager.handle_rpc(rpc, &mut |r| replies.push(r));

        assert_eq!(replies.len(), 1);
        assert_eq!(
            response_status(&replies[0].reply),
            Some(Status::UnimplementedRequest)
        );
        assert!(manager.idle());
    }

    #[test]
    fn one_rpc_round_trips_through_a_worker() {
        let manager = WorkerManager::new(Arc::new(EchoService), 4);
        let rpc = ServerRpc::new(3, 99, request(1, b"payload"));

        let mut errors = Vec::new();
        manager.handle_rpc(rpc, &mut |r| errors.push(r));
        assert!(errors.is_empty());
        assert_eq!(manager.num_outstanding(), 1);

        let mut replies = Vec::new();
        drain_until(&manager, &mut replies, 1, None);

        assert_eq!(replies[0].nonce(), 99);
        assert_eq!(response_status(&replies[0].reply), Some(Status::Ok));
        assert_eq!(&replies[0].reply.to_vec()[RESPONSE_COMMON_LEN..], b"payload");
        assert!(manager.idle());
    }

    #[test]
    fn overload_preserves_fifo_reply_order() {
        let (release, gate) = unbounded();
        let manager = WorkerManager::new(Arc::new(GatedService { gate }), 1);

        let mut errors = Vec::new();
        for i in 0u8..4 {
            let rpc = ServerRpc::new(1, i as u64, request(1, &[i]));
            manager.handle_rpc(rpc, &mut |r| errors.push(r));
        }
        assert!(errors.is_empty());
        assert_eq!(manager.num_outstanding(), 4);

        let mut replies = Vec::new();
        drain_until(&manager, &mut replies, 4, Some(&release));

        let order: Vec<u64> = replies.iter().map(|r| r.nonce()).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert!(manager.idle());
    }
}
