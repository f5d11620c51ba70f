//! The reliable-connected InfiniBand RPC transport.
//!
//! One transport owns: the HCA, two shared receive queues (one fed by
//! server-side queue pairs, one by client-side queue pairs), one common
//! transmit completion queue, the registered receive and transmit buffer
//! pools, the UDP bootstrap sockets, and the queue-pair registry.
//!
//! All receive buffers sit on the two SRQs rather than on per-QP receive
//! queues; a process with thousands of connections would otherwise pin a
//! multi-megabyte buffer per queue pair. Completions name their buffer by
//! pool index stashed in `wr_id`, and server completions name their
//! connection by `qp_num`.
//!
//! Everything here is dispatcher-thread state. The only concessions to
//! other threads are the receive-buffer return queue (fed by message chunks
//! dropped on worker threads) and the worker engine's completed queue.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;

use tracing::{debug, error, info, warn};

use crate::bootstrap;
use crate::buffer::{BufferDescriptor, RegisteredBufferPool, RxReturnQueue};
use crate::config::Config;
use crate::dispatch::{Dispatch, Poller};
use crate::error::{Error, Result};
use crate::hca::{CompletionQueue, Hca, MemoryRegion, QueuePair, SharedReceiveQueue, WorkCompletion};
use crate::locator::ServiceLocator;
use crate::msgbuf::{Buffer, LoanedRx};
use crate::server::ServerRpc;
use crate::session::{ClientRpc, InfRcSession, RpcState, SessionInner};
use crate::wire::{Header, QueuePairTuple, HEADER_LEN, QP_TUPLE_LEN};
use crate::worker::WorkerManager;

/// A caller-registered region used by the zero-copy request path.
#[derive(Clone, Copy)]
struct LogRegion {
    base: u64,
    len: u64,
    lkey: u32,
}

impl LogRegion {
    /// True when `[addr, addr + len)` lies entirely inside the region.
    fn contains(&self, addr: u64, len: u32) -> bool {
        addr >= self.base && addr + len as u64 <= self.base + self.len
    }
}

/// An oversize reply is a service bug, not a wire fault: report it
/// distinctly from the fire-and-forget send failures.
fn report_reply_failure(e: &Error) {
    match e {
        Error::MessageTooLong { len, max } => {
            error!(len = *len, max = *max, "service produced an oversize reply; dropping it")
        }
        _ => warn!(error = %e, "failed to send reply"),
    }
}

pub struct InfRcTransport {
    // Verbs objects are declared before the Hca so they are destroyed while
    // the device context is still open.
    queue_pair_map: RefCell<HashMap<u32, QueuePair>>,
    server_srq: SharedReceiveQueue,
    client_srq: SharedReceiveQueue,
    server_rx_cq: CompletionQueue,
    client_rx_cq: CompletionQueue,
    common_tx_cq: CompletionQueue,
    rx_pool: RegisteredBufferPool,
    tx_pool: RegisteredBufferPool,
    log_mr: RefCell<Option<MemoryRegion>>,
    hca: Hca,

    config: Config,
    ib_port: u8,
    lid: u16,
    locator: Option<String>,

    client_setup_socket: UdpSocket,
    server_setup_socket: Option<UdpSocket>,

    free_tx_buffers: RefCell<Vec<u32>>,
    tx_wc_scratch: RefCell<Vec<WorkCompletion>>,
    rx_returns: std::sync::Arc<RxReturnQueue>,

    client_send_queue: RefCell<VecDeque<Rc<RefCell<ClientRpc>>>>,
    outstanding_rpcs: RefCell<Vec<Rc<RefCell<ClientRpc>>>>,
    num_used_client_srq_buffers: Cell<u32>,

    log_region: Cell<Option<LogRegion>>,
    num_zero_copy_transmits: Cell<u64>,
    worker_manager: RefCell<Option<Rc<WorkerManager>>>,
    dispatch: Rc<Dispatch>,
}

impl InfRcTransport {
    /// Build a transport and register its poller with `dispatch`.
    ///
    /// With a locator the transport also listens for inbound connections on
    /// the locator's UDP address; without one it is configured for client
    /// use only. Any resource that cannot be created here is fatal.
    pub fn new(
        dispatch: Rc<Dispatch>,
        config: Config,
        locator: Option<&ServiceLocator>,
    ) -> Result<Rc<Self>> {
        let device = locator
            .and_then(|sl| sl.device.clone())
            .or_else(|| config.device.clone());
        let ib_port = locator
            .and_then(|sl| sl.dev_port)
            .unwrap_or(config.ib_physical_port);

        // The kernel assigns the client socket a dynamic port on first use.
        let client_setup_socket = UdpSocket::bind("0.0.0.0:0")
            .map_err(|e| Error::Setup(format!("client setup socket: {e}")))?;
        client_setup_socket
            .set_nonblocking(true)
            .map_err(|e| Error::Setup(format!("client setup socket: {e}")))?;

        let server_setup_socket = match locator {
            None => None,
            Some(sl) => {
                let socket = UdpSocket::bind(sl.socket_addr())
                    .map_err(|e| Error::Setup(format!("bind {}: {e}", sl.socket_addr())))?;
                socket
                    .set_nonblocking(true)
                    .map_err(|e| Error::Setup(format!("server setup socket: {e}")))?;
                info!(address = %sl.socket_addr(), "infrc listening on UDP");
                Some(socket)
            }
        };

        let hca = Hca::open(device.as_deref())?;
        let lid = hca.lid(ib_port)?;

        // Two shared receive queues: all server-side queue pairs feed one,
        // all client-side queue pairs feed the other.
        let depth = config.max_shared_rx_queue_depth;
        let server_srq = hca.create_srq(depth, config.max_shared_rx_sge_count)?;
        let client_srq = hca.create_srq(depth, config.max_shared_rx_sge_count)?;
        let server_rx_cq = hca.create_cq(depth)?;
        let client_rx_cq = hca.create_cq(depth)?;
        let common_tx_cq = hca.create_cq(config.max_tx_queue_depth)?;

        let rx_pool = RegisteredBufferPool::new(&hca, config.max_rpc_size, depth * 2)?;
        let tx_pool = RegisteredBufferPool::new(&hca, config.max_rpc_size, config.max_tx_queue_depth)?;

        let transport = Rc::new(Self {
            queue_pair_map: RefCell::new(HashMap::new()),
            server_srq,
            client_srq,
            server_rx_cq,
            client_rx_cq,
            common_tx_cq,
            rx_pool,
            tx_pool,
            log_mr: RefCell::new(None),
            hca,
            ib_port,
            lid,
            locator: locator.map(|sl| sl.as_str().to_string()),
            client_setup_socket,
            server_setup_socket,
            free_tx_buffers: RefCell::new((0..config.max_tx_queue_depth).collect()),
            tx_wc_scratch: RefCell::new(vec![
                WorkCompletion::zeroed();
                config.max_tx_queue_depth as usize
            ]),
            rx_returns: RxReturnQueue::new(),
            client_send_queue: RefCell::new(VecDeque::new()),
            outstanding_rpcs: RefCell::new(Vec::new()),
            // All receive buffers count as borrowed until the initial posting
            // below hands them to the SRQs.
            num_used_client_srq_buffers: Cell::new(depth),
            log_region: Cell::new(None),
            num_zero_copy_transmits: Cell::new(0),
            worker_manager: RefCell::new(None),
            dispatch: dispatch.clone(),
            config,
        });

        // Post the first half of the receive pool to the server SRQ and the
        // second half to the client SRQ. The client half runs the credit
        // down to zero.
        for index in 0..transport.rx_pool.count() {
            transport.post_srq_receive_and_kick_transmit(index)?;
        }
        debug_assert_eq!(transport.num_used_client_srq_buffers.get(), 0);

        dispatch.register(transport.clone() as Rc<dyn Poller>);
        Ok(transport)
    }

    /// Wire the worker engine in: inbound server RPCs flow to `manager`,
    /// and a poller draining its completed queue into `send_reply` is
    /// registered with the dispatcher.
    pub fn attach_worker_manager(self: &Rc<Self>, manager: Rc<WorkerManager>) {
        *self.worker_manager.borrow_mut() = Some(manager.clone());
        self.dispatch.register(Rc::new(WorkerPoller {
            transport: self.clone(),
            manager,
        }));
    }

    /// The locator this transport serves, if any.
    pub fn service_locator(&self) -> Option<&str> {
        self.locator.as_deref()
    }

    pub fn max_rpc_size(&self) -> u32 {
        self.config.max_rpc_size
    }

    pub(crate) fn rx_queue_depth(&self) -> u32 {
        self.config.max_shared_rx_queue_depth
    }

    pub(crate) fn num_used_client_srq_buffers(&self) -> u32 {
        self.num_used_client_srq_buffers.get()
    }

    /// Number of server-side connections in the registry.
    pub fn num_server_connections(&self) -> usize {
        self.queue_pair_map.borrow().len()
    }

    /// Number of requests that went out through the zero-copy gather path.
    pub fn num_zero_copy_transmits(&self) -> u64 {
        self.num_zero_copy_transmits.get()
    }

    /// Register `len` bytes at `base` for the zero-copy request path: a
    /// two-chunk request whose second chunk lies inside this region is sent
    /// gather-style without copying the bulk data.
    ///
    /// # Safety
    /// The region must stay mapped and unmodified-while-sending for the
    /// transport's lifetime.
    pub unsafe fn register_zero_copy_region(&self, base: *const u8, len: usize) -> Result<()> {
        let mr = self.hca.register_region(base as *mut u8, len)?;
        self.log_region.set(Some(LogRegion {
            base: base as u64,
            len: len as u64,
            lkey: mr.lkey(),
        }));
        *self.log_mr.borrow_mut() = Some(mr);
        info!(len, "registered zero-copy memory region");
        Ok(())
    }

    /// Open a session to the server named by `locator`.
    ///
    /// Blocks on the UDP handshake (bounded by the configured timeouts),
    /// pumping the dispatcher while it waits so a server in this same
    /// process can answer.
    pub fn open_session(self: &Rc<Self>, locator: &ServiceLocator) -> Result<InfRcSession> {
        let qp = self.client_try_setup_queue_pair(SocketAddr::V4(locator.socket_addr()))?;
        Ok(InfRcSession {
            inner: Rc::new(SessionInner {
                qp: RefCell::new(Some(qp)),
                transport: self.clone(),
            }),
        })
    }

    /// Allocate a client queue pair and run the UDP handshake until the
    /// server's tuple arrives or the retry budget is exhausted.
    fn client_try_setup_queue_pair(&self, server: SocketAddr) -> Result<QueuePair> {
        let qp = self.hca.create_queue_pair(
            self.ib_port,
            &self.client_srq,
            &self.common_tx_cq,
            &self.client_rx_cq,
            self.config.max_tx_queue_depth,
            self.config.max_shared_rx_queue_depth,
        )?;

        for attempt in 0..self.config.qp_exchange_max_timeouts {
            // A fresh nonce per attempt lets us tell a late reply to an
            // earlier attempt from the reply we are waiting for.
            let outgoing =
                QueuePairTuple::new(self.lid, qp.qpn(), qp.initial_psn(), rand::random::<u64>());

            let dispatch = self.dispatch.clone();
            let reply = bootstrap::exchange_tuples(
                &self.client_setup_socket,
                server,
                &outgoing,
                self.config.qp_exchange_timeout,
                || {
                    // Let other event handlers run while we wait; essential
                    // when the server is this same process.
                    if dispatch.is_dispatch_thread() {
                        dispatch.poll();
                    }
                },
            )?;

            match reply {
                Some(peer) => {
                    qp.plumb(&peer)?;
                    return Ok(qp);
                }
                None => warn!(attempt, "timed out waiting for handshake response; retrying"),
            }
        }

        warn!(
            peer = %server,
            attempts = self.config.qp_exchange_max_timeouts,
            "failed to exchange queue pairs within the allotted time"
        );
        Err(Error::HandshakeTimeout {
            peer: server.to_string(),
            attempts: self.config.qp_exchange_max_timeouts,
        })
    }

    /// Post receive buffer `index` back to its shared receive queue. For
    /// client buffers this returns one unit of send credit and, if a send
    /// was deferred for lack of credit, kicks the head of that queue.
    pub(crate) fn post_srq_receive_and_kick_transmit(&self, index: u32) -> Result<()> {
        let bd = self.rx_pool.descriptor(index);
        let is_client = index >= self.config.max_shared_rx_queue_depth;
        let srq = if is_client {
            &self.client_srq
        } else {
            &self.server_srq
        };
        srq.post_receive(index as u64, bd.addr(), bd.capacity(), bd.lkey())?;

        if is_client {
            self.num_used_client_srq_buffers
                .set(self.num_used_client_srq_buffers.get() - 1);
            let deferred = self.client_send_queue.borrow_mut().pop_front();
            if let Some(rpc) = deferred {
                debug!("dequeued deferred request with nonce {:#018x}", rpc.borrow().nonce);
                self.send_or_queue(&rpc)?;
            }
        }
        Ok(())
    }

    /// Pop a free transmit buffer, reaping the common transmit completion
    /// queue until one is available. Failed sends are logged and otherwise
    /// dropped; the peer is expected to time out at a higher layer.
    fn get_transmit_buffer(&self) -> Result<BufferDescriptor> {
        loop {
            if let Some(index) = self.free_tx_buffers.borrow_mut().pop() {
                return Ok(self.tx_pool.descriptor(index));
            }

            let mut scratch = self.tx_wc_scratch.borrow_mut();
            let n = self.common_tx_cq.poll(scratch.as_mut_slice())?;
            for wc in &scratch[..n] {
                if !wc.is_success() {
                    error!(
                        wr_id = wc.wr_id(),
                        status = wc.status_str(),
                        "transmit failed"
                    );
                }
                self.free_tx_buffers.borrow_mut().push(wc.wr_id() as u32);
            }
        }
    }

    /// Copy-or-gather a client request onto the wire.
    pub(crate) fn post_client_request(
        &self,
        qp: &QueuePair,
        nonce: u64,
        request: &Buffer,
    ) -> Result<()> {
        let header = Header { nonce };
        let mut header_bytes = [0u8; HEADER_LEN];
        header.write_to(&mut header_bytes);

        // Zero-copy fast path: a two-chunk request whose bulk half already
        // lives in the registered log region goes out as a two-segment
        // gather, copying only the header chunk.
        if request.number_chunks() == 2 {
            if let (Some((addr, len)), Some(region)) =
                (request.external_chunk(1), self.log_region.get())
            {
                if region.contains(addr, len) {
                    let bd = self.get_transmit_buffer()?;
                    bd.copy_in(0, &header_bytes);
                    let mut copied = HEADER_LEN;
                    if let Some(first) = request.chunk_slices().next() {
                        bd.copy_in(copied, first);
                        copied += first.len();
                    }
                    debug!(copied, in_place = len, "sending zero-copy request");
                    let posted = self.post_send_reclaiming(
                        qp,
                        bd,
                        copied as u32,
                        Some((addr, len, region.lkey)),
                    );
                    if posted.is_ok() {
                        self.num_zero_copy_transmits
                            .set(self.num_zero_copy_transmits.get() + 1);
                    }
                    return posted;
                }
            }
        }

        let bd = self.get_transmit_buffer()?;
        bd.copy_in(0, &header_bytes);
        let mut offset = HEADER_LEN;
        for chunk in request.chunk_slices() {
            bd.copy_in(offset, chunk);
            offset += chunk.len();
        }
        self.post_send_reclaiming(qp, bd, offset as u32, None)
    }

    /// Post a send, returning the transmit buffer to the free list if the
    /// post itself is rejected.
    fn post_send_reclaiming(
        &self,
        qp: &QueuePair,
        bd: BufferDescriptor,
        len: u32,
        second: Option<(u64, u32, u32)>,
    ) -> Result<()> {
        let posted = qp.post_send(bd.index() as u64, (bd.addr(), len, bd.lkey()), second);
        if posted.is_err() {
            self.free_tx_buffers.borrow_mut().push(bd.index());
        }
        posted
    }

    /// Transmit the reply for a serviced RPC on the queue pair its request
    /// arrived on. Dispatcher thread only; consumes the RPC.
    pub fn send_reply(&self, rpc: ServerRpc) -> Result<()> {
        let total = HEADER_LEN + rpc.reply.total_length();
        if total > self.config.max_rpc_size as usize {
            return Err(Error::MessageTooLong {
                len: rpc.reply.total_length(),
                max: self.config.max_rpc_size as usize - HEADER_LEN,
            });
        }

        let map = self.queue_pair_map.borrow();
        let Some(qp) = map.get(&rpc.qpn) else {
            // The connection went away while the worker ran.
            warn!(qpn = rpc.qpn, "dropping reply for unknown queue pair");
            return Ok(());
        };

        let bd = self.get_transmit_buffer()?;
        let mut header_bytes = [0u8; HEADER_LEN];
        Header { nonce: rpc.nonce }.write_to(&mut header_bytes);
        bd.copy_in(0, &header_bytes);
        let mut offset = HEADER_LEN;
        for chunk in rpc.reply.chunk_slices() {
            bd.copy_in(offset, chunk);
            offset += chunk.len();
        }

        self.post_send_reclaiming(qp, bd, total as u32, None)?;
        debug!("sent response with nonce {:#018x}", rpc.nonce);
        Ok(())
    }

    pub(crate) fn link_outstanding(&self, rpc: Rc<RefCell<ClientRpc>>) {
        self.outstanding_rpcs.borrow_mut().push(rpc);
        self.num_used_client_srq_buffers
            .set(self.num_used_client_srq_buffers.get() + 1);
    }

    pub(crate) fn queue_deferred_send(&self, rpc: Rc<RefCell<ClientRpc>>) {
        self.client_send_queue.borrow_mut().push_back(rpc);
    }

    /// Cancel everything a dying session still has in flight, then drop its
    /// queue pair.
    pub(crate) fn release_session(&self, session: &Rc<SessionInner>) {
        let mut cancelled = 0usize;
        self.outstanding_rpcs.borrow_mut().retain(|rpc| {
            if Rc::ptr_eq(&rpc.borrow().session, session) {
                rpc.borrow_mut().fail(Error::Cancelled);
                cancelled += 1;
                false
            } else {
                true
            }
        });
        self.client_send_queue.borrow_mut().retain(|rpc| {
            if Rc::ptr_eq(&rpc.borrow().session, session) {
                rpc.borrow_mut().fail(Error::Cancelled);
                cancelled += 1;
                false
            } else {
                true
            }
        });
        if cancelled > 0 {
            warn!(cancelled, "cancelled rpcs on session release");
        }
        session.qp.borrow_mut().take();
    }

    /// One poller invocation: re-post returned receive buffers, drain
    /// client responses, accept at most one server request, and process at
    /// most one bootstrap datagram. The one-at-a-time steps bound dispatcher
    /// latency between the pollable sources.
    fn poll_once(&self) -> Result<bool> {
        let mut found_work = false;

        // Buffers whose message wrappers were dropped (possibly on a worker
        // thread) come home here.
        while let Some(index) = self.rx_returns.pop() {
            self.post_srq_receive_and_kick_transmit(index)?;
            found_work = true;
        }

        // Responses to requests we have made.
        let mut wc = [WorkCompletion::zeroed()];
        while !self.outstanding_rpcs.borrow().is_empty() {
            let n = self.client_rx_cq.poll(&mut wc)?;
            if n == 0 {
                break;
            }
            found_work = true;
            self.process_client_completion(&wc[0])?;
        }

        // Incoming requests, if we are a server.
        if self.server_setup_socket.is_some() {
            let n = self.server_rx_cq.poll(&mut wc)?;
            if n >= 1 {
                found_work = true;
                self.process_server_completion(&wc[0])?;
            }
        }

        if self.server_handle_connect()? {
            found_work = true;
        }

        Ok(found_work)
    }

    fn process_client_completion(&self, wc: &WorkCompletion) -> Result<()> {
        let index = wc.wr_id() as u32;

        if !wc.is_success() {
            error!(status = wc.status_str(), "client receive completed in error");
            self.post_srq_receive_and_kick_transmit(index)?;
            return Err(Error::ReceiveFailed {
                status: wc.status_str(),
            });
        }

        let bd = self.rx_pool.descriptor(index);
        let byte_len = wc.byte_len() as usize;
        let Some(header) = Header::read_from(bd.bytes(byte_len)) else {
            warn!(byte_len, "dropping runt response");
            return self.post_srq_receive_and_kick_transmit(index);
        };
        debug!("received response with nonce {:#018x}", header.nonce);

        let position = self
            .outstanding_rpcs
            .borrow()
            .iter()
            .position(|rpc| rpc.borrow().nonce == header.nonce);
        let Some(position) = position else {
            warn!(
                "dropped response because no nonce matched {:#018x}",
                header.nonce
            );
            return self.post_srq_receive_and_kick_transmit(index);
        };

        let rpc = self.outstanding_rpcs.borrow_mut().remove(position);
        let payload_len = byte_len - HEADER_LEN;
        let mut response = Buffer::new();
        if self.num_used_client_srq_buffers.get() >= self.config.max_shared_rx_queue_depth / 2 {
            // The client SRQ is low on buffers: copy the payload out and
            // hand this one straight back.
            debug!("copying payload and immediately returning client srq buffer");
            response.append_bytes(&bd.bytes(byte_len)[HEADER_LEN..]);
            self.post_srq_receive_and_kick_transmit(index)?;
        } else {
            // Loan the buffer into the response; dropping the response
            // re-posts it.
            debug!("loaning client srq buffer into response");
            response.append_loaned(LoanedRx::new(
                bd.ptr_at(HEADER_LEN),
                payload_len,
                index,
                bd.arena().clone(),
                self.rx_returns.clone(),
            ));
        }

        let mut r = rpc.borrow_mut();
        r.response = Some(response);
        r.state = RpcState::ResponseReceived;
        Ok(())
    }

    fn process_server_completion(&self, wc: &WorkCompletion) -> Result<()> {
        let index = wc.wr_id() as u32;

        if !self.queue_pair_map.borrow().contains_key(&wc.qp_num()) {
            error!(qpn = wc.qp_num(), "failed to find queue pair for completion");
            return self.post_srq_receive_and_kick_transmit(index);
        }

        if !wc.is_success() {
            error!(status = wc.status_str(), "failed to receive rpc");
            return self.post_srq_receive_and_kick_transmit(index);
        }

        let bd = self.rx_pool.descriptor(index);
        let byte_len = wc.byte_len() as usize;
        let Some(header) = Header::read_from(bd.bytes(byte_len)) else {
            warn!(byte_len, "dropping runt request");
            return self.post_srq_receive_and_kick_transmit(index);
        };
        debug!("received request with nonce {:#018x}", header.nonce);

        let mut request = Buffer::new();
        request.append_loaned(LoanedRx::new(
            bd.ptr_at(HEADER_LEN),
            byte_len - HEADER_LEN,
            index,
            bd.arena().clone(),
            self.rx_returns.clone(),
        ));
        let rpc = ServerRpc::new(wc.qp_num(), header.nonce, request);

        let manager = self.worker_manager.borrow().clone();
        match manager {
            Some(manager) => manager.handle_rpc(rpc, &mut |reply| {
                if let Err(e) = self.send_reply(reply) {
                    report_reply_failure(&e);
                }
            }),
            None => warn!("dropping request: no worker manager attached"),
        }
        Ok(())
    }

    /// Accept one bootstrap datagram: construct and plumb a server-side
    /// queue pair from the client's tuple, answer with ours (echoing the
    /// client's nonce), and index the queue pair by its number.
    ///
    /// The handshake keeps no state between datagrams; a client that never
    /// saw our reply will retry and we will build another queue pair.
    fn server_handle_connect(&self) -> Result<bool> {
        let Some(socket) = &self.server_setup_socket else {
            return Ok(false);
        };

        let mut datagram = [0u8; QP_TUPLE_LEN + 1];
        let (len, from) = match socket.recv_from(&mut datagram) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(false)
            }
            Err(e) => return Err(e.into()),
        };

        let Some(incoming) = QueuePairTuple::from_bytes(&datagram[..len]) else {
            warn!(len, %from, "dropping handshake datagram with unexpected length");
            return Ok(true);
        };

        let qp = self.hca.create_queue_pair(
            self.ib_port,
            &self.server_srq,
            &self.common_tx_cq,
            &self.server_rx_cq,
            self.config.max_tx_queue_depth,
            self.config.max_shared_rx_queue_depth,
        )?;
        qp.plumb(&incoming)?;

        let outgoing = QueuePairTuple::new(self.lid, qp.qpn(), qp.initial_psn(), incoming.nonce);
        match socket.send_to(&outgoing.to_bytes(), from) {
            Ok(sent) if sent == QP_TUPLE_LEN => {}
            Ok(sent) => {
                warn!(sent, %from, "short handshake reply; abandoning queue pair");
                return Ok(true);
            }
            Err(e) => {
                warn!(error = %e, %from, "failed to send handshake reply; abandoning queue pair");
                return Ok(true);
            }
        }

        debug!(qpn = qp.qpn(), %from, "accepted connection");
        self.queue_pair_map.borrow_mut().insert(qp.qpn(), qp);
        Ok(true)
    }
}

impl Poller for InfRcTransport {
    fn poll(&self) -> Result<bool> {
        self.poll_once()
    }

    fn name(&self) -> &'static str {
        "infrc-transport"
    }
}

/// Dispatcher poller draining worker-completed RPCs into the transport's
/// reply path.
struct WorkerPoller {
    transport: Rc<InfRcTransport>,
    manager: Rc<WorkerManager>,
}

impl Poller for WorkerPoller {
    fn poll(&self) -> Result<bool> {
        let transport = &self.transport;
        let found_work = self.manager.poll(&mut |rpc| {
            if let Err(e) = transport.send_reply(rpc) {
                report_reply_failure(&e);
            }
        });
        Ok(found_work)
    }

    fn name(&self) -> &'static str {
        "infrc-worker-manager"
    }
}
