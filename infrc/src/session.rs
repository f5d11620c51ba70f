//! Client sessions and the per-RPC state machine.
//!
//! A session owns one reliable connected queue pair to a destination. Each
//! RPC moves `PENDING -> REQUEST_SENT -> RESPONSE_RECEIVED` (or `FAILED`).
//! Sends are admitted against the client receive-buffer budget: every
//! inflight RPC will consume exactly one client-SRQ buffer for its response,
//! so an RPC may only go out while `num_used_client_srq_buffers` is below
//! the SRQ depth. Over-budget RPCs wait in the transport's deferred send
//! queue and are kicked out when a receive buffer is re-posted.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::dispatch::Dispatch;
use crate::error::{Error, Result};
use crate::hca::QueuePair;
use crate::msgbuf::Buffer;
use crate::transport::InfRcTransport;
use crate::wire::HEADER_LEN;

/// Client RPC states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcState {
    /// Not yet transmitted (possibly waiting in the deferred send queue).
    Pending,
    /// On the wire; linked into the outstanding list.
    RequestSent,
    /// Response matched by nonce and delivered.
    ResponseReceived,
    /// The RPC will never complete; see the stored error.
    Failed,
}

pub(crate) struct SessionInner {
    // Declared before `transport` so the queue pair is destroyed while the
    // transport's verbs resources are still alive.
    pub(crate) qp: RefCell<Option<QueuePair>>,
    pub(crate) transport: Rc<InfRcTransport>,
}

pub(crate) struct ClientRpc {
    pub(crate) session: Rc<SessionInner>,
    pub(crate) nonce: u64,
    pub(crate) state: RpcState,
    /// Present until the request is copied onto the wire.
    pub(crate) request: Option<Buffer>,
    /// Present once the response has been matched.
    pub(crate) response: Option<Buffer>,
    pub(crate) error: Option<Error>,
}

impl ClientRpc {
    pub(crate) fn fail(&mut self, error: Error) {
        self.state = RpcState::Failed;
        self.error = Some(error);
    }
}

/// Caller-side handle to one issued RPC.
pub struct ClientRpcHandle {
    rpc: Rc<RefCell<ClientRpc>>,
}

impl ClientRpcHandle {
    pub(crate) fn new(rpc: Rc<RefCell<ClientRpc>>) -> Self {
        Self { rpc }
    }

    /// Current RPC state.
    pub fn state(&self) -> RpcState {
        self.rpc.borrow().state
    }

    /// True once the RPC has a response or has failed.
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), RpcState::ResponseReceived | RpcState::Failed)
    }

    /// Take the outcome if the RPC is finished.
    pub fn try_finish(&self) -> Option<Result<Buffer>> {
        let mut rpc = self.rpc.borrow_mut();
        match rpc.state {
            RpcState::ResponseReceived => Some(Ok(rpc.response.take().unwrap_or_default())),
            RpcState::Failed => Some(Err(rpc.error.take().unwrap_or(Error::Cancelled))),
            _ => None,
        }
    }

    /// Pump the dispatcher until the RPC finishes. Dispatcher thread only.
    pub fn wait(self, dispatch: &Dispatch) -> Result<Buffer> {
        loop {
            if let Some(outcome) = self.try_finish() {
                return outcome;
            }
            dispatch.poll();
        }
    }
}

/// A connection to one `infrc` server.
///
/// Dropping the session cancels its outstanding RPCs and destroys the queue
/// pair.
pub struct InfRcSession {
    pub(crate) inner: Rc<SessionInner>,
}

impl InfRcSession {
    /// Issue an RPC on this session.
    ///
    /// The request must leave room for the wire header. The returned handle
    /// resolves once the poller matches a response nonce.
    pub fn client_send(&self, request: Buffer) -> Result<ClientRpcHandle> {
        let transport = self.inner.transport.clone();
        let max_payload = transport.max_rpc_size() as usize - HEADER_LEN;
        if request.total_length() > max_payload {
            return Err(Error::MessageTooLong {
                len: request.total_length(),
                max: max_payload,
            });
        }
        if self.inner.qp.borrow().is_none() {
            return Err(Error::NotConnected);
        }

        // The nonce binds the response to this RPC across the shared
        // completion queue.
        let rpc = Rc::new(RefCell::new(ClientRpc {
            session: self.inner.clone(),
            nonce: rand::random::<u64>(),
            state: RpcState::Pending,
            request: Some(request),
            response: None,
            error: None,
        }));
        transport.send_or_queue(&rpc)?;
        Ok(ClientRpcHandle::new(rpc))
    }

    /// Local queue pair number, for diagnostics.
    pub fn qpn(&self) -> Option<u32> {
        self.inner.qp.borrow().as_ref().map(|qp| qp.qpn())
    }
}

impl Drop for InfRcSession {
    fn drop(&mut self) {
        self.inner.transport.release_session(&self.inner);
    }
}

impl InfRcTransport {
    /// Transmit `rpc` if a client receive buffer is budgeted for its
    /// response, otherwise park it in the deferred send queue.
    pub(crate) fn send_or_queue(&self, rpc: &Rc<RefCell<ClientRpc>>) -> Result<()> {
        debug_assert_eq!(rpc.borrow().state, RpcState::Pending);

        if self.num_used_client_srq_buffers() < self.rx_queue_depth() {
            let (nonce, request) = {
                let mut r = rpc.borrow_mut();
                let Some(request) = r.request.take() else {
                    r.fail(Error::NotConnected);
                    return Ok(());
                };
                (r.nonce, request)
            };

            let session = rpc.borrow().session.clone();
            let qp = session.qp.borrow();
            let Some(qp) = qp.as_ref() else {
                rpc.borrow_mut().fail(Error::NotConnected);
                return Ok(());
            };

            if let Err(e) = self.post_client_request(qp, nonce, &request) {
                warn!(error = %e, "failed to transmit request");
                rpc.borrow_mut().fail(e);
                return Ok(());
            }

            self.link_outstanding(rpc.clone());
            rpc.borrow_mut().state = RpcState::RequestSent;
            debug!("sent request with nonce {:#018x}", nonce);
        } else {
            debug!("queued send request with nonce {:#018x}", rpc.borrow().nonce);
            self.queue_deferred_send(rpc.clone());
        }
        Ok(())
    }
}
