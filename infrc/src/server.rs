//! Server-side RPC objects.

use crate::msgbuf::Buffer;

/// One inbound request and the reply being built for it.
///
/// Created by the transport's poller when a request completes on the server
/// receive queue, handed to the worker manager, serviced on a worker thread,
/// and finally consumed by the transport's `send_reply` on the dispatcher.
///
/// Carries the number of the queue pair the request arrived on rather than
/// the queue pair itself: the reply path resolves the QP through the
/// registry on the dispatcher thread, so a torn-down connection simply drops
/// the reply.
pub struct ServerRpc {
    pub(crate) qpn: u32,
    pub(crate) nonce: u64,
    /// The request payload, typically backed by a loaned receive buffer.
    pub request: Buffer,
    /// The reply payload, filled by the service handler.
    pub reply: Buffer,
    /// Monotone id assigned by the worker manager.
    pub(crate) id: u64,
    /// Opcode parsed from the request header by the worker manager.
    pub(crate) opcode: u16,
}

impl ServerRpc {
    pub(crate) fn new(qpn: u32, nonce: u64, request: Buffer) -> Self {
        Self {
            qpn,
            nonce,
            request,
            reply: Buffer::new(),
            id: 0,
            opcode: 0,
        }
    }

    /// Number of the queue pair this request arrived on.
    pub fn qpn(&self) -> u32 {
        self.qpn
    }

    /// The nonce the reply will carry.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }
}
