//! Error types for the infrc transport.

use std::io;

use thiserror::Error;

/// Error type for transport and dispatch operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A verbs or socket resource could not be created. Fatal at startup.
    #[error("transport setup failed: {0}")]
    Setup(String),

    /// IO error from the bootstrap sockets.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The service locator string could not be parsed.
    #[error("bad service locator `{locator}`: {reason}")]
    Locator { locator: String, reason: String },

    /// The queue-pair handshake never produced a matching reply.
    #[error("handshake with {peer} timed out after {attempts} attempts")]
    HandshakeTimeout { peer: String, attempts: u32 },

    /// A message (plus its wire header) does not fit in one registered buffer.
    #[error("message of {len} bytes exceeds maximum rpc size of {max} bytes")]
    MessageTooLong { len: usize, max: usize },

    /// A posted work request was rejected by the HCA.
    #[error("failed to post {op} work request: {source}")]
    PostFailed {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A receive completed with an error status; the buffer was re-posted.
    #[error("receive completed with status {status}")]
    ReceiveFailed { status: &'static str },

    /// The RPC's session was released while the RPC was outstanding.
    #[error("rpc cancelled: session released")]
    Cancelled,

    /// The session never completed its handshake, or its queue pair is gone.
    #[error("session is not connected")]
    NotConnected,
}

/// Result type for transport and dispatch operations.
pub type Result<T> = std::result::Result<T, Error>;
