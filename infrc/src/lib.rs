//! infrc - reliable, low-latency RPC over InfiniBand reliable connected
//! queue pairs.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────── dispatcher thread ──────────────────────────┐
//! │                                                                       │
//! │  Dispatch ──► InfRcTransport poller          WorkerManager poller     │
//! │               │  client RX CQ ─ nonce match  │  completed queue drain │
//! │               │  server RX CQ ─ qpn registry │  waiting FIFO respawn  │
//! │               │  bootstrap UDP ─ handshakes  │  send_reply            │
//! │               └ RX buffer re-posting         │                        │
//! └───────────────────────────────┬──────────────┴───────────▲────────────┘
//!                                 │ ServerRpc                │ spin-locked
//!                                 ▼                          │ handoff
//!                        worker threads: one service handler invocation each
//! ```
//!
//! Queue-pair bootstrap runs over UDP: the client sends a
//! [`wire::QueuePairTuple`] (SYN), the server builds a queue pair and echoes
//! the client's nonce with its own tuple (SYN/ACK), and both sides plumb
//! their queue pairs from the peer's (LID, QPN, PSN). Receive buffers live
//! on two shared receive queues, one per role, so thousands of connections
//! share a fixed pool; a fixed 8-byte nonce header on every RC message
//! matches responses to requests.
//!
//! The single dispatcher thread performs all transport mutation, connection
//! setup, and reply transmission, so transport structures need no locks.
//! Workers touch only their own RPC plus the completed-RPC handoff queue.
//!
//! Known hazard carried from the design: the handshake pumps the dispatcher
//! while it blocks, so another stack frame may begin using the client setup
//! socket; connection setup should eventually become an event-driven task.
//!
//! # Example
//!
//! ```no_run
//! use infrc::{Buffer, Config, Dispatch, InfRcTransport, ServiceLocator};
//!
//! # fn main() -> infrc::Result<()> {
//! let locator = ServiceLocator::parse("infrc:host=10.0.0.1,port=1100")?;
//! let config = Config::default();
//! let dispatch = Dispatch::new(config.poll_micros);
//! let transport = InfRcTransport::new(dispatch.clone(), config, None)?;
//!
//! let session = transport.open_session(&locator)?;
//! let mut request = Buffer::new();
//! request.append_bytes(&0u16.to_le_bytes()); // opcode
//! request.append_bytes(b"ping");
//! let reply = session.client_send(request)?.wait(&dispatch)?;
//! println!("{} byte reply", reply.total_length());
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hca;
pub mod locator;
pub mod msgbuf;
pub mod server;
pub mod session;
pub mod transport;
pub mod wire;
pub mod worker;

pub use config::Config;
pub use dispatch::{Dispatch, Poller};
pub use error::{Error, Result};
pub use locator::ServiceLocator;
pub use msgbuf::Buffer;
pub use server::ServerRpc;
pub use session::{ClientRpcHandle, InfRcSession, RpcState};
pub use transport::InfRcTransport;
pub use wire::{Status, ILLEGAL_RPC_TYPE};
pub use worker::{Service, WorkerManager};
