//! Transport configuration.
//!
//! All values are deployment-tunable but fixed for the lifetime of a
//! transport instance.

use std::time::Duration;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Depth of each shared receive queue (one for the server side, one for
    /// the client side). Also the client-RPC admission bound.
    /// Default: 32
    pub max_shared_rx_queue_depth: u32,
    /// Capacity of the common transmit completion queue and size of the
    /// transmit buffer pool.
    /// Default: 64
    pub max_tx_queue_depth: u32,
    /// Scatter-gather entries per posted receive.
    /// Default: 1
    pub max_shared_rx_sge_count: u32,
    /// Maximum size of one RPC message, header included. Sized a little above
    /// one storage-log segment so that segment replication fits in a single
    /// message.
    /// Default: 8 MiB + 4 KiB
    pub max_rpc_size: u32,
    /// How long one handshake send waits for a matching reply.
    /// Default: 50 ms
    pub qp_exchange_timeout: Duration,
    /// How many handshake attempts are made before giving up.
    /// Default: 10
    pub qp_exchange_max_timeouts: u32,
    /// How long the dispatcher keeps actively polling with no work before it
    /// yields the core.
    /// Default: 10 ms
    pub poll_micros: u64,
    /// Upper bound on concurrently live worker threads. A request that
    /// arrives while the pool is saturated waits in the FIFO.
    /// Default: 16
    pub max_worker_threads: usize,
    /// HCA device to open; the first available device when `None`.
    pub device: Option<String>,
    /// Physical port on the HCA.
    /// Default: 1
    pub ib_physical_port: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_shared_rx_queue_depth: 32,
            max_tx_queue_depth: 64,
            max_shared_rx_sge_count: 1,
            max_rpc_size: 8 * 1024 * 1024 + 4096,
            qp_exchange_timeout: Duration::from_micros(50_000),
            qp_exchange_max_timeouts: 10,
            poll_micros: 10_000,
            max_worker_threads: 16,
            device: None,
            ib_physical_port: 1,
        }
    }
}

impl Config {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shared receive queue depth.
    pub fn with_rx_queue_depth(mut self, depth: u32) -> Self {
        self.max_shared_rx_queue_depth = depth;
        self
    }

    /// Set the transmit queue depth.
    pub fn with_tx_queue_depth(mut self, depth: u32) -> Self {
        self.max_tx_queue_depth = depth;
        self
    }

    /// Set the maximum RPC size.
    pub fn with_max_rpc_size(mut self, bytes: u32) -> Self {
        self.max_rpc_size = bytes;
        self
    }

    /// Set the handshake timeout per attempt.
    pub fn with_qp_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.qp_exchange_timeout = timeout;
        self
    }

    /// Set the number of handshake attempts.
    pub fn with_qp_exchange_max_timeouts(mut self, attempts: u32) -> Self {
        self.qp_exchange_max_timeouts = attempts;
        self
    }

    /// Set the worker thread cap.
    pub fn with_max_worker_threads(mut self, workers: usize) -> Self {
        self.max_worker_threads = workers;
        self
    }

    /// Set the HCA device name.
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }
}
