//! Echo server and round-trip latency client for the infrc transport.
//!
//! Run the server on one host:
//!
//! ```text
//! infrc-bench serve infrc:host=10.0.0.1,port=1100
//! ```
//!
//! and point the client at it from another:
//!
//! ```text
//! infrc-bench ping infrc:host=10.0.0.1,port=1100 --iterations 10000 --size 64
//! ```

use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::info;

use infrc::wire::{RequestCommon, ResponseCommon, REQUEST_COMMON_LEN, RESPONSE_COMMON_LEN};
use infrc::{Buffer, Config, Dispatch, InfRcTransport, Service, ServiceLocator, Status, WorkerManager};

const ECHO_OPCODE: u16 = 1;

#[derive(Debug, Parser)]
#[command(about = "infrc echo benchmark")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the echo server at the given locator.
    Serve {
        /// e.g. infrc:host=10.0.0.1,port=1100
        locator: String,
    },
    /// Measure echo round-trip latency against a server.
    Ping {
        /// e.g. infrc:host=10.0.0.1,port=1100
        locator: String,

        #[arg(short, long, default_value_t = 1000)]
        iterations: usize,

        /// Echo payload size in bytes.
        #[arg(short, long, default_value_t = 64)]
        size: usize,
    },
}

/// Replies with the request payload behind an OK status.
struct EchoService;

impl Service for EchoService {
    fn handle_rpc(&self, _opcode: u16, request: &Buffer, reply: &mut Buffer) {
        reply.append_bytes(&ResponseCommon::new(Status::Ok).to_bytes());
        reply.append_bytes(&request.to_vec()[REQUEST_COMMON_LEN..]);
    }
}

fn serve(locator: &str) -> infrc::Result<()> {
    let locator = ServiceLocator::parse(locator)?;
    let config = Config::default();
    let dispatch = Dispatch::new(config.poll_micros);
    let max_workers = config.max_worker_threads;

    let transport = InfRcTransport::new(dispatch.clone(), config, Some(&locator))?;
    let manager = std::rc::Rc::new(WorkerManager::new(Arc::new(EchoService), max_workers));
    transport.attach_worker_manager(manager);

    info!(%locator, "echo server running");
    dispatch.run();
    Ok(())
}

fn ping(locator: &str, iterations: usize, size: usize) -> infrc::Result<()> {
    let locator = ServiceLocator::parse(locator)?;
    let config = Config::default();
    let dispatch = Dispatch::new(config.poll_micros);

    let transport = InfRcTransport::new(dispatch.clone(), config, None)?;
    let session = transport.open_session(&locator)?;
    info!(%locator, qpn = ?session.qpn(), "connected");

    let payload = vec![0xabu8; size];
    let mut header = [0u8; REQUEST_COMMON_LEN];
    RequestCommon {
        opcode: ECHO_OPCODE,
    }
    .write_to(&mut header);

    let mut latencies = Vec::with_capacity(iterations);
    for i in 0..iterations {
        let mut request = Buffer::new();
        request.append_bytes(&header);
        request.append_bytes(&payload);

        let start = Instant::now();
        let reply = session.client_send(request)?.wait(&dispatch)?;
        latencies.push(start.elapsed());

        let body = reply.to_vec();
        assert!(body.len() >= RESPONSE_COMMON_LEN, "runt reply");
        assert_eq!(&body[RESPONSE_COMMON_LEN..], &payload[..], "echo mismatch");
        if i == 0 {
            info!(bytes = body.len(), "first echo verified");
        }
    }

    latencies.sort();
    let total: std::time::Duration = latencies.iter().sum();
    println!(
        "{iterations} echoes of {size} bytes: median {:?}, p99 {:?}, mean {:?}",
        latencies[latencies.len() / 2],
        latencies[latencies.len() * 99 / 100],
        total / iterations as u32,
    );
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Serve { locator } => serve(&locator),
        Command::Ping {
            locator,
            iterations,
            size,
        } => ping(&locator, iterations, size),
    };

    if let Err(e) = outcome {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
