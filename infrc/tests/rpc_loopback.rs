//! End-to-end tests over a loopback connection: one process acting as both
//! server and client, the way a cluster node talks to itself.
//!
//! These need an InfiniBand HCA with an active port. When no device is
//! available the tests print a notice and pass vacuously, so the rest of the
//! suite stays runnable on plain machines.

use std::rc::Rc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use infrc::wire::{RequestCommon, ResponseCommon, REQUEST_COMMON_LEN, RESPONSE_COMMON_LEN};
use infrc::{
    Buffer, Config, Dispatch, Error, InfRcTransport, RpcState, Service, ServiceLocator, Status,
    WorkerManager,
};

const ECHO_OPCODE: u16 = 1;

struct EchoService;

impl Service for EchoService {
    fn handle_rpc(&self, _opcode: u16, request: &Buffer, reply: &mut Buffer) {
        reply.append_bytes(&ResponseCommon::new(Status::Ok).to_bytes());
        reply.append_bytes(&request.to_vec()[REQUEST_COMMON_LEN..]);
    }
}

fn test_config() -> Config {
    Config::default()
        .with_max_rpc_size(64 * 1024)
        .with_qp_exchange_timeout(Duration::from_millis(100))
}

fn unique_locator() -> ServiceLocator {
    // Spread test runs over a port range so parallel suites don't collide,
    // and give each test in this process its own port.
    static NEXT: AtomicU16 = AtomicU16::new(0);
    let port = 20000 + (std::process::id() % 8000) as u16 + NEXT.fetch_add(1, Ordering::Relaxed);
    ServiceLocator::parse(&format!("infrc:host=127.0.0.1,port={port}")).unwrap()
}

/// Build a server+client transport, or skip when no HCA is present.
fn try_transport(
    dispatch: &Rc<Dispatch>,
    locator: &ServiceLocator,
) -> Option<Rc<InfRcTransport>> {
    match InfRcTransport::new(dispatch.clone(), test_config(), Some(locator)) {
        Ok(transport) => Some(transport),
        Err(e) => {
            eprintln!("skipping loopback test (no usable HCA): {e}");
            None
        }
    }
}

fn echo_request(payload: &[u8]) -> Buffer {
    let mut raw = [0u8; REQUEST_COMMON_LEN];
    RequestCommon {
        opcode: ECHO_OPCODE,
    }
    .write_to(&mut raw);
    let mut request = Buffer::new();
    request.append_bytes(&raw);
    request.append_bytes(payload);
    request
}

#[test]
fn echo_round_trip_over_loopback() {
    let locator = unique_locator();
    let dispatch = Dispatch::new(10_000);
    let Some(transport) = try_transport(&dispatch, &locator) else {
        return;
    };
    let manager = Rc::new(WorkerManager::new(Arc::new(EchoService), 4));
    transport.attach_worker_manager(manager);

    let session = transport.open_session(&locator).unwrap();
    assert_eq!(transport.num_server_connections(), 1);

    let reply = session
        .client_send(echo_request(b"01234567"))
        .unwrap()
        .wait(&dispatch)
        .unwrap();
    let body = reply.to_vec();
    let status = ResponseCommon::read_from(&body).unwrap();
    assert_eq!(Status::from_u32(status.status), Some(Status::Ok));
    assert_eq!(&body[RESPONSE_COMMON_LEN..], b"01234567");
}

#[test]
fn admission_control_queues_the_thirty_third_rpc() {
    let locator = unique_locator();
    let dispatch = Dispatch::new(10_000);
    let Some(transport) = try_transport(&dispatch, &locator) else {
        return;
    };
    let manager = Rc::new(WorkerManager::new(Arc::new(EchoService), 4));
    transport.attach_worker_manager(manager);

    let session = transport.open_session(&locator).unwrap();

    // Issue one more RPC than the client SRQ can buffer responses for,
    // without pumping the dispatcher in between.
    let depth = 32usize;
    let mut handles = Vec::new();
    for i in 0..depth + 1 {
        let payload = (i as u64).to_le_bytes();
        handles.push(session.client_send(echo_request(&payload)).unwrap());
    }

    let sent = handles
        .iter()
        .filter(|h| h.state() == RpcState::RequestSent)
        .count();
    let pending = handles
        .iter()
        .filter(|h| h.state() == RpcState::Pending)
        .count();
    assert_eq!(sent, depth);
    assert_eq!(pending, 1);

    // Once responses flow and receive buffers are re-posted, the deferred
    // RPC goes out and everything completes.
    for (i, handle) in handles.into_iter().enumerate() {
        let reply = handle.wait(&dispatch).unwrap();
        let body = reply.to_vec();
        assert_eq!(&body[RESPONSE_COMMON_LEN..], &(i as u64).to_le_bytes());
    }
}

#[test]
fn zero_copy_requests_take_the_gather_path() {
    let locator = unique_locator();
    let dispatch = Dispatch::new(10_000);
    let Some(transport) = try_transport(&dispatch, &locator) else {
        return;
    };
    let manager = Rc::new(WorkerManager::new(Arc::new(EchoService), 4));
    transport.attach_worker_manager(manager);

    // Stand-in for the long-lived log a real deployment registers; leaked
    // so it outlives the transport, per the registration contract.
    let mut bytes = vec![0u8; 8192];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = i as u8;
    }
    let region: &'static [u8] = Box::leak(bytes.into_boxed_slice());
    // Safety: the region is leaked and never modified after this point.
    unsafe {
        transport
            .register_zero_copy_region(region.as_ptr(), region.len())
            .unwrap();
    }

    let session = transport.open_session(&locator).unwrap();
    let mut raw = [0u8; REQUEST_COMMON_LEN];
    RequestCommon {
        opcode: ECHO_OPCODE,
    }
    .write_to(&mut raw);

    // Two chunks with the bulk half inside the registered region: the
    // request goes out as a two-segment gather.
    let mut request = Buffer::new();
    request.append_bytes(&raw);
    // Safety: points into the leaked region.
    unsafe { request.append_external(region[256..].as_ptr(), 1024) };
    let reply = session.client_send(request).unwrap().wait(&dispatch).unwrap();
    assert_eq!(transport.num_zero_copy_transmits(), 1);
    assert_eq!(&reply.to_vec()[RESPONSE_COMMON_LEN..], &region[256..1280]);

    // Bulk chunk outside the registered region: full copy path, same
    // bytes on the wire.
    let outside: &'static [u8] = Box::leak(vec![0x5au8; 512].into_boxed_slice());
    let mut request = Buffer::new();
    request.append_bytes(&raw);
    // Safety: `outside` is leaked.
    unsafe { request.append_external(outside.as_ptr(), outside.len()) };
    let reply = session.client_send(request).unwrap().wait(&dispatch).unwrap();
    assert_eq!(transport.num_zero_copy_transmits(), 1);
    assert_eq!(&reply.to_vec()[RESPONSE_COMMON_LEN..], &outside[..]);

    // A three-chunk request never takes the gather path, even when its
    // middle chunk is in-region.
    let mut request = Buffer::new();
    request.append_bytes(&raw);
    // Safety: points into the leaked region.
    unsafe { request.append_external(region.as_ptr(), 128) };
    request.append_bytes(b"tail");
    let reply = session.client_send(request).unwrap().wait(&dispatch).unwrap();
    assert_eq!(transport.num_zero_copy_transmits(), 1);
    let body = reply.to_vec();
    assert_eq!(
        &body[RESPONSE_COMMON_LEN..RESPONSE_COMMON_LEN + 128],
        &region[..128]
    );
    assert_eq!(&body[RESPONSE_COMMON_LEN + 128..], b"tail");
}

#[test]
fn unknown_opcode_is_answered_with_unimplemented() {
    let locator = unique_locator();
    let dispatch = Dispatch::new(10_000);
    let Some(transport) = try_transport(&dispatch, &locator) else {
        return;
    };
    let manager = Rc::new(WorkerManager::new(Arc::new(EchoService), 4));
    transport.attach_worker_manager(manager);

    let session = transport.open_session(&locator).unwrap();

    let mut raw = [0u8; REQUEST_COMMON_LEN];
    RequestCommon {
        opcode: infrc::ILLEGAL_RPC_TYPE,
    }
    .write_to(&mut raw);
    let mut request = Buffer::new();
    request.append_bytes(&raw);

    let reply = session
        .client_send(request)
        .unwrap()
        .wait(&dispatch)
        .unwrap();
    let status = ResponseCommon::read_from(&reply.to_vec()).unwrap();
    assert_eq!(
        Status::from_u32(status.status),
        Some(Status::UnimplementedRequest)
    );
}

#[test]
fn handshake_exhaustion_surfaces_a_connection_error() {
    let dispatch = Dispatch::new(10_000);

    // Client-only transport; nothing listens at the target locator.
    let config = test_config()
        .with_qp_exchange_timeout(Duration::from_millis(10))
        .with_qp_exchange_max_timeouts(3);
    let transport = match InfRcTransport::new(dispatch.clone(), config, None) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("skipping loopback test (no usable HCA): {e}");
            return;
        }
    };

    let dead = ServiceLocator::parse("infrc:host=127.0.0.1,port=19999").unwrap();
    let start = Instant::now();
    match transport.open_session(&dead) {
        Ok(_) => panic!("expected handshake timeout, got a session"),
        Err(Error::HandshakeTimeout { attempts, .. }) => assert_eq!(attempts, 3),
        Err(other) => panic!("expected handshake timeout, got {other}"),
    }
    assert!(start.elapsed() >= Duration::from_millis(30));
}
