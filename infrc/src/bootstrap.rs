//! Client side of the queue-pair bootstrap handshake.
//!
//! Connected queue pairs need their peers' (LID, QPN, PSN) before they can
//! carry traffic, so the endpoints trade [`QueuePairTuple`]s over UDP: the
//! client sends its tuple (think SYN), the server constructs a queue pair
//! and answers with its own tuple echoing the client's nonce (think
//! SYN/ACK). Datagrams can be lost or delayed, so replies are matched by
//! nonce and each attempt is bounded by a deadline.

use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::error::Result;
use crate::wire::{QueuePairTuple, QP_TUPLE_LEN};

/// Perform one send + wait-for-reply cycle against `server`.
///
/// The outgoing tuple is sent once; replies are then drained until one
/// carries the outgoing nonce or `timeout` elapses. A reply with a different
/// nonce is a straggler answering an earlier attempt: it is logged and
/// skipped without consuming the attempt. Returns `Ok(None)` on timeout.
///
/// `pump` runs once per wait iteration. When the caller is the dispatcher
/// thread it must pump the dispatcher here, so a server in the same process
/// can answer. (Known hazard: another stack frame may start using the setup
/// socket while we are pumped; see the crate docs.)
pub fn exchange_tuples(
    socket: &UdpSocket,
    server: SocketAddr,
    outgoing: &QueuePairTuple,
    timeout: Duration,
    mut pump: impl FnMut(),
) -> Result<Option<QueuePairTuple>> {
    let packet = outgoing.to_bytes();
    let mut remaining = timeout;
    let mut have_sent = false;

    loop {
        let start = Instant::now();

        if !have_sent {
            match socket.send_to(&packet, server) {
                Ok(len) if len == QP_TUPLE_LEN => have_sent = true,
                Ok(len) => {
                    error!(len, %server, "short send of handshake datagram");
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "short handshake send",
                    )
                    .into());
                }
                Err(e) if would_block(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut reply = [0u8; QP_TUPLE_LEN + 1];
        match socket.recv_from(&mut reply) {
            Ok((len, from)) => {
                if len != QP_TUPLE_LEN {
                    warn!(len, %from, "dropping handshake datagram with unexpected length");
                } else if let Some(incoming) = QueuePairTuple::from_bytes(&reply[..len]) {
                    if incoming.nonce == outgoing.nonce {
                        return Ok(Some(incoming));
                    }
                    warn!(
                        "received nonce {:#018x} does not match {:#018x}; ignoring straggler",
                        incoming.nonce, outgoing.nonce
                    );
                }
            }
            Err(e) if would_block(&e) => {}
            Err(e) => return Err(e.into()),
        }

        let elapsed = start.elapsed();
        if elapsed >= remaining {
            return Ok(None);
        }
        remaining -= elapsed;

        pump();
    }
}

fn would_block(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn client_socket() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        socket
    }

    fn spawn_server(reply: impl Fn(QueuePairTuple, usize) -> Vec<Vec<u8>> + Send + 'static) -> SocketAddr {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || {
            let mut buf = [0u8; 64];
            let mut count = 0;
            while let Ok((len, from)) = server.recv_from(&mut buf) {
                if let Some(tuple) = QueuePairTuple::from_bytes(&buf[..len]) {
                    for datagram in reply(tuple, count) {
                        server.send_to(&datagram, from).unwrap();
                    }
                    count += 1;
                }
            }
        });
        addr
    }

    #[test]
    fn matching_reply_completes_the_exchange() {
        let server = spawn_server(|tuple, _| {
            vec![QueuePairTuple::new(9, 42, 7, tuple.nonce).to_bytes().to_vec()]
        });
        let socket = client_socket();
        let outgoing = QueuePairTuple::new(1, 2, 3, 0x1234_5678_9abc_def0);

        let got = exchange_tuples(&socket, server, &outgoing, Duration::from_secs(2), || {
            thread::yield_now()
        })
        .unwrap()
        .expect("expected a matching reply");
        assert_eq!(got.lid, 9);
        assert_eq!(got.qpn, 42);
        assert_eq!(got.nonce, outgoing.nonce);
    }

    #[test]
    fn short_and_mismatched_datagrams_are_skipped() {
        let server = spawn_server(|tuple, _| {
            vec![
                // Too short: dropped.
                vec![0u8; QP_TUPLE_LEN - 3],
                // Stale nonce: a straggler from an earlier attempt.
                QueuePairTuple::new(5, 5, 5, tuple.nonce ^ 1).to_bytes().to_vec(),
                // The real reply.
                QueuePairTuple::new(8, 88, 6, tuple.nonce).to_bytes().to_vec(),
            ]
        });
        let socket = client_socket();
        let outgoing = QueuePairTuple::new(1, 2, 3, 77);

        let got = exchange_tuples(&socket, server, &outgoing, Duration::from_secs(2), || {
            thread::yield_now()
        })
        .unwrap()
        .expect("expected the third datagram to match");
        assert_eq!(got.qpn, 88);
    }

    #[test]
    fn unreachable_server_times_out() {
        // Bind a socket and drop it so nothing answers.
        let dead = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = dead.local_addr().unwrap();
        drop(dead);

        let socket = client_socket();
        let outgoing = QueuePairTuple::new(1, 2, 3, 4);
        let start = Instant::now();
        let got = exchange_tuples(&socket, addr, &outgoing, Duration::from_millis(50), || {
            thread::yield_now()
        })
        .unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn pump_runs_while_waiting() {
        let dead = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = dead.local_addr().unwrap();
        drop(dead);

        let socket = client_socket();
        let outgoing = QueuePairTuple::new(1, 2, 3, 4);
        let mut pumped = 0u32;
        exchange_tuples(&socket, addr, &outgoing, Duration::from_millis(20), || {
            pumped += 1
        })
        .unwrap();
        assert!(pumped > 0);
    }
}
