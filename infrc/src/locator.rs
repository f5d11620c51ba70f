//! Service locator parsing.
//!
//! A locator names the UDP endpoint a server uses for queue-pair
//! bootstrapping, plus optionally the HCA device and physical port:
//!
//! ```text
//! infrc:host=10.0.0.1,port=1100
//! infrc:host=10.0.0.1,port=1100,dev=mlx5_0,devport=1
//! ```
//!
//! Unknown options are tolerated so locators can carry extra keys for other
//! consumers.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{Error, Result};

/// A parsed `infrc` service locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLocator {
    /// IPv4 address the server binds its bootstrap socket to.
    pub host: Ipv4Addr,
    /// UDP port of the bootstrap socket.
    pub port: u16,
    /// HCA device name override.
    pub device: Option<String>,
    /// Physical HCA port override.
    pub dev_port: Option<u8>,
    original: String,
}

impl ServiceLocator {
    /// Parse a locator string of the form
    /// `infrc:host=<ipv4>,port=<u16>[,dev=<name>][,devport=<u8>]`.
    pub fn parse(locator: &str) -> Result<Self> {
        let bad = |reason: &str| Error::Locator {
            locator: locator.to_string(),
            reason: reason.to_string(),
        };

        let rest = locator
            .strip_prefix("infrc:")
            .ok_or_else(|| bad("expected `infrc:` scheme"))?;

        let mut host = None;
        let mut port = None;
        let mut device = None;
        let mut dev_port = None;

        for option in rest.split(',').filter(|s| !s.is_empty()) {
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| bad("options must be key=value"))?;
            match key {
                "host" => {
                    host = Some(
                        value
                            .parse::<Ipv4Addr>()
                            .map_err(|_| bad("host is not an ipv4 address"))?,
                    );
                }
                "port" => {
                    port = Some(value.parse::<u16>().map_err(|_| bad("port is not a u16"))?);
                }
                "dev" => device = Some(value.to_string()),
                "devport" => {
                    dev_port =
                        Some(value.parse::<u8>().map_err(|_| bad("devport is not a u8"))?);
                }
                // Unknown options are tolerated.
                _ => {}
            }
        }

        Ok(Self {
            host: host.ok_or_else(|| bad("missing host option"))?,
            port: port.ok_or_else(|| bad("missing port option"))?,
            device,
            dev_port,
            original: locator.to_string(),
        })
    }

    /// The UDP endpoint for bootstrap datagrams.
    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.host, self.port)
    }

    /// The locator string this was parsed from.
    pub fn as_str(&self) -> &str {
        &self.original
    }
}

impl fmt::Display for ServiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}
