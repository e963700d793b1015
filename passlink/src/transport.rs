//! The transport port: a byte pipe to the adapter, and the connection
//! string grammar resolving endpoints.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::tcp::TcpTransport;

/// Default TCP endpoint of an adapter in access-point mode.
pub const DEFAULT_TCP_HOST: &str = "192.168.42.42";
/// Default TCP port.
pub const DEFAULT_TCP_PORT: u16 = 129;
/// TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default per-receive timeout.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// BLE GATT service advertised by the adapter.
pub const BLE_SERVICE_UUID: &str = "FFF1";
/// Write-without-response characteristic (host to adapter).
pub const BLE_TX_CHARACTERISTIC: &str = "FFF2";
/// Notification characteristic (adapter to host).
pub const BLE_RX_CHARACTERISTIC: &str = "FFF3";

/// Transport failures.
#[derive(Debug)]
pub enum TransportError {
    /// Underlying socket error.
    Io(io::Error),
    /// Operation on a transport that is not connected.
    NotConnected,
    /// The remote side closed the connection. Reported once; afterwards the
    /// transport is disconnected.
    Closed,
    /// No backend for this transport kind in this build.
    Unsupported(&'static str),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(err) => write!(f, "io error: {err}"),
            TransportError::NotConnected => write!(f, "not connected"),
            TransportError::Closed => write!(f, "connection closed by remote"),
            TransportError::Unsupported(what) => write!(f, "unsupported transport: {what}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err)
    }
}

/// A byte pipe to the adapter.
///
/// Implementations own their buffering. One `receive` may return part of a
/// PDU or several PDUs at once; the session layer re-parses across reads.
pub trait Transport: Send {
    /// Establish the connection.
    fn connect(&mut self) -> Result<(), TransportError>;
    /// Tear the connection down. Idempotent.
    fn disconnect(&mut self);
    /// Whether the transport is currently connected.
    fn is_connected(&self) -> bool;
    /// Send bytes; returns the number of bytes accepted.
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;
    /// Receive whatever is available within `timeout`. An empty buffer
    /// means the timeout elapsed without data.
    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

/// A resolved connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Ble { device: String },
}

impl Endpoint {
    /// Parse a connection string.
    ///
    /// - empty → the default TCP endpoint,
    /// - `TCP:host[:port]` (case-insensitive) → TCP,
    /// - `BLE:name-or-mac` → BLE,
    /// - otherwise: strings that contain a dot and consist only of digits,
    ///   dots and colons are `host[:port]`; anything else is a BLE device
    ///   name.
    pub fn parse(name: &str) -> Endpoint {
        let name = name.trim();
        if name.is_empty() {
            return Endpoint::Tcp {
                host: DEFAULT_TCP_HOST.to_string(),
                port: DEFAULT_TCP_PORT,
            };
        }
        if let Some(rest) = strip_prefix_ci(name, "TCP:") {
            return parse_host_port(rest);
        }
        if let Some(rest) = strip_prefix_ci(name, "BLE:") {
            return Endpoint::Ble {
                device: rest.to_string(),
            };
        }
        let addr_like = name.contains('.')
            && name
                .chars()
                .all(|c| c.is_ascii_digit() || c == '.' || c == ':');
        if addr_like {
            return parse_host_port(name);
        }
        Endpoint::Ble {
            device: name.to_string(),
        }
    }

    /// Open a transport for this endpoint.
    ///
    /// BLE endpoints parse and round-trip, but the GATT backend lives
    /// outside this crate; opening one here reports unsupported.
    pub fn open(&self) -> Result<Box<dyn Transport>, TransportError> {
        match self {
            Endpoint::Tcp { host, port } => Ok(Box::new(TcpTransport::new(host.clone(), *port))),
            Endpoint::Ble { .. } => Err(TransportError::Unsupported("BLE")),
        }
    }
}

fn strip_prefix_ci<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    if name.len() >= prefix.len() && name[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&name[prefix.len()..])
    } else {
        None
    }
}

fn parse_host_port(spec: &str) -> Endpoint {
    if let Some((host, port)) = spec.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            let host = if host.is_empty() {
                DEFAULT_TCP_HOST.to_string()
            } else {
                host.to_string()
            };
            return Endpoint::Tcp { host, port };
        }
    }
    let host = if spec.is_empty() {
        DEFAULT_TCP_HOST.to_string()
    } else {
        spec.to_string()
    };
    Endpoint::Tcp {
        host,
        port: DEFAULT_TCP_PORT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(host: &str, port: u16) -> Endpoint {
        Endpoint::Tcp {
            host: host.to_string(),
            port,
        }
    }

    fn ble(device: &str) -> Endpoint {
        Endpoint::Ble {
            device: device.to_string(),
        }
    }

    #[test]
    fn empty_name_is_the_default_tcp_endpoint() {
        assert_eq!(Endpoint::parse(""), tcp(DEFAULT_TCP_HOST, DEFAULT_TCP_PORT));
        assert_eq!(Endpoint::parse("  "), tcp(DEFAULT_TCP_HOST, DEFAULT_TCP_PORT));
    }

    #[test]
    fn explicit_prefixes_win() {
        assert_eq!(Endpoint::parse("TCP:10.0.0.5"), tcp("10.0.0.5", DEFAULT_TCP_PORT));
        assert_eq!(Endpoint::parse("tcp:10.0.0.5:4000"), tcp("10.0.0.5", 4000));
        assert_eq!(Endpoint::parse("TCP:"), tcp(DEFAULT_TCP_HOST, DEFAULT_TCP_PORT));
        assert_eq!(Endpoint::parse("BLE:LinkBox-0042"), ble("LinkBox-0042"));
        assert_eq!(
            Endpoint::parse("ble:AA:BB:CC:DD:EE:FF"),
            ble("AA:BB:CC:DD:EE:FF")
        );
    }

    #[test]
    fn bare_addresses_are_detected_as_tcp() {
        assert_eq!(Endpoint::parse("192.168.42.42"), tcp("192.168.42.42", DEFAULT_TCP_PORT));
        assert_eq!(Endpoint::parse("192.168.42.42:129"), tcp("192.168.42.42", 129));
    }

    #[test]
    fn bare_names_fall_back_to_ble() {
        assert_eq!(Endpoint::parse("LinkBox-0042"), ble("LinkBox-0042"));
        // A dotted hostname with letters is not an address literal.
        assert_eq!(Endpoint::parse("adapter.local"), ble("adapter.local"));
    }
}
