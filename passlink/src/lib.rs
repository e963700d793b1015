//! `passlink`: the host-side core that bridges a diagnostic API to a remote
//! CAN/K-Line adapter speaking the framed PDU protocol from
//! [`passlink_wire`].
//!
//! Layering, bottom up:
//! - [`transport`]: the byte-pipe port (TCP today, BLE endpoints resolved
//!   but served by an external backend) plus the connection-string grammar.
//! - [`session`]: one request/response channel multiplexed with
//!   asynchronous frame delivery over a single transport.
//! - [`manager`]: the process-global device/channel registry implementing
//!   the Pass-Thru verbs: open/connect, read/write, filters, periodic
//!   messages, IOCTL.
//!
//! Everything runs on OS threads with blocking I/O and condition
//! variables; no async runtime is involved. Lock order, outermost first:
//! manager registry, channel state, session internals, channel RX queue.

pub mod device;
pub mod error;
pub mod manager;
pub mod mock;
pub mod passthru;
pub mod session;
pub mod tcp;
pub mod transport;

pub use error::{ErrorCode, SessionError};
pub use manager::DeviceManager;
pub use passthru::{PassThruMsg, SConfig};
pub use session::{Expected, Session};
pub use tcp::TcpTransport;
pub use transport::{Endpoint, Transport, TransportError};

use std::sync::OnceLock;
use std::time::Instant;

/// Monotonic microseconds since the process first asked for a timestamp.
/// Used to stamp received frames and loopback messages.
pub fn timestamp_micros() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}
