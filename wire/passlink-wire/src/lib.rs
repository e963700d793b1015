//! `passlink-wire`: the framed PDU codec spoken between a diagnostic host
//! and a remote CAN/K-Line adapter.
//!
//! A PDU on the wire is a fixed four-byte header followed by an optional
//! payload:
//!
//! ```text
//! [ SYNC:0x1F | TYPE:u8 | LEN:u16be | <payload...> ]
//! ```
//!
//! The type byte selects one of a closed set of commands, positive replies,
//! asynchronous deliveries and negative replies (see [`PduType`]). All
//! multi-byte integers are big-endian. Payloads are capped at 65535 bytes,
//! so a PDU is never longer than `4 + 0xFFFF` bytes.
//!
//! The codec is stateless over a caller-owned byte buffer: [`Pdu::parse`]
//! reports whether the buffer holds a complete PDU, needs more bytes, or
//! starts with garbage that the caller should skip to resynchronize.
//! [`Pdu::drain`] wraps that loop for streaming use.
//!
//! Bulk data frames can travel LZ4-compressed (`SendCompressed` /
//! `ReceivedCompressed`); the uncompressed length is carried next to the
//! compressed bytes so the decoder can size its output exactly.

pub mod arbitration;
pub mod helpers;
pub mod pdu;

pub use arbitration::Arbitration;
pub use pdu::{CanFrame, ChannelProtocol, DeviceInfo, Parsed, Pdu, PduType, WireError};
pub use pdu::{HEADER_LEN, MAX_BATCH_BYTES, MAX_PAYLOAD_LEN, SYNC};
