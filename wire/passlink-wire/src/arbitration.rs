//! CAN arbitration pair: the request/reply addressing a channel transmits
//! and listens with.

use crate::helpers::{put_u32, read_u32};

/// Request/reply address pair programmed into an adapter channel.
///
/// Serialized as 14 bytes:
/// `request:u32 ‖ request_extension:u8 ‖ reply_pattern:u32 ‖
/// reply_mask:u32 ‖ reply_extension:u8`, all big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arbitration {
    /// Request (or source) CAN identifier.
    pub request: u32,
    /// Request address extension (extended-addressing byte).
    pub request_extension: u8,
    /// Reply pattern (or destination) identifier.
    pub reply_pattern: u32,
    /// Reply mask; `0` passes every identifier.
    pub reply_mask: u32,
    /// Reply address extension.
    pub reply_extension: u8,
}

impl Default for Arbitration {
    fn default() -> Self {
        Self {
            request: 0,
            request_extension: 0,
            reply_pattern: 0,
            reply_mask: 0xFFFF_FFFF,
            reply_extension: 0,
        }
    }
}

impl Arbitration {
    /// Serialized size in bytes.
    pub const SIZE: usize = 14;

    /// Append the 14-byte wire form to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        put_u32(out, self.request);
        out.push(self.request_extension);
        put_u32(out, self.reply_pattern);
        put_u32(out, self.reply_mask);
        out.push(self.reply_extension);
    }

    /// Serialize into a fresh vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut out);
        out
    }

    /// Parse the 14-byte wire form; `None` if `data` is too short.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            request: read_u32(&data[0..4]),
            request_extension: data[4],
            reply_pattern: read_u32(&data[5..9]),
            reply_mask: read_u32(&data[9..13]),
            reply_extension: data[13],
        })
    }
}
