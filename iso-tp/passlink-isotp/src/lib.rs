//! `passlink-isotp`: ISO 15765-2 segmentation/reassembly state machines.
//!
//! ISO-TP carries payloads of up to 4095 bytes over CAN by splitting them
//! into:
//! - a **Single Frame** for small payloads,
//! - a **First Frame** followed by **Consecutive Frames** for larger ones,
//!   paced by **Flow Control** frames from the receiver.
//!
//! The transceivers here are pure state machines: they consume and produce
//! CAN frame payloads as byte slices and never perform I/O or enforce
//! timing. Each input returns an [`Action`] telling the caller what to do
//! next: deliver a reassembled payload, write frames to the bus (with a
//! minimum inter-frame gap), keep waiting, or record a protocol violation.
//!
//! Two machines share one skeleton:
//! - [`Transceiver`] for classic CAN (8-byte frames, or 7 usable bytes in
//!   extended addressing mode),
//! - [`TransceiverFd`] for CAN FD, which picks the smallest valid DLC per
//!   emitted frame and enforces DLC validity on inbound frames.
//!
//! Violation handling is configurable: [`Behavior::Strict`] surfaces every
//! violation, [`Behavior::Defensive`] resets and re-interprets the frame
//! once, then silently ignores it; real ECUs occasionally emit frames that
//! no standard predicts.

pub mod classic;
pub mod fd;
pub mod frame;

pub use classic::Transceiver;
pub use fd::TransceiverFd;
pub use frame::{FlowStatus, FrameType};

/// Violation handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Reset once and retry the frame as a data frame; swallow a second
    /// failure.
    Defensive,
    /// Surface every protocol violation.
    Strict,
}

/// Addressing mode. Extended addressing reserves one byte per frame for an
/// address extension, shrinking the usable width by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Standard,
    Extended,
}

/// Transfer state of a transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Sending,
    Receiving,
}

/// What the caller must do after feeding the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Reassembly complete; deliver the payload to the application.
    Process(Vec<u8>),
    /// Write these frames to the bus, keeping at least `separation_time_us`
    /// microseconds between them.
    WriteFrames {
        frames: Vec<Vec<u8>>,
        separation_time_us: u32,
    },
    /// State advanced; nothing to emit.
    WaitForMore,
    /// The peer violated the protocol; the reason is a fixed description.
    ProtocolViolation(&'static str),
}

impl Action {
    /// Build a `WriteFrames` action with no pacing requirement.
    fn write(frames: Vec<Vec<u8>>) -> Self {
        Action::WriteFrames {
            frames,
            separation_time_us: 0,
        }
    }
}
