//! Error types: the Pass-Thru status codes surfaced to API callers and the
//! internal session error taxonomy they are translated from.

use std::fmt;

use passlink_wire::{PduType, WireError};

use crate::transport::TransportError;

/// Pass-Thru (04.04) status codes. `0x00` (no error) is represented by
/// `Ok(())` on the Rust side; this enum carries the failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NotSupported = 0x01,
    InvalidChannelId = 0x02,
    InvalidProtocolId = 0x03,
    NullParameter = 0x04,
    InvalidIoctlValue = 0x05,
    InvalidFlags = 0x06,
    Failed = 0x07,
    DeviceNotConnected = 0x08,
    Timeout = 0x09,
    InvalidMsg = 0x0A,
    InvalidTimeInterval = 0x0B,
    ExceededLimit = 0x0C,
    InvalidMsgId = 0x0D,
    DeviceInUse = 0x0E,
    InvalidIoctlId = 0x0F,
    BufferEmpty = 0x10,
    BufferFull = 0x11,
    BufferOverflow = 0x12,
    PinInvalid = 0x13,
    ChannelInUse = 0x14,
    MsgProtocolId = 0x15,
    InvalidFilterId = 0x16,
    NoFlowControl = 0x17,
    NotUnique = 0x18,
    InvalidBaudrate = 0x19,
    InvalidDeviceId = 0x1A,
}

impl ErrorCode {
    /// Numeric status value of the published API.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NotSupported => "not supported",
            ErrorCode::InvalidChannelId => "invalid channel ID",
            ErrorCode::InvalidProtocolId => "invalid protocol ID",
            ErrorCode::NullParameter => "null parameter",
            ErrorCode::InvalidIoctlValue => "invalid ioctl value",
            ErrorCode::InvalidFlags => "invalid flags",
            ErrorCode::Failed => "failed",
            ErrorCode::DeviceNotConnected => "device not connected",
            ErrorCode::Timeout => "timeout",
            ErrorCode::InvalidMsg => "invalid message",
            ErrorCode::InvalidTimeInterval => "invalid time interval",
            ErrorCode::ExceededLimit => "exceeded limit",
            ErrorCode::InvalidMsgId => "invalid message ID",
            ErrorCode::DeviceInUse => "device in use",
            ErrorCode::InvalidIoctlId => "invalid ioctl ID",
            ErrorCode::BufferEmpty => "buffer empty",
            ErrorCode::BufferFull => "buffer full",
            ErrorCode::BufferOverflow => "buffer overflow",
            ErrorCode::PinInvalid => "pin invalid",
            ErrorCode::ChannelInUse => "channel in use",
            ErrorCode::MsgProtocolId => "message protocol ID mismatch",
            ErrorCode::InvalidFilterId => "invalid filter ID",
            ErrorCode::NoFlowControl => "no flow control",
            ErrorCode::NotUnique => "not unique",
            ErrorCode::InvalidBaudrate => "invalid baudrate",
            ErrorCode::InvalidDeviceId => "invalid device ID",
        };
        f.write_str(name)
    }
}

/// Failures surfaced by the session layer.
#[derive(Debug)]
pub enum SessionError {
    /// The transport failed or is not connected.
    Transport(TransportError),
    /// No matching response arrived within the request window.
    Timeout,
    /// The adapter answered with a negative PDU.
    Adapter(PduType),
    /// The reply arrived but its payload could not be decoded.
    Protocol(WireError),
}

impl SessionError {
    /// Translate into the Pass-Thru status code per the error table:
    /// transport and connection problems map to "device not connected",
    /// response expiry to "timeout", everything else to "failed".
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SessionError::Transport(_) => ErrorCode::DeviceNotConnected,
            SessionError::Timeout => ErrorCode::Timeout,
            SessionError::Adapter(_) | SessionError::Protocol(_) => ErrorCode::Failed,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Transport(err) => write!(f, "transport error: {err}"),
            SessionError::Timeout => write!(f, "response timeout"),
            SessionError::Adapter(kind) => write!(f, "{}", kind.error_name()),
            SessionError::Protocol(err) => write!(f, "protocol error: {err}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Transport(err) => Some(err),
            SessionError::Protocol(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        SessionError::Transport(err)
    }
}

impl From<WireError> for SessionError {
    fn from(err: WireError) -> Self {
        SessionError::Protocol(err)
    }
}
