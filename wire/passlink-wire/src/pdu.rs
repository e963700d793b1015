//! PDU framing, the type-tag taxonomy, and per-opcode payload layouts.

use std::fmt;

use crate::arbitration::Arbitration;
use crate::helpers::{lz4_compress, lz4_decompress, put_u16, put_u32, read_u16, read_u32};

/// Sync marker opening every wire frame.
pub const SYNC: u8 = 0x1F;
/// Fixed header length: sync, type, 16-bit payload length.
pub const HEADER_LEN: usize = 4;
/// Maximum PDU payload length (the length field is 16 bits).
pub const MAX_PAYLOAD_LEN: usize = 0xFFFF;
/// Maximum payload bytes of one batched `Send` (handle byte plus
/// length-prefixed frame entries).
pub const MAX_BATCH_BYTES: usize = 16384;

/// Protocol selector carried in `OpenChannel` / `OpenFDChannel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelProtocol {
    /// Raw CAN frames, up to 8 data bytes.
    Raw = 0x00,
    /// ISO 15765-2 framing handled by the adapter, up to 4095 bytes.
    Isotp = 0x01,
    /// K-Line (KWP2000 / ISO 9141-2).
    KLine = 0x02,
    /// Raw CAN FD frames, up to 64 data bytes.
    RawFd = 0x03,
    /// ISO 15765-2 over CAN FD.
    IsotpFd = 0x04,
    /// Raw CAN with adapter-side flow control responses.
    RawWithFc = 0x05,
    /// Ethernet (DoIP-style) frames.
    Enet = 0x06,
}

impl ChannelProtocol {
    /// Decode the wire byte.
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x00 => Self::Raw,
            0x01 => Self::Isotp,
            0x02 => Self::KLine,
            0x03 => Self::RawFd,
            0x04 => Self::IsotpFd,
            0x05 => Self::RawWithFc,
            0x06 => Self::Enet,
            _ => return None,
        })
    }
}

/// The closed set of PDU type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PduType {
    // Commands (host -> adapter).
    Ping = 0x10,
    RequestInfo = 0x11,
    ReadVoltage = 0x12,
    OpenChannel = 0x30,
    CloseChannel = 0x31,
    OpenFdChannel = 0x32,
    Send = 0x33,
    SetArbitration = 0x34,
    StartPeriodicMessage = 0x35,
    EndPeriodicMessage = 0x36,
    SendCompressed = 0x37,
    PrepareForUpdate = 0x40,
    SendUpdateData = 0x41,
    CommitUpdate = 0x42,
    Reset = 0x43,
    RpcCall = 0x50,
    RpcSendBinary = 0x51,

    // Positive replies and asynchronous deliveries (adapter -> host).
    Ok = 0x80,
    Pong = 0x90,
    Info = 0x91,
    Voltage = 0x92,
    ChannelOpened = 0xB0,
    ChannelClosed = 0xB1,
    Received = 0xB2,
    ReceivedCompressed = 0xB3,
    PeriodicMessageStarted = 0xB5,
    PeriodicMessageEnded = 0xB6,
    UpdateStartedSendData = 0xC0,
    UpdateDataReceived = 0xC1,
    UpdateCompleted = 0xC2,
    RpcResponse = 0xD0,
    RpcBinaryResponse = 0xD1,

    // Negative replies (0xE0..=0xEF).
    ErrorUnspecified = 0xE0,
    ErrorHardware = 0xE1,
    ErrorInvalidChannel = 0xE2,
    ErrorInvalidPeriodic = 0xE3,
    ErrorNoResponse = 0xE4,
    ErrorInvalidRpc = 0xE5,
    ErrorInvalidCommand = 0xEF,
}

impl PduType {
    /// Decode a wire tag byte; `None` for tags outside the taxonomy.
    pub fn from_raw(raw: u8) -> Option<Self> {
        use PduType::*;
        Some(match raw {
            0x10 => Ping,
            0x11 => RequestInfo,
            0x12 => ReadVoltage,
            0x30 => OpenChannel,
            0x31 => CloseChannel,
            0x32 => OpenFdChannel,
            0x33 => Send,
            0x34 => SetArbitration,
            0x35 => StartPeriodicMessage,
            0x36 => EndPeriodicMessage,
            0x37 => SendCompressed,
            0x40 => PrepareForUpdate,
            0x41 => SendUpdateData,
            0x42 => CommitUpdate,
            0x43 => Reset,
            0x50 => RpcCall,
            0x51 => RpcSendBinary,
            0x80 => Ok,
            0x90 => Pong,
            0x91 => Info,
            0x92 => Voltage,
            0xB0 => ChannelOpened,
            0xB1 => ChannelClosed,
            0xB2 => Received,
            0xB3 => ReceivedCompressed,
            0xB5 => PeriodicMessageStarted,
            0xB6 => PeriodicMessageEnded,
            0xC0 => UpdateStartedSendData,
            0xC1 => UpdateDataReceived,
            0xC2 => UpdateCompleted,
            0xD0 => RpcResponse,
            0xD1 => RpcBinaryResponse,
            0xE0 => ErrorUnspecified,
            0xE1 => ErrorHardware,
            0xE2 => ErrorInvalidChannel,
            0xE3 => ErrorInvalidPeriodic,
            0xE4 => ErrorNoResponse,
            0xE5 => ErrorInvalidRpc,
            0xEF => ErrorInvalidCommand,
            _ => return None,
        })
    }

    /// Whether this tag is a negative reply.
    pub fn is_error(self) -> bool {
        (0xE0..=0xEF).contains(&(self as u8))
    }

    /// Fixed human-readable name of a negative reply.
    pub fn error_name(self) -> &'static str {
        match self {
            PduType::ErrorUnspecified => "Unspecified error",
            PduType::ErrorHardware => "Hardware error",
            PduType::ErrorInvalidChannel => "Invalid channel",
            PduType::ErrorInvalidPeriodic => "Invalid periodic message",
            PduType::ErrorNoResponse => "No response",
            PduType::ErrorInvalidRpc => "Invalid RPC",
            PduType::ErrorInvalidCommand => "Invalid command",
            _ => "Unknown error",
        }
    }
}

/// Decode failures on payload access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Payload too short for the layout of this PDU type.
    Truncated,
    /// The accessor does not apply to this PDU type.
    WrongType,
    /// LZ4 block did not decompress to the stated length.
    Decompress,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated => write!(f, "payload truncated"),
            WireError::WrongType => write!(f, "accessor does not match PDU type"),
            WireError::Decompress => write!(f, "LZ4 decompression failed"),
        }
    }
}

impl std::error::Error for WireError {}

/// Adapter identity strings, newline-separated in the `Info` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor: String,
    pub model: String,
    pub hardware: String,
    pub serial: String,
    pub firmware: String,
}

impl DeviceInfo {
    /// Parse the five newline-separated UTF-8 strings; missing trailing
    /// fields stay empty.
    pub fn parse(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        let mut lines = text.split('\n');
        let mut next = || lines.next().unwrap_or("").to_string();
        Self {
            vendor: next(),
            model: next(),
            hardware: next(),
            serial: next(),
            firmware: next(),
        }
    }
}

/// One inbound CAN data indication decoded from `Received` /
/// `ReceivedCompressed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// Adapter channel handle the frame arrived on.
    pub channel: u8,
    /// CAN identifier.
    pub id: u32,
    /// Address extension byte.
    pub extension: u8,
    /// Frame payload.
    pub data: Vec<u8>,
    /// Monotonic arrival timestamp in microseconds, stamped by the caller.
    pub timestamp_us: u64,
}

/// Outcome of one [`Pdu::parse`] attempt over a streaming buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// Not enough bytes buffered for a complete PDU.
    NeedMore,
    /// The buffer does not start with a frame; drop one byte and retry.
    Garbage,
    /// A well-framed PDU whose type tag is outside the taxonomy; consume
    /// the given byte count and ignore it.
    Skipped(usize),
    /// A complete PDU and the number of bytes it consumed.
    Complete(Pdu, usize),
}

/// A typed frame on the adapter wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pdu_type: PduType,
    payload: Vec<u8>,
}

impl Pdu {
    /// Build a PDU from a type and payload. Payloads longer than
    /// [`MAX_PAYLOAD_LEN`] are truncated to the wire maximum.
    pub fn new(pdu_type: PduType, mut payload: Vec<u8>) -> Self {
        payload.truncate(MAX_PAYLOAD_LEN);
        Self { pdu_type, payload }
    }

    fn bare(pdu_type: PduType) -> Self {
        Self {
            pdu_type,
            payload: Vec::new(),
        }
    }

    /// The type tag.
    pub fn pdu_type(&self) -> PduType {
        self.pdu_type
    }

    /// The raw payload, header excluded.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether this PDU is a negative reply.
    pub fn is_error(&self) -> bool {
        self.pdu_type.is_error()
    }

    /// Fixed message for a negative reply.
    pub fn error_message(&self) -> &'static str {
        self.pdu_type.error_name()
    }

    // --- framing ---------------------------------------------------------

    /// Serialize to the wire form: sync, type, big-endian length, payload.
    pub fn serialize(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_LEN + self.payload.len());
        frame.push(SYNC);
        frame.push(self.pdu_type as u8);
        put_u16(&mut frame, self.payload.len() as u16);
        frame.extend_from_slice(&self.payload);
        frame
    }

    /// Try to parse one PDU from the front of `buf`.
    ///
    /// The codec is stateless; the caller owns the buffer and reacts to the
    /// outcome: keep buffering on [`Parsed::NeedMore`], drop one byte and
    /// retry on [`Parsed::Garbage`], consume the reported count otherwise.
    pub fn parse(buf: &[u8]) -> Parsed {
        if buf.len() < HEADER_LEN {
            return Parsed::NeedMore;
        }
        if buf[0] != SYNC {
            return Parsed::Garbage;
        }
        let payload_len = read_u16(&buf[2..4]) as usize;
        let total = HEADER_LEN + payload_len;
        if buf.len() < total {
            return Parsed::NeedMore;
        }
        match PduType::from_raw(buf[1]) {
            Some(pdu_type) => Parsed::Complete(
                Pdu {
                    pdu_type,
                    payload: buf[HEADER_LEN..total].to_vec(),
                },
                total,
            ),
            None => Parsed::Skipped(total),
        }
    }

    /// Run the resynchronizing parse loop over `buffer`, removing consumed
    /// and garbage bytes, and return the PDUs in byte-arrival order.
    pub fn drain(buffer: &mut Vec<u8>) -> Vec<Pdu> {
        let mut parsed = Vec::new();
        let mut offset = 0;
        while offset < buffer.len() {
            match Pdu::parse(&buffer[offset..]) {
                Parsed::NeedMore => break,
                Parsed::Garbage => offset += 1,
                Parsed::Skipped(used) => offset += used,
                Parsed::Complete(pdu, used) => {
                    parsed.push(pdu);
                    offset += used;
                }
            }
        }
        buffer.drain(..offset);
        parsed
    }

    // --- command constructors (host -> adapter) --------------------------

    /// `Ping`, optionally with an echo payload.
    pub fn ping(payload: Vec<u8>) -> Self {
        Self::new(PduType::Ping, payload)
    }

    pub fn request_info() -> Self {
        Self::bare(PduType::RequestInfo)
    }

    pub fn read_voltage() -> Self {
        Self::bare(PduType::ReadVoltage)
    }

    /// `OpenChannel`: protocol ‖ bitrate ‖ separation-time byte
    /// (high nibble RX code, low nibble TX code).
    pub fn open_channel(
        protocol: ChannelProtocol,
        bitrate: u32,
        rx_separation_us: u16,
        tx_separation_us: u16,
    ) -> Self {
        let mut payload = vec![protocol as u8];
        put_u32(&mut payload, bitrate);
        payload.push(
            (septime_code_from_micros(rx_separation_us) << 4)
                | septime_code_from_micros(tx_separation_us),
        );
        Self::new(PduType::OpenChannel, payload)
    }

    /// `OpenFDChannel`: protocol ‖ bitrate ‖ data bitrate ‖ separation-time
    /// byte.
    pub fn open_fd_channel(
        protocol: ChannelProtocol,
        bitrate: u32,
        data_bitrate: u32,
        rx_separation_us: u16,
        tx_separation_us: u16,
    ) -> Self {
        let mut payload = vec![protocol as u8];
        put_u32(&mut payload, bitrate);
        put_u32(&mut payload, data_bitrate);
        payload.push(
            (septime_code_from_micros(rx_separation_us) << 4)
                | septime_code_from_micros(tx_separation_us),
        );
        Self::new(PduType::OpenFdChannel, payload)
    }

    pub fn close_channel(handle: u8) -> Self {
        Self::new(PduType::CloseChannel, vec![handle])
    }

    /// `Send` with a single frame payload.
    pub fn send(handle: u8, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(handle);
        payload.extend_from_slice(data);
        Self::new(PduType::Send, payload)
    }

    /// Batched `Send`: handle ‖ `{len:u8 ‖ bytes}` per frame. Frames longer
    /// than 255 bytes cannot be batched.
    pub fn send_batch(handle: u8, frames: &[Vec<u8>]) -> Self {
        let mut payload = vec![handle];
        for frame in frames {
            payload.push(frame.len() as u8);
            payload.extend_from_slice(frame);
        }
        Self::new(PduType::Send, payload)
    }

    /// `SendCompressed`: handle ‖ uncompressed length ‖ LZ4 block.
    pub fn send_compressed(handle: u8, data: &[u8]) -> Self {
        let mut payload = vec![handle];
        put_u16(&mut payload, data.len() as u16);
        payload.extend_from_slice(&lz4_compress(data));
        Self::new(PduType::SendCompressed, payload)
    }

    pub fn set_arbitration(handle: u8, arbitration: &Arbitration) -> Self {
        let mut payload = vec![handle];
        arbitration.write_to(&mut payload);
        Self::new(PduType::SetArbitration, payload)
    }

    /// `StartPeriodicMessage`: interval byte (interval = byte × 500 ms on
    /// the adapter) ‖ arbitration ‖ frame data.
    pub fn start_periodic_message(
        interval_byte: u8,
        arbitration: &Arbitration,
        data: &[u8],
    ) -> Self {
        let mut payload = vec![interval_byte];
        arbitration.write_to(&mut payload);
        payload.extend_from_slice(data);
        Self::new(PduType::StartPeriodicMessage, payload)
    }

    pub fn end_periodic_message(handle: u8) -> Self {
        Self::new(PduType::EndPeriodicMessage, vec![handle])
    }

    pub fn prepare_for_update() -> Self {
        Self::bare(PduType::PrepareForUpdate)
    }

    pub fn send_update_data(data: Vec<u8>) -> Self {
        Self::new(PduType::SendUpdateData, data)
    }

    pub fn commit_update() -> Self {
        Self::bare(PduType::CommitUpdate)
    }

    pub fn reset() -> Self {
        Self::bare(PduType::Reset)
    }

    pub fn rpc_call(request: &str) -> Self {
        Self::new(PduType::RpcCall, request.as_bytes().to_vec())
    }

    pub fn rpc_send_binary(name: &str) -> Self {
        Self::new(PduType::RpcSendBinary, name.as_bytes().to_vec())
    }

    // --- reply constructors (adapter -> host) ----------------------------

    pub fn ok() -> Self {
        Self::bare(PduType::Ok)
    }

    /// `Pong` echoing the ping payload.
    pub fn pong(payload: Vec<u8>) -> Self {
        Self::new(PduType::Pong, payload)
    }

    pub fn info(info: &DeviceInfo) -> Self {
        let text = format!(
            "{}\n{}\n{}\n{}\n{}",
            info.vendor, info.model, info.hardware, info.serial, info.firmware
        );
        Self::new(PduType::Info, text.into_bytes())
    }

    pub fn voltage(millivolts: u16) -> Self {
        let mut payload = Vec::with_capacity(2);
        put_u16(&mut payload, millivolts);
        Self::new(PduType::Voltage, payload)
    }

    pub fn channel_opened(handle: u8) -> Self {
        Self::new(PduType::ChannelOpened, vec![handle])
    }

    pub fn channel_closed(handle: u8) -> Self {
        Self::new(PduType::ChannelClosed, vec![handle])
    }

    /// `Received`: handle ‖ id ‖ extension ‖ data.
    pub fn received(handle: u8, id: u32, extension: u8, data: &[u8]) -> Self {
        let mut payload = vec![handle];
        put_u32(&mut payload, id);
        payload.push(extension);
        payload.extend_from_slice(data);
        Self::new(PduType::Received, payload)
    }

    /// `ReceivedCompressed`: handle ‖ id ‖ extension ‖ uncompressed length
    /// ‖ LZ4 block.
    pub fn received_compressed(handle: u8, id: u32, extension: u8, data: &[u8]) -> Self {
        let mut payload = vec![handle];
        put_u32(&mut payload, id);
        payload.push(extension);
        put_u16(&mut payload, data.len() as u16);
        payload.extend_from_slice(&lz4_compress(data));
        Self::new(PduType::ReceivedCompressed, payload)
    }

    pub fn periodic_message_started(handle: u8) -> Self {
        Self::new(PduType::PeriodicMessageStarted, vec![handle])
    }

    pub fn periodic_message_ended(handle: u8) -> Self {
        Self::new(PduType::PeriodicMessageEnded, vec![handle])
    }

    pub fn update_started_send_data() -> Self {
        Self::bare(PduType::UpdateStartedSendData)
    }

    pub fn update_data_received() -> Self {
        Self::bare(PduType::UpdateDataReceived)
    }

    pub fn update_completed() -> Self {
        Self::bare(PduType::UpdateCompleted)
    }

    pub fn rpc_response(body: &str) -> Self {
        Self::new(PduType::RpcResponse, body.as_bytes().to_vec())
    }

    pub fn rpc_binary_response(data: Vec<u8>) -> Self {
        Self::new(PduType::RpcBinaryResponse, data)
    }

    pub fn error(kind: PduType) -> Self {
        debug_assert!(kind.is_error());
        Self::bare(kind)
    }

    // --- payload accessors -----------------------------------------------

    /// Channel handle for the PDU types that lead with one.
    pub fn channel_handle(&self) -> Result<u8, WireError> {
        match self.pdu_type {
            PduType::OpenChannel
            | PduType::CloseChannel
            | PduType::Send
            | PduType::SendCompressed
            | PduType::SetArbitration
            | PduType::ChannelOpened
            | PduType::ChannelClosed
            | PduType::Received
            | PduType::ReceivedCompressed => {
                self.payload.first().copied().ok_or(WireError::Truncated)
            }
            _ => Err(WireError::WrongType),
        }
    }

    /// Periodic-message handle.
    pub fn periodic_handle(&self) -> Result<u8, WireError> {
        match self.pdu_type {
            PduType::EndPeriodicMessage
            | PduType::PeriodicMessageStarted
            | PduType::PeriodicMessageEnded => {
                self.payload.first().copied().ok_or(WireError::Truncated)
            }
            _ => Err(WireError::WrongType),
        }
    }

    /// Battery voltage in millivolts from a `Voltage` reply.
    pub fn voltage_millivolts(&self) -> Result<u16, WireError> {
        if self.pdu_type != PduType::Voltage {
            return Err(WireError::WrongType);
        }
        if self.payload.len() < 2 {
            return Err(WireError::Truncated);
        }
        Ok(read_u16(&self.payload))
    }

    /// Adapter identity from an `Info` reply.
    pub fn device_info(&self) -> Result<DeviceInfo, WireError> {
        if self.pdu_type != PduType::Info {
            return Err(WireError::WrongType);
        }
        Ok(DeviceInfo::parse(&self.payload))
    }

    /// Channel protocol from an `OpenChannel` / `OpenFDChannel`.
    pub fn protocol(&self) -> Result<ChannelProtocol, WireError> {
        match self.pdu_type {
            PduType::OpenChannel | PduType::OpenFdChannel => ChannelProtocol::from_raw(
                *self.payload.first().ok_or(WireError::Truncated)?,
            )
            .ok_or(WireError::Truncated),
            _ => Err(WireError::WrongType),
        }
    }

    /// Bitrate from an `OpenChannel` / `OpenFDChannel`.
    pub fn bitrate(&self) -> Result<u32, WireError> {
        match self.pdu_type {
            PduType::OpenChannel | PduType::OpenFdChannel => {
                if self.payload.len() < 5 {
                    return Err(WireError::Truncated);
                }
                Ok(read_u32(&self.payload[1..5]))
            }
            _ => Err(WireError::WrongType),
        }
    }

    /// `(rx, tx)` separation times in microseconds from an `OpenChannel` /
    /// `OpenFDChannel`.
    pub fn separation_times(&self) -> Result<(u16, u16), WireError> {
        let index = match self.pdu_type {
            PduType::OpenChannel => 5,
            PduType::OpenFdChannel => 9,
            _ => return Err(WireError::WrongType),
        };
        let byte = *self.payload.get(index).ok_or(WireError::Truncated)?;
        Ok((
            micros_from_septime_code(byte >> 4),
            micros_from_septime_code(byte & 0x0F),
        ))
    }

    /// Interval in milliseconds encoded in a `StartPeriodicMessage`.
    pub fn interval_ms(&self) -> Result<u16, WireError> {
        if self.pdu_type != PduType::StartPeriodicMessage {
            return Err(WireError::WrongType);
        }
        let byte = *self.payload.first().ok_or(WireError::Truncated)?;
        Ok(u16::from(byte) * 500)
    }

    /// Arbitration carried by `SetArbitration` / `StartPeriodicMessage`
    /// (after the leading handle or interval byte).
    pub fn arbitration(&self) -> Result<Arbitration, WireError> {
        match self.pdu_type {
            PduType::SetArbitration | PduType::StartPeriodicMessage => {
                Arbitration::parse(self.payload.get(1..).ok_or(WireError::Truncated)?)
                    .ok_or(WireError::Truncated)
            }
            _ => Err(WireError::WrongType),
        }
    }

    /// Raw data bytes of the PDU types that carry frame data.
    pub fn data(&self) -> Result<&[u8], WireError> {
        let offset = match self.pdu_type {
            PduType::Send => 1,
            PduType::Received => 6,
            PduType::SendUpdateData => 0,
            PduType::StartPeriodicMessage => 1 + Arbitration::SIZE,
            _ => return Err(WireError::WrongType),
        };
        self.payload.get(offset..).ok_or(WireError::Truncated)
    }

    /// Stated uncompressed length of a compressed PDU.
    pub fn uncompressed_len(&self) -> Result<u16, WireError> {
        let offset = match self.pdu_type {
            PduType::SendCompressed => 1,
            PduType::ReceivedCompressed => 6,
            _ => return Err(WireError::WrongType),
        };
        let bytes = self
            .payload
            .get(offset..offset + 2)
            .ok_or(WireError::Truncated)?;
        Ok(read_u16(bytes))
    }

    /// Decompressed data bytes of a compressed PDU.
    pub fn uncompressed_data(&self) -> Result<Vec<u8>, WireError> {
        let len = usize::from(self.uncompressed_len()?);
        let offset = match self.pdu_type {
            PduType::SendCompressed => 3,
            PduType::ReceivedCompressed => 8,
            _ => return Err(WireError::WrongType),
        };
        let block = self.payload.get(offset..).ok_or(WireError::Truncated)?;
        lz4_decompress(block, len).ok_or(WireError::Decompress)
    }

    /// Decode a `Received` / `ReceivedCompressed` delivery into a
    /// [`CanFrame`], stamping it with the caller-supplied arrival time.
    pub fn received_frame(&self, timestamp_us: u64) -> Result<CanFrame, WireError> {
        if !matches!(
            self.pdu_type,
            PduType::Received | PduType::ReceivedCompressed
        ) {
            return Err(WireError::WrongType);
        }
        if self.payload.len() < 6 {
            return Err(WireError::Truncated);
        }
        let data = match self.pdu_type {
            PduType::Received => self.payload[6..].to_vec(),
            _ => self.uncompressed_data()?,
        };
        Ok(CanFrame {
            channel: self.payload[0],
            id: read_u32(&self.payload[1..5]),
            extension: self.payload[5],
            data,
            timestamp_us,
        })
    }
}

/// Encode a separation time to its 4-bit wire code, rounding down to the
/// next lower table entry.
pub fn septime_code_from_micros(microseconds: u16) -> u8 {
    match microseconds {
        0..=99 => 0x00,
        100..=199 => 0x07,
        200..=299 => 0x08,
        300..=399 => 0x09,
        400..=499 => 0x0A,
        500..=599 => 0x0B,
        600..=699 => 0x0C,
        700..=799 => 0x0D,
        800..=899 => 0x0E,
        900..=999 => 0x0F,
        1000..=1999 => 0x01,
        2000..=2999 => 0x02,
        3000..=3999 => 0x03,
        4000..=4999 => 0x04,
        5000..=5999 => 0x05,
        _ => 0x06,
    }
}

/// Decode a 4-bit separation-time code to microseconds.
pub fn micros_from_septime_code(code: u8) -> u16 {
    match code {
        0x00 => 0,
        0x01 => 1000,
        0x02 => 2000,
        0x03 => 3000,
        0x04 => 4000,
        0x05 => 5000,
        0x06 => 6000,
        0x07 => 100,
        0x08 => 200,
        0x09 => 300,
        0x0A => 400,
        0x0B => 500,
        0x0C => 600,
        0x0D => 700,
        0x0E => 800,
        _ => 900,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_has_fixed_header() {
        let pdu = Pdu::pong(vec![0x42]);
        assert_eq!(pdu.serialize(), [0x1F, 0x90, 0x00, 0x01, 0x42]);
    }

    #[test]
    fn open_channel_wire_form() {
        let pdu = Pdu::open_channel(ChannelProtocol::Raw, 500_000, 1000, 0);
        assert_eq!(
            pdu.serialize(),
            [0x1F, 0x30, 0x00, 0x06, 0x00, 0x00, 0x07, 0xA1, 0x20, 0x10]
        );
        assert_eq!(pdu.protocol().unwrap(), ChannelProtocol::Raw);
        assert_eq!(pdu.bitrate().unwrap(), 500_000);
        assert_eq!(pdu.separation_times().unwrap(), (1000, 0));
    }

    #[test]
    fn septime_codes_round_down() {
        assert_eq!(septime_code_from_micros(0), 0x00);
        assert_eq!(septime_code_from_micros(99), 0x00);
        assert_eq!(septime_code_from_micros(150), 0x07);
        assert_eq!(septime_code_from_micros(950), 0x0F);
        assert_eq!(septime_code_from_micros(1500), 0x01);
        assert_eq!(septime_code_from_micros(60_000), 0x06);
        for code in 0..=0x0F {
            assert_eq!(septime_code_from_micros(micros_from_septime_code(code)), code);
        }
    }

    #[test]
    fn error_tags_classify_and_name() {
        let pdu = Pdu::error(PduType::ErrorInvalidChannel);
        assert!(pdu.is_error());
        assert_eq!(pdu.error_message(), "Invalid channel");
        assert!(!Pdu::ok().is_error());
        assert!(PduType::ErrorInvalidCommand.is_error());
        assert!(!PduType::Received.is_error());
    }

    #[test]
    fn info_roundtrip() {
        let info = DeviceInfo {
            vendor: "Vanagon Labs".into(),
            model: "LinkBox".into(),
            hardware: "rev C".into(),
            serial: "PL-0042".into(),
            firmware: "2.4.1".into(),
        };
        let pdu = Pdu::info(&info);
        assert_eq!(pdu.device_info().unwrap(), info);
    }

    #[test]
    fn arbitration_accessor_skips_leading_byte() {
        let arb = Arbitration {
            request: 0x7E0,
            ..Arbitration::default()
        };
        let set = Pdu::set_arbitration(3, &arb);
        assert_eq!(set.channel_handle().unwrap(), 3);
        assert_eq!(set.arbitration().unwrap(), arb);

        let periodic = Pdu::start_periodic_message(20, &arb, &[0x01, 0x3E]);
        assert_eq!(periodic.interval_ms().unwrap(), 10_000);
        assert_eq!(periodic.arbitration().unwrap(), arb);
        assert_eq!(periodic.data().unwrap(), &[0x01, 0x3E]);
    }

    #[test]
    fn compressed_payloads_roundtrip() {
        let data: Vec<u8> = (0..200u16).map(|i| (i % 7) as u8).collect();
        let send = Pdu::send_compressed(9, &data);
        assert_eq!(send.channel_handle().unwrap(), 9);
        assert_eq!(usize::from(send.uncompressed_len().unwrap()), data.len());
        assert_eq!(send.uncompressed_data().unwrap(), data);

        let rx = Pdu::received_compressed(9, 0x18DA_F110, 1, &data);
        let frame = rx.received_frame(77).unwrap();
        assert_eq!(frame.id, 0x18DA_F110);
        assert_eq!(frame.extension, 1);
        assert_eq!(frame.data, data);
        assert_eq!(frame.timestamp_us, 77);
    }
}
