//! The CAN-FD ISO-TP transceiver.
//!
//! Same skeleton as the classic machine, with three differences: emitted
//! frames use the smallest valid CAN-FD DLC that holds their content
//! (capped by the configured maximum width), Single Frames switch to the
//! escape encoding (PCI `0x00`, length in byte 1) once the payload reaches
//! 8 bytes, and inbound frames must use a valid CAN-FD DLC.

use crate::frame::{self, FlowStatus, FrameType, MAX_TRANSFER_LEN, PADDING};
use crate::{Action, Behavior, Mode, State};

/// Maximum usable frame width in standard addressing.
pub const MAX_STANDARD_WIDTH: usize = 64;
/// Maximum usable frame width in extended addressing (one byte reserved).
pub const MAX_EXTENDED_WIDTH: usize = 63;

const MIN_STANDARD_WIDTH: usize = 8;
const MIN_EXTENDED_WIDTH: usize = 7;

fn default_max_width(mode: Mode) -> usize {
    match mode {
        Mode::Standard => MAX_STANDARD_WIDTH,
        Mode::Extended => MAX_EXTENDED_WIDTH,
    }
}

/// Whether `width` usable bytes map to a valid CAN-FD DLC in this mode.
pub fn is_valid_fd_width(width: usize, mode: Mode) -> bool {
    match mode {
        Mode::Standard => width <= MAX_STANDARD_WIDTH && frame::is_valid_can_fd_len(width),
        Mode::Extended => {
            width <= MAX_EXTENDED_WIDTH && frame::is_valid_can_fd_len(width + 1)
        }
    }
}

/// Smallest valid usable width holding `required` bytes in this mode.
pub fn next_valid_fd_width(required: usize, mode: Mode) -> usize {
    match mode {
        Mode::Standard => frame::next_valid_can_fd_len(required),
        Mode::Extended => frame::next_valid_can_fd_len(required + 1) - 1,
    }
}

fn single_frame_capacity(width: usize) -> usize {
    if width > 8 { width - 2 } else { width - 1 }
}

/// ISO 15765-2 protocol machine over CAN-FD frames.
pub struct TransceiverFd {
    behavior: Behavior,
    mode: Mode,
    max_frame_width: usize,
    block_size: u8,
    rx_separation_us: u32,
    tx_separation_us: u32,

    state: State,
    sending: Vec<u8>,
    sending_offset: usize,
    sending_sequence: u8,

    receiving: Vec<u8>,
    receiving_sequence: u8,
    receiving_pending: u16,
    receiving_unconfirmed: u16,
}

impl Default for TransceiverFd {
    fn default() -> Self {
        Self::new(Behavior::Defensive, Mode::Standard, 0, 0, 0, 0)
    }
}

impl TransceiverFd {
    /// Create a CAN-FD transceiver.
    ///
    /// `max_frame_width` caps the usable width of every emitted frame
    /// (0 selects the mode maximum: 64 standard, 63 extended). Invalid
    /// requests are bumped to the next valid DLC and clamped to the mode
    /// range.
    pub fn new(
        behavior: Behavior,
        mode: Mode,
        block_size: u8,
        rx_separation_us: u32,
        tx_separation_us: u32,
        max_frame_width: usize,
    ) -> Self {
        Self {
            behavior,
            mode,
            max_frame_width: Self::resolve_max_width(mode, max_frame_width),
            block_size,
            rx_separation_us,
            tx_separation_us,
            state: State::Idle,
            sending: Vec::new(),
            sending_offset: 0,
            sending_sequence: 0,
            receiving: Vec::new(),
            receiving_sequence: 0,
            receiving_pending: 0,
            receiving_unconfirmed: 0,
        }
    }

    fn resolve_max_width(mode: Mode, requested: usize) -> usize {
        let minimum = match mode {
            Mode::Standard => MIN_STANDARD_WIDTH,
            Mode::Extended => MIN_EXTENDED_WIDTH,
        };
        let maximum = default_max_width(mode);
        if requested == 0 {
            return maximum;
        }
        let mut clamped = requested.clamp(minimum, maximum);
        if !is_valid_fd_width(clamped, mode) {
            clamped = next_valid_fd_width(clamped, mode);
        }
        clamped.min(maximum)
    }

    /// Current transfer state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Effective maximum usable frame width.
    pub fn max_frame_width(&self) -> usize {
        self.max_frame_width
    }

    /// Drop any in-flight transfer and return to idle.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.sending.clear();
        self.sending_offset = 0;
        self.sending_sequence = 0;
        self.receiving.clear();
        self.receiving_sequence = 0;
        self.receiving_pending = 0;
        self.receiving_unconfirmed = 0;
    }

    /// Submit an application payload for transmission.
    pub fn write_pdu(&mut self, bytes: &[u8]) -> Action {
        if bytes.len() > MAX_TRANSFER_LEN {
            return Action::ProtocolViolation("payload exceeds the maximum ISO-TP transfer size");
        }
        if self.state != State::Idle {
            return Action::ProtocolViolation("transceiver is not idle");
        }

        if bytes.len() <= single_frame_capacity(self.max_frame_width) {
            return Action::write(vec![self.single_frame(bytes)]);
        }

        let head = (self.max_frame_width - 2).min(bytes.len());
        let first = self.first_frame(bytes.len(), &bytes[..head]);
        self.state = State::Sending;
        self.sending = bytes.to_vec();
        self.sending_offset = head;
        self.sending_sequence = 0x01;
        Action::write(vec![first])
    }

    /// Feed one inbound CAN-FD frame payload.
    pub fn did_receive_frame(&mut self, bytes: &[u8]) -> Action {
        if bytes.is_empty() {
            return Action::ProtocolViolation("inbound frame is empty");
        }
        if bytes.len() > self.max_frame_width {
            return Action::ProtocolViolation("inbound frame exceeds the configured width");
        }
        if !is_valid_fd_width(bytes.len(), self.mode) {
            return Action::ProtocolViolation("inbound frame uses an invalid CAN-FD length");
        }

        let action = match self.state {
            State::Sending => self.parse_flow_control(bytes),
            _ => self.parse_data_frame(bytes),
        };

        match self.behavior {
            Behavior::Strict => action,
            Behavior::Defensive => {
                if !matches!(action, Action::ProtocolViolation(_)) {
                    return action;
                }
                self.reset();
                match self.parse_data_frame(bytes) {
                    Action::ProtocolViolation(_) => Action::WaitForMore,
                    recovered => recovered,
                }
            }
        }
    }

    fn parse_flow_control(&mut self, bytes: &[u8]) -> Action {
        if bytes.len() < 3 {
            return Action::ProtocolViolation("flow control below the minimum length");
        }
        if FrameType::of(bytes[0]) != FrameType::FlowControl {
            return Action::ProtocolViolation("expected a flow control frame while sending");
        }

        match FlowStatus::of(bytes[0]) {
            FlowStatus::ClearToSend => {
                let mut grant = u16::from(bytes[1]);
                if grant == 0 {
                    grant = u16::MAX;
                }
                let separation_time_us =
                    frame::st_micros_from_byte(bytes[2]).max(self.tx_separation_us);

                let mut frames = Vec::new();
                for _ in 0..grant {
                    let remaining = self.sending.len() - self.sending_offset;
                    if remaining == 0 {
                        self.reset();
                        break;
                    }
                    let chunk = remaining.min(self.max_frame_width - 1);
                    frames.push(self.consecutive_frame(
                        self.sending_sequence,
                        self.sending_offset,
                        chunk,
                    ));
                    self.sending_offset += chunk;
                    if self.sending_offset >= self.sending.len() {
                        self.reset();
                        break;
                    }
                    self.sending_sequence = (self.sending_sequence + 1) & 0x0F;
                }
                Action::WriteFrames {
                    frames,
                    separation_time_us,
                }
            }
            FlowStatus::Wait => Action::WaitForMore,
            FlowStatus::Overflow => {
                Action::ProtocolViolation("flow control reported receiver overflow")
            }
            FlowStatus::Invalid => {
                Action::ProtocolViolation("flow control carries an invalid status")
            }
        }
    }

    fn parse_data_frame(&mut self, bytes: &[u8]) -> Action {
        match FrameType::of(bytes[0]) {
            FrameType::Single => {
                if self.state != State::Idle {
                    return Action::ProtocolViolation("single frame received while not idle");
                }
                let (header, len) = if bytes.len() > 8 {
                    // Escape form: zero nibble, 8-bit length in byte 1.
                    if bytes[0] & 0x0F != 0 || bytes.len() < 2 {
                        return Action::ProtocolViolation("invalid CAN-FD single frame PCI");
                    }
                    (2usize, usize::from(bytes[1]))
                } else {
                    (1usize, usize::from(bytes[0] & 0x0F))
                };
                if len == 0 {
                    return Action::ProtocolViolation("single frame with zero length");
                }
                if len > bytes.len() - header {
                    return Action::ProtocolViolation("single frame length exceeds the payload");
                }
                if len > single_frame_capacity(bytes.len()) {
                    return Action::ProtocolViolation(
                        "single frame length invalid for the frame width",
                    );
                }
                Action::Process(bytes[header..header + len].to_vec())
            }

            FrameType::First => {
                if self.state != State::Idle {
                    return Action::ProtocolViolation("first frame received while not idle");
                }
                if bytes.len() < 3 {
                    return Action::ProtocolViolation("first frame below the minimum length");
                }
                let total = frame::first_len(bytes);
                let head = bytes.len() - 2;
                if total <= head {
                    return Action::ProtocolViolation(
                        "first frame length fits in the frame itself",
                    );
                }
                self.receiving = bytes[2..].to_vec();
                self.receiving_pending = (total - head) as u16;
                self.receiving_unconfirmed = if self.block_size == 0 {
                    u16::MAX
                } else {
                    u16::from(self.block_size)
                };
                self.receiving_sequence = 0x01;
                self.state = State::Receiving;
                Action::write(vec![self.clear_to_send()])
            }

            FrameType::Consecutive => {
                if self.state != State::Receiving {
                    return Action::ProtocolViolation("consecutive frame received while not receiving");
                }
                if bytes.len() < 2 {
                    return Action::ProtocolViolation("consecutive frame below the minimum length");
                }
                if bytes[0] & 0x0F != self.receiving_sequence {
                    return Action::ProtocolViolation("consecutive frame out of sequence");
                }
                self.receiving_sequence = (self.receiving_sequence + 1) & 0x0F;

                let take = usize::from(self.receiving_pending).min(bytes.len() - 1);
                self.receiving.extend_from_slice(&bytes[1..1 + take]);
                self.receiving_pending -= take as u16;
                if self.receiving_pending == 0 {
                    let payload = std::mem::take(&mut self.receiving);
                    self.reset();
                    return Action::Process(payload);
                }

                self.receiving_unconfirmed -= 1;
                if self.receiving_unconfirmed > 0 {
                    return Action::WaitForMore;
                }
                self.receiving_unconfirmed = if self.block_size == 0 {
                    u16::MAX
                } else {
                    u16::from(self.block_size)
                };
                Action::write(vec![self.clear_to_send()])
            }

            _ => Action::ProtocolViolation("unexpected frame type for the current state"),
        }
    }

    fn width_for(&self, required: usize) -> usize {
        next_valid_fd_width(required, self.mode).min(self.max_frame_width)
    }

    fn single_frame(&self, data: &[u8]) -> Vec<u8> {
        let mut frame = if data.len() <= 7 {
            vec![data.len() as u8]
        } else {
            vec![0x00, data.len() as u8]
        };
        let width = self.width_for(frame.len() + data.len());
        frame.extend_from_slice(data);
        frame.resize(width, PADDING);
        frame
    }

    fn first_frame(&self, total_len: usize, head: &[u8]) -> Vec<u8> {
        let mut frame = frame::first(total_len, head, head.len());
        frame.resize(self.width_for(head.len() + 2), PADDING);
        frame
    }

    fn consecutive_frame(&self, sequence: u8, offset: usize, count: usize) -> Vec<u8> {
        let width = self.width_for(count + 1);
        frame::consecutive(sequence, &self.sending[offset..offset + count], width)
    }

    fn clear_to_send(&self) -> Vec<u8> {
        frame::flow_control(
            FlowStatus::ClearToSend,
            self.block_size,
            frame::st_byte_from_micros(self.rx_separation_us),
            self.width_for(3),
        )
    }
}
