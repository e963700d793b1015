//! The classic-CAN ISO-TP transceiver.

use crate::frame::{
    self, FlowStatus, FrameType, MAX_TRANSFER_LEN, MAX_UNCONFIRMED_FRAMES,
};
use crate::{Action, Behavior, Mode, State};

/// ISO 15765-2 protocol machine over 8-byte CAN frames.
///
/// The machine enforces framing and sequencing but no timings, so it works
/// with arbitrarily slow ECUs. One transfer per direction can be active at
/// a time.
pub struct Transceiver {
    behavior: Behavior,
    width: usize,
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

impl Default for Transceiver {
    fn default() -> Self {
        Self::new(Behavior::Defensive, Mode::Standard, 0, 0, 0)
    }
}

impl Transceiver {
    /// Create a transceiver.
    ///
    /// `block_size` is the number of consecutive frames granted per flow
    /// control (0 = unbounded). Separation times are in microseconds: the
    /// RX value is advertised to the peer in emitted flow controls, the TX
    /// value is a lower bound on the pacing of our own consecutive frames.
    pub fn new(
        behavior: Behavior,
        mode: Mode,
        block_size: u8,
        rx_separation_us: u32,
        tx_separation_us: u32,
    ) -> Self {
        Self {
            behavior,
            width: match mode {
                Mode::Standard => 8,
                Mode::Extended => 7,
            },
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

    /// Current transfer state.
    pub fn state(&self) -> State {
        self.state
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
    ///
    /// Payloads shorter than the frame width go out as one Single Frame and
    /// the machine stays idle; longer payloads emit a First Frame and move
    /// to the sending state until the transfer completes.
    pub fn write_pdu(&mut self, bytes: &[u8]) -> Action {
        if bytes.len() > MAX_TRANSFER_LEN {
            return Action::ProtocolViolation("payload exceeds the maximum ISO-TP transfer size");
        }
        if self.state != State::Idle {
            return Action::ProtocolViolation("transceiver is not idle");
        }

        if bytes.len() < self.width {
            return Action::write(vec![frame::single(bytes, self.width)]);
        }

        let head = self.width - 2;
        let first = frame::first(bytes.len(), bytes, head);
        self.state = State::Sending;
        self.sending = bytes.to_vec();
        self.sending_offset = head;
        self.sending_sequence = 0x01;
        Action::write(vec![first])
    }

    /// Feed one inbound CAN frame payload.
    pub fn did_receive_frame(&mut self, bytes: &[u8]) -> Action {
        if bytes.len() != self.width {
            // Allow unpadded flow control, which some ECUs emit.
            if !(bytes.len() == 3 && (0x30..=0x32).contains(&bytes[0])) {
                return Action::ProtocolViolation("inbound frame does not match the frame width");
            }
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
                // Reset and retry the frame as a data frame; a second
                // failure is swallowed so a stray frame cannot wedge us.
                self.reset();
                match self.parse_data_frame(bytes) {
                    Action::ProtocolViolation(_) => Action::WaitForMore,
                    recovered => recovered,
                }
            }
        }
    }

    fn parse_flow_control(&mut self, bytes: &[u8]) -> Action {
        if FrameType::of(bytes[0]) != FrameType::FlowControl {
            return Action::ProtocolViolation("expected a flow control frame while sending");
        }

        match FlowStatus::of(bytes[0]) {
            FlowStatus::ClearToSend => {
                let mut grant = u16::from(bytes[1]);
                if grant == 0 {
                    grant = MAX_UNCONFIRMED_FRAMES;
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
                    let chunk = remaining.min(self.width - 1);
                    frames.push(frame::consecutive(
                        self.sending_sequence,
                        &self.sending[self.sending_offset..self.sending_offset + chunk],
                        self.width,
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
                let len = usize::from(bytes[0] & 0x0F);
                if len == 0 {
                    return Action::ProtocolViolation("single frame with zero length");
                }
                if len > 7 || len > bytes.len() - 1 {
                    return Action::ProtocolViolation("single frame length exceeds the payload");
                }
                Action::Process(bytes[1..1 + len].to_vec())
            }

            FrameType::First => {
                if self.state != State::Idle {
                    return Action::ProtocolViolation("first frame received while not idle");
                }
                let total = frame::first_len(bytes);
                if total <= self.width - 2 {
                    return Action::ProtocolViolation(
                        "first frame length fits in the frame itself",
                    );
                }
                self.receiving = bytes[2..].to_vec();
                self.receiving_pending = (total - (self.width - 2)) as u16;
                self.receiving_unconfirmed = if self.block_size == 0 {
                    MAX_UNCONFIRMED_FRAMES
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
                if bytes[0] & 0x0F != self.receiving_sequence {
                    return Action::ProtocolViolation("consecutive frame out of sequence");
                }
                self.receiving_sequence = (self.receiving_sequence + 1) & 0x0F;

                let take = usize::from(self.receiving_pending).min(self.width - 1);
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
                    MAX_UNCONFIRMED_FRAMES
                } else {
                    u16::from(self.block_size)
                };
                Action::write(vec![self.clear_to_send()])
            }

            _ => Action::ProtocolViolation("unexpected frame type for the current state"),
        }
    }

    fn clear_to_send(&self) -> Vec<u8> {
        frame::flow_control(
            FlowStatus::ClearToSend,
            self.block_size,
            frame::st_byte_from_micros(self.rx_separation_us),
            self.width,
        )
    }
}
