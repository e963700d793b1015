//! `passlink-kline`: K-Line frame validation and multi-frame merging for
//! KWP2000 and ISO 9141-2.
//!
//! Two wire encodings are handled:
//! - **KWP2000**: `fmt ‖ target ‖ source ‖ payload ‖ checksum`, where the
//!   low nibble of `fmt` is the payload length (0..=15) and the frame size
//!   is therefore exact.
//! - **ISO 9141-2**: `target ‖ source ‖ tester ‖ payload ‖ checksum`; the
//!   length is implicit, so the caller either sets an expected total
//!   payload length or calls [`Transceiver::finalize`] to close a merge.
//!
//! The checksum is the additive 8-bit sum of all preceding bytes.
//!
//! ECUs chain long KWP responses over several frames that repeat the
//! service and PID bytes and, on most implementations, insert a sequence
//! byte at payload offset 2. Whether that byte really is a sequence number
//! is only decidable once the second frame arrives: sequence detection is
//! therefore retroactive; see [`Transceiver::feed`].

use std::fmt;

/// K-Line protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMode {
    /// KWP2000 framing with an explicit length nibble.
    Kwp,
    /// ISO 9141-2 framing with implicit length.
    Iso9141,
}

/// Outcome of feeding a frame into the transceiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// A merged payload is complete.
    Process(Vec<u8>),
    /// Frame absorbed; the transfer continues.
    WaitForMore,
    /// The frame was rejected; the transceiver has been reset.
    ProtocolViolation(&'static str),
}

/// Header length shared by both modes (their byte meanings differ).
const HEADER_LEN: usize = 3;

/// Additive 8-bit checksum over `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// A validated view over one K-Line frame.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    bytes: &'a [u8],
    mode: ProtocolMode,
}

impl<'a> Frame<'a> {
    pub fn new(bytes: &'a [u8], mode: ProtocolMode) -> Self {
        Self { bytes, mode }
    }

    /// Whether the trailing checksum matches the preceding bytes.
    pub fn checksum_valid(&self) -> bool {
        if self.bytes.len() < 4 {
            return false;
        }
        let (body, tail) = self.bytes.split_at(self.bytes.len() - 1);
        checksum(body) == tail[0]
    }

    /// Payload length: explicit for KWP, implied by the frame size for
    /// ISO 9141-2.
    pub fn payload_len(&self) -> usize {
        match self.mode {
            ProtocolMode::Kwp => self
                .bytes
                .first()
                .map_or(0, |fmt| usize::from(fmt & 0x0F)),
            ProtocolMode::Iso9141 => self.bytes.len().saturating_sub(HEADER_LEN + 1),
        }
    }

    /// Whether the frame size is consistent with the mode: exact for KWP,
    /// at least header plus checksum for ISO 9141-2.
    pub fn size_valid(&self) -> bool {
        match self.mode {
            ProtocolMode::Kwp => self.bytes.len() == HEADER_LEN + self.payload_len() + 1,
            ProtocolMode::Iso9141 => self.bytes.len() >= HEADER_LEN + 1,
        }
    }

    /// Target address byte.
    pub fn target(&self) -> u8 {
        let index = match self.mode {
            ProtocolMode::Kwp => 1,
            ProtocolMode::Iso9141 => 0,
        };
        self.bytes.get(index).copied().unwrap_or(0)
    }

    /// Source address byte.
    pub fn source(&self) -> u8 {
        let index = match self.mode {
            ProtocolMode::Kwp => 2,
            ProtocolMode::Iso9141 => 1,
        };
        self.bytes.get(index).copied().unwrap_or(0)
    }

    /// Payload bytes, header and checksum stripped.
    pub fn payload(&self) -> &'a [u8] {
        let end = HEADER_LEN + self.payload_len();
        self.bytes.get(HEADER_LEN..end.min(self.bytes.len())).unwrap_or(&[])
    }
}

/// Merges chained K-Line frames into one application payload.
///
/// In KWP mode the first accepted frame pins the `(service, PID)` pair;
/// every follower must repeat it. If the first frame's payload byte 2 was
/// `0x01` and the second frame's byte 2 is `0x02`, the pair is recognized
/// as a frame sequence: the buffered `0x01` is retroactively removed and
/// byte 2 of every further frame is validated as an incrementing sequence
/// number. Without that confirmation, byte 2 stays ordinary data: a lone
/// `0x01` in a single-frame response is not a sequence number.
pub struct Transceiver {
    mode: ProtocolMode,
    expected_target: Option<u8>,
    expected_source: Option<u8>,
    expected_len: Option<usize>,

    base: Option<(u8, u8)>,
    first_frame_had_potential_seq: bool,
    sequence_mode: bool,
    expected_seq: u8,
    buffer: Vec<u8>,
}

impl Transceiver {
    /// Create a transceiver. `expected_target` / `expected_source` reject
    /// frames from other addresses when set; `expected_len` terminates the
    /// merge once the buffer reaches it.
    pub fn new(
        mode: ProtocolMode,
        expected_target: Option<u8>,
        expected_source: Option<u8>,
        expected_len: Option<usize>,
    ) -> Self {
        Self {
            mode,
            expected_target,
            expected_source,
            expected_len,
            base: None,
            first_frame_had_potential_seq: false,
            sequence_mode: false,
            expected_seq: 0,
            buffer: Vec::new(),
        }
    }

    /// KWP2000 transceiver with no address or length expectations.
    pub fn kwp() -> Self {
        Self::new(ProtocolMode::Kwp, None, None, None)
    }

    /// ISO 9141-2 transceiver with no address or length expectations.
    pub fn iso9141() -> Self {
        Self::new(ProtocolMode::Iso9141, None, None, None)
    }

    /// Replace the expected total payload length mid-transfer.
    pub fn set_expected_len(&mut self, len: Option<usize>) {
        self.expected_len = len;
    }

    /// Clear all merge state.
    pub fn reset(&mut self) {
        self.base = None;
        self.first_frame_had_potential_seq = false;
        self.sequence_mode = false;
        self.expected_seq = 0;
        self.buffer.clear();
    }

    /// Feed one complete frame.
    pub fn feed(&mut self, frame_bytes: &[u8]) -> Action {
        if frame_bytes.is_empty() {
            return self.violation("empty frame");
        }

        let frame = Frame::new(frame_bytes, self.mode);
        if !frame.size_valid() {
            return self.violation(match self.mode {
                ProtocolMode::Kwp => "frame size does not match the format length nibble",
                ProtocolMode::Iso9141 => "frame shorter than header and checksum",
            });
        }
        if !frame.checksum_valid() {
            return self.violation("checksum mismatch");
        }
        if let Some(expected) = self.expected_target {
            if frame.target() != expected {
                return self.violation("unexpected target address");
            }
        }
        if let Some(expected) = self.expected_source {
            if frame.source() != expected {
                return self.violation("unexpected source address");
            }
        }

        let payload = frame.payload();

        if self.mode == ProtocolMode::Iso9141 {
            // ISO 9141-2 merging is plain concatenation.
            self.buffer.extend_from_slice(payload);
            if self.reached_expected_len() {
                return self.complete();
            }
            return Action::WaitForMore;
        }

        match self.base {
            None if payload.len() >= 2 => {
                self.base = Some((payload[0], payload[1]));
                self.buffer.push(payload[0]);
                self.buffer.push(payload[1]);
                self.first_frame_had_potential_seq = payload.len() >= 3 && payload[2] == 0x01;
                self.buffer.extend_from_slice(&payload[2..]);
            }
            None => {
                self.buffer.extend_from_slice(payload);
            }
            Some((service, pid)) => {
                if payload.len() >= 2 && (payload[0] != service || payload[1] != pid) {
                    return self.violation("service/PID mismatch between chained frames");
                }

                if !self.sequence_mode
                    && self.first_frame_had_potential_seq
                    && payload.len() >= 3
                    && payload[2] == 0x02
                {
                    // Sequence confirmed: strip the 0x01 buffered from the
                    // first frame and validate byte 2 from now on.
                    if self.buffer.len() > 2 && self.buffer[2] == 0x01 {
                        self.buffer.remove(2);
                    }
                    self.sequence_mode = true;
                    self.expected_seq = 0x03;
                    self.buffer.extend_from_slice(&payload[3..]);
                } else if self.sequence_mode {
                    if payload.len() >= 3 {
                        if payload[2] != self.expected_seq {
                            return self.violation("sequence number mismatch");
                        }
                        self.expected_seq = payload[2].wrapping_add(1);
                        self.buffer.extend_from_slice(&payload[3..]);
                    } else if payload.len() >= 2 {
                        self.buffer.extend_from_slice(&payload[2..]);
                    }
                } else if payload.len() >= 2 {
                    self.buffer.extend_from_slice(&payload[2..]);
                }
            }
        }

        if self.reached_expected_len() {
            return self.complete();
        }
        Action::WaitForMore
    }

    /// Close an open merge and deliver whatever has been buffered.
    pub fn finalize(&mut self) -> Action {
        if self.buffer.is_empty() {
            return Action::WaitForMore;
        }
        self.complete()
    }

    fn reached_expected_len(&self) -> bool {
        self.expected_len
            .is_some_and(|expected| expected > 0 && self.buffer.len() >= expected)
    }

    fn complete(&mut self) -> Action {
        let payload = std::mem::take(&mut self.buffer);
        self.reset();
        Action::Process(payload)
    }

    fn violation(&mut self, reason: &'static str) -> Action {
        self.reset();
        Action::ProtocolViolation(reason)
    }
}

impl fmt::Debug for Transceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transceiver")
            .field("mode", &self.mode)
            .field("sequence_mode", &self.sequence_mode)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

/// Build one KWP2000 frame. The high nibble of `format_prefix` becomes the
/// format bits; the length nibble is filled in from the payload.
pub fn kwp_frame(target: u8, source: u8, payload: &[u8], format_prefix: u8) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + 1);
    frame.push(format_prefix | (payload.len() as u8 & 0x0F));
    frame.push(target);
    frame.push(source);
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    frame
}

/// Build one ISO 9141-2 frame.
pub fn iso9141_frame(target: u8, source: u8, tester: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + 1);
    frame.push(target);
    frame.push(source);
    frame.push(tester);
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    frame
}

/// Build one or more KWP frames for a `service ‖ pid ‖ data` payload.
///
/// Payloads that fit the 4-bit length nibble go out as one frame. Longer
/// payloads are chunked into frames that repeat the service/PID pair and
/// insert a sequence byte at payload offset 2, starting at `0x01`.
pub fn kwp_frames(
    target: u8,
    source: u8,
    payload: &[u8],
    format_prefix: u8,
    max_data_per_frame: usize,
) -> Vec<Vec<u8>> {
    if payload.len() <= 0x0F {
        return vec![kwp_frame(target, source, payload, format_prefix)];
    }
    if payload.len() < 2 {
        return Vec::new();
    }

    let service = payload[0];
    let pid = payload[1];
    let data = &payload[2..];
    let chunk_size = if max_data_per_frame == 0 { 4 } else { max_data_per_frame };

    let mut frames = Vec::new();
    let mut sequence: u8 = 0x01;
    for chunk in data.chunks(chunk_size) {
        let mut body = Vec::with_capacity(3 + chunk.len());
        body.push(service);
        body.push(pid);
        body.push(sequence);
        body.extend_from_slice(chunk);
        frames.push(kwp_frame(target, source, &body, format_prefix));
        sequence = sequence.wrapping_add(1);
    }
    frames
}

/// Split a contiguous K-Line capture into frames.
///
/// KWP frames self-describe their length; ISO 9141-2 does not encode one,
/// so the whole buffer is treated as a single frame.
pub fn split_frames(raw: &[u8], mode: ProtocolMode) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    if raw.len() < 4 {
        return frames;
    }
    match mode {
        ProtocolMode::Kwp => {
            let mut index = 0;
            while index + 4 <= raw.len() {
                let payload_len = usize::from(raw[index] & 0x0F);
                let frame_len = HEADER_LEN + payload_len + 1;
                if index + frame_len > raw.len() {
                    break;
                }
                frames.push(raw[index..index + frame_len].to_vec());
                index += frame_len;
            }
        }
        ProtocolMode::Iso9141 => frames.push(raw.to_vec()),
    }
    frames
}

/// Decode a raw capture into a merged payload by driving a [`Transceiver`]
/// over [`split_frames`]. Returns an empty payload on violation.
pub fn decode_stream(
    raw: &[u8],
    mode: ProtocolMode,
    expected_target: Option<u8>,
    expected_source: Option<u8>,
    expected_len: Option<usize>,
) -> Vec<u8> {
    let mut transceiver = Transceiver::new(mode, expected_target, expected_source, expected_len);
    for frame in split_frames(raw, mode) {
        match transceiver.feed(&frame) {
            Action::Process(payload) => return payload,
            Action::ProtocolViolation(_) => return Vec::new(),
            Action::WaitForMore => {}
        }
    }
    match transceiver.finalize() {
        Action::Process(payload) => payload,
        _ => Vec::new(),
    }
}
