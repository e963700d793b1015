//! An in-memory emulated adapter for tests and offline development.
//!
//! [`MockAdapter`] implements [`Transport`] and behaves like the remote
//! side of the wire: it parses the PDUs the host writes, records them, and
//! queues plausible replies: channel handles, periodic handles, device
//! info, voltage. Tests clone the handle before boxing it into a session
//! and then inspect the recorded command stream or inject asynchronous
//! frame deliveries.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use passlink_wire::{DeviceInfo, Pdu, PduType};

use crate::transport::{Transport, TransportError};

#[derive(Clone, Default)]
struct MockState {
    connected: bool,
    parse_buffer: Vec<u8>,
    outgoing: VecDeque<u8>,
    commands: Vec<Pdu>,
    muted: bool,
    next_error: Option<PduType>,
    end_periodic_with_ok: bool,
    voltage_mv: u16,
    next_channel: u8,
    next_periodic: u8,
}

struct Inner {
    state: Mutex<MockState>,
    available: Condvar,
    info: DeviceInfo,
}

/// Cheaply clonable handle to an emulated adapter.
#[derive(Clone)]
pub struct MockAdapter {
    inner: Arc<Inner>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MockState {
                    voltage_mv: 12_600,
                    next_channel: 1,
                    next_periodic: 1,
                    ..MockState::default()
                }),
                available: Condvar::new(),
                info: DeviceInfo {
                    vendor: "Vanagon Labs".into(),
                    model: "LinkBox".into(),
                    hardware: "ESP32 rev C".into(),
                    serial: "PL-0042".into(),
                    firmware: "2.4.1".into(),
                },
            }),
        }
    }

    /// Stop answering commands; subsequent requests run into their timeout.
    pub fn set_muted(&self, muted: bool) {
        self.inner.state.lock().unwrap().muted = muted;
    }

    /// Answer the next command with the given negative reply.
    pub fn fail_next(&self, error: PduType) {
        debug_assert!(error.is_error());
        self.inner.state.lock().unwrap().next_error = Some(error);
    }

    /// Acknowledge `EndPeriodicMessage` with a bare `Ok`, as some firmware
    /// revisions do.
    pub fn set_end_periodic_with_ok(&self, enabled: bool) {
        self.inner.state.lock().unwrap().end_periodic_with_ok = enabled;
    }

    /// Everything the host has sent so far, in order.
    pub fn commands(&self) -> Vec<Pdu> {
        self.inner.state.lock().unwrap().commands.clone()
    }

    /// Queue an asynchronous `Received` delivery toward the host.
    pub fn inject_frame(&self, channel: u8, id: u32, extension: u8, data: &[u8]) {
        self.push_pdu(&Pdu::received(channel, id, extension, data));
    }

    /// Queue an asynchronous `ReceivedCompressed` delivery toward the host.
    pub fn inject_compressed_frame(&self, channel: u8, id: u32, extension: u8, data: &[u8]) {
        self.push_pdu(&Pdu::received_compressed(channel, id, extension, data));
    }

    /// Queue raw bytes toward the host, framed or not.
    pub fn inject_bytes(&self, bytes: &[u8]) {
        let mut state = self.inner.state.lock().unwrap();
        state.outgoing.extend(bytes.iter().copied());
        self.inner.available.notify_all();
    }

    fn push_pdu(&self, pdu: &Pdu) {
        self.inject_bytes(&pdu.serialize());
    }

    fn respond(state: &mut MockState, info: &DeviceInfo, command: &Pdu) -> Option<Pdu> {
        if let Some(error) = state.next_error.take() {
            return Some(Pdu::error(error));
        }
        let reply = match command.pdu_type() {
            PduType::Ping => Pdu::pong(command.payload().to_vec()),
            PduType::RequestInfo => Pdu::info(info),
            PduType::ReadVoltage => Pdu::voltage(state.voltage_mv),
            PduType::OpenChannel | PduType::OpenFdChannel => {
                let handle = state.next_channel;
                state.next_channel += 1;
                Pdu::channel_opened(handle)
            }
            PduType::CloseChannel => {
                Pdu::channel_closed(command.channel_handle().unwrap_or(0))
            }
            PduType::SetArbitration => Pdu::ok(),
            // Sends are fire-and-forget from the host's point of view; the
            // adapter still acknowledges and the session drops the ack.
            PduType::Send | PduType::SendCompressed => Pdu::ok(),
            PduType::StartPeriodicMessage => {
                let handle = state.next_periodic;
                state.next_periodic += 1;
                Pdu::periodic_message_started(handle)
            }
            PduType::EndPeriodicMessage => {
                if state.end_periodic_with_ok {
                    Pdu::ok()
                } else {
                    Pdu::periodic_message_ended(command.periodic_handle().unwrap_or(0))
                }
            }
            PduType::Reset => Pdu::ok(),
            PduType::PrepareForUpdate => Pdu::update_started_send_data(),
            PduType::SendUpdateData => Pdu::update_data_received(),
            PduType::CommitUpdate => Pdu::update_completed(),
            PduType::RpcCall | PduType::RpcSendBinary => Pdu::error(PduType::ErrorInvalidRpc),
            _ => Pdu::error(PduType::ErrorInvalidCommand),
        };
        Some(reply)
    }
}

impl Transport for MockAdapter {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.inner.state.lock().unwrap().connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.inner.state.lock().unwrap();
        state.connected = false;
        state.parse_buffer.clear();
        state.outgoing.clear();
        self.inner.available.notify_all();
    }

    fn is_connected(&self) -> bool {
        self.inner.state.lock().unwrap().connected
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.inner.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.parse_buffer.extend_from_slice(data);
        let commands = Pdu::drain(&mut state.parse_buffer);
        for command in commands {
            state.commands.push(command.clone());
            if state.muted {
                continue;
            }
            if let Some(reply) = Self::respond(&mut state, &self.inner.info, &command) {
                let bytes = reply.serialize();
                state.outgoing.extend(bytes.iter().copied());
            }
        }
        self.inner.available.notify_all();
        Ok(data.len())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            if !state.outgoing.is_empty() {
                let take = state.outgoing.len().min(4096);
                return Ok(state.outgoing.drain(..take).collect());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let (guard, _timeout) = self
                .inner
                .available
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
    }
}
