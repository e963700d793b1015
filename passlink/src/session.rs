//! The session layer: one request/response channel and asynchronous frame
//! delivery, multiplexed over a single transport.
//!
//! A request serializes its PDU, records the expected response tag, and
//! pumps the transport until a matching (or negative) reply arrives or the
//! timeout expires. Asynchronous `Received` / `ReceivedCompressed` PDUs
//! can interleave with the awaited reply at any point; they are routed to
//! a FIFO in byte-arrival order and picked up by [`Session::receive_messages`].
//!
//! Two pump modes exist: in the default synchronous mode the requesting
//! thread polls the transport itself in 50 ms slices; in async mode a
//! background thread pumps continuously and requesters park on a condition
//! variable. Either way at most one request is in flight per session, and
//! a reply that arrives after its request timed out is silently dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use passlink_wire::{Arbitration, CanFrame, ChannelProtocol, DeviceInfo, Pdu, PduType};

use crate::error::SessionError;
use crate::timestamp_micros;
use crate::transport::{Transport, TransportError};

/// Polling quantum for the synchronous pump and the background pumper.
const POLL_QUANTUM: Duration = Duration::from_millis(50);

/// The response tag(s) a request is prepared to accept as success.
#[derive(Debug, Clone, Copy)]
pub struct Expected {
    primary: PduType,
    alternate: Option<PduType>,
}

impl Expected {
    /// Accept exactly one tag.
    pub fn only(primary: PduType) -> Self {
        Self {
            primary,
            alternate: None,
        }
    }

    /// Accept either of two tags. Some firmware revisions acknowledge
    /// `EndPeriodicMessage` with a bare `Ok`, so that request accepts both.
    pub fn either(primary: PduType, alternate: PduType) -> Self {
        Self {
            primary,
            alternate: Some(alternate),
        }
    }

    fn matches(&self, tag: PduType) -> bool {
        tag == self.primary || self.alternate == Some(tag)
    }
}

struct Shared {
    rx_buffer: Vec<u8>,
    frames: VecDeque<CanFrame>,
    expected: Option<Expected>,
    captured: Option<Pdu>,
    async_mode: bool,
    last_error: String,
}

struct PumpControl {
    thread: Option<thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

/// A connection to one adapter.
pub struct Session {
    transport: Mutex<Box<dyn Transport>>,
    shared: Mutex<Shared>,
    response: Condvar,
    /// Serializes requests: at most one in flight per session.
    request: Mutex<()>,
    pump: Mutex<PumpControl>,
}

impl Session {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Mutex::new(transport),
            shared: Mutex::new(Shared {
                rx_buffer: Vec::new(),
                frames: VecDeque::new(),
                expected: None,
                captured: None,
                async_mode: false,
                last_error: String::new(),
            }),
            response: Condvar::new(),
            request: Mutex::new(()),
            pump: Mutex::new(PumpControl {
                thread: None,
                stop: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Connect the underlying transport.
    pub fn connect(&self) -> Result<(), SessionError> {
        let result = self.transport.lock().unwrap().connect();
        if let Err(err) = result {
            self.set_last_error(format!("connect failed: {err}"));
            return Err(err.into());
        }
        Ok(())
    }

    /// Stop the pump thread (if any), close the transport and drop all
    /// buffered state. In-flight requests observe their timeout.
    pub fn disconnect(&self) {
        self.stop_pump();
        self.transport.lock().unwrap().disconnect();
        let mut shared = self.shared.lock().unwrap();
        shared.rx_buffer.clear();
        shared.frames.clear();
        shared.captured = None;
        self.response.notify_all();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.lock().unwrap().is_connected()
    }

    /// Most recent error description.
    pub fn last_error(&self) -> String {
        self.shared.lock().unwrap().last_error.clone()
    }

    fn set_last_error(&self, message: String) {
        self.shared.lock().unwrap().last_error = message;
    }

    /// Switch between the synchronous pump (requesters poll the transport
    /// themselves) and a background pump thread feeding the dispatcher.
    pub fn set_async_mode(self: &Arc<Self>, enabled: bool) {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.async_mode == enabled {
                return;
            }
            shared.async_mode = enabled;
        }
        if enabled {
            let stop = Arc::new(AtomicBool::new(false));
            let session = Arc::clone(self);
            let stop_flag = Arc::clone(&stop);
            let handle = thread::spawn(move || session.pump_loop(stop_flag));
            let mut pump = self.pump.lock().unwrap();
            pump.stop = stop;
            pump.thread = Some(handle);
        } else {
            self.stop_pump();
        }
    }

    fn stop_pump(&self) {
        let (stop, handle) = {
            let mut pump = self.pump.lock().unwrap();
            (Arc::clone(&pump.stop), pump.thread.take())
        };
        stop.store(true, Ordering::Relaxed);
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn pump_loop(&self, stop: Arc<AtomicBool>) {
        debug!("session pump started");
        while !stop.load(Ordering::Relaxed) {
            let data = {
                let mut transport = self.transport.lock().unwrap();
                if !transport.is_connected() {
                    drop(transport);
                    thread::sleep(POLL_QUANTUM);
                    continue;
                }
                transport.receive(POLL_QUANTUM)
            };
            match data {
                Ok(bytes) if !bytes.is_empty() => self.ingest(&bytes),
                Ok(_) => {}
                Err(err) => {
                    trace!("pump receive failed: {err}");
                    thread::sleep(POLL_QUANTUM);
                }
            }
        }
        debug!("session pump stopped");
    }

    /// Append received bytes, parse every complete PDU and dispatch them in
    /// byte-arrival order.
    fn ingest(&self, bytes: &[u8]) {
        let mut shared = self.shared.lock().unwrap();
        shared.rx_buffer.extend_from_slice(bytes);
        let pdus = Pdu::drain(&mut shared.rx_buffer);
        for pdu in pdus {
            self.dispatch(&mut shared, pdu);
        }
    }

    fn dispatch(&self, shared: &mut Shared, pdu: Pdu) {
        match pdu.pdu_type() {
            PduType::Received | PduType::ReceivedCompressed => {
                match pdu.received_frame(timestamp_micros()) {
                    Ok(frame) => shared.frames.push_back(frame),
                    Err(err) => warn!("dropping malformed received frame: {err}"),
                }
            }
            tag => {
                let wanted = shared
                    .expected
                    .is_some_and(|expected| expected.matches(tag) || pdu.is_error());
                if wanted {
                    shared.captured = Some(pdu);
                    self.response.notify_all();
                } else {
                    // Fire-and-forget sends produce unsolicited acks; late
                    // replies land here after their request timed out.
                    trace!("dropping unsolicited {tag:?}");
                }
            }
        }
    }

    /// Send `pdu` and wait up to `timeout_ms` for a response whose tag is
    /// expected or negative. At most one request is in flight at a time.
    pub fn send_and_receive(
        &self,
        pdu: &Pdu,
        expected: Expected,
        timeout_ms: u32,
    ) -> Result<Pdu, SessionError> {
        let _in_flight = self.request.lock().unwrap();

        {
            let mut transport = self.transport.lock().unwrap();
            if !transport.is_connected() {
                self.set_last_error("not connected".into());
                return Err(TransportError::NotConnected.into());
            }
            if let Err(err) = transport.send(&pdu.serialize()) {
                self.set_last_error(format!("send failed: {err}"));
                return Err(err.into());
            }
        }

        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        let async_mode = {
            let mut shared = self.shared.lock().unwrap();
            shared.captured = None;
            shared.expected = Some(expected);
            shared.async_mode
        };

        let result = if async_mode {
            self.await_response(deadline)
        } else {
            self.pump_until_response(deadline)
        };

        if result.is_err() {
            let mut shared = self.shared.lock().unwrap();
            shared.expected = None;
            shared.captured = None;
        }
        result
    }

    /// Synchronous pump: poll the transport in 50 ms slices, feeding the
    /// dispatcher, until the response slot fills or the deadline passes.
    fn pump_until_response(&self, deadline: Instant) -> Result<Pdu, SessionError> {
        loop {
            {
                let mut shared = self.shared.lock().unwrap();
                if let Some(pdu) = shared.captured.take() {
                    shared.expected = None;
                    return Ok(pdu);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                self.set_last_error("response timeout".into());
                return Err(SessionError::Timeout);
            }

            let slice = POLL_QUANTUM.min(deadline - now);
            let data = self.transport.lock().unwrap().receive(slice);
            match data {
                Ok(bytes) if !bytes.is_empty() => self.ingest(&bytes),
                Ok(_) => {}
                Err(err) => {
                    self.set_last_error(format!("receive failed: {err}"));
                    return Err(err.into());
                }
            }
        }
    }

    /// Async-mode wait: the pump thread dispatches; park on the condvar.
    fn await_response(&self, deadline: Instant) -> Result<Pdu, SessionError> {
        let mut shared = self.shared.lock().unwrap();
        loop {
            if let Some(pdu) = shared.captured.take() {
                shared.expected = None;
                return Ok(pdu);
            }
            let now = Instant::now();
            if now >= deadline {
                shared.last_error = "response timeout".into();
                return Err(SessionError::Timeout);
            }
            let (guard, _) = self.response.wait_timeout(shared, deadline - now).unwrap();
            shared = guard;
        }
    }

    /// Drain queued asynchronous frames, reading from the transport once if
    /// the FIFO is empty. In async mode the pump thread fills the FIFO and
    /// this only drains it.
    pub fn receive_messages(&self, timeout_ms: u32) -> Vec<CanFrame> {
        {
            let mut shared = self.shared.lock().unwrap();
            if !shared.frames.is_empty() {
                return shared.frames.drain(..).collect();
            }
            if shared.async_mode {
                drop(shared);
                // Give the pump thread a chance to deliver.
                thread::sleep(POLL_QUANTUM.min(Duration::from_millis(u64::from(timeout_ms))));
                let mut shared = self.shared.lock().unwrap();
                return shared.frames.drain(..).collect();
            }
        }

        let data = {
            let mut transport = self.transport.lock().unwrap();
            if !transport.is_connected() {
                return Vec::new();
            }
            transport.receive(Duration::from_millis(u64::from(timeout_ms)))
        };
        match data {
            Ok(bytes) if !bytes.is_empty() => self.ingest(&bytes),
            Ok(_) => {}
            Err(err) => self.set_last_error(format!("receive failed: {err}")),
        }

        self.shared.lock().unwrap().frames.drain(..).collect()
    }

    // --- high-level verbs ------------------------------------------------

    fn checked(&self, reply: Pdu) -> Result<Pdu, SessionError> {
        if reply.is_error() {
            self.set_last_error(reply.error_message().to_string());
            return Err(SessionError::Adapter(reply.pdu_type()));
        }
        Ok(reply)
    }

    /// Round-trip a `Ping`.
    pub fn ping(&self, payload: &[u8], timeout_ms: u32) -> Result<Vec<u8>, SessionError> {
        let reply = self.send_and_receive(
            &Pdu::ping(payload.to_vec()),
            Expected::only(PduType::Pong),
            timeout_ms,
        )?;
        Ok(self.checked(reply)?.payload().to_vec())
    }

    /// Fetch the adapter identity strings.
    pub fn device_info(&self, timeout_ms: u32) -> Result<DeviceInfo, SessionError> {
        let reply = self.send_and_receive(
            &Pdu::request_info(),
            Expected::only(PduType::Info),
            timeout_ms,
        )?;
        Ok(self.checked(reply)?.device_info()?)
    }

    /// Read the battery voltage in millivolts.
    pub fn read_voltage(&self, timeout_ms: u32) -> Result<u16, SessionError> {
        let reply = self.send_and_receive(
            &Pdu::read_voltage(),
            Expected::only(PduType::Voltage),
            timeout_ms,
        )?;
        Ok(self.checked(reply)?.voltage_millivolts()?)
    }

    /// Open a channel; `data_bitrate` selects the FD variant.
    pub fn open_channel(
        &self,
        protocol: ChannelProtocol,
        bitrate: u32,
        data_bitrate: Option<u32>,
        rx_separation_us: u16,
        tx_separation_us: u16,
        timeout_ms: u32,
    ) -> Result<u8, SessionError> {
        let request = match data_bitrate {
            Some(data_bitrate) => Pdu::open_fd_channel(
                protocol,
                bitrate,
                data_bitrate,
                rx_separation_us,
                tx_separation_us,
            ),
            None => Pdu::open_channel(protocol, bitrate, rx_separation_us, tx_separation_us),
        };
        let reply = self.send_and_receive(
            &request,
            Expected::only(PduType::ChannelOpened),
            timeout_ms,
        )?;
        Ok(self.checked(reply)?.channel_handle()?)
    }

    pub fn close_channel(&self, handle: u8, timeout_ms: u32) -> Result<(), SessionError> {
        let reply = self.send_and_receive(
            &Pdu::close_channel(handle),
            Expected::only(PduType::ChannelClosed),
            timeout_ms,
        )?;
        self.checked(reply).map(|_| ())
    }

    pub fn set_arbitration(
        &self,
        handle: u8,
        arbitration: &Arbitration,
        timeout_ms: u32,
    ) -> Result<(), SessionError> {
        let reply = self.send_and_receive(
            &Pdu::set_arbitration(handle, arbitration),
            Expected::only(PduType::Ok),
            timeout_ms,
        )?;
        self.checked(reply).map(|_| ())
    }

    /// Send one frame and wait for the acknowledgement.
    pub fn send_frame(&self, handle: u8, data: &[u8], timeout_ms: u32) -> Result<(), SessionError> {
        let reply = self.send_and_receive(
            &Pdu::send(handle, data),
            Expected::only(PduType::Ok),
            timeout_ms,
        )?;
        self.checked(reply).map(|_| ())
    }

    /// Fire-and-forget batched send. Any acknowledgement the adapter emits
    /// is dropped by the dispatcher as unsolicited.
    pub fn send_batch(&self, handle: u8, frames: &[Vec<u8>]) -> Result<(), SessionError> {
        let _in_flight = self.request.lock().unwrap();
        let mut transport = self.transport.lock().unwrap();
        if !transport.is_connected() {
            self.set_last_error("not connected".into());
            return Err(TransportError::NotConnected.into());
        }
        let pdu = Pdu::send_batch(handle, frames);
        if let Err(err) = transport.send(&pdu.serialize()) {
            self.set_last_error(format!("send failed: {err}"));
            return Err(err.into());
        }
        Ok(())
    }

    /// Start an out-of-band periodic message; returns the adapter handle.
    pub fn start_periodic(
        &self,
        interval_byte: u8,
        arbitration: &Arbitration,
        data: &[u8],
        timeout_ms: u32,
    ) -> Result<u8, SessionError> {
        let reply = self.send_and_receive(
            &Pdu::start_periodic_message(interval_byte, arbitration, data),
            Expected::only(PduType::PeriodicMessageStarted),
            timeout_ms,
        )?;
        Ok(self.checked(reply)?.periodic_handle()?)
    }

    /// Stop a periodic message. `PeriodicMessageEnded` and plain `Ok` are
    /// both treated as success.
    pub fn end_periodic(&self, handle: u8, timeout_ms: u32) -> Result<(), SessionError> {
        let reply = self.send_and_receive(
            &Pdu::end_periodic_message(handle),
            Expected::either(PduType::PeriodicMessageEnded, PduType::Ok),
            timeout_ms,
        )?;
        self.checked(reply).map(|_| ())
    }

    /// Reboot the adapter.
    pub fn reset_adapter(&self, timeout_ms: u32) -> Result<(), SessionError> {
        let reply =
            self.send_and_receive(&Pdu::reset(), Expected::only(PduType::Ok), timeout_ms)?;
        self.checked(reply).map(|_| ())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_pump();
    }
}
