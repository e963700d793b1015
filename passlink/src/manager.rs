//! The device manager: process-wide registry of devices and channels, and
//! the implementation behind every Pass-Thru verb.
//!
//! Registry mutations happen under one mutex. Channel RX queues carry
//! their own mutex and condition variable so a blocked `read_msgs` never
//! holds the registry lock. Each open device runs one polling thread that
//! drains the session's asynchronous frame FIFO and fans frames into the
//! per-channel queues after software filter evaluation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use passlink_wire::{Arbitration, CanFrame, ChannelProtocol, DeviceInfo};

use crate::device::{passes_filters, Channel, Device, Filter};
use crate::error::ErrorCode;
use crate::passthru::{
    self, config, filter, flags, PassThruMsg, SConfig, API_VERSION, DLL_VERSION, MSG_DATA_LEN,
};
use crate::session::Session;
use crate::timestamp_micros;
use crate::transport::{Endpoint, Transport};

/// Maximum payload bytes of one batched send (handle byte plus
/// length-prefixed entries).
const MAX_BATCH_BYTES: usize = passlink_wire::MAX_BATCH_BYTES;

/// Timeout for adapter housekeeping requests issued by the manager itself.
const HOUSEKEEPING_TIMEOUT_MS: u32 = 1000;
/// Timeout for the identity query when opening a device.
const OPEN_INFO_TIMEOUT_MS: u32 = 2000;
/// Polling thread receive window.
const POLL_WINDOW_MS: u32 = 100;

struct Registry {
    devices: HashMap<u32, Device>,
    /// Channel ID to owning device ID; avoids back-pointers from channels.
    channel_to_device: HashMap<u32, u32>,
    /// Shared counter for device and channel IDs; uniqueness across both
    /// spaces.
    next_id: u32,
}

struct ManagerInner {
    registry: Mutex<Registry>,
    last_error: Mutex<String>,
}

/// Registry of open devices. Cheap to clone; all clones share state.
///
/// The ABI shim uses the process-global instance from
/// [`DeviceManager::global`]; tests construct private instances.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<ManagerInner>,
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: Mutex::new(Registry {
                    devices: HashMap::new(),
                    channel_to_device: HashMap::new(),
                    next_id: 1,
                }),
                last_error: Mutex::new(String::new()),
            }),
        }
    }

    /// The process-wide instance used by the C ABI.
    pub fn global() -> &'static DeviceManager {
        static GLOBAL: OnceLock<DeviceManager> = OnceLock::new();
        GLOBAL.get_or_init(DeviceManager::new)
    }

    /// Most recent error description.
    pub fn last_error(&self) -> String {
        self.inner.last_error.lock().unwrap().clone()
    }

    pub fn set_last_error(&self, message: impl Into<String>) {
        *self.inner.last_error.lock().unwrap() = message.into();
    }

    // --- device lifecycle ------------------------------------------------

    /// Open a device by connection string (see [`Endpoint::parse`]).
    pub fn open_device(&self, name: &str) -> Result<u32, ErrorCode> {
        debug!("open device, name={name:?}");
        let endpoint = Endpoint::parse(name);
        let transport = match endpoint.open() {
            Ok(transport) => transport,
            Err(err) => {
                self.set_last_error(format!("failed to create transport: {err}"));
                return Err(ErrorCode::Failed);
            }
        };
        self.open_device_with(transport, name)
    }

    /// Open a device over an already-constructed transport.
    pub fn open_device_with(
        &self,
        transport: Box<dyn Transport>,
        name: &str,
    ) -> Result<u32, ErrorCode> {
        let session = Arc::new(Session::new(transport));
        if let Err(err) = session.connect() {
            self.set_last_error(format!("failed to connect: {err}"));
            return Err(ErrorCode::DeviceNotConnected);
        }

        // The identity query doubles as a liveness check.
        let info = match session.device_info(OPEN_INFO_TIMEOUT_MS) {
            Ok(info) => info,
            Err(err) => {
                session.disconnect();
                self.set_last_error(format!("failed to get device info: {err}"));
                return Err(ErrorCode::DeviceNotConnected);
            }
        };
        debug!(
            "device identified: {} {} fw {}",
            info.vendor, info.model, info.firmware
        );

        let mut registry = self.inner.registry.lock().unwrap();
        let device_id = registry.next_id;
        registry.next_id += 1;
        registry
            .devices
            .insert(device_id, Device::new(session, info, name.to_string()));
        Ok(device_id)
    }

    /// Close a device, its channels and its polling thread.
    pub fn close_device(&self, device_id: u32) -> Result<(), ErrorCode> {
        let mut device = {
            let mut registry = self.inner.registry.lock().unwrap();
            let Some(device) = registry.devices.remove(&device_id) else {
                self.set_last_error("invalid device ID");
                return Err(ErrorCode::InvalidDeviceId);
            };
            registry
                .channel_to_device
                .retain(|_, owner| *owner != device_id);
            device
        };

        // The polling thread re-checks the registry and its stop flag; both
        // joins happen outside the registry lock.
        device.stop_polling.store(true, Ordering::Relaxed);
        if let Some(handle) = device.polling.take() {
            let _ = handle.join();
        }

        for channel in device.channels.values() {
            self.teardown_channel(&device.session, channel);
        }
        device.session.disconnect();
        Ok(())
    }

    fn teardown_channel(&self, session: &Session, channel: &Channel) {
        let periodic: Vec<u8> = {
            let state = channel.state.lock().unwrap();
            state.periodic.values().copied().collect()
        };
        for handle in periodic {
            let _ = session.end_periodic(handle, HOUSEKEEPING_TIMEOUT_MS);
        }
        if session.is_connected() {
            let _ = session.close_channel(channel.adapter_handle, HOUSEKEEPING_TIMEOUT_MS);
        }
    }

    // --- channel lifecycle -----------------------------------------------

    /// Open a logical channel on a device. The adapter supports one active
    /// channel per device.
    pub fn connect(
        &self,
        device_id: u32,
        protocol_id: u32,
        channel_flags: u32,
        baudrate: u32,
    ) -> Result<u32, ErrorCode> {
        debug!("connect: device={device_id} protocol={protocol_id:#x} baudrate={baudrate}");
        let mut registry = self.inner.registry.lock().unwrap();

        let device_exists = registry.devices.contains_key(&device_id);
        if !device_exists {
            self.set_last_error("invalid device ID");
            return Err(ErrorCode::InvalidDeviceId);
        }
        {
            let device = &registry.devices[&device_id];
            if !device.channels.is_empty() {
                self.set_last_error("only one active channel is supported per device");
                return Err(ErrorCode::ChannelInUse);
            }
        }
        if protocol_id != passthru::protocol::CAN {
            self.set_last_error("protocol not supported (only CAN)");
            return Err(ErrorCode::InvalidProtocolId);
        }
        if baudrate == 0 {
            self.set_last_error("invalid baudrate");
            return Err(ErrorCode::InvalidBaudrate);
        }

        // The adapter channel is opened raw; ISO-TP and K-Line framing for
        // the host side are layered above this crate.
        let session = Arc::clone(&registry.devices[&device_id].session);
        let adapter_handle = match session.open_channel(
            ChannelProtocol::Raw,
            baudrate,
            None,
            0,
            0,
            HOUSEKEEPING_TIMEOUT_MS,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                self.set_last_error(format!("failed to open channel: {err}"));
                return Err(err.error_code());
            }
        };
        debug!("adapter channel opened, handle={adapter_handle}");

        let channel_id = registry.next_id;
        registry.next_id += 1;
        let channel = Arc::new(Channel::new(
            device_id,
            protocol_id,
            channel_flags,
            baudrate,
            adapter_handle,
        ));

        let device = registry.devices.get_mut(&device_id).unwrap();
        device.channels.insert(channel_id, Arc::clone(&channel));
        registry.channel_to_device.insert(channel_id, device_id);

        let device = registry.devices.get_mut(&device_id).unwrap();
        if device.polling.is_none() {
            let stop = Arc::new(AtomicBool::new(false));
            device.stop_polling = Arc::clone(&stop);
            let inner = Arc::clone(&self.inner);
            let session = Arc::clone(&device.session);
            device.polling = Some(thread::spawn(move || {
                polling_loop(inner, device_id, session, stop);
            }));
        }

        Ok(channel_id)
    }

    /// Close a channel and stop the device's polling thread.
    pub fn disconnect(&self, channel_id: u32) -> Result<(), ErrorCode> {
        let (session, channel, polling) = {
            let mut registry = self.inner.registry.lock().unwrap();
            let Some(device_id) = registry.channel_to_device.remove(&channel_id) else {
                self.set_last_error("invalid channel ID");
                return Err(ErrorCode::InvalidChannelId);
            };
            let Some(device) = registry.devices.get_mut(&device_id) else {
                self.set_last_error("invalid device");
                return Err(ErrorCode::InvalidDeviceId);
            };
            let Some(channel) = device.channels.remove(&channel_id) else {
                self.set_last_error("invalid channel ID");
                return Err(ErrorCode::InvalidChannelId);
            };
            device.stop_polling.store(true, Ordering::Relaxed);
            (Arc::clone(&device.session), channel, device.polling.take())
        };

        if let Some(handle) = polling {
            let _ = handle.join();
        }
        self.teardown_channel(&session, &channel);
        Ok(())
    }

    fn channel_arc(&self, channel_id: u32) -> Result<Arc<Channel>, ErrorCode> {
        let found = {
            let registry = self.inner.registry.lock().unwrap();
            registry
                .channel_to_device
                .get(&channel_id)
                .and_then(|device_id| registry.devices.get(device_id))
                .and_then(|device| device.channels.get(&channel_id))
                .cloned()
        };
        match found {
            Some(channel) => Ok(channel),
            None => {
                self.set_last_error("invalid channel ID");
                Err(ErrorCode::InvalidChannelId)
            }
        }
    }

    // --- message operations ----------------------------------------------

    /// Read up to `max_msgs` queued messages, blocking up to `timeout_ms`
    /// for the first one.
    pub fn read_msgs(
        &self,
        channel_id: u32,
        max_msgs: usize,
        timeout_ms: u32,
    ) -> Result<Vec<PassThruMsg>, ErrorCode> {
        if max_msgs == 0 {
            return Ok(Vec::new());
        }
        let channel = self.channel_arc(channel_id)?;

        let mut queue = channel.rx.lock().unwrap();
        if queue.is_empty() && timeout_ms > 0 {
            let (guard, _) = channel
                .rx_ready
                .wait_timeout_while(
                    queue,
                    Duration::from_millis(u64::from(timeout_ms)),
                    |queue| queue.is_empty(),
                )
                .unwrap();
            queue = guard;
        }

        let take = queue.len().min(max_msgs);
        let msgs: Vec<PassThruMsg> = queue.drain(..take).collect();
        if msgs.is_empty() {
            return Err(if timeout_ms > 0 {
                ErrorCode::Timeout
            } else {
                ErrorCode::BufferEmpty
            });
        }
        Ok(msgs)
    }

    /// Write messages, batching consecutive frames that share an
    /// arbitration into single `Send` PDUs. `written` counts the messages
    /// handed to the adapter even when a later batch fails.
    pub fn write_msgs(
        &self,
        channel_id: u32,
        msgs: &[PassThruMsg],
        timeout_ms: u32,
        written: &mut u32,
    ) -> Result<(), ErrorCode> {
        *written = 0;
        let registry = self.inner.registry.lock().unwrap();
        let Some((session, channel)) = registry
            .channel_to_device
            .get(&channel_id)
            .and_then(|device_id| registry.devices.get(device_id))
            .and_then(|device| {
                device
                    .channels
                    .get(&channel_id)
                    .map(|channel| (Arc::clone(&device.session), Arc::clone(channel)))
            })
        else {
            self.set_last_error("invalid channel ID");
            return Err(ErrorCode::InvalidChannelId);
        };

        let mut index = 0;
        while index < msgs.len() {
            let head = &msgs[index];
            if head.protocol_id != channel.protocol_id {
                self.set_last_error("message protocol mismatch");
                return Err(ErrorCode::MsgProtocolId);
            }
            if head.data_size < 4 {
                self.set_last_error("invalid message size");
                return Err(ErrorCode::InvalidMsg);
            }

            let batch_id = head.can_id().unwrap();
            let batch_extension = extension_of(head.tx_flags);

            // Collect consecutive messages sharing this arbitration.
            let mut batch: Vec<Vec<u8>> = Vec::new();
            let mut batch_flags: Vec<u32> = Vec::new();
            let mut batch_bytes = 1usize;
            while index < msgs.len() {
                let msg = &msgs[index];
                if msg.protocol_id != channel.protocol_id || msg.data_size < 4 {
                    break;
                }
                if msg.can_id() != Some(batch_id) || extension_of(msg.tx_flags) != batch_extension
                {
                    break;
                }
                let frame_size = 1 + (msg.data_size as usize - 4);
                if batch_bytes + frame_size > MAX_BATCH_BYTES && !batch.is_empty() {
                    break;
                }
                batch.push(msg.can_payload().unwrap().to_vec());
                batch_flags.push(msg.tx_flags);
                batch_bytes += frame_size;
                index += 1;
            }
            if batch.is_empty() {
                index += 1;
                continue;
            }

            // Re-program the arbitration only when it actually changed.
            let arbitration = Arbitration {
                request: batch_id,
                request_extension: batch_extension,
                reply_pattern: 0,
                // A zero mask means the adapter passes every identifier;
                // host-side filters narrow it down.
                reply_mask: 0,
                reply_extension: 0,
            };
            let needs_arbitration = {
                let state = channel.state.lock().unwrap();
                state.last_tx_arb != Some(arbitration)
            };
            if needs_arbitration {
                if let Err(err) =
                    session.set_arbitration(channel.adapter_handle, &arbitration, timeout_ms)
                {
                    self.set_last_error(format!("failed to set arbitration: {err}"));
                    return Err(err.error_code());
                }
                channel.state.lock().unwrap().last_tx_arb = Some(arbitration);
            }

            if let Err(err) = session.send_batch(channel.adapter_handle, &batch) {
                self.set_last_error(format!("failed to send messages: {err}"));
                return Err(err.error_code());
            }

            // Loopback echoes each sent message that passes the filters.
            let loopback: Vec<PassThruMsg> = {
                let state = channel.state.lock().unwrap();
                if state.loopback {
                    batch
                        .iter()
                        .zip(&batch_flags)
                        .filter(|(data, _)| passes_filters(&state.filters, batch_id, data))
                        .map(|(data, tx_flags)| {
                            let mut msg =
                                PassThruMsg::can(channel.protocol_id, batch_id, data, *tx_flags);
                            msg.rx_status = flags::TX_MSG_TYPE;
                            if tx_flags & flags::CAN_29BIT_ID != 0 {
                                msg.rx_status |= flags::CAN_29BIT_ID;
                            }
                            msg.timestamp = (timestamp_micros() & 0xFFFF_FFFF) as u32;
                            msg
                        })
                        .collect()
                } else {
                    Vec::new()
                }
            };
            for msg in loopback {
                channel.push_rx(msg);
            }

            *written += batch.len() as u32;
        }

        Ok(())
    }

    // --- periodic messages -----------------------------------------------

    /// Start a periodic message; returns the host-side message ID.
    pub fn start_periodic_msg(
        &self,
        channel_id: u32,
        msg: &PassThruMsg,
        time_interval_ms: u32,
    ) -> Result<u32, ErrorCode> {
        let (session, channel) = self.session_and_channel(channel_id)?;

        if msg.data_size < 4 {
            self.set_last_error("invalid message size");
            return Err(ErrorCode::InvalidMsg);
        }
        let can_id = msg.can_id().unwrap();
        let arbitration = Arbitration {
            request: can_id,
            request_extension: 0,
            reply_pattern: 0,
            reply_mask: 0xFFFF_FFFF,
            reply_extension: 0,
        };
        let interval_byte = (time_interval_ms / 10).min(255) as u8;

        let adapter_handle = match session.start_periodic(
            interval_byte,
            &arbitration,
            msg.can_payload().unwrap(),
            HOUSEKEEPING_TIMEOUT_MS,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                self.set_last_error(format!("failed to start periodic message: {err}"));
                return Err(err.error_code());
            }
        };

        let mut state = channel.state.lock().unwrap();
        let msg_id = state.next_periodic_id;
        state.next_periodic_id += 1;
        state.periodic.insert(msg_id, adapter_handle);
        Ok(msg_id)
    }

    /// Stop a periodic message by host-side ID.
    pub fn stop_periodic_msg(&self, channel_id: u32, msg_id: u32) -> Result<(), ErrorCode> {
        let (session, channel) = self.session_and_channel(channel_id)?;

        let adapter_handle = {
            let state = channel.state.lock().unwrap();
            match state.periodic.get(&msg_id) {
                Some(handle) => *handle,
                None => {
                    self.set_last_error("invalid message ID");
                    return Err(ErrorCode::InvalidMsgId);
                }
            }
        };

        if let Err(err) = session.end_periodic(adapter_handle, HOUSEKEEPING_TIMEOUT_MS) {
            // Some firmware loses individual periodic handles; handle 0
            // stops them all. Fall back to that before giving up.
            if session.end_periodic(0, HOUSEKEEPING_TIMEOUT_MS).is_err() {
                self.set_last_error(format!("failed to stop periodic message: {err}"));
                return Err(ErrorCode::Failed);
            }
            channel.state.lock().unwrap().periodic.clear();
            return Ok(());
        }

        channel.state.lock().unwrap().periodic.remove(&msg_id);
        Ok(())
    }

    // --- filters ---------------------------------------------------------

    /// Install a message filter; returns the filter ID.
    pub fn start_msg_filter(
        &self,
        channel_id: u32,
        filter_type: u32,
        mask: &PassThruMsg,
        pattern: &PassThruMsg,
        flow_control: Option<&PassThruMsg>,
    ) -> Result<u32, ErrorCode> {
        let (session, channel) = self.session_and_channel(channel_id)?;

        if !matches!(
            filter_type,
            filter::PASS_FILTER | filter::BLOCK_FILTER | filter::FLOW_CONTROL_FILTER
        ) {
            self.set_last_error("invalid filter type");
            return Err(ErrorCode::InvalidMsg);
        }
        if filter_type == filter::FLOW_CONTROL_FILTER
            && channel.protocol_id != passthru::protocol::ISO15765
        {
            self.set_last_error("flow control filters require ISO15765");
            return Err(ErrorCode::NotSupported);
        }

        let mask_size = mask.data_size as usize;
        let pattern_size = pattern.data_size as usize;
        if mask_size == 0 || pattern_size == 0 || mask_size > 12 || mask_size != pattern_size {
            self.set_last_error("invalid filter message size");
            return Err(ErrorCode::InvalidMsg);
        }

        let entry = Filter {
            kind: filter_type,
            mask: u32::from_be_bytes([mask.data[0], mask.data[1], mask.data[2], mask.data[3]]),
            pattern: u32::from_be_bytes([
                pattern.data[0],
                pattern.data[1],
                pattern.data[2],
                pattern.data[3],
            ]),
            mask_bytes: mask.data[..mask_size].to_vec(),
            pattern_bytes: pattern.data[..pattern_size].to_vec(),
            flow_control_id: flow_control
                .filter(|msg| msg.data_size >= 4)
                .and_then(|msg| msg.can_id()),
        };

        let filter_id = {
            let mut state = channel.state.lock().unwrap();
            let filter_id = state.next_filter_id;
            state.next_filter_id += 1;
            state.filters.insert(filter_id, entry);
            filter_id
        };

        // Filtering happens host-side; configure the adapter to pass every
        // frame (zero reply mask).
        let pass_all = Arbitration {
            reply_mask: 0,
            ..Arbitration::default()
        };
        if let Err(err) =
            session.set_arbitration(channel.adapter_handle, &pass_all, HOUSEKEEPING_TIMEOUT_MS)
        {
            warn!("pass-all arbitration failed: {err}");
        }

        Ok(filter_id)
    }

    /// Remove a message filter.
    pub fn stop_msg_filter(&self, channel_id: u32, filter_id: u32) -> Result<(), ErrorCode> {
        let channel = self.channel_arc(channel_id)?;
        let mut state = channel.state.lock().unwrap();
        if state.filters.remove(&filter_id).is_none() {
            drop(state);
            self.set_last_error("invalid filter ID");
            return Err(ErrorCode::InvalidFilterId);
        }
        Ok(())
    }

    // --- ioctl operations ------------------------------------------------

    /// `GET_CONFIG`: fill in the values of known parameters, leave unknown
    /// ones untouched.
    pub fn get_config(&self, channel_id: u32, params: &mut [SConfig]) -> Result<(), ErrorCode> {
        let channel = self.channel_arc(channel_id)?;
        let state = channel.state.lock().unwrap();
        for param in params {
            match param.parameter {
                config::DATA_RATE => param.value = state.data_rate,
                config::LOOPBACK => param.value = u32::from(state.loopback),
                _ => {}
            }
        }
        Ok(())
    }

    /// `SET_CONFIG`: apply known parameters, silently ignore unknown ones.
    pub fn set_config(&self, channel_id: u32, params: &[SConfig]) -> Result<(), ErrorCode> {
        let channel = self.channel_arc(channel_id)?;
        let mut state = channel.state.lock().unwrap();
        for param in params {
            match param.parameter {
                config::DATA_RATE => state.data_rate = param.value,
                config::LOOPBACK => state.loopback = param.value != 0,
                _ => {}
            }
        }
        Ok(())
    }

    /// `READ_VBATT` / `READ_PROG_VOLTAGE`: battery voltage in millivolts.
    /// Callers pass either a device ID or a channel ID.
    pub fn read_vbatt(&self, id: u32) -> Result<u32, ErrorCode> {
        let session = {
            let registry = self.inner.registry.lock().unwrap();
            registry
                .devices
                .get(&id)
                .or_else(|| {
                    registry
                        .channel_to_device
                        .get(&id)
                        .and_then(|device_id| registry.devices.get(device_id))
                })
                .map(|device| Arc::clone(&device.session))
        };
        let Some(session) = session else {
            self.set_last_error("invalid device ID");
            return Err(ErrorCode::InvalidDeviceId);
        };
        match session.read_voltage(HOUSEKEEPING_TIMEOUT_MS) {
            Ok(millivolts) => Ok(u32::from(millivolts)),
            Err(err) => {
                self.set_last_error(format!("failed to read voltage: {err}"));
                Err(ErrorCode::Failed)
            }
        }
    }

    /// `CLEAR_RX_BUFFER`: drop queued messages.
    pub fn clear_rx_buffer(&self, channel_id: u32) -> Result<(), ErrorCode> {
        let channel = self.channel_arc(channel_id)?;
        channel.rx.lock().unwrap().clear();
        Ok(())
    }

    /// `CLEAR_TX_BUFFER`: nothing is buffered on the transmit side.
    pub fn clear_tx_buffer(&self, channel_id: u32) -> Result<(), ErrorCode> {
        self.channel_arc(channel_id).map(|_| ())
    }

    /// `CLEAR_PERIODIC_MSGS`: stop every periodic message on the channel.
    pub fn clear_periodic_msgs(&self, channel_id: u32) -> Result<(), ErrorCode> {
        let (session, channel) = self.session_and_channel(channel_id)?;
        let handles: Vec<u8> = {
            let mut state = channel.state.lock().unwrap();
            let handles = state.periodic.values().copied().collect();
            state.periodic.clear();
            handles
        };
        for handle in handles {
            let _ = session.end_periodic(handle, HOUSEKEEPING_TIMEOUT_MS);
        }
        Ok(())
    }

    /// `CLEAR_MSG_FILTERS`: drop every filter on the channel.
    pub fn clear_msg_filters(&self, channel_id: u32) -> Result<(), ErrorCode> {
        let channel = self.channel_arc(channel_id)?;
        channel.state.lock().unwrap().filters.clear();
        Ok(())
    }

    // --- version ---------------------------------------------------------

    /// Firmware, DLL and API version strings.
    pub fn read_version(&self, device_id: u32) -> Result<(String, String, String), ErrorCode> {
        let session = {
            let registry = self.inner.registry.lock().unwrap();
            registry
                .devices
                .get(&device_id)
                .map(|device| Arc::clone(&device.session))
        };
        let Some(session) = session else {
            self.set_last_error("invalid device ID");
            return Err(ErrorCode::InvalidDeviceId);
        };

        // Refresh the cached identity when the adapter still answers.
        let fresh = session.device_info(HOUSEKEEPING_TIMEOUT_MS).ok();
        let mut registry = self.inner.registry.lock().unwrap();
        let Some(device) = registry.devices.get_mut(&device_id) else {
            self.set_last_error("invalid device ID");
            return Err(ErrorCode::InvalidDeviceId);
        };
        if let Some(info) = fresh {
            device.info = info;
        }
        Ok((
            device.info.firmware.clone(),
            DLL_VERSION.to_string(),
            API_VERSION.to_string(),
        ))
    }

    /// Cached identity of an open device.
    pub fn device_info(&self, device_id: u32) -> Result<DeviceInfo, ErrorCode> {
        let info = {
            let registry = self.inner.registry.lock().unwrap();
            registry
                .devices
                .get(&device_id)
                .map(|device| device.info.clone())
        };
        info.ok_or_else(|| {
            self.set_last_error("invalid device ID");
            ErrorCode::InvalidDeviceId
        })
    }

    fn session_and_channel(
        &self,
        channel_id: u32,
    ) -> Result<(Arc<Session>, Arc<Channel>), ErrorCode> {
        let found = {
            let registry = self.inner.registry.lock().unwrap();
            registry
                .channel_to_device
                .get(&channel_id)
                .and_then(|device_id| registry.devices.get(device_id))
                .and_then(|device| {
                    device
                        .channels
                        .get(&channel_id)
                        .map(|channel| (Arc::clone(&device.session), Arc::clone(channel)))
                })
        };
        match found {
            Some(pair) => Ok(pair),
            None => {
                self.set_last_error("invalid channel ID");
                Err(ErrorCode::InvalidChannelId)
            }
        }
    }
}

fn extension_of(tx_flags: u32) -> u8 {
    u8::from(tx_flags & flags::CAN_29BIT_ID != 0)
}

/// Convert a received frame into the host message layout: 4-byte
/// big-endian identifier followed by the payload, with the lower 32 bits
/// of the arrival timestamp.
fn rx_msg(protocol_id: u32, frame: &CanFrame) -> PassThruMsg {
    let mut msg = PassThruMsg::new(protocol_id);
    let len = frame.data.len().min(MSG_DATA_LEN - 4);
    msg.data[..4].copy_from_slice(&frame.id.to_be_bytes());
    msg.data[4..4 + len].copy_from_slice(&frame.data[..len]);
    msg.data_size = (4 + len) as u32;
    msg.extra_data_index = msg.data_size;
    msg.timestamp = (frame.timestamp_us & 0xFFFF_FFFF) as u32;
    if frame.id > 0x7FF {
        msg.rx_status |= flags::CAN_29BIT_ID;
    }
    msg
}

/// Per-device polling thread: drain received frames from the session and
/// fan them into the (single) channel's RX queue after filter evaluation.
fn polling_loop(
    inner: Arc<ManagerInner>,
    device_id: u32,
    session: Arc<Session>,
    stop: Arc<AtomicBool>,
) {
    debug!("polling thread started for device {device_id}");
    while !stop.load(Ordering::Relaxed) {
        if !session.is_connected() {
            thread::sleep(Duration::from_millis(u64::from(POLL_WINDOW_MS)));
            continue;
        }

        let frames = session.receive_messages(POLL_WINDOW_MS);
        if frames.is_empty() {
            continue;
        }

        let registry = inner.registry.lock().unwrap();
        let Some(device) = registry.devices.get(&device_id) else {
            break;
        };
        let Some(channel) = device.channels.values().next() else {
            continue;
        };

        for frame in frames {
            let passed = {
                let state = channel.state.lock().unwrap();
                passes_filters(&state.filters, frame.id, &frame.data)
            };
            if !passed {
                continue;
            }
            channel.push_rx(rx_msg(channel.protocol_id, &frame));
        }
    }
    debug!("polling thread stopped for device {device_id}");
}
