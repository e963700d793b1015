//! Host-side device and channel records, and software filter evaluation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use passlink_wire::{Arbitration, DeviceInfo};

use crate::passthru::{filter, PassThruMsg};
use crate::session::Session;

/// One message filter installed on a channel.
#[derive(Debug, Clone)]
pub struct Filter {
    /// Pass, block or flow-control.
    pub kind: u32,
    /// Identifier mask from the first four mask bytes.
    pub mask: u32,
    /// Identifier pattern from the first four pattern bytes.
    pub pattern: u32,
    /// Full byte-wise mask; covers the identifier and, beyond four bytes,
    /// leading payload bytes.
    pub mask_bytes: Vec<u8>,
    /// Full byte-wise pattern, same length as `mask_bytes`.
    pub pattern_bytes: Vec<u8>,
    /// Flow-control source identifier (ISO-TP filters only).
    pub flow_control_id: Option<u32>,
}

impl Filter {
    /// Whether a frame matches this filter.
    ///
    /// With a byte-wise mask of four to twelve bytes, byte `i < 4` tests
    /// the big-endian identifier and byte `i >= 4` tests payload byte
    /// `i - 4` (a missing payload byte is a mismatch). Shorter masks fall
    /// back to the 32-bit identifier test.
    pub fn matches(&self, can_id: u32, data: &[u8]) -> bool {
        let len = self.mask_bytes.len();
        if (4..=12).contains(&len) && len == self.pattern_bytes.len() {
            let id_bytes = can_id.to_be_bytes();
            for i in 0..len {
                let value = if i < 4 {
                    id_bytes[i]
                } else {
                    match data.get(i - 4) {
                        Some(byte) => *byte,
                        None => return false,
                    }
                };
                let mask = self.mask_bytes[i];
                if value & mask != self.pattern_bytes[i] & mask {
                    return false;
                }
            }
            return true;
        }
        can_id & self.mask == self.pattern & self.mask
    }
}

/// Filter verdict for one frame: no pass filter means default-pass;
/// otherwise at least one pass filter must match and no block filter may.
pub fn passes_filters(filters: &HashMap<u32, Filter>, can_id: u32, data: &[u8]) -> bool {
    let mut has_pass_filter = false;
    let mut pass_match = false;

    for entry in filters.values() {
        match entry.kind {
            filter::PASS_FILTER => {
                has_pass_filter = true;
                if entry.matches(can_id, data) {
                    pass_match = true;
                }
            }
            filter::BLOCK_FILTER => {
                if entry.matches(can_id, data) {
                    return false;
                }
            }
            _ => {}
        }
    }

    !has_pass_filter || pass_match
}

/// Mutable channel bookkeeping, guarded by the channel state mutex.
#[derive(Default)]
pub struct ChannelState {
    pub filters: HashMap<u32, Filter>,
    pub next_filter_id: u32,
    /// Host periodic-message ID to adapter periodic handle.
    pub periodic: HashMap<u32, u8>,
    pub next_periodic_id: u32,
    /// Last transmit arbitration actually programmed into the adapter.
    pub last_tx_arb: Option<Arbitration>,
    pub loopback: bool,
    pub data_rate: u32,
}

/// One logical channel of an open device.
pub struct Channel {
    pub device_id: u32,
    pub protocol_id: u32,
    pub flags: u32,
    pub baudrate: u32,
    /// Channel handle at the adapter.
    pub adapter_handle: u8,
    pub state: Mutex<ChannelState>,
    /// Ready-to-deliver host messages. Guarded separately so a blocked
    /// reader never holds the registry lock.
    pub rx: Mutex<VecDeque<PassThruMsg>>,
    pub rx_ready: Condvar,
}

impl Channel {
    pub fn new(
        device_id: u32,
        protocol_id: u32,
        flags: u32,
        baudrate: u32,
        adapter_handle: u8,
    ) -> Self {
        Self {
            device_id,
            protocol_id,
            flags,
            baudrate,
            adapter_handle,
            state: Mutex::new(ChannelState {
                next_filter_id: 1,
                next_periodic_id: 1,
                data_rate: baudrate,
                ..ChannelState::default()
            }),
            rx: Mutex::new(VecDeque::new()),
            rx_ready: Condvar::new(),
        }
    }

    /// Queue one message for the reader side and wake one waiter.
    pub fn push_rx(&self, msg: PassThruMsg) {
        self.rx.lock().unwrap().push_back(msg);
        self.rx_ready.notify_one();
    }
}

/// One open device: its session, identity, channels and polling thread.
pub struct Device {
    pub session: Arc<Session>,
    pub info: DeviceInfo,
    pub connection: String,
    pub channels: HashMap<u32, Arc<Channel>>,
    pub polling: Option<thread::JoinHandle<()>>,
    pub stop_polling: Arc<AtomicBool>,
}

impl Device {
    pub fn new(session: Arc<Session>, info: DeviceInfo, connection: String) -> Self {
        Self {
            session,
            info,
            connection,
            channels: HashMap::new(),
            polling: None,
            stop_polling: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass(mask: &[u8], pattern: &[u8]) -> Filter {
        Filter {
            kind: filter::PASS_FILTER,
            mask: u32::from_be_bytes([mask[0], mask[1], mask[2], mask[3]]),
            pattern: u32::from_be_bytes([pattern[0], pattern[1], pattern[2], pattern[3]]),
            mask_bytes: mask.to_vec(),
            pattern_bytes: pattern.to_vec(),
            flow_control_id: None,
        }
    }

    #[test]
    fn id_only_filter_masks_the_identifier() {
        let f = pass(&[0xFF, 0xFF, 0xFF, 0xFF], &[0x00, 0x00, 0x07, 0xE8]);
        assert!(f.matches(0x7E8, &[]));
        assert!(!f.matches(0x7E0, &[]));

        let any = pass(&[0, 0, 0, 0], &[0, 0, 0, 0]);
        assert!(any.matches(0x123, &[1, 2, 3]));
    }

    #[test]
    fn byte_wise_filter_reaches_into_the_payload() {
        // Match ID 0x7E8 and first payload byte 0x10 (first frame PCI).
        let f = pass(
            &[0xFF, 0xFF, 0xFF, 0xFF, 0xF0],
            &[0x00, 0x00, 0x07, 0xE8, 0x10],
        );
        assert!(f.matches(0x7E8, &[0x10, 0x14]));
        assert!(f.matches(0x7E8, &[0x1F]));
        assert!(!f.matches(0x7E8, &[0x02, 0x01]));
        // Missing payload byte is a mismatch.
        assert!(!f.matches(0x7E8, &[]));
    }

    #[test]
    fn default_pass_until_a_pass_filter_exists() {
        let mut filters = HashMap::new();
        assert!(passes_filters(&filters, 0x123, &[]));

        filters.insert(1, pass(&[0xFF, 0xFF, 0xFF, 0xFF], &[0x00, 0x00, 0x07, 0xE8]));
        assert!(passes_filters(&filters, 0x7E8, &[]));
        assert!(!passes_filters(&filters, 0x123, &[]));
    }

    #[test]
    fn block_filters_override_pass_filters() {
        let mut filters = HashMap::new();
        filters.insert(1, pass(&[0, 0, 0, 0], &[0, 0, 0, 0]));
        let mut block = pass(&[0xFF, 0xFF, 0xFF, 0xFF], &[0x00, 0x00, 0x07, 0xFF]);
        block.kind = filter::BLOCK_FILTER;
        filters.insert(2, block);

        assert!(passes_filters(&filters, 0x7E8, &[]));
        assert!(!passes_filters(&filters, 0x7FF, &[]));
    }
}
