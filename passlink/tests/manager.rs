//! Device-manager behavior over the emulated adapter: registries, TX
//! batching with arbitration suppression, filters, loopback, periodic
//! messages and ioctl handling.

use std::time::{Duration, Instant};

use passlink::mock::MockAdapter;
use passlink::passthru::{config, filter, flags, protocol};
use passlink::{DeviceManager, ErrorCode, PassThruMsg, SConfig};
use passlink_wire::{Pdu, PduType};

/// Open a device over a fresh emulated adapter and connect one channel.
fn open_and_connect(manager: &DeviceManager) -> (MockAdapter, u32, u32) {
    let adapter = MockAdapter::new();
    let device_id = manager
        .open_device_with(Box::new(adapter.clone()), "")
        .unwrap();
    let channel_id = manager
        .connect(device_id, protocol::CAN, 0, 500_000)
        .unwrap();
    (adapter, device_id, channel_id)
}

/// Commands the host sent after device open and channel setup.
fn commands_after_setup(adapter: &MockAdapter) -> Vec<Pdu> {
    adapter
        .commands()
        .into_iter()
        .filter(|pdu| {
            !matches!(
                pdu.pdu_type(),
                PduType::RequestInfo | PduType::OpenChannel
            )
        })
        .collect()
}

fn wait_for_msgs(
    manager: &DeviceManager,
    channel_id: u32,
    count: usize,
    deadline_ms: u64,
) -> Vec<PassThruMsg> {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    let mut msgs = Vec::new();
    while msgs.len() < count && Instant::now() < deadline {
        if let Ok(read) = manager.read_msgs(channel_id, count - msgs.len(), 100) {
            msgs.extend(read);
        }
    }
    msgs
}

#[test]
fn open_device_caches_identity_and_reports_versions() {
    let manager = DeviceManager::new();
    let adapter = MockAdapter::new();
    let device_id = manager
        .open_device_with(Box::new(adapter), "")
        .unwrap();

    let info = manager.device_info(device_id).unwrap();
    assert_eq!(info.vendor, "Vanagon Labs");

    let (firmware, dll, api) = manager.read_version(device_id).unwrap();
    assert_eq!(firmware, "2.4.1");
    assert_eq!(dll, "1.0.0");
    assert_eq!(api, "04.04");

    manager.close_device(device_id).unwrap();
    assert_eq!(
        manager.close_device(device_id),
        Err(ErrorCode::InvalidDeviceId)
    );
}

#[test]
fn connect_validates_protocol_baudrate_and_channel_count() {
    let manager = DeviceManager::new();
    let adapter = MockAdapter::new();
    let device_id = manager
        .open_device_with(Box::new(adapter.clone()), "")
        .unwrap();

    assert_eq!(
        manager.connect(device_id, protocol::ISO15765, 0, 500_000),
        Err(ErrorCode::InvalidProtocolId)
    );
    assert_eq!(
        manager.connect(device_id, protocol::CAN, 0, 0),
        Err(ErrorCode::InvalidBaudrate)
    );
    assert_eq!(
        manager.connect(9999, protocol::CAN, 0, 500_000),
        Err(ErrorCode::InvalidDeviceId)
    );

    let channel_id = manager
        .connect(device_id, protocol::CAN, 0, 500_000)
        .unwrap();
    assert_eq!(
        manager.connect(device_id, protocol::CAN, 0, 500_000),
        Err(ErrorCode::ChannelInUse)
    );

    // The adapter channel was opened with the raw protocol.
    let open = adapter
        .commands()
        .into_iter()
        .find(|pdu| pdu.pdu_type() == PduType::OpenChannel)
        .unwrap();
    assert_eq!(
        open.protocol().unwrap(),
        passlink_wire::ChannelProtocol::Raw
    );
    assert_eq!(open.bitrate().unwrap(), 500_000);

    manager.disconnect(channel_id).unwrap();
    assert_eq!(
        manager.disconnect(channel_id),
        Err(ErrorCode::InvalidChannelId)
    );
    manager.close_device(device_id).unwrap();
}

#[test]
fn write_msgs_batches_by_arbitration() {
    let manager = DeviceManager::new();
    let (adapter, device_id, channel_id) = open_and_connect(&manager);

    // Three messages to 0x7E0 followed by two to 0x7E8.
    let msgs: Vec<PassThruMsg> = [
        (0x7E0u32, vec![0x02, 0x01, 0x0D]),
        (0x7E0, vec![0x02, 0x01, 0x0C]),
        (0x7E0, vec![0x02, 0x01, 0x05]),
        (0x7E8, vec![0x01, 0x3E]),
        (0x7E8, vec![0x02, 0x3E, 0x00]),
    ]
    .iter()
    .map(|(id, data)| PassThruMsg::can(protocol::CAN, *id, data, 0))
    .collect();

    let mut written = 0;
    manager
        .write_msgs(channel_id, &msgs, 1000, &mut written)
        .unwrap();
    assert_eq!(written, 5);

    let wire = commands_after_setup(&adapter);
    assert_eq!(wire.len(), 4);
    assert_eq!(wire[0].pdu_type(), PduType::SetArbitration);
    assert_eq!(wire[0].arbitration().unwrap().request, 0x7E0);
    assert_eq!(wire[1].pdu_type(), PduType::Send);
    // handle ‖ {len ‖ bytes} × 3
    assert_eq!(
        wire[1].payload(),
        &[
            0x01, 0x03, 0x02, 0x01, 0x0D, 0x03, 0x02, 0x01, 0x0C, 0x03, 0x02, 0x01, 0x05
        ]
    );
    assert_eq!(wire[2].pdu_type(), PduType::SetArbitration);
    assert_eq!(wire[2].arbitration().unwrap().request, 0x7E8);
    assert_eq!(wire[3].pdu_type(), PduType::Send);
    assert_eq!(wire[3].payload(), &[0x01, 0x02, 0x01, 0x3E, 0x03, 0x02, 0x3E, 0x00]);

    manager.close_device(device_id).unwrap();
}

#[test]
fn unchanged_arbitration_is_not_reprogrammed() {
    let manager = DeviceManager::new();
    let (adapter, device_id, channel_id) = open_and_connect(&manager);

    let msg = PassThruMsg::can(protocol::CAN, 0x7E0, &[0x01, 0x3E], 0);
    let mut written = 0;
    manager
        .write_msgs(channel_id, &[msg], 1000, &mut written)
        .unwrap();
    manager
        .write_msgs(channel_id, &[msg], 1000, &mut written)
        .unwrap();

    let wire = commands_after_setup(&adapter);
    let arbitrations = wire
        .iter()
        .filter(|pdu| pdu.pdu_type() == PduType::SetArbitration)
        .count();
    let sends = wire
        .iter()
        .filter(|pdu| pdu.pdu_type() == PduType::Send)
        .count();
    assert_eq!(arbitrations, 1);
    assert_eq!(sends, 2);

    manager.close_device(device_id).unwrap();
}

#[test]
fn write_msgs_rejects_protocol_mismatch_and_short_messages() {
    let manager = DeviceManager::new();
    let (_adapter, device_id, channel_id) = open_and_connect(&manager);

    let wrong = PassThruMsg::can(protocol::ISO15765, 0x7E0, &[0x3E], 0);
    let mut written = 1;
    assert_eq!(
        manager.write_msgs(channel_id, &[wrong], 1000, &mut written),
        Err(ErrorCode::MsgProtocolId)
    );
    assert_eq!(written, 0);

    let mut short = PassThruMsg::new(protocol::CAN);
    short.data_size = 2;
    assert_eq!(
        manager.write_msgs(channel_id, &[short], 1000, &mut written),
        Err(ErrorCode::InvalidMsg)
    );

    manager.close_device(device_id).unwrap();
}

#[test]
fn received_frames_are_delivered_through_the_polling_thread() {
    let manager = DeviceManager::new();
    let (adapter, device_id, channel_id) = open_and_connect(&manager);

    adapter.inject_frame(1, 0x7E8, 0, &[0x41, 0x0D, 0x32]);
    adapter.inject_frame(1, 0x18DA_F110, 1, &[0x50]);

    let msgs = wait_for_msgs(&manager, channel_id, 2, 2000);
    assert_eq!(msgs.len(), 2);

    assert_eq!({ msgs[0].protocol_id }, protocol::CAN);
    assert_eq!({ msgs[0].data_size }, 7);
    assert_eq!({ msgs[0].extra_data_index }, 7);
    assert_eq!(
        msgs[0].data_bytes(),
        &[0x00, 0x00, 0x07, 0xE8, 0x41, 0x0D, 0x32]
    );
    assert_eq!({ msgs[0].rx_status }, 0);

    // 29-bit identifiers carry the status flag.
    assert_eq!(msgs[1].can_id(), Some(0x18DA_F110));
    assert_eq!(msgs[1].rx_status & flags::CAN_29BIT_ID, flags::CAN_29BIT_ID);

    manager.close_device(device_id).unwrap();
}

#[test]
fn read_msgs_reports_timeout_or_buffer_empty() {
    let manager = DeviceManager::new();
    let (_adapter, device_id, channel_id) = open_and_connect(&manager);

    assert_eq!(
        manager.read_msgs(channel_id, 4, 0),
        Err(ErrorCode::BufferEmpty)
    );

    let started = Instant::now();
    assert_eq!(
        manager.read_msgs(channel_id, 4, 150),
        Err(ErrorCode::Timeout)
    );
    assert!(started.elapsed() >= Duration::from_millis(150));

    assert_eq!(
        manager.read_msgs(9999, 4, 0),
        Err(ErrorCode::InvalidChannelId)
    );

    manager.close_device(device_id).unwrap();
}

#[test]
fn pass_filters_narrow_delivery() {
    let manager = DeviceManager::new();
    let (adapter, device_id, channel_id) = open_and_connect(&manager);

    let mask = PassThruMsg::can(protocol::CAN, 0xFFFF_FFFF, &[], 0);
    let pattern = PassThruMsg::can(protocol::CAN, 0x7E8, &[], 0);
    let filter_id = manager
        .start_msg_filter(channel_id, filter::PASS_FILTER, &mask, &pattern, None)
        .unwrap();

    adapter.inject_frame(1, 0x123, 0, &[0x99]);
    adapter.inject_frame(1, 0x7E8, 0, &[0x41]);

    let msgs = wait_for_msgs(&manager, channel_id, 1, 2000);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].can_id(), Some(0x7E8));
    // The filtered-out frame never shows up.
    assert_eq!(
        manager.read_msgs(channel_id, 4, 0),
        Err(ErrorCode::BufferEmpty)
    );

    manager.stop_msg_filter(channel_id, filter_id).unwrap();
    assert_eq!(
        manager.stop_msg_filter(channel_id, filter_id),
        Err(ErrorCode::InvalidFilterId)
    );

    // Installing a filter reconfigures the adapter to pass everything.
    let pass_all = adapter
        .commands()
        .iter()
        .filter(|pdu| pdu.pdu_type() == PduType::SetArbitration)
        .any(|pdu| pdu.arbitration().unwrap().reply_mask == 0);
    assert!(pass_all);

    manager.close_device(device_id).unwrap();
}

#[test]
fn flow_control_filters_require_isotp() {
    let manager = DeviceManager::new();
    let (_adapter, device_id, channel_id) = open_and_connect(&manager);

    let mask = PassThruMsg::can(protocol::CAN, 0xFFFF_FFFF, &[], 0);
    let pattern = PassThruMsg::can(protocol::CAN, 0x7E8, &[], 0);
    assert_eq!(
        manager.start_msg_filter(
            channel_id,
            filter::FLOW_CONTROL_FILTER,
            &mask,
            &pattern,
            None
        ),
        Err(ErrorCode::NotSupported)
    );

    manager.close_device(device_id).unwrap();
}

#[test]
fn loopback_echoes_written_messages() {
    let manager = DeviceManager::new();
    let (_adapter, device_id, channel_id) = open_and_connect(&manager);

    manager
        .set_config(
            channel_id,
            &[SConfig {
                parameter: config::LOOPBACK,
                value: 1,
            }],
        )
        .unwrap();

    let msg = PassThruMsg::can(protocol::CAN, 0x7E0, &[0x02, 0x01, 0x0D], 0);
    let mut written = 0;
    manager
        .write_msgs(channel_id, &[msg], 1000, &mut written)
        .unwrap();

    let echoed = manager.read_msgs(channel_id, 4, 500).unwrap();
    assert_eq!(echoed.len(), 1);
    assert_eq!(echoed[0].rx_status & flags::TX_MSG_TYPE, flags::TX_MSG_TYPE);
    assert_eq!(echoed[0].can_id(), Some(0x7E0));
    assert_eq!(echoed[0].can_payload(), Some(&[0x02, 0x01, 0x0D][..]));

    manager.close_device(device_id).unwrap();
}

#[test]
fn config_round_trips_data_rate_and_loopback() {
    let manager = DeviceManager::new();
    let (_adapter, device_id, channel_id) = open_and_connect(&manager);

    manager
        .set_config(
            channel_id,
            &[
                SConfig {
                    parameter: config::DATA_RATE,
                    value: 250_000,
                },
                // Unknown parameters are ignored.
                SConfig {
                    parameter: 0x9999,
                    value: 7,
                },
            ],
        )
        .unwrap();

    let mut query = [
        SConfig {
            parameter: config::DATA_RATE,
            value: 0,
        },
        SConfig {
            parameter: config::LOOPBACK,
            value: 0xFF,
        },
    ];
    manager.get_config(channel_id, &mut query).unwrap();
    assert_eq!(query[0].value, 250_000);
    assert_eq!(query[1].value, 0);

    manager.close_device(device_id).unwrap();
}

#[test]
fn vbatt_reads_through_device_or_channel_id() {
    let manager = DeviceManager::new();
    let (_adapter, device_id, channel_id) = open_and_connect(&manager);

    assert_eq!(manager.read_vbatt(device_id).unwrap(), 12_600);
    assert_eq!(manager.read_vbatt(channel_id).unwrap(), 12_600);
    assert_eq!(manager.read_vbatt(9999), Err(ErrorCode::InvalidDeviceId));

    manager.close_device(device_id).unwrap();
}

#[test]
fn periodic_messages_map_host_ids_to_adapter_handles() {
    let manager = DeviceManager::new();
    let (adapter, device_id, channel_id) = open_and_connect(&manager);

    let msg = PassThruMsg::can(protocol::CAN, 0x7DF, &[0x01, 0x3E], 0);
    let msg_id = manager.start_periodic_msg(channel_id, &msg, 2550).unwrap();

    let start = adapter
        .commands()
        .into_iter()
        .find(|pdu| pdu.pdu_type() == PduType::StartPeriodicMessage)
        .unwrap();
    // 2550 ms / 10 = interval byte 255.
    assert_eq!(start.payload()[0], 255);
    let arbitration = start.arbitration().unwrap();
    assert_eq!(arbitration.request, 0x7DF);
    assert_eq!(arbitration.reply_mask, 0xFFFF_FFFF);
    assert_eq!(start.data().unwrap(), &[0x01, 0x3E]);

    manager.stop_periodic_msg(channel_id, msg_id).unwrap();
    assert_eq!(
        manager.stop_periodic_msg(channel_id, msg_id),
        Err(ErrorCode::InvalidMsgId)
    );

    manager.close_device(device_id).unwrap();
}

#[test]
fn clear_ioctls_empty_queue_filters_and_periodics() {
    let manager = DeviceManager::new();
    let (adapter, device_id, channel_id) = open_and_connect(&manager);

    adapter.inject_frame(1, 0x7E8, 0, &[0x01]);
    let _ = wait_for_msgs(&manager, channel_id, 1, 2000);
    adapter.inject_frame(1, 0x7E8, 0, &[0x02]);
    std::thread::sleep(Duration::from_millis(200));

    manager.clear_rx_buffer(channel_id).unwrap();
    assert_eq!(
        manager.read_msgs(channel_id, 4, 0),
        Err(ErrorCode::BufferEmpty)
    );

    let msg = PassThruMsg::can(protocol::CAN, 0x7DF, &[0x01, 0x3E], 0);
    manager.start_periodic_msg(channel_id, &msg, 100).unwrap();
    manager.clear_periodic_msgs(channel_id).unwrap();

    let mask = PassThruMsg::can(protocol::CAN, 0xFFFF_FFFF, &[], 0);
    let pattern = PassThruMsg::can(protocol::CAN, 0x7E8, &[], 0);
    manager
        .start_msg_filter(channel_id, filter::PASS_FILTER, &mask, &pattern, None)
        .unwrap();
    manager.clear_msg_filters(channel_id).unwrap();

    // With filters cleared, everything is delivered again.
    adapter.inject_frame(1, 0x456, 0, &[0x03]);
    let msgs = wait_for_msgs(&manager, channel_id, 1, 2000);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].can_id(), Some(0x456));

    manager.clear_tx_buffer(channel_id).unwrap();
    manager.close_device(device_id).unwrap();
}
