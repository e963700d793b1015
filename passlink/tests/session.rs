//! Session behavior against the emulated adapter: request/response
//! correlation, timeout bounds, asynchronous frame interleaving.

use std::sync::Arc;
use std::time::{Duration, Instant};

use passlink::mock::MockAdapter;
use passlink::{Session, SessionError};
use passlink_wire::{ChannelProtocol, PduType};

fn session_over(adapter: &MockAdapter) -> Session {
    let session = Session::new(Box::new(adapter.clone()));
    session.connect().unwrap();
    session
}

#[test]
fn ping_round_trips_before_the_timeout() {
    let adapter = MockAdapter::new();
    let session = session_over(&adapter);

    let started = Instant::now();
    let echo = session.ping(&[0xDE, 0xAD], 1000).unwrap();
    assert_eq!(echo, vec![0xDE, 0xAD]);
    assert!(started.elapsed() < Duration::from_millis(1000));
}

#[test]
fn device_info_and_voltage_queries() {
    let adapter = MockAdapter::new();
    let session = session_over(&adapter);

    let info = session.device_info(1000).unwrap();
    assert_eq!(info.model, "LinkBox");
    assert_eq!(info.firmware, "2.4.1");
    assert_eq!(session.read_voltage(1000).unwrap(), 12_600);
}

#[test]
fn a_silent_peer_times_out_within_one_polling_quantum() {
    let adapter = MockAdapter::new();
    adapter.set_muted(true);
    let session = session_over(&adapter);

    let started = Instant::now();
    let result = session.ping(&[], 200);
    let elapsed = started.elapsed();
    assert!(matches!(result, Err(SessionError::Timeout)));
    assert!(elapsed >= Duration::from_millis(200));
    // Granularity is bounded by the 50 ms polling quantum; leave slack for
    // a loaded test machine.
    assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
    assert_eq!(session.last_error(), "response timeout");
}

#[test]
fn interleaved_frames_reach_the_fifo_and_the_response_arrives_once() {
    let adapter = MockAdapter::new();
    let session = session_over(&adapter);

    // Two asynchronous deliveries are already queued ahead of the reply.
    adapter.inject_frame(1, 0x7E8, 0, &[0x41, 0x00]);
    adapter.inject_frame(1, 0x7EF, 0, &[0x41, 0x20]);

    assert_eq!(session.read_voltage(1000).unwrap(), 12_600);

    let frames = session.receive_messages(100);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].id, 0x7E8);
    assert_eq!(frames[0].data, vec![0x41, 0x00]);
    assert_eq!(frames[1].id, 0x7EF);
    assert_eq!(frames[1].data, vec![0x41, 0x20]);
}

#[test]
fn compressed_deliveries_are_decompressed_in_order() {
    let adapter = MockAdapter::new();
    let session = session_over(&adapter);

    let bulk: Vec<u8> = (0..300u16).map(|i| (i % 11) as u8).collect();
    adapter.inject_compressed_frame(1, 0x18DA_F110, 1, &bulk);
    adapter.inject_frame(1, 0x7E8, 0, &[0x01]);

    let frames = session.receive_messages(500);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].data, bulk);
    assert_eq!(frames[0].extension, 1);
    assert_eq!(frames[1].data, vec![0x01]);
}

#[test]
fn garbage_on_the_wire_does_not_break_the_stream() {
    let adapter = MockAdapter::new();
    let session = session_over(&adapter);

    adapter.inject_bytes(&[0xAB, 0xCD, 0x00]);
    adapter.inject_frame(1, 0x123, 0, &[0x55]);

    let frames = session.receive_messages(500);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id, 0x123);
}

#[test]
fn adapter_errors_surface_with_their_fixed_message() {
    let adapter = MockAdapter::new();
    let session = session_over(&adapter);

    adapter.fail_next(PduType::ErrorInvalidChannel);
    let result = session.open_channel(ChannelProtocol::Raw, 500_000, None, 0, 0, 1000);
    match result {
        Err(SessionError::Adapter(PduType::ErrorInvalidChannel)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(session.last_error(), "Invalid channel");
}

#[test]
fn open_close_and_arbitration_round_trip() {
    let adapter = MockAdapter::new();
    let session = session_over(&adapter);

    let handle = session
        .open_channel(ChannelProtocol::Raw, 500_000, None, 1000, 0, 1000)
        .unwrap();
    assert_eq!(handle, 1);

    let arbitration = passlink_wire::Arbitration {
        request: 0x7E0,
        ..Default::default()
    };
    session.set_arbitration(handle, &arbitration, 1000).unwrap();
    session.close_channel(handle, 1000).unwrap();

    let fd = session
        .open_channel(ChannelProtocol::RawFd, 500_000, Some(2_000_000), 0, 0, 1000)
        .unwrap();
    assert_eq!(fd, 2);
}

#[test]
fn periodic_end_accepts_both_acknowledgements() {
    let adapter = MockAdapter::new();
    let session = session_over(&adapter);
    let arbitration = passlink_wire::Arbitration {
        request: 0x7DF,
        ..Default::default()
    };

    let handle = session
        .start_periodic(20, &arbitration, &[0x01, 0x3E], 1000)
        .unwrap();
    session.end_periodic(handle, 1000).unwrap();

    // Firmware that acknowledges with a bare Ok is also success.
    adapter.set_end_periodic_with_ok(true);
    let handle = session
        .start_periodic(20, &arbitration, &[0x01, 0x3E], 1000)
        .unwrap();
    session.end_periodic(handle, 1000).unwrap();
}

#[test]
fn fire_and_forget_batches_do_not_poison_later_requests() {
    let adapter = MockAdapter::new();
    let session = session_over(&adapter);

    // The adapter acks the batch with an Ok nobody waits for.
    session
        .send_batch(1, &[vec![0x02, 0x01, 0x0D], vec![0x02, 0x01, 0x0C]])
        .unwrap();

    // The next typed request still correlates correctly.
    assert_eq!(session.read_voltage(1000).unwrap(), 12_600);
    let echo = session.ping(&[0x42], 1000).unwrap();
    assert_eq!(echo, vec![0x42]);
}

#[test]
fn async_mode_pumps_in_the_background() {
    let adapter = MockAdapter::new();
    let session = Arc::new(Session::new(Box::new(adapter.clone())));
    session.connect().unwrap();
    session.set_async_mode(true);

    assert_eq!(session.read_voltage(1000).unwrap(), 12_600);

    adapter.inject_frame(1, 0x7E8, 0, &[0x10, 0x14]);
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut frames = Vec::new();
    while frames.is_empty() && Instant::now() < deadline {
        frames = session.receive_messages(100);
    }
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id, 0x7E8);

    session.set_async_mode(false);
    session.disconnect();
}

#[test]
fn disconnect_fails_in_flight_requests_cleanly() {
    let adapter = MockAdapter::new();
    adapter.set_muted(true);
    let session = Arc::new(session_over(&adapter));

    let worker = {
        let session = Arc::clone(&session);
        std::thread::spawn(move || session.ping(&[], 400))
    };
    std::thread::sleep(Duration::from_millis(50));
    session.disconnect();

    match worker.join().unwrap() {
        Err(SessionError::Timeout) | Err(SessionError::Transport(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
}
