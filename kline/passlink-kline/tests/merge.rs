//! Multi-frame merging, retroactive sequencing and validation failures.

use passlink_kline::{
    decode_stream, kwp_frame, kwp_frames, Action, ProtocolMode, Transceiver,
};

#[test]
fn two_frame_sequence_is_detected_retroactively() {
    let mut trx = Transceiver::kwp();
    let first = kwp_frame(0x10, 0xF1, &[0x62, 0xF1, 0x01, 0xAA], 0x80);
    let second = kwp_frame(0x10, 0xF1, &[0x62, 0xF1, 0x02, 0xBB], 0x80);

    assert_eq!(trx.feed(&first), Action::WaitForMore);
    assert_eq!(trx.feed(&second), Action::WaitForMore);
    // The buffered 0x01 was stripped once 0x02 confirmed the sequence.
    assert_eq!(trx.finalize(), Action::Process(vec![0x62, 0xF1, 0xAA, 0xBB]));
}

#[test]
fn lone_first_frame_keeps_its_potential_sequence_byte() {
    let mut trx = Transceiver::kwp();
    let only = kwp_frame(0x10, 0xF1, &[0x62, 0xF1, 0x01, 0xAA], 0x80);
    assert_eq!(trx.feed(&only), Action::WaitForMore);
    // No follower ever confirmed a sequence; 0x01 is payload data.
    assert_eq!(trx.finalize(), Action::Process(vec![0x62, 0xF1, 0x01, 0xAA]));
}

#[test]
fn second_frame_without_0x02_does_not_enter_sequence_mode() {
    let mut trx = Transceiver::kwp();
    trx.feed(&kwp_frame(0x10, 0xF1, &[0x62, 0xF1, 0x01, 0xAA], 0x80));
    trx.feed(&kwp_frame(0x10, 0xF1, &[0x62, 0xF1, 0x7B, 0xCC], 0x80));
    assert_eq!(
        trx.finalize(),
        Action::Process(vec![0x62, 0xF1, 0x01, 0xAA, 0x7B, 0xCC])
    );
}

#[test]
fn sequence_mode_validates_every_further_frame() {
    let mut trx = Transceiver::kwp();
    trx.feed(&kwp_frame(0x10, 0xF1, &[0x62, 0xF1, 0x01, 0x11], 0x80));
    trx.feed(&kwp_frame(0x10, 0xF1, &[0x62, 0xF1, 0x02, 0x22], 0x80));
    trx.feed(&kwp_frame(0x10, 0xF1, &[0x62, 0xF1, 0x03, 0x33], 0x80));
    // Skipping 0x04 is a violation.
    assert!(matches!(
        trx.feed(&kwp_frame(0x10, 0xF1, &[0x62, 0xF1, 0x05, 0x44], 0x80)),
        Action::ProtocolViolation(_)
    ));
    // Violation cleared the merge state.
    assert_eq!(trx.finalize(), Action::WaitForMore);
}

#[test]
fn service_pid_mismatch_is_rejected() {
    let mut trx = Transceiver::kwp();
    trx.feed(&kwp_frame(0x10, 0xF1, &[0x62, 0xF1, 0xAA], 0x80));
    assert!(matches!(
        trx.feed(&kwp_frame(0x10, 0xF1, &[0x62, 0xF2, 0xBB], 0x80)),
        Action::ProtocolViolation(_)
    ));
}

#[test]
fn corrupt_checksum_resets_the_transceiver() {
    let mut trx = Transceiver::kwp();
    trx.feed(&kwp_frame(0x10, 0xF1, &[0x62, 0xF1, 0xAA], 0x80));

    let mut bad = kwp_frame(0x10, 0xF1, &[0x62, 0xF1, 0xBB], 0x80);
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;
    assert!(matches!(
        trx.feed(&bad),
        Action::ProtocolViolation(_)
    ));
    assert_eq!(trx.finalize(), Action::WaitForMore);
}

#[test]
fn wrong_size_for_length_nibble_is_rejected() {
    let mut trx = Transceiver::kwp();
    // Format byte claims three payload bytes but only two follow.
    let mut frame = vec![0x83, 0x10, 0xF1, 0x62, 0xF1];
    frame.push(passlink_kline::checksum(&frame));
    assert!(matches!(
        trx.feed(&frame),
        Action::ProtocolViolation(_)
    ));
}

#[test]
fn address_expectations_filter_frames() {
    let mut trx = Transceiver::new(ProtocolMode::Kwp, Some(0xF1), Some(0x10), None);
    let good = kwp_frame(0xF1, 0x10, &[0x50, 0x81], 0x80);
    let bad = kwp_frame(0xF1, 0x33, &[0x50, 0x81], 0x80);
    assert_eq!(trx.feed(&good), Action::WaitForMore);
    assert!(matches!(trx.feed(&bad), Action::ProtocolViolation(_)));
}

#[test]
fn expected_length_terminates_the_merge() {
    let mut trx = Transceiver::new(ProtocolMode::Kwp, None, None, Some(5));
    trx.feed(&kwp_frame(0x10, 0xF1, &[0x62, 0xF1, 0x01, 0x11], 0x80));
    match trx.feed(&kwp_frame(0x10, 0xF1, &[0x62, 0xF1, 0x02, 0x22, 0x33], 0x80)) {
        Action::Process(payload) => assert_eq!(payload, vec![0x62, 0xF1, 0x11, 0x22, 0x33]),
        other => panic!("unexpected action: {other:?}"),
    }
}

#[test]
fn iso9141_merge_is_plain_concatenation() {
    let mut trx = Transceiver::iso9141();
    let first = passlink_kline::iso9141_frame(0x48, 0x6B, 0x11, &[0x41, 0x00]);
    let second = passlink_kline::iso9141_frame(0x48, 0x6B, 0x11, &[0xBE, 0x1F]);
    assert_eq!(trx.feed(&first), Action::WaitForMore);
    assert_eq!(trx.feed(&second), Action::WaitForMore);
    assert_eq!(
        trx.finalize(),
        Action::Process(vec![0x41, 0x00, 0xBE, 0x1F])
    );
}

#[test]
fn decode_stream_drives_a_full_capture() {
    // A chunked response rebuilt from its raw concatenated capture.
    let payload: Vec<u8> = [0x61, 0x01].iter().copied().chain(0..12).collect();
    let frames = kwp_frames(0xF1, 0x10, &payload, 0x80, 4);
    let raw: Vec<u8> = frames.concat();
    assert_eq!(
        decode_stream(&raw, ProtocolMode::Kwp, None, None, None),
        payload
    );
}

#[test]
fn decode_stream_returns_empty_on_violation() {
    let mut raw = kwp_frame(0x10, 0xF1, &[0x62, 0xF1, 0xAA], 0x80);
    let last = raw.len() - 1;
    raw[last] ^= 0x01;
    assert!(decode_stream(&raw, ProtocolMode::Kwp, None, None, None).is_empty());
}
