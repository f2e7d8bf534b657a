//! Frame wire parsing and conversion to volts.

use rust_moku::config::CalibrationConfig;
use rust_moku::frame::{decode, RawFrame, INVALID_SAMPLE};
use rust_moku::scales::{Frontend, MonitorTap, ScaleState};
use rust_moku::{Channel, MokuError};

fn scales(taps: [MonitorTap; 2]) -> ScaleState {
    let mut s = ScaleState::from_calibration(
        &CalibrationConfig::default(),
        [Frontend::default(); 2],
        taps,
    );
    s.decimation = 4.0;
    s.time_min = -1e-6;
    s.time_step = 8e-9;
    s
}

#[test]
fn test_parse_wire_frame() {
    let frame = RawFrame::new(7, 42, vec![1, -2, INVALID_SAMPLE], vec![3, 4, 5]).unwrap();
    let bytes = frame.to_bytes();
    assert_eq!(bytes.len(), 12 + 3 * 8);
    assert_eq!(&bytes[..4], &7u32.to_le_bytes());

    let parsed = RawFrame::parse(&bytes).unwrap();
    assert_eq!(parsed, frame);
}

#[test]
fn test_parse_rejects_truncated_frames() {
    let frame = RawFrame::new(1, 1, vec![1, 2], vec![3, 4]).unwrap();
    let bytes = frame.to_bytes();

    assert!(matches!(
        RawFrame::parse(&bytes[..8]),
        Err(MokuError::MalformedFrame(_))
    ));
    assert!(matches!(
        RawFrame::parse(&bytes[..bytes.len() - 1]),
        Err(MokuError::MalformedFrame(_))
    ));
}

#[test]
fn test_decode_per_tap_gains() {
    let s = scales([
        MonitorTap::FilterInput(Channel::One),
        MonitorTap::Dac(Channel::Two),
    ]);
    let raw = RawFrame::new(0, 0, vec![3750, -7500], vec![30000, INVALID_SAMPLE]).unwrap();

    let volts = decode(&raw, &s);
    assert!((volts.channel_a[0] - 1.0).abs() < 1e-12);
    assert!((volts.channel_a[1] + 2.0).abs() < 1e-12);
    assert!((volts.channel_b[0] - 1.0).abs() < 1e-12);
    assert!(volts.channel_b[1].is_nan());

    assert_eq!(volts.axis.len(), 2);
    assert!((volts.axis[1] - (-1e-6 + 8e-9)).abs() < 1e-18);
}

#[test]
fn test_precision_mode_divides_by_decimation() {
    let mut s = scales([MonitorTap::Input(Channel::One), MonitorTap::Off]);
    let raw = RawFrame::new(0, 0, vec![4 * 3750], vec![9]).unwrap();

    let normal = decode(&raw, &s);
    assert!((normal.channel_a[0] - 4.0).abs() < 1e-12);

    s.precision_mode = true;
    let precise = decode(&raw, &s);
    assert!((precise.channel_a[0] - 1.0).abs() < 1e-12);
    // a disabled tap passes raw counts through
    assert_eq!(precise.channel_b[0], 9.0 / 4.0);
}

#[test]
fn test_mismatched_channels_never_build_a_frame() {
    assert!(matches!(
        RawFrame::new(2, 5, vec![1, 2], vec![3]),
        Err(MokuError::MalformedFrame(_))
    ));

    // header claims one sample per channel but carries three samples
    let mut bytes = RawFrame::new(2, 5, vec![1], vec![2]).unwrap().to_bytes().to_vec();
    bytes.extend_from_slice(&9i32.to_le_bytes());
    assert!(matches!(
        RawFrame::parse(&bytes),
        Err(MokuError::MalformedFrame(_))
    ));

    let frame = RawFrame::new(2, 5, vec![7, 8], vec![9, 10]).unwrap();
    assert_eq!(frame.state_id(), 2);
    assert_eq!(frame.frame_id(), 5);
    assert_eq!(frame.channel_b(), &[9, 10]);
}
