//! Commit engine behaviour through the public register API.

use rust_moku::codec::{FieldCodec, Transform};
use rust_moku::commit::{CommitState, RegisterDevice, REG_STATE};
use rust_moku::register_map::AttributeSpec;
use rust_moku::scales::ScaleState;
use rust_moku::transport::{MockTransport, RegisterWrite};
use rust_moku::MokuError;

const REG_GAIN: u32 = 40;
const REG_MODE: u32 = 41;
const REG_RUN: u32 = 42;

fn gain_to_raw(x: f64, s: &ScaleState) -> f64 {
    x / s.gain_dac[0]
}

fn gain_from_raw(raw: f64, s: &ScaleState) -> f64 {
    raw * s.gain_dac[0]
}

const TABLE: &[AttributeSpec] = &[
    AttributeSpec::new("gain", REG_GAIN, FieldCodec::signed(0, 16)).with_transform(
        Transform::Dependent {
            to_raw: gain_to_raw,
            from_raw: gain_from_raw,
        },
    ),
    AttributeSpec::new("mode", REG_MODE, FieldCodec::unsigned(0, 2)),
    AttributeSpec::new("fast", REG_MODE, FieldCodec::flag(2)),
    AttributeSpec::new("run", REG_RUN, FieldCodec::flag(0)).control(),
];

fn device() -> (RegisterDevice, MockTransport) {
    let mock = MockTransport::new();
    let dev = RegisterDevice::new(Box::new(mock.clone()), &[TABLE]).unwrap();
    (dev, mock)
}

#[test]
fn test_shared_register_fields_merge() {
    let (mut dev, mock) = device();
    mock.set_register(REG_MODE, 0xF0);
    dev.sync(&ScaleState::default()).unwrap();

    dev.stage_code("mode", 3).unwrap();
    dev.stage_flag("fast", true).unwrap();
    dev.commit(&ScaleState::default(), &[]).unwrap();

    // bits outside both fields survive the read-modify-write
    assert_eq!(mock.register(REG_MODE), 0xF0 | 0b111);
    let tx = mock.last_transaction().unwrap();
    assert_eq!(tx.iter().filter(|w| w.address == REG_MODE).count(), 1);
}

#[test]
fn test_data_before_control() {
    let (mut dev, mock) = device();
    dev.stage_flag("run", true).unwrap();
    dev.stage_code("mode", 1).unwrap();
    dev.commit(&ScaleState::default(), &[]).unwrap();

    let addresses: Vec<u32> = mock
        .last_transaction()
        .unwrap()
        .iter()
        .map(|w| w.address)
        .collect();
    // the never-read gain register goes out with the first transaction
    assert_eq!(addresses, vec![REG_GAIN, REG_MODE, REG_RUN, REG_STATE]);
}

#[test]
fn test_unknown_register_overwrites_device_residue() {
    let (mut dev, mock) = device();
    mock.set_register(REG_GAIN, 555);
    dev.stage_code("mode", 1).unwrap();
    dev.commit(&ScaleState::default(), &[]).unwrap();

    assert_eq!(mock.register(REG_GAIN), 0);
    assert_eq!(dev.map().remote_word(REG_GAIN), Some(0));

    mock.clear_log();
    dev.stage_code("mode", 2).unwrap();
    dev.commit(&ScaleState::default(), &[]).unwrap();
    let addresses: Vec<u32> = mock
        .last_transaction()
        .unwrap()
        .iter()
        .map(|w| w.address)
        .collect();
    assert_eq!(addresses, vec![REG_MODE, REG_STATE]);
}

#[test]
fn test_derived_values_follow_scales() {
    let (mut dev, mock) = device();
    let mut scales = ScaleState::default();
    scales.gain_dac[0] = 0.01;

    dev.commit(&scales, &[("gain", 1.0)]).unwrap();
    assert_eq!(mock.register(REG_GAIN), 100);

    // same engineering value, same scales: nothing to send
    mock.clear_log();
    dev.commit(&scales, &[("gain", 1.0)]).unwrap();
    assert!(mock.call_log().is_empty());

    scales.gain_dac[0] = 0.02;
    dev.commit(&scales, &[("gain", 1.0)]).unwrap();
    assert_eq!(mock.register(REG_GAIN), 50);
    assert!((dev.read("gain", &scales).unwrap() - 1.0).abs() < 1e-12);
}

#[test]
fn test_derived_overflow_is_reported_and_nothing_sent() {
    let (mut dev, mock) = device();
    let mut scales = ScaleState::default();
    scales.gain_dac[0] = 1e-6;
    dev.stage_code("mode", 2).unwrap();

    let err = dev.commit(&scales, &[("gain", 1.0)]).unwrap_err();
    assert!(matches!(err, MokuError::RangeOverflow { ref attribute, .. } if attribute == "gain"));
    assert!(mock.call_log().is_empty());
    assert_eq!(dev.state(), CommitState::Dirty);
    assert_eq!(dev.map().pending(), vec!["mode"]);
}

#[test]
fn test_stage_rejects_unrepresentable_value() {
    let (mut dev, _mock) = device();
    let err = dev.stage_code("mode", 4).unwrap_err();
    assert!(matches!(err, MokuError::Validation { .. }));
    assert!(matches!(
        dev.stage("missing", 1.0),
        Err(MokuError::UnknownAttribute(_))
    ));
    assert_eq!(dev.state(), CommitState::Clean);
}

#[test]
fn test_conflicting_tables_rejected() {
    const CLASH: &[AttributeSpec] = &[AttributeSpec::new(
        "mode_alias",
        REG_MODE,
        FieldCodec::unsigned(1, 2),
    )];
    let err = RegisterDevice::new(Box::new(MockTransport::new()), &[TABLE, CLASH]).unwrap_err();
    assert!(matches!(err, MokuError::BindingConflict(_)));
}

#[test]
fn test_state_id_tags_each_commit() {
    let (mut dev, mock) = device();
    for expected in 1..=3u8 {
        dev.stage_code("mode", u32::from(expected)).unwrap();
        dev.commit(&ScaleState::default(), &[]).unwrap();
        assert_eq!(dev.state_id(), expected);
        assert_eq!(
            mock.last_transaction().unwrap().last(),
            Some(&RegisterWrite::new(REG_STATE, u32::from(expected)))
        );
    }
}
