//! Oscilloscope capture core and the standalone oscilloscope instrument.
//!
//! Every instrument that streams monitor frames embeds an
//! [`OscilloscopeCore`]: analog frontends, trigger, timebase and precision
//! mode live in the shared [`OSC_REGISTERS`] table. The core holds no register
//! state of its own, only the acquisition constants and the requested
//! timebase; every setter stages through the instrument's [`RegisterDevice`].

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use super::Instrument;
use crate::channel::Channel;
use crate::codec::{FieldCodec, Transform};
use crate::commit::RegisterDevice;
use crate::config::{CalibrationConfig, DeviceConfig, ADC_DEFAULT_CALIBRATION};
use crate::error::{AppResult, MokuError};
use crate::register_map::AttributeSpec;
use crate::scales::{Frontend, MonitorTap, ScaleState};
use crate::transport::Transport;
use crate::validation::{check_choice, Range};

/// Analog frontend control.
pub const REG_AINCTL: u32 = 13;
/// Capture source selection.
pub const REG_OUTSEL: u32 = 64;
/// Trigger arming mode.
pub const REG_TRIGMODE: u32 = 65;
/// Trigger source, edge and filtering.
pub const REG_TRIGCTL: u32 = 66;
/// Trigger level in source bits.
pub const REG_TRIGLVL: u32 = 67;
/// Acquisition control.
pub const REG_ACTL: u32 = 68;
/// Capture decimation.
pub const REG_DECIMATION: u32 = 69;

/// Samples per channel in one captured frame.
pub const CHANNEL_BUFFER_LEN: usize = 8192;

/// ADC sample rate of the oscilloscope input path, samples per second.
pub const OSC_INPUT_RATE: f64 = 500e6;

/// Trigger level limits in volts.
pub const TRIGGER_LEVEL_RANGE: Range = Range::new(-10.0, 10.0);

const FIFTYR: [&str; 2] = ["fiftyr_ch1", "fiftyr_ch2"];
const ATTEN: [&str; 2] = ["atten_ch1", "atten_ch2"];
const AC: [&str; 2] = ["ac_ch1", "ac_ch2"];
const SOURCE: [&str; 2] = ["source_ch1", "source_ch2"];

fn level_to_raw(volts: f64, s: &ScaleState) -> f64 {
    volts / s.trigger_gain
}

fn level_from_raw(raw: f64, s: &ScaleState) -> f64 {
    raw * s.trigger_gain
}

/// Registers shared by every instrument with an oscilloscope core.
pub const OSC_REGISTERS: &[AttributeSpec] = &[
    AttributeSpec::new(FIFTYR[0], REG_AINCTL, FieldCodec::flag(0)),
    AttributeSpec::new(ATTEN[0], REG_AINCTL, FieldCodec::flag(1)),
    AttributeSpec::new(AC[0], REG_AINCTL, FieldCodec::flag(2)),
    AttributeSpec::new(FIFTYR[1], REG_AINCTL, FieldCodec::flag(3)),
    AttributeSpec::new(ATTEN[1], REG_AINCTL, FieldCodec::flag(4)),
    AttributeSpec::new(AC[1], REG_AINCTL, FieldCodec::flag(5)),
    AttributeSpec::new(SOURCE[0], REG_OUTSEL, FieldCodec::flag(0)),
    AttributeSpec::new(SOURCE[1], REG_OUTSEL, FieldCodec::flag(1)),
    AttributeSpec::new("trig_mode", REG_TRIGMODE, FieldCodec::unsigned(0, 2)),
    AttributeSpec::new("trig_source", REG_TRIGCTL, FieldCodec::unsigned(0, 3)),
    AttributeSpec::new("trig_edge", REG_TRIGCTL, FieldCodec::unsigned(3, 2)),
    AttributeSpec::new("hysteresis", REG_TRIGCTL, FieldCodec::flag(5)),
    AttributeSpec::new("hf_reject", REG_TRIGCTL, FieldCodec::flag(6)),
    AttributeSpec::new("trigger_level", REG_TRIGLVL, FieldCodec::signed(0, 32))
        .with_transform(Transform::Dependent {
            to_raw: level_to_raw,
            from_raw: level_from_raw,
        })
        .with_limits(TRIGGER_LEVEL_RANGE.min, TRIGGER_LEVEL_RANGE.max),
    AttributeSpec::new("precision_mode", REG_ACTL, FieldCodec::flag(0)),
    AttributeSpec::new("decimation", REG_DECIMATION, FieldCodec::unsigned(0, 32))
        .with_limits(1.0, u32::MAX as f64),
];

// =============================================================================
// Trigger settings
// =============================================================================

/// Oscilloscope trigger source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Capture channel 1.
    Ch1,
    /// Capture channel 2.
    Ch2,
    /// DAC output 1.
    Dac1,
    /// DAC output 2.
    Dac2,
    /// External trigger input.
    Ext,
}

impl TriggerSource {
    const TABLE: [(&'static str, TriggerSource); 5] = [
        ("ch1", TriggerSource::Ch1),
        ("ch2", TriggerSource::Ch2),
        ("dac1", TriggerSource::Dac1),
        ("dac2", TriggerSource::Dac2),
        ("ext", TriggerSource::Ext),
    ];

    pub fn code(self) -> u32 {
        match self {
            TriggerSource::Ch1 => 0,
            TriggerSource::Ch2 => 1,
            TriggerSource::Dac1 => 2,
            TriggerSource::Dac2 => 3,
            TriggerSource::Ext => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::TABLE.iter().map(|(_, s)| *s).find(|s| s.code() == code)
    }
}

impl FromStr for TriggerSource {
    type Err = MokuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check_choice("trigger source", s, &Self::TABLE)
    }
}

/// Edge the trigger fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEdge {
    Rising,
    Falling,
    Both,
}

impl TriggerEdge {
    const TABLE: [(&'static str, TriggerEdge); 3] = [
        ("rising", TriggerEdge::Rising),
        ("falling", TriggerEdge::Falling),
        ("both", TriggerEdge::Both),
    ];

    pub fn code(self) -> u32 {
        match self {
            TriggerEdge::Rising => 0,
            TriggerEdge::Falling => 1,
            TriggerEdge::Both => 2,
        }
    }
}

impl FromStr for TriggerEdge {
    type Err = MokuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check_choice("trigger edge", s, &Self::TABLE)
    }
}

/// Trigger arming mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Free-run when no trigger arrives.
    Auto,
    /// Capture on every trigger.
    Normal,
    /// Capture once, then disarm.
    Single,
}

impl TriggerMode {
    const TABLE: [(&'static str, TriggerMode); 3] = [
        ("auto", TriggerMode::Auto),
        ("normal", TriggerMode::Normal),
        ("single", TriggerMode::Single),
    ];

    pub fn code(self) -> u32 {
        match self {
            TriggerMode::Auto => 0,
            TriggerMode::Normal => 1,
            TriggerMode::Single => 2,
        }
    }
}

impl FromStr for TriggerMode {
    type Err = MokuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check_choice("trigger mode", s, &Self::TABLE)
    }
}

/// Complete trigger configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trigger {
    pub source: TriggerSource,
    pub edge: TriggerEdge,
    /// Volts.
    pub level: f64,
    /// Widen the trigger threshold to reject noise.
    pub hysteresis: bool,
    /// Low-pass the trigger path.
    pub hf_reject: bool,
    pub mode: TriggerMode,
}

impl Default for Trigger {
    fn default() -> Self {
        Self {
            source: TriggerSource::Ch1,
            edge: TriggerEdge::Rising,
            level: 0.0,
            hysteresis: false,
            hf_reject: false,
            mode: TriggerMode::Auto,
        }
    }
}

/// Signal captured on an oscilloscope channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeSource {
    /// The analog input of the same channel.
    Input,
    /// The DAC output of the same channel, looped back.
    Dac,
}

// =============================================================================
// OscilloscopeCore
// =============================================================================

/// Acquisition helper composed into instruments that capture frames.
#[derive(Debug, Clone)]
pub struct OscilloscopeCore {
    input_rate: f64,
    buffer_len: usize,
    timebase: (f64, f64),
}

impl OscilloscopeCore {
    /// Core sampling at `input_rate` samples per second.
    pub fn new(input_rate: f64) -> Self {
        Self {
            input_rate,
            buffer_len: CHANNEL_BUFFER_LEN,
            timebase: (-1e-3, 1e-3),
        }
    }

    pub fn input_rate(&self) -> f64 {
        self.input_rate
    }

    /// Requested capture window `(t1, t2)` in seconds.
    pub fn timebase(&self) -> (f64, f64) {
        self.timebase
    }

    /// Stage oscilloscope defaults: 50 Ω DC frontends without attenuation,
    /// trigger on channel 1 rising through 0 V in auto mode, a ±1 ms window
    /// and normal (non-precision) acquisition.
    pub fn set_defaults(&mut self, device: &mut RegisterDevice) -> AppResult<()> {
        for ch in Channel::ALL {
            self.set_frontend(device, ch, Frontend::default())?;
        }
        self.set_trigger(device, Trigger::default())?;
        self.set_timebase(device, -1e-3, 1e-3)?;
        self.set_precision_mode(device, false)
    }

    pub fn set_frontend(
        &self,
        device: &mut RegisterDevice,
        ch: Channel,
        frontend: Frontend,
    ) -> AppResult<()> {
        let i = ch.index();
        device.stage_flag(FIFTYR[i], frontend.fiftyr)?;
        device.stage_flag(ATTEN[i], frontend.atten)?;
        device.stage_flag(AC[i], frontend.ac)
    }

    pub fn frontend(&self, device: &RegisterDevice, ch: Channel) -> AppResult<Frontend> {
        let i = ch.index();
        Ok(Frontend {
            fiftyr: device.flag(FIFTYR[i])?,
            atten: device.flag(ATTEN[i])?,
            ac: device.flag(AC[i])?,
        })
    }

    /// Stage a trigger; the level is checked against the trigger range.
    pub fn set_trigger(&self, device: &mut RegisterDevice, trigger: Trigger) -> AppResult<()> {
        TRIGGER_LEVEL_RANGE.check("trigger level", trigger.level)?;
        device.stage_code("trig_source", trigger.source.code())?;
        device.stage_code("trig_edge", trigger.edge.code())?;
        device.stage("trigger_level", trigger.level)?;
        device.stage_flag("hysteresis", trigger.hysteresis)?;
        device.stage_flag("hf_reject", trigger.hf_reject)?;
        device.stage_code("trig_mode", trigger.mode.code())
    }

    /// Decimation needed to fit a window of `span` seconds into one buffer.
    pub fn decimation_for(&self, span: f64) -> u32 {
        let ideal = (span * self.input_rate / self.buffer_len as f64).ceil();
        ideal.clamp(1.0, f64::from(u32::MAX)) as u32
    }

    /// Set the capture window relative to the trigger point.
    pub fn set_timebase(&mut self, device: &mut RegisterDevice, t1: f64, t2: f64) -> AppResult<()> {
        if !t1.is_finite() || !t2.is_finite() {
            return Err(MokuError::validation(
                "timebase",
                format!("({}, {})", t1, t2),
                "finite times",
            ));
        }
        if t2 <= t1 {
            return Err(MokuError::validation(
                "timebase",
                format!("({}, {})", t1, t2),
                "t1 < t2",
            ));
        }
        let decimation = self.decimation_for(t2 - t1);
        device.stage("decimation", f64::from(decimation))?;
        self.timebase = (t1, t2);
        debug!(t1, t2, decimation, "timebase staged");
        Ok(())
    }

    pub fn set_precision_mode(&self, device: &mut RegisterDevice, on: bool) -> AppResult<()> {
        device.stage_flag("precision_mode", on)
    }

    /// Volts per bit of the configured trigger source.
    fn trigger_gain(&self, device: &RegisterDevice, scales: &ScaleState) -> AppResult<f64> {
        let code = device.code("trig_source")?;
        Ok(match TriggerSource::from_code(code) {
            Some(TriggerSource::Ch1) => scales.tap_gain(scales.taps[0]),
            Some(TriggerSource::Ch2) => scales.tap_gain(scales.taps[1]),
            Some(TriggerSource::Dac1) => scales.dac_gain(Channel::One),
            Some(TriggerSource::Dac2) => scales.dac_gain(Channel::Two),
            Some(TriggerSource::Ext) | None => 1.0 / ADC_DEFAULT_CALIBRATION,
        })
    }

    /// Scale state for the staged acquisition settings and monitor taps.
    pub fn scales(
        &self,
        device: &RegisterDevice,
        calibration: &CalibrationConfig,
        taps: [MonitorTap; 2],
    ) -> AppResult<ScaleState> {
        let frontends = [
            self.frontend(device, Channel::One)?,
            self.frontend(device, Channel::Two)?,
        ];
        let mut scales = ScaleState::from_calibration(calibration, frontends, taps);
        scales.precision_mode = device.flag("precision_mode")?;
        scales.decimation = device.value("decimation")?;
        scales.time_min = self.timebase.0;
        scales.time_step = scales.decimation / self.input_rate;
        scales.trigger_gain = self.trigger_gain(device, &scales)?;
        Ok(scales)
    }
}

// =============================================================================
// Oscilloscope instrument
// =============================================================================

/// Two-channel oscilloscope.
pub struct Oscilloscope {
    device: RegisterDevice,
    config: DeviceConfig,
    core: OscilloscopeCore,
}

impl fmt::Debug for Oscilloscope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Oscilloscope")
            .field("device", &self.device)
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl Oscilloscope {
    /// Bind the oscilloscope registers.
    pub fn new(transport: Box<dyn Transport>, config: DeviceConfig) -> AppResult<Self> {
        Ok(Self {
            device: RegisterDevice::new(transport, &[OSC_REGISTERS])?,
            config,
            core: OscilloscopeCore::new(OSC_INPUT_RATE),
        })
    }

    /// Select what capture channel `ch` records.
    pub fn set_source(&mut self, ch: u8, source: ScopeSource) -> AppResult<()> {
        let ch = Channel::parse(ch, "channel")?;
        self.device
            .stage_flag(SOURCE[ch.index()], source == ScopeSource::Dac)
    }

    pub fn source(&self, ch: Channel) -> AppResult<ScopeSource> {
        Ok(if self.device.flag(SOURCE[ch.index()])? {
            ScopeSource::Dac
        } else {
            ScopeSource::Input
        })
    }

    pub fn set_frontend(&mut self, ch: u8, fiftyr: bool, atten: bool, ac: bool) -> AppResult<()> {
        let ch = Channel::parse(ch, "channel")?;
        self.core
            .set_frontend(&mut self.device, ch, Frontend { fiftyr, atten, ac })
    }

    pub fn set_trigger(&mut self, trigger: Trigger) -> AppResult<()> {
        self.core.set_trigger(&mut self.device, trigger)
    }

    pub fn set_timebase(&mut self, t1: f64, t2: f64) -> AppResult<()> {
        self.core.set_timebase(&mut self.device, t1, t2)
    }

    pub fn set_precision_mode(&mut self, on: bool) -> AppResult<()> {
        self.core.set_precision_mode(&mut self.device, on)
    }

    fn taps(&self) -> AppResult<[MonitorTap; 2]> {
        let tap = |ch: Channel| -> AppResult<MonitorTap> {
            Ok(match self.source(ch)? {
                ScopeSource::Input => MonitorTap::Input(ch),
                ScopeSource::Dac => MonitorTap::Dac(ch),
            })
        };
        Ok([tap(Channel::One)?, tap(Channel::Two)?])
    }
}

impl Instrument for Oscilloscope {
    fn id(&self) -> u8 {
        1
    }

    fn name(&self) -> &'static str {
        "oscilloscope"
    }

    fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn device(&self) -> &RegisterDevice {
        &self.device
    }

    fn device_mut(&mut self) -> &mut RegisterDevice {
        &mut self.device
    }

    fn set_defaults(&mut self) -> AppResult<()> {
        self.core.set_defaults(&mut self.device)?;
        for ch in Channel::ALL {
            self.device.stage_flag(SOURCE[ch.index()], false)?;
        }
        Ok(())
    }

    fn calculate_scales(&self) -> AppResult<ScaleState> {
        self.core
            .scales(&self.device, &self.config.calibration, self.taps()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitState;
    use crate::transport::MockTransport;

    fn scope() -> (Oscilloscope, MockTransport) {
        let mock = MockTransport::new();
        let osc = Oscilloscope::new(Box::new(mock.clone()), DeviceConfig::default()).unwrap();
        (osc, mock)
    }

    #[test]
    fn test_decimation_for_span() {
        let core = OscilloscopeCore::new(125e6);
        assert_eq!(core.decimation_for(1e-9), 1);
        // 2 ms at 125 MS/s is 250000 samples, 30.5 buffers
        assert_eq!(core.decimation_for(2e-3), 31);
        assert_eq!(OscilloscopeCore::new(OSC_INPUT_RATE).decimation_for(1e-6), 1);
    }

    #[test]
    fn test_timebase_validation() {
        let (mut osc, _) = scope();
        assert!(osc.set_timebase(1.0, -1.0).is_err());
        assert!(osc.set_timebase(0.0, f64::NAN).is_err());
        assert_eq!(osc.commit_state(), CommitState::Clean);
        osc.set_timebase(0.0, 1e-3).unwrap();
        assert_eq!(osc.device().value("decimation").unwrap(), 62.0);
    }

    #[test]
    fn test_trigger_parsing() {
        assert_eq!("DAC2".parse::<TriggerSource>().unwrap(), TriggerSource::Dac2);
        assert_eq!("both".parse::<TriggerEdge>().unwrap(), TriggerEdge::Both);
        assert!("sideways".parse::<TriggerEdge>().is_err());
        assert_eq!(TriggerSource::from_code(4), Some(TriggerSource::Ext));
    }

    #[test]
    fn test_trigger_level_encoding_follows_source_gain() {
        let (mut osc, mock) = scope();
        osc.set_defaults().unwrap();
        osc.set_trigger(Trigger {
            source: TriggerSource::Dac1,
            level: 1.0,
            ..Trigger::default()
        })
        .unwrap();
        osc.commit().unwrap();

        assert_eq!(mock.register(REG_TRIGLVL), 30000);
        assert_eq!(mock.register(REG_TRIGCTL) & 0b111, 2);
    }

    #[test]
    fn test_trigger_level_tracks_frontend_attenuation() {
        let (mut osc, mock) = scope();
        osc.set_defaults().unwrap();
        osc.set_trigger(Trigger {
            level: 1.0,
            ..Trigger::default()
        })
        .unwrap();
        osc.commit().unwrap();
        assert_eq!(mock.register(REG_TRIGLVL), 3750);

        // only the frontend changes; the stored 1 V level is re-encoded
        osc.set_frontend(1, true, true, false).unwrap();
        osc.commit().unwrap();
        assert_eq!(mock.register(REG_TRIGLVL), 375);
        let addresses: Vec<u32> = mock
            .last_transaction()
            .unwrap()
            .iter()
            .map(|w| w.address)
            .collect();
        assert!(addresses.contains(&REG_TRIGLVL));
    }

    #[test]
    fn test_trigger_level_out_of_range() {
        let (mut osc, _) = scope();
        let err = osc
            .set_trigger(Trigger {
                level: 12.0,
                ..Trigger::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("trigger level"));
        assert!(!osc.device().map().is_dirty());
    }

    #[test]
    fn test_frontend_register_packing() {
        let (mut osc, mock) = scope();
        osc.set_frontend(2, false, true, true).unwrap();
        osc.set_frontend(1, true, false, false).unwrap();
        osc.commit().unwrap();
        assert_eq!(mock.register(REG_AINCTL), 0b110_001);

        let scales = osc.calculate_scales().unwrap();
        assert!((scales.gain_adc[1] - 10.0 / 3750.0).abs() < 1e-15);
    }

    #[test]
    fn test_source_selects_tap() {
        let (mut osc, _) = scope();
        osc.set_source(2, ScopeSource::Dac).unwrap();
        let scales = osc.calculate_scales().unwrap();
        assert_eq!(scales.taps, [MonitorTap::Input(Channel::One), MonitorTap::Dac(Channel::Two)]);
        assert!(osc.set_source(3, ScopeSource::Input).is_err());
    }
}
