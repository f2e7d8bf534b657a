//! IIR Filter Box instrument.
//!
//! Two independent channels, each a cascade of four direct-form-1 biquad
//! sections followed by an output gain stage:
//!
//! ```text
//! H(z) = G * prod_{k=1..4} s_k * (b0_k + b1_k z^-1 + b2_k z^-2) / (1 + a1_k z^-1 + a2_k z^-2)
//! ```
//!
//! Inputs are mixed through a 2x2 control matrix ahead of the filters, and
//! each channel has input/output gain and offset stages. Two monitor taps feed
//! an embedded oscilloscope core for frame capture.
//!
//! ## Coefficients
//!
//! Filters are given as five rows: row 0 holds `G` alone, rows 1-4 hold
//! `[s, b0, b1, b2, a1, a2]` for each section. Before upload each section's
//! `s` is folded into its `b` terms and `G` takes the last section's `s` slot.
//! Gain slots are quantized with 24 fractional bits, every other coefficient
//! with 45, as 48-bit signed words.
//!
//! ## Dependent registers
//!
//! The control matrix, gain and offset registers depend on the frontend
//! attenuation and converter calibration in force at commit time, so their
//! engineering values are held here and recomputed on every commit.

use std::fmt;
use std::str::FromStr;

use tracing::{info, warn};

use super::dec_filter::{dec_filter_registers, DecFilter};
use super::oscilloscope::{
    OscilloscopeCore, Trigger, TriggerEdge, TriggerMode, TriggerSource, OSC_REGISTERS,
};
use super::Instrument;
use crate::channel::Channel;
use crate::codec::{quantize, FieldCodec, Transform};
use crate::commit::RegisterDevice;
use crate::config::{DeviceConfig, ADC_DEFAULT_CALIBRATION};
use crate::error::{AppResult, MokuError};
use crate::payload::{BulkPayload, ScratchFile};
use crate::register_map::AttributeSpec;
use crate::scales::{Frontend, MonitorTap, ScaleState};
use crate::transport::Transport;
use crate::validation::{check_choice, decimal_places, Range};

/// Filter state reset.
pub const REG_FILT_RESET: u32 = 62;
/// Input and output enables.
pub const REG_ENABLE: u32 = 96;
/// Channel 1 decimation filter.
pub const REG_DECFILTER1: u32 = 103;
/// Channel 2 decimation filter.
pub const REG_DECFILTER2: u32 = 107;
/// Monitor source selection for taps a and b.
pub const REG_MONSELECT: u32 = 111;
/// Per-channel input offsets.
pub const REG_INPUTOFFSET: [u32; 2] = [112, 113];
/// Per-channel output offsets.
pub const REG_OUTPUTOFFSET: [u32; 2] = [114, 115];
/// Control matrix, output 1 from input 1.
pub const REG_CH1_CH1GAIN: u32 = 116;
/// Control matrix, output 1 from input 2.
pub const REG_CH1_CH2GAIN: u32 = 117;
/// Control matrix, output 2 from input 1.
pub const REG_CH2_CH1GAIN: u32 = 118;
/// Control matrix, output 2 from input 2.
pub const REG_CH2_CH2GAIN: u32 = 119;
/// Per-channel input gains.
pub const REG_INPUTSCALE: [u32; 2] = [120, 121];
/// Per-channel output gains.
pub const REG_OUTPUTSCALE: [u32; 2] = [122, 123];
/// Per-channel low sample rate flags.
pub const REG_SAMPLINGFREQ: u32 = 124;

/// Monitor path sample rate, samples per second.
pub const IIR_INPUT_RATE: f64 = 125e6;

/// Mount point tag for coefficient uploads.
pub const COEFFICIENT_TAG: char = 'j';

/// Fractional bits of the gain (`s`) coefficient slots.
pub const GAIN_FRACTION_BITS: i32 = 24;
/// Fractional bits of every other coefficient.
pub const COEFFICIENT_FRACTION_BITS: i32 = 45;
/// Width of a quantized coefficient word.
pub const COEFFICIENT_WIDTH: u32 = 48;

/// Biquad sections per channel.
pub const SECTIONS: usize = 4;
/// Coefficients per section.
pub const COMPONENTS: usize = 6;

/// One channel's cascade: `[s, b0, b1, b2, a1, a2]` per section.
pub type SosCascade = [[f64; COMPONENTS]; SECTIONS];

const MATRIX_SCALE_RANGE: Range = Range::new(-20.0, 20.0);
const GAIN_RANGE: Range = Range::new(-100.0, 100.0);
const INPUT_OFFSET_RANGE: Range = Range::new(-1.0, 1.0);
const OUTPUT_OFFSET_RANGE: Range = Range::new(-2.0, 2.0);
const OVERALL_GAIN_RANGE: Range = Range::new(-8e6, 8e6 - 1.0 / (1u64 << 24) as f64);
const COEFFICIENT_RANGE: Range = Range::new(-4.0, 4.0 - 1.0 / (1u64 << 45) as f64);

const INPUT_EN: [&str; 2] = ["input_en1", "input_en2"];
const OUTPUT_EN: [&str; 2] = ["output_en1", "output_en2"];
const MON_SOURCE: [&str; 2] = ["mon1_source", "mon2_source"];
const SAMPLING_FREQ: [&str; 2] = ["ch1_sampling_freq", "ch2_sampling_freq"];
const MATRIX_SCALE: [[&str; 2]; 2] = [
    ["matrixscale_ch1_ch1", "matrixscale_ch1_ch2"],
    ["matrixscale_ch2_ch1", "matrixscale_ch2_ch2"],
];
const INPUT_SCALE: [&str; 2] = ["input_scale1", "input_scale2"];
const OUTPUT_SCALE: [&str; 2] = ["output_scale1", "output_scale2"];
const INPUT_OFFSET: [&str; 2] = ["input_offset1", "input_offset2"];
const OUTPUT_OFFSET: [&str; 2] = ["output_offset1", "output_offset2"];

const MONITOR_SOURCES: [(&str, u32); 6] = [
    ("adc1", 1),
    ("in1", 2),
    ("out1", 3),
    ("adc2", 4),
    ("in2", 5),
    ("out2", 6),
];

// =============================================================================
// Dependent transforms
// =============================================================================

// The mixing and offset registers work in nominal ADC bits with the frontend
// attenuation removed; `IN`/`CH` index the analog channel each one reads.

fn matrix_to_raw<const IN: usize>(x: f64, s: &ScaleState) -> f64 {
    let ch = Channel::ALL[IN];
    x * (ADC_DEFAULT_CALIBRATION / s.attenuation(ch)) * s.adc_gain(ch) * 1024.0
}

fn matrix_from_raw<const IN: usize>(raw: f64, s: &ScaleState) -> f64 {
    let ch = Channel::ALL[IN];
    raw * (s.attenuation(ch) / ADC_DEFAULT_CALIBRATION) / s.adc_gain(ch) / 1024.0
}

fn output_scale_to_raw<const CH: usize>(x: f64, s: &ScaleState) -> f64 {
    x * 512.0 / (ADC_DEFAULT_CALIBRATION * 8.0 * s.dac_gain(Channel::ALL[CH]))
}

fn output_scale_from_raw<const CH: usize>(raw: f64, s: &ScaleState) -> f64 {
    raw * (ADC_DEFAULT_CALIBRATION * 8.0 * s.dac_gain(Channel::ALL[CH])) / 512.0
}

fn input_offset_to_raw<const CH: usize>(x: f64, s: &ScaleState) -> f64 {
    2.0 * x * ADC_DEFAULT_CALIBRATION / s.attenuation(Channel::ALL[CH])
}

fn input_offset_from_raw<const CH: usize>(raw: f64, s: &ScaleState) -> f64 {
    raw * s.attenuation(Channel::ALL[CH]) / 2.0 / ADC_DEFAULT_CALIBRATION
}

fn output_offset_to_raw<const CH: usize>(x: f64, s: &ScaleState) -> f64 {
    x / s.dac_gain(Channel::ALL[CH])
}

fn output_offset_from_raw<const CH: usize>(raw: f64, s: &ScaleState) -> f64 {
    raw * s.dac_gain(Channel::ALL[CH])
}

const fn matrix<const IN: usize>() -> Transform {
    Transform::Dependent {
        to_raw: matrix_to_raw::<IN>,
        from_raw: matrix_from_raw::<IN>,
    }
}

const fn output_scale<const CH: usize>() -> Transform {
    Transform::Dependent {
        to_raw: output_scale_to_raw::<CH>,
        from_raw: output_scale_from_raw::<CH>,
    }
}

const fn input_offset<const CH: usize>() -> Transform {
    Transform::Dependent {
        to_raw: input_offset_to_raw::<CH>,
        from_raw: input_offset_from_raw::<CH>,
    }
}

const fn output_offset<const CH: usize>() -> Transform {
    Transform::Dependent {
        to_raw: output_offset_to_raw::<CH>,
        from_raw: output_offset_from_raw::<CH>,
    }
}

/// Filter box registers, on top of the oscilloscope table.
pub const IIR_REGISTERS: &[AttributeSpec] = &[
    AttributeSpec::new(MON_SOURCE[0], REG_MONSELECT, FieldCodec::unsigned(0, 3)),
    AttributeSpec::new(MON_SOURCE[1], REG_MONSELECT, FieldCodec::unsigned(3, 3)),
    AttributeSpec::new(INPUT_EN[0], REG_ENABLE, FieldCodec::flag(0)).control(),
    AttributeSpec::new(INPUT_EN[1], REG_ENABLE, FieldCodec::flag(1)).control(),
    AttributeSpec::new(OUTPUT_EN[0], REG_ENABLE, FieldCodec::flag(2)).control(),
    AttributeSpec::new(OUTPUT_EN[1], REG_ENABLE, FieldCodec::flag(3)).control(),
    AttributeSpec::new(MATRIX_SCALE[0][0], REG_CH1_CH1GAIN, FieldCodec::signed(0, 16))
        .with_transform(matrix::<0>()),
    AttributeSpec::new(MATRIX_SCALE[0][1], REG_CH1_CH2GAIN, FieldCodec::signed(0, 16))
        .with_transform(matrix::<1>()),
    AttributeSpec::new(MATRIX_SCALE[1][0], REG_CH2_CH1GAIN, FieldCodec::signed(0, 16))
        .with_transform(matrix::<0>()),
    AttributeSpec::new(MATRIX_SCALE[1][1], REG_CH2_CH2GAIN, FieldCodec::signed(0, 16))
        .with_transform(matrix::<1>()),
    AttributeSpec::new(SAMPLING_FREQ[0], REG_SAMPLINGFREQ, FieldCodec::flag(0)),
    AttributeSpec::new(SAMPLING_FREQ[1], REG_SAMPLINGFREQ, FieldCodec::flag(1)),
    AttributeSpec::new("filter_reset", REG_FILT_RESET, FieldCodec::flag(0)),
    AttributeSpec::new(INPUT_SCALE[0], REG_INPUTSCALE[0], FieldCodec::signed(0, 18))
        .with_transform(Transform::Scale(512.0)),
    AttributeSpec::new(INPUT_SCALE[1], REG_INPUTSCALE[1], FieldCodec::signed(0, 18))
        .with_transform(Transform::Scale(512.0)),
    AttributeSpec::new(OUTPUT_SCALE[0], REG_OUTPUTSCALE[0], FieldCodec::signed(0, 18))
        .with_transform(output_scale::<0>()),
    AttributeSpec::new(OUTPUT_SCALE[1], REG_OUTPUTSCALE[1], FieldCodec::signed(0, 18))
        .with_transform(output_scale::<1>()),
    AttributeSpec::new(INPUT_OFFSET[0], REG_INPUTOFFSET[0], FieldCodec::signed(0, 14))
        .with_transform(input_offset::<0>()),
    AttributeSpec::new(INPUT_OFFSET[1], REG_INPUTOFFSET[1], FieldCodec::signed(0, 14))
        .with_transform(input_offset::<1>()),
    AttributeSpec::new(OUTPUT_OFFSET[0], REG_OUTPUTOFFSET[0], FieldCodec::signed(0, 17))
        .with_transform(output_offset::<0>()),
    AttributeSpec::new(OUTPUT_OFFSET[1], REG_OUTPUTOFFSET[1], FieldCodec::signed(0, 17))
        .with_transform(output_offset::<1>()),
];

const DECFILTER1_REGISTERS: [AttributeSpec; 2] =
    dec_filter_registers(REG_DECFILTER1, "decfilter1_stages", "decfilter1_bypass");
const DECFILTER2_REGISTERS: [AttributeSpec; 2] =
    dec_filter_registers(REG_DECFILTER2, "decfilter2_stages", "decfilter2_bypass");

// =============================================================================
// Settings
// =============================================================================

/// Filter sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRate {
    /// Decimation 8, about 15.625 MS/s.
    High,
    /// Decimation 1024, about 122.07 kS/s.
    Low,
}

impl SampleRate {
    /// Decimation factor of the filter path.
    pub fn decimation(self) -> u32 {
        match self {
            SampleRate::High => 8,
            SampleRate::Low => 1024,
        }
    }

    /// Filter update rate in samples per second.
    pub fn rate(self) -> f64 {
        IIR_INPUT_RATE / f64::from(self.decimation())
    }
}

impl FromStr for SampleRate {
    type Err = MokuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check_choice(
            "sample rate",
            s,
            &[("high", SampleRate::High), ("low", SampleRate::Low)],
        )
    }
}

/// Input and output stage settings of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainsOffsets {
    /// Linear gain ahead of the filter.
    pub input_gain: f64,
    /// Linear gain after the filter.
    pub output_gain: f64,
    /// Volts.
    pub input_offset: f64,
    /// Volts.
    pub output_offset: f64,
}

impl Default for GainsOffsets {
    fn default() -> Self {
        Self {
            input_gain: 1.0,
            output_gain: 1.0,
            input_offset: 0.0,
            output_offset: 0.0,
        }
    }
}

/// Validated filter coefficients in caller layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterCoefficients {
    /// Overall gain `G`.
    pub gain: f64,
    /// Sections as given, `[s, b0, b1, b2, a1, a2]`.
    pub sections: SosCascade,
}

impl FilterCoefficients {
    /// Unity-gain pass-through in every section.
    pub fn all_pass() -> Self {
        Self {
            gain: 1.0,
            sections: [[1.0, 1.0, 0.0, 0.0, 0.0, 0.0]; SECTIONS],
        }
    }

    /// Validate a five-row coefficient matrix and copy it into owned storage.
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> AppResult<Self> {
        if rows.len() != SECTIONS + 1 {
            return Err(MokuError::validation(
                "filter coefficients",
                format!("{} rows", rows.len()),
                "5 rows",
            ));
        }
        let first = rows[0].as_ref();
        if first.len() != 1 {
            return Err(MokuError::validation(
                "filter coefficients row 0",
                format!("{} columns", first.len()),
                "1 column (G)",
            ));
        }
        OVERALL_GAIN_RANGE.check("filter gain G", first[0])?;

        let mut sections = [[0.0; COMPONENTS]; SECTIONS];
        for (k, (row, section)) in rows[1..].iter().zip(sections.iter_mut()).enumerate() {
            let row = row.as_ref();
            if row.len() != COMPONENTS {
                return Err(MokuError::validation(
                    format!("filter coefficients row {}", k + 1),
                    format!("{} columns", row.len()),
                    "6 columns (s, b0, b1, b2, a1, a2)",
                ));
            }
            for (c, &value) in row.iter().enumerate() {
                COEFFICIENT_RANGE.check(&format!("filter coefficient [{}][{}]", k + 1, c), value)?;
            }
            section.copy_from_slice(row);
        }

        Ok(Self {
            gain: first[0],
            sections,
        })
    }

    /// Fold each `s` into its `b` terms and place `G` in the last gain slot.
    pub fn reshape(&self) -> SosCascade {
        let mut out = self.sections;
        for section in out.iter_mut() {
            let s = section[0];
            for b in &mut section[1..4] {
                *b *= s;
            }
            section[0] = 1.0;
        }
        out[SECTIONS - 1][0] = self.gain;
        out
    }
}

fn quantize_coefficient(
    value: f64,
    fraction_bits: i32,
    section: usize,
    component: usize,
) -> AppResult<i64> {
    let field = || format!("filter coefficient [{}][{}]", section + 1, component);
    let raw = quantize(value * 2f64.powi(fraction_bits))
        .map_err(|e| MokuError::validation(field(), value, e.to_string()))?;
    let half = 1i64 << (COEFFICIENT_WIDTH - 1);
    if raw < -half || raw >= half {
        return Err(MokuError::validation(
            field(),
            value,
            format!("a product representable in {} bits", COEFFICIENT_WIDTH),
        ));
    }
    Ok(raw)
}

/// Quantize both cascades and pack them channel, then component, then section.
pub fn pack_coefficients(filters: &[SosCascade; 2]) -> AppResult<BulkPayload> {
    let mut payload = BulkPayload::with_capacity(2 * COMPONENTS * SECTIONS * 8);
    for cascade in filters {
        for component in 0..COMPONENTS {
            let bits = if component == 0 {
                GAIN_FRACTION_BITS
            } else {
                COEFFICIENT_FRACTION_BITS
            };
            for (section, coeffs) in cascade.iter().enumerate() {
                let raw = quantize_coefficient(coeffs[component], bits, section, component)?;
                payload.push_i64(raw);
            }
        }
    }
    Ok(payload)
}

fn monitor_tap(code: u32) -> MonitorTap {
    match code {
        1 => MonitorTap::Adc(Channel::One),
        2 => MonitorTap::FilterInput(Channel::One),
        3 => MonitorTap::FilterOutput(Channel::One),
        4 => MonitorTap::Adc(Channel::Two),
        5 => MonitorTap::FilterInput(Channel::Two),
        6 => MonitorTap::FilterOutput(Channel::Two),
        _ => MonitorTap::Off,
    }
}

// =============================================================================
// IirFilterBox
// =============================================================================

/// Two-channel IIR filter box (instrument id 6).
pub struct IirFilterBox {
    device: RegisterDevice,
    config: DeviceConfig,
    scope: OscilloscopeCore,
    decfilters: [DecFilter; 2],
    /// `matrix[out][in]`
    matrix: [[f64; 2]; 2],
    stages: [GainsOffsets; 2],
    filters: [SosCascade; 2],
}

impl fmt::Debug for IirFilterBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IirFilterBox")
            .field("device", &self.device)
            .field("matrix", &self.matrix)
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

impl IirFilterBox {
    /// Bind the filter box registers. Call [`attach`](super::attach) before use.
    pub fn new(transport: Box<dyn Transport>, config: DeviceConfig) -> AppResult<Self> {
        let device = RegisterDevice::new(
            transport,
            &[
                OSC_REGISTERS,
                IIR_REGISTERS,
                &DECFILTER1_REGISTERS,
                &DECFILTER2_REGISTERS,
            ],
        )?;
        let all_pass = FilterCoefficients::all_pass().reshape();
        Ok(Self {
            device,
            config,
            scope: OscilloscopeCore::new(IIR_INPUT_RATE),
            decfilters: [
                DecFilter::new("decfilter1_stages", "decfilter1_bypass"),
                DecFilter::new("decfilter2_stages", "decfilter2_bypass"),
            ],
            matrix: [[1.0, 0.0], [0.0, 1.0]],
            stages: [GainsOffsets::default(); 2],
            filters: [all_pass; 2],
        })
    }

    /// Mixing coefficients, `[out][in]`.
    pub fn control_matrix(&self) -> [[f64; 2]; 2] {
        self.matrix
    }

    /// Input and output stage settings of `ch`.
    pub fn gains_offsets(&self, ch: Channel) -> GainsOffsets {
        self.stages[ch.index()]
    }

    /// Reshaped cascade last uploaded for `ch`.
    pub fn filter(&self, ch: Channel) -> &SosCascade {
        &self.filters[ch.index()]
    }

    /// Set the input mixing of output channel `ch`:
    /// `filter_in[ch] = scale_in1 * in1 + scale_in2 * in2`.
    pub fn set_control_matrix(&mut self, ch: u8, scale_in1: f64, scale_in2: f64) -> AppResult<()> {
        let ch = Channel::parse(ch, "control matrix channel")?;
        MATRIX_SCALE_RANGE.check(&format!("control matrix scale_in1 ({})", ch), scale_in1)?;
        MATRIX_SCALE_RANGE.check(&format!("control matrix scale_in2 ({})", ch), scale_in2)?;

        for value in [scale_in1, scale_in2] {
            if decimal_places(value) > 1 {
                warn!(
                    "Control matrix scale {} has more than one decimal place and will be rounded by the device",
                    value
                );
            }
        }

        self.matrix[ch.index()] = [scale_in1, scale_in2];
        self.device.mark_dirty();
        Ok(())
    }

    /// Set the input and output stages of channel `ch`.
    pub fn set_gains_offsets(
        &mut self,
        ch: u8,
        input_gain: f64,
        output_gain: f64,
        input_offset: f64,
        output_offset: f64,
    ) -> AppResult<()> {
        let ch = Channel::parse(ch, "filter channel")?;
        GAIN_RANGE.check("input gain", input_gain)?;
        GAIN_RANGE.check("output gain", output_gain)?;
        INPUT_OFFSET_RANGE.check("input offset", input_offset)?;
        OUTPUT_OFFSET_RANGE.check("output offset", output_offset)?;

        self.stages[ch.index()] = GainsOffsets {
            input_gain,
            output_gain,
            input_offset,
            output_offset,
        };
        self.device.mark_dirty();
        Ok(())
    }

    fn upload_filters(&mut self, filters: &[SosCascade; 2]) -> AppResult<()> {
        let payload = pack_coefficients(filters)?;
        let bytes = payload.len();
        let scratch = ScratchFile::create(&self.config.scratch_dir, "iir-coefficients", payload)?;
        self.device.with_memory_access(|transport| {
            transport
                .send_file(COEFFICIENT_TAG, scratch.path())
                .map_err(MokuError::Transport)
        })?;
        info!(bytes, "uploaded IIR coefficients");
        Ok(())
    }

    /// Load a filter into channel `ch`, enable its input and output, and
    /// commit.
    ///
    /// Both channels' coefficients are uploaded on every call.
    pub fn set_filter<R: AsRef<[f64]>>(
        &mut self,
        ch: u8,
        sample_rate: SampleRate,
        coefficients: &[R],
    ) -> AppResult<()> {
        let ch = Channel::parse(ch, "filter channel")?;
        let coefficients = FilterCoefficients::from_rows(coefficients)?;

        let mut filters = self.filters;
        filters[ch.index()] = coefficients.reshape();
        self.upload_filters(&filters)?;
        self.filters = filters;

        let i = ch.index();
        self.decfilters[i].set_factor(&mut self.device, sample_rate.decimation())?;
        self.device
            .stage_flag(SAMPLING_FREQ[i], sample_rate == SampleRate::Low)?;
        self.device.stage_flag(INPUT_EN[i], true)?;
        self.device.stage_flag(OUTPUT_EN[i], true)?;
        self.commit()
    }

    /// Stage the output of channel `ch` off.
    pub fn disable_output(&mut self, ch: u8) -> AppResult<()> {
        let ch = Channel::parse(ch, "filter channel")?;
        self.device.stage_flag(OUTPUT_EN[ch.index()], false)
    }

    /// Route a signal to monitor `a` or `b`.
    ///
    /// Sources: `adc1`, `in1`, `out1`, `adc2`, `in2`, `out2`.
    pub fn set_monitor(&mut self, ch: &str, source: &str) -> AppResult<()> {
        let index = check_choice("monitor channel", ch, &[("a", 0usize), ("b", 1)])?;
        let code = check_choice("monitor source", source, &MONITOR_SOURCES)?;
        self.device.stage_code(MON_SOURCE[index], code)
    }

    /// Current tap of monitor channel `a` (index 0) or `b` (index 1).
    pub fn monitor(&self, index: usize) -> AppResult<MonitorTap> {
        let name = MON_SOURCE.get(index).ok_or_else(|| {
            MokuError::validation("monitor index", index, "0 (a) or 1 (b)")
        })?;
        Ok(monitor_tap(self.device.code(name)?))
    }

    /// Trigger on a monitor channel (`a`, `b`), a filter input (`in1`, `in2`)
    /// or the external input (`ext`).
    pub fn set_trigger(
        &mut self,
        source: &str,
        edge: TriggerEdge,
        level: f64,
        hysteresis: bool,
        hf_reject: bool,
        mode: TriggerMode,
    ) -> AppResult<()> {
        let source = check_choice(
            "trigger source",
            source,
            &[
                ("a", TriggerSource::Ch1),
                ("b", TriggerSource::Ch2),
                ("in1", TriggerSource::Dac1),
                ("in2", TriggerSource::Dac2),
                ("ext", TriggerSource::Ext),
            ],
        )?;
        self.scope.set_trigger(
            &mut self.device,
            Trigger {
                source,
                edge,
                level,
                hysteresis,
                hf_reject,
                mode,
            },
        )
    }

    pub fn set_frontend(&mut self, ch: u8, fiftyr: bool, atten: bool, ac: bool) -> AppResult<()> {
        let ch = Channel::parse(ch, "channel")?;
        self.scope
            .set_frontend(&mut self.device, ch, Frontend { fiftyr, atten, ac })
    }

    /// Staged frontend of input `ch`.
    pub fn frontend(&self, ch: Channel) -> AppResult<Frontend> {
        self.scope.frontend(&self.device, ch)
    }

    pub fn set_timebase(&mut self, t1: f64, t2: f64) -> AppResult<()> {
        self.scope.set_timebase(&mut self.device, t1, t2)
    }

    pub fn set_precision_mode(&mut self, on: bool) -> AppResult<()> {
        self.scope.set_precision_mode(&mut self.device, on)
    }

    /// Decimation factor staged for channel `ch`'s filter.
    pub fn sample_decimation(&self, ch: Channel) -> AppResult<u32> {
        self.decfilters[ch.index()].factor(&self.device)
    }
}

impl Instrument for IirFilterBox {
    fn id(&self) -> u8 {
        6
    }

    fn name(&self) -> &'static str {
        "iirfilterbox"
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

    /// Oscilloscope defaults, inputs on and outputs off, identity mixing,
    /// unity stages, all-pass filters, monitors on the filter inputs.
    fn set_defaults(&mut self) -> AppResult<()> {
        self.scope.set_defaults(&mut self.device)?;

        for ch in Channel::ALL {
            let i = ch.index();
            self.device.stage_flag(INPUT_EN[i], true)?;
            self.device.stage_flag(OUTPUT_EN[i], false)?;
            self.device.stage_flag(SAMPLING_FREQ[i], false)?;
            self.decfilters[i].set_factor(&mut self.device, SampleRate::High.decimation())?;
        }
        self.device.stage_flag("filter_reset", false)?;
        self.set_monitor("a", "in1")?;
        self.set_monitor("b", "in2")?;

        self.matrix = [[1.0, 0.0], [0.0, 1.0]];
        self.stages = [GainsOffsets::default(); 2];
        self.device.mark_dirty();

        let all_pass = FilterCoefficients::all_pass().reshape();
        self.upload_filters(&[all_pass; 2])?;
        self.filters = [all_pass; 2];
        Ok(())
    }

    fn calculate_scales(&self) -> AppResult<ScaleState> {
        let taps = [self.monitor(0)?, self.monitor(1)?];
        self.scope
            .scales(&self.device, &self.config.calibration, taps)
    }

    fn reload_from_registers(&mut self) -> AppResult<()> {
        for ch in Channel::ALL {
            let i = ch.index();
            self.matrix[i] = [
                self.device.value(MATRIX_SCALE[i][0])?,
                self.device.value(MATRIX_SCALE[i][1])?,
            ];
            self.stages[i] = GainsOffsets {
                input_gain: self.device.value(INPUT_SCALE[i])?,
                output_gain: self.device.value(OUTPUT_SCALE[i])?,
                input_offset: self.device.value(INPUT_OFFSET[i])?,
                output_offset: self.device.value(OUTPUT_OFFSET[i])?,
            };
        }
        Ok(())
    }

    fn recompute_dependent_registers(&self, _scales: &ScaleState) -> Vec<(&'static str, f64)> {
        let mut derived = Vec::with_capacity(12);
        for ch in Channel::ALL {
            let i = ch.index();
            derived.push((MATRIX_SCALE[i][0], self.matrix[i][0]));
            derived.push((MATRIX_SCALE[i][1], self.matrix[i][1]));
            let stage = self.stages[i];
            derived.push((INPUT_SCALE[i], stage.input_gain));
            derived.push((OUTPUT_SCALE[i], stage.output_gain));
            derived.push((INPUT_OFFSET[i], stage.input_offset));
            derived.push((OUTPUT_OFFSET[i], stage.output_offset));
        }
        derived
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ScaleFn;
    use crate::transport::MockTransport;
    use tracing_test::traced_test;

    fn rows(gain: f64, section: [f64; 6]) -> Vec<Vec<f64>> {
        let mut rows = vec![vec![gain]];
        rows.extend(std::iter::repeat(section.to_vec()).take(4));
        rows
    }

    #[test]
    fn test_reshape_folds_section_gain() {
        let mut r = rows(2.5, [0.5, 1.0, -2.0, 0.25, 0.1, 0.2]);
        r[2][0] = 2.0;
        let coeffs = FilterCoefficients::from_rows(&r).unwrap();
        let shaped = coeffs.reshape();

        assert_eq!(shaped[0], [1.0, 0.5, -1.0, 0.125, 0.1, 0.2]);
        assert_eq!(shaped[1], [1.0, 2.0, -4.0, 0.5, 0.1, 0.2]);
        assert_eq!(shaped[2][0], 1.0);
        assert_eq!(shaped[3][0], 2.5);
        assert_eq!(shaped[3][1], 0.5);
    }

    #[test]
    fn test_coefficient_shape_validation() {
        let mut r = rows(1.0, [1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        r.pop();
        assert!(FilterCoefficients::from_rows(&r).is_err());

        let mut r = rows(1.0, [1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        r[3].push(0.0);
        let err = FilterCoefficients::from_rows(&r).unwrap_err();
        assert!(err.to_string().contains("row 3"));

        let r = rows(9e6, [1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        assert!(FilterCoefficients::from_rows(&r).is_err());

        let r = rows(1.0, [1.0, 4.0, 0.0, 0.0, 0.0, 0.0]);
        assert!(FilterCoefficients::from_rows(&r).is_err());
    }

    #[test]
    fn test_pack_layout() {
        let all_pass = FilterCoefficients::all_pass().reshape();
        let mut second = all_pass;
        second[2][4] = -0.5;
        let bytes = pack_coefficients(&[all_pass, second]).unwrap().freeze();
        assert_eq!(bytes.len(), 2 * 6 * 4 * 8);

        let word = |i: usize| i64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
        // channel 1, component s, sections 1-4
        for section in 0..4 {
            assert_eq!(word(section), 1 << 24);
        }
        // channel 1, component b0
        assert_eq!(word(4), 1 << 45);
        // channel 2, component a1, section 3
        assert_eq!(word(24 + 4 * 4 + 2), -(1 << 44));
    }

    #[test]
    fn test_pack_rejects_overflowing_product() {
        let mut shaped = FilterCoefficients::all_pass().reshape();
        shaped[0][1] = 8.0;
        let err = pack_coefficients(&[shaped, shaped]).unwrap_err();
        assert!(matches!(err, MokuError::Validation { .. }));
    }

    #[test]
    fn test_monitor_tap_codes() {
        assert_eq!(monitor_tap(0), MonitorTap::Off);
        assert_eq!(monitor_tap(3), MonitorTap::FilterOutput(Channel::One));
        assert_eq!(monitor_tap(5), MonitorTap::FilterInput(Channel::Two));
        assert_eq!(monitor_tap(7), MonitorTap::Off);
    }

    #[test]
    fn test_dependent_transforms_invert() {
        let mut scales = ScaleState::default();
        scales.frontends[1].atten = true;
        scales.gain_adc[1] = 10.0 / 3712.0;
        let pairs: [(ScaleFn, ScaleFn); 4] = [
            (matrix_to_raw::<1>, matrix_from_raw::<1>),
            (output_scale_to_raw::<0>, output_scale_from_raw::<0>),
            (input_offset_to_raw::<1>, input_offset_from_raw::<1>),
            (output_offset_to_raw::<1>, output_offset_from_raw::<1>),
        ];
        for (to, from) in pairs {
            let raw = to(0.75, &scales);
            assert!((from(raw, &scales) - 0.75).abs() < 1e-12);
        }
    }

    #[test]
    fn test_sample_rate() {
        assert_eq!(SampleRate::High.rate(), 15.625e6);
        assert!((SampleRate::Low.rate() - 122_070.3125).abs() < 1e-9);
        assert_eq!("LOW".parse::<SampleRate>().unwrap(), SampleRate::Low);
    }

    #[traced_test]
    #[test]
    fn test_fine_matrix_scale_warns() {
        let mut iir =
            IirFilterBox::new(Box::new(MockTransport::new()), DeviceConfig::default()).unwrap();
        iir.set_control_matrix(1, 0.5, 0.0).unwrap();
        assert!(!logs_contain("more than one decimal place"));

        iir.set_control_matrix(1, 0.25, 0.0).unwrap();
        assert!(logs_contain("more than one decimal place"));
        assert_eq!(iir.control_matrix()[0], [0.25, 0.0]);
    }
}
