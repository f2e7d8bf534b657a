//! Scale state snapshots.
//!
//! A [`ScaleState`] captures everything needed to turn raw integers into volts
//! and back: calibrated converter gains, frontend relays, monitor tap
//! selection, decimation and the time axis. It is computed immediately before
//! each commit, used by dependent register transforms, and recorded under the
//! commit's state id so frames are decoded with the settings that produced
//! them rather than whatever the live model holds by the time they arrive.

use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::config::{CalibrationConfig, ADC_DEFAULT_CALIBRATION};

/// Voltage division of the frontend attenuator used by register transforms.
pub const ATTENUATION_FACTOR: f64 = 10.0;

/// Decimation rates at or above this use the coarse gain representation.
const DECIMATION_GAIN_SPLIT: f64 = (1u32 << 20) as f64;

/// Analog frontend configuration of one input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frontend {
    /// 50 Ω termination (otherwise 1 MΩ).
    pub fiftyr: bool,
    /// 10x attenuator engaged.
    pub atten: bool,
    /// AC coupling (otherwise DC).
    pub ac: bool,
}

impl Default for Frontend {
    fn default() -> Self {
        Self {
            fiftyr: true,
            atten: false,
            ac: false,
        }
    }
}

/// Signal routed to one of the two capture channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorTap {
    /// Nothing connected; samples are passed through unscaled.
    Off,
    /// Calibrated analog input, as seen by the oscilloscope.
    Input(Channel),
    /// DAC output looped back into the capture path.
    Dac(Channel),
    /// Raw ADC samples ahead of the frontend compensation.
    Adc(Channel),
    /// Filter input after the control matrix.
    FilterInput(Channel),
    /// Filter output ahead of the output stage.
    FilterOutput(Channel),
}

/// Snapshot of calibration and gain parameters for one commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleState {
    /// ADC volts per bit at the connector, attenuator included.
    pub gain_adc: [f64; 2],
    /// DAC volts per bit.
    pub gain_dac: [f64; 2],
    /// Frontend settings in force.
    pub frontends: [Frontend; 2],
    /// Signals feeding capture channels A and B.
    pub taps: [MonitorTap; 2],
    /// Samples are averaged rather than decimated.
    pub precision_mode: bool,
    /// Capture decimation factor.
    pub decimation: f64,
    /// Time of the first sample relative to the trigger, seconds.
    pub time_min: f64,
    /// Sample spacing, seconds.
    pub time_step: f64,
    /// Volts per bit of the trigger source.
    pub trigger_gain: f64,
}

impl Default for ScaleState {
    fn default() -> Self {
        let frontends = [Frontend::default(); 2];
        Self::from_calibration(
            &CalibrationConfig::default(),
            frontends,
            [MonitorTap::Input(Channel::One), MonitorTap::Input(Channel::Two)],
        )
    }
}

impl ScaleState {
    /// Converter gains for the given frontends, with a unit decimation and an
    /// empty time axis. Callers fill in the acquisition fields.
    pub fn from_calibration(
        calibration: &CalibrationConfig,
        frontends: [Frontend; 2],
        taps: [MonitorTap; 2],
    ) -> Self {
        let gain_adc = Channel::ALL.map(|ch| {
            let fe = frontends[ch.index()];
            calibration.adc_gain(ch, fe.fiftyr, fe.atten)
        });
        let gain_dac = Channel::ALL.map(|ch| calibration.dac_gain(ch));
        Self {
            gain_adc,
            gain_dac,
            frontends,
            taps,
            precision_mode: false,
            decimation: 1.0,
            time_min: 0.0,
            time_step: 0.0,
            trigger_gain: gain_adc[0],
        }
    }

    /// ADC volts per bit of input `ch`.
    pub fn adc_gain(&self, ch: Channel) -> f64 {
        self.gain_adc[ch.index()]
    }

    /// DAC volts per bit of output `ch`.
    pub fn dac_gain(&self, ch: Channel) -> f64 {
        self.gain_dac[ch.index()]
    }

    /// Attenuation factor applied by the channel's frontend (1 or 10).
    pub fn attenuation(&self, ch: Channel) -> f64 {
        if self.frontends[ch.index()].atten {
            ATTENUATION_FACTOR
        } else {
            1.0
        }
    }

    /// Volts per bit of a monitor tap.
    pub fn tap_gain(&self, tap: MonitorTap) -> f64 {
        match tap {
            MonitorTap::Off => 1.0,
            MonitorTap::Input(ch) => self.adc_gain(ch),
            MonitorTap::Dac(ch) => self.dac_gain(ch),
            MonitorTap::Adc(ch) => self.adc_gain(ch) / self.attenuation(ch),
            MonitorTap::FilterInput(_) => 1.0 / ADC_DEFAULT_CALIBRATION,
            MonitorTap::FilterOutput(ch) => self.dac_gain(ch) * 16.0,
        }
    }

    /// Gain accumulated by the decimation filter in precision mode.
    pub fn decimation_gain(&self) -> f64 {
        let rate = self.decimation;
        if rate == 0.0 {
            1.0
        } else if rate < DECIMATION_GAIN_SPLIT {
            rate
        } else {
            rate / 1024.0
        }
    }

    /// Volts per raw sample for one capture channel.
    pub fn channel_scale(&self, index: usize) -> f64 {
        let tap = self.taps.get(index).copied().unwrap_or(MonitorTap::Off);
        let gain = self.tap_gain(tap);
        if self.precision_mode {
            gain / self.decimation_gain()
        } else {
            gain
        }
    }

    /// Sample times for a frame of `len` samples.
    pub fn time_axis(&self, len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| self.time_min + i as f64 * self.time_step)
            .collect()
    }
}
