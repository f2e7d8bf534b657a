//! Captured frames and their conversion to volts.
//!
//! Wire format, all little endian:
//!
//! ```text
//! u32 state_id | u32 frame_id | u32 n | n x i32 channel A | n x i32 channel B
//! ```
//!
//! A [`Frame`] pairs the raw samples with the [`ScaleState`] recorded for the
//! frame's state id, and is consumed by [`Frame::decode`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, MokuError};
use crate::scales::ScaleState;

/// Sample value the device uses to mark an invalid sample.
pub const INVALID_SAMPLE: i32 = i32::MIN;

const HEADER_LEN: usize = 12;

/// Raw frame as produced by the device.
///
/// Both channels always hold the same number of samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    state_id: u32,
    frame_id: u32,
    channel_a: Vec<i32>,
    channel_b: Vec<i32>,
}

impl RawFrame {
    /// Build a frame from its parts, rejecting channels of unequal length.
    pub fn new(
        state_id: u32,
        frame_id: u32,
        channel_a: Vec<i32>,
        channel_b: Vec<i32>,
    ) -> AppResult<Self> {
        if channel_a.len() != channel_b.len() {
            return Err(MokuError::MalformedFrame(format!(
                "channel A has {} samples, channel B has {}",
                channel_a.len(),
                channel_b.len()
            )));
        }
        Ok(Self {
            state_id,
            frame_id,
            channel_a,
            channel_b,
        })
    }

    /// Parse a frame from its wire representation.
    pub fn parse(mut data: &[u8]) -> AppResult<Self> {
        if data.remaining() < HEADER_LEN {
            return Err(MokuError::MalformedFrame(format!(
                "{} bytes is shorter than the {}-byte header",
                data.remaining(),
                HEADER_LEN
            )));
        }
        let state_id = data.get_u32_le();
        let frame_id = data.get_u32_le();
        let n = data.get_u32_le() as usize;

        let expected = n.checked_mul(8).ok_or_else(|| {
            MokuError::MalformedFrame(format!("sample count {} is too large", n))
        })?;
        if data.remaining() != expected {
            return Err(MokuError::MalformedFrame(format!(
                "{} samples per channel need {} payload bytes, got {}",
                n,
                expected,
                data.remaining()
            )));
        }

        let channel_a = (0..n).map(|_| data.get_i32_le()).collect();
        let channel_b = (0..n).map(|_| data.get_i32_le()).collect();
        Self::new(state_id, frame_id, channel_a, channel_b)
    }

    /// Serialize to the wire representation.
    pub fn to_bytes(&self) -> Bytes {
        let n = self.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + n * 8);
        buf.put_u32_le(self.state_id);
        buf.put_u32_le(self.frame_id);
        buf.put_u32_le(n as u32);
        for &s in self.channel_a.iter().chain(&self.channel_b) {
            buf.put_i32_le(s);
        }
        buf.freeze()
    }

    /// State id the device tagged the frame with.
    pub fn state_id(&self) -> u32 {
        self.state_id
    }

    /// Sequence number assigned by the device.
    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    /// Raw samples of capture channel A.
    pub fn channel_a(&self) -> &[i32] {
        &self.channel_a
    }

    /// Raw samples of capture channel B.
    pub fn channel_b(&self) -> &[i32] {
        &self.channel_b
    }

    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.channel_a.len()
    }

    /// True when the frame carries no samples.
    pub fn is_empty(&self) -> bool {
        self.channel_a.is_empty()
    }
}

/// Calibrated waveforms of one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltsData {
    /// State id of the transaction the frame was captured under.
    pub state_id: u32,
    /// Sequence number assigned by the device.
    pub frame_id: u32,
    /// Channel A in volts; invalid samples are NaN.
    pub channel_a: Vec<f64>,
    /// Channel B in volts; invalid samples are NaN.
    pub channel_b: Vec<f64>,
    /// Sample times in seconds.
    pub axis: Vec<f64>,
    /// Host time the frame was received.
    pub received_at: DateTime<Utc>,
}

/// Raw frame plus the scale state active when it was captured.
#[derive(Debug, Clone)]
pub struct Frame {
    raw: RawFrame,
    scales: ScaleState,
    received_at: DateTime<Utc>,
}

impl Frame {
    /// Pair a raw frame with the scales it was captured under.
    pub fn new(raw: RawFrame, scales: ScaleState) -> Self {
        Self {
            raw,
            scales,
            received_at: Utc::now(),
        }
    }

    /// Undecoded samples.
    pub fn raw(&self) -> &RawFrame {
        &self.raw
    }

    /// Scale state in force at capture.
    pub fn scales(&self) -> &ScaleState {
        &self.scales
    }

    /// Host receive time.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Convert to volts, consuming the frame.
    pub fn decode(self) -> VoltsData {
        let mut data = decode(&self.raw, &self.scales);
        data.received_at = self.received_at;
        data
    }
}

fn scale_samples(samples: &[i32], scale: f64) -> Vec<f64> {
    samples
        .iter()
        .map(|&s| {
            if s == INVALID_SAMPLE {
                f64::NAN
            } else {
                f64::from(s) * scale
            }
        })
        .collect()
}

/// Apply a scale state to raw samples.
pub fn decode(raw: &RawFrame, scales: &ScaleState) -> VoltsData {
    VoltsData {
        state_id: raw.state_id,
        frame_id: raw.frame_id,
        channel_a: scale_samples(&raw.channel_a, scales.channel_scale(0)),
        channel_b: scale_samples(&raw.channel_b, scales.channel_scale(1)),
        axis: scales.time_axis(raw.len()),
        received_at: Utc::now(),
    }
}
