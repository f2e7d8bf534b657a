//! Power-of-two decimation filter block.
//!
//! A decimation filter occupies a small register window starting at its base
//! address. The stage count is `log2(factor)`; a factor of 1 sets the bypass
//! flag instead of running zero stages.

use crate::codec::FieldCodec;
use crate::commit::RegisterDevice;
use crate::error::{AppResult, MokuError};
use crate::register_map::AttributeSpec;

/// Largest supported decimation factor.
pub const MAX_DECIMATION: u32 = 1024;

/// Attribute names of one decimation filter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecFilter {
    stages: &'static str,
    bypass: &'static str,
}

/// Register table for a decimation filter at `base`.
pub const fn dec_filter_registers(
    base: u32,
    stages: &'static str,
    bypass: &'static str,
) -> [AttributeSpec; 2] {
    [
        AttributeSpec::new(stages, base, FieldCodec::unsigned(0, 4)),
        AttributeSpec::new(bypass, base, FieldCodec::flag(4)),
    ]
}

impl DecFilter {
    /// Helper over the named stage and bypass attributes.
    pub const fn new(stages: &'static str, bypass: &'static str) -> Self {
        Self { stages, bypass }
    }

    /// Stage a decimation factor, which must be a power of two up to 1024.
    pub fn set_factor(&self, device: &mut RegisterDevice, factor: u32) -> AppResult<()> {
        if !factor.is_power_of_two() || factor > MAX_DECIMATION {
            return Err(MokuError::validation(
                "decimation factor",
                factor,
                format!("a power of two in [1, {}]", MAX_DECIMATION),
            ));
        }
        device.stage_code(self.stages, factor.trailing_zeros())?;
        device.stage_flag(self.bypass, factor == 1)
    }

    /// Factor last staged or read back.
    pub fn factor(&self, device: &RegisterDevice) -> AppResult<u32> {
        if device.flag(self.bypass)? {
            return Ok(1);
        }
        Ok(1u32 << device.code(self.stages)?.min(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scales::ScaleState;
    use crate::transport::MockTransport;

    const TABLE: [AttributeSpec; 2] = dec_filter_registers(103, "df_stages", "df_bypass");
    const FILTER: DecFilter = DecFilter::new("df_stages", "df_bypass");

    fn device() -> (RegisterDevice, MockTransport) {
        let mock = MockTransport::new();
        let device = RegisterDevice::new(Box::new(mock.clone()), &[&TABLE]).unwrap();
        (device, mock)
    }

    #[test]
    fn test_factor_encoding() {
        let (mut dev, mock) = device();
        FILTER.set_factor(&mut dev, 1024).unwrap();
        dev.commit(&ScaleState::default(), &[]).unwrap();
        assert_eq!(mock.register(103), 10);
        assert_eq!(FILTER.factor(&dev).unwrap(), 1024);

        FILTER.set_factor(&mut dev, 1).unwrap();
        dev.commit(&ScaleState::default(), &[]).unwrap();
        assert_eq!(mock.register(103), 1 << 4);
        assert_eq!(FILTER.factor(&dev).unwrap(), 1);
    }

    #[test]
    fn test_invalid_factors() {
        let (mut dev, _) = device();
        assert!(FILTER.set_factor(&mut dev, 0).is_err());
        assert!(FILTER.set_factor(&mut dev, 12).is_err());
        assert!(FILTER.set_factor(&mut dev, 2048).is_err());
        assert!(!dev.map().is_dirty());
    }
}
