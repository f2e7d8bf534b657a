//! Device configuration using Figment
//!
//! Configuration is explicit state handed to instruments at construction time.
//! Nothing in the library reads global settings. Values are loaded from:
//! 1. built-in defaults
//! 2. a TOML file (`config/moku.toml` by default)
//! 3. environment variables prefixed with `MOKU_` (nested keys separated by `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! MOKU_FRAME_TIMEOUT_MS=2000
//! MOKU_LOGGING__LEVEL=debug
//! MOKU_COMPATIBILITY__PROTOCOL_VERSION=7
//! ```
//!
//! # Example
//!
//! ```toml
//! scratch_dir = "/tmp"
//! frame_timeout_ms = 1000
//!
//! [compatibility]
//! firmware_builds = [474]
//! protocol_version = "7"
//!
//! [[calibration.adc]]
//! fifty_ohm_bits_per_volt = 3750.0
//! one_megohm_bits_per_volt = 3750.0
//! attenuation = 10.0
//!
//! [[calibration.adc]]
//! fifty_ohm_bits_per_volt = 3750.0
//! one_megohm_bits_per_volt = 3750.0
//! attenuation = 10.0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::channel::Channel;
use crate::error::{AppResult, MokuError};
use crate::transport::DeviceInfo;

/// Nominal ADC calibration without attenuation, in bits per volt.
pub const ADC_DEFAULT_CALIBRATION: f64 = 3750.0;

/// Nominal DAC calibration, in bits per volt.
pub const DAC_DEFAULT_CALIBRATION: f64 = 30000.0;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    #[error("Calibration file error: {0}")]
    CalibrationFile(String),
}

/// Top-level device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Firmware/protocol versions this host library can drive
    #[serde(default)]
    pub compatibility: CompatibilityConfig,
    /// Converter calibration constants
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Directory for scratch payload files written before bulk uploads
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Default frame retrieval timeout in milliseconds
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_ms: u64,
    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Versions accepted at attach time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityConfig {
    /// Compatible firmware build numbers
    #[serde(default = "default_firmware_builds")]
    pub firmware_builds: Vec<u32>,
    /// Network protocol version
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

/// ADC calibration for one input channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdcCalibration {
    /// Bits per volt with 50 Ω termination, attenuator off
    pub fifty_ohm_bits_per_volt: f64,
    /// Bits per volt with 1 MΩ termination, attenuator off
    pub one_megohm_bits_per_volt: f64,
    /// Voltage division applied by the frontend attenuator
    #[serde(default = "default_attenuation")]
    pub attenuation: f64,
}

/// Calibration constants for both converters of both channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Per-channel ADC calibration.
    pub adc: [AdcCalibration; 2],
    /// Per-channel DAC resolution.
    pub dac_bits_per_volt: [f64; 2],
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level (trace, debug, info, warn, error); `RUST_LOG` overrides it
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_frame_timeout() -> u64 {
    1000
}

fn default_firmware_builds() -> Vec<u32> {
    vec![474]
}

fn default_protocol_version() -> String {
    "7".to_string()
}

fn default_attenuation() -> f64 {
    10.0
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            compatibility: CompatibilityConfig::default(),
            calibration: CalibrationConfig::default(),
            scratch_dir: default_scratch_dir(),
            frame_timeout_ms: default_frame_timeout(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CompatibilityConfig {
    fn default() -> Self {
        Self {
            firmware_builds: default_firmware_builds(),
            protocol_version: default_protocol_version(),
        }
    }
}

impl Default for AdcCalibration {
    fn default() -> Self {
        Self {
            fifty_ohm_bits_per_volt: ADC_DEFAULT_CALIBRATION,
            one_megohm_bits_per_volt: ADC_DEFAULT_CALIBRATION,
            attenuation: default_attenuation(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            adc: [AdcCalibration::default(); 2],
            dac_bits_per_volt: [DAC_DEFAULT_CALIBRATION; 2],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl DeviceConfig {
    /// Load configuration from `config/moku.toml` and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/moku.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Missing files fall back to defaults; environment variables take
    /// precedence over the file. The result is validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(DeviceConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MOKU_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(format!("cannot serialize: {}", e)))?;
        std::fs::write(path.as_ref(), contents).map_err(|e| {
            ConfigError::ValidationError(format!(
                "cannot write {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - At least one compatible firmware build is listed
    /// - Calibration constants are finite and positive
    /// - Frame timeout is non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.compatibility.firmware_builds.is_empty() {
            return Err(ConfigError::ValidationError(
                "compatibility.firmware_builds must list at least one build".to_string(),
            ));
        }

        if self.frame_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "frame_timeout_ms must be greater than zero".to_string(),
            ));
        }

        self.calibration.validate()
    }

    /// Default frame retrieval timeout.
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    /// Check a connected device against the compatibility lists.
    pub fn check_compatibility(&self, info: &DeviceInfo) -> AppResult<()> {
        if !self
            .compatibility
            .firmware_builds
            .contains(&info.firmware_build)
        {
            return Err(MokuError::Incompatible(format!(
                "firmware build {} is not one of {:?}",
                info.firmware_build, self.compatibility.firmware_builds
            )));
        }
        if info.protocol_version != self.compatibility.protocol_version {
            return Err(MokuError::Incompatible(format!(
                "protocol version '{}' (expected '{}')",
                info.protocol_version, self.compatibility.protocol_version
            )));
        }
        Ok(())
    }
}

impl CalibrationConfig {
    /// ADC gain in volts per bit at the connector, for a frontend state.
    pub fn adc_gain(&self, ch: Channel, fiftyr: bool, atten: bool) -> f64 {
        let cal = &self.adc[ch.index()];
        let bits_per_volt = if fiftyr {
            cal.fifty_ohm_bits_per_volt
        } else {
            cal.one_megohm_bits_per_volt
        };
        let division = if atten { cal.attenuation } else { 1.0 };
        division / bits_per_volt
    }

    /// DAC gain in volts per bit.
    pub fn dac_gain(&self, ch: Channel) -> f64 {
        1.0 / self.dac_bits_per_volt[ch.index()]
    }

    /// Check every constant is finite and positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let constants = self
            .adc
            .iter()
            .flat_map(|c| {
                [
                    ("fifty_ohm_bits_per_volt", c.fifty_ohm_bits_per_volt),
                    ("one_megohm_bits_per_volt", c.one_megohm_bits_per_volt),
                    ("attenuation", c.attenuation),
                ]
            })
            .chain(
                self.dac_bits_per_volt
                    .iter()
                    .map(|&v| ("dac_bits_per_volt", v)),
            );

        for (name, value) in constants {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "calibration constant {} must be positive, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// Load calibration constants from a JSON file.
    ///
    /// A missing file yields the nominal calibration.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(
                "Calibration file not found: {}. Using nominal calibration.",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::CalibrationFile(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let calibration: Self = serde_json::from_str(&contents).map_err(|e| {
            ConfigError::CalibrationFile(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        calibration.validate()?;

        info!("Loaded calibration from {}", path.display());
        Ok(calibration)
    }

    /// Save calibration constants as pretty-printed JSON.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = serde_json::to_string_pretty(self).map_err(|e| {
            ConfigError::CalibrationFile(format!("Failed to serialize calibration: {}", e))
        })?;
        std::fs::write(path, contents).map_err(|e| {
            ConfigError::CalibrationFile(format!("Failed to write {}: {}", path.display(), e))
        })?;
        info!("Saved calibration to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = DeviceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.compatibility.firmware_builds, vec![474]);
        assert_eq!(config.frame_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_adc_gain_with_attenuation() {
        let cal = CalibrationConfig::default();
        let plain = cal.adc_gain(Channel::One, true, false);
        let attenuated = cal.adc_gain(Channel::One, true, true);
        assert!((plain - 1.0 / 3750.0).abs() < 1e-15);
        assert!((attenuated - 10.0 * plain).abs() < 1e-15);
        assert!((cal.dac_gain(Channel::Two) - 1.0 / 30000.0).abs() < 1e-15);
    }

    #[test]
    fn test_invalid_calibration_rejected() {
        let mut config = DeviceConfig::default();
        config.calibration.dac_bits_per_volt[1] = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = DeviceConfig::default();
        config.logging.level = "loud".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn test_load_from_file_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "moku.toml",
                r#"
                frame_timeout_ms = 250

                [compatibility]
                firmware_builds = [474, 480]
                "#,
            )?;
            jail.set_env("MOKU_LOGGING__LEVEL", "debug");

            let config = DeviceConfig::load_from("moku.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.frame_timeout_ms, 250);
            assert_eq!(config.compatibility.firmware_builds, vec![474, 480]);
            assert_eq!(config.compatibility.protocol_version, "7");
            assert_eq!(config.logging.level, "debug");
            Ok(())
        });
    }

    #[test]
    fn test_compatibility_check() {
        let config = DeviceConfig::default();
        let good = DeviceInfo {
            firmware_build: 474,
            protocol_version: "7".to_string(),
        };
        config.check_compatibility(&good).unwrap();

        let old = DeviceInfo {
            firmware_build: 400,
            ..good.clone()
        };
        assert!(matches!(
            config.check_compatibility(&old),
            Err(MokuError::Incompatible(_))
        ));

        let wrong_protocol = DeviceInfo {
            protocol_version: "6".to_string(),
            ..good
        };
        assert!(config.check_compatibility(&wrong_protocol).is_err());
    }

    #[test]
    fn test_calibration_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");

        let mut cal = CalibrationConfig::default();
        cal.adc[1].fifty_ohm_bits_per_volt = 3712.5;
        cal.save_json(&path).unwrap();

        let loaded = CalibrationConfig::load_json(&path).unwrap();
        assert_eq!(loaded, cal);

        let missing = CalibrationConfig::load_json(dir.path().join("absent.json")).unwrap();
        assert_eq!(missing, CalibrationConfig::default());
    }

    #[test]
    fn test_save_and_reload_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moku.toml");
        let mut config = DeviceConfig::default();
        config.frame_timeout_ms = 42;
        config.save_to(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: DeviceConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
