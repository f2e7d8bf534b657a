//! Tracing subscriber setup for applications embedding the driver.
//!
//! The library itself only emits `tracing` events; it never installs a
//! subscriber. Binaries and test harnesses call [`init`] once at startup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::AppResult;

/// Build the filter: `RUST_LOG` when set, otherwise the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install a global fmt subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> AppResult<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(config));
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| {
        crate::config::ConfigError::ValidationError(format!("logging already initialised: {}", e))
            .into()
    })
}
