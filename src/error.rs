//! Custom error types for the driver library.
//!
//! This module defines the primary error type, `MokuError`, shared by every layer
//! of the register engine. Using the `thiserror` crate, it provides a centralized
//! and consistent way to report the four failure classes an instrument call can hit.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: the caller supplied an out-of-range or structurally invalid
//!   value. Always raised before any state is mutated.
//! - **`RangeOverflow`**: a raw integer computed from a staged value no longer fits
//!   its register field once the commit-time scale state is applied (for example
//!   after the frontend attenuator was toggled). Values are never truncated.
//! - **`Transport`**: the register write, register read or bulk upload failed at
//!   the collaborator boundary. Pending writes are retained so `commit()` can be
//!   retried.
//! - **`Timeout`**: frame retrieval exceeded the caller's deadline.
//!
//! The remaining variants cover static configuration mistakes (conflicting
//! bindings, unknown attribute names), malformed frames and configuration loading.

use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, MokuError>;

/// Errors raised by the register engine and instruments.
#[derive(Error, Debug)]
pub enum MokuError {
    /// A setter argument is outside its accepted set or range.
    #[error("Invalid {field}: {value} (expected {expected})")]
    Validation {
        field: String,
        value: String,
        expected: String,
    },

    /// A value does not fit its register field at commit time.
    #[error("Register overflow for '{attribute}': {source}")]
    RangeOverflow {
        attribute: String,
        #[source]
        source: CodecError,
    },

    /// The device link failed.
    #[error("Transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// No frame arrived in time.
    #[error("Timed out after {0:?} waiting for a frame")]
    Timeout(Duration),

    /// No binding has this name.
    #[error("Unknown attribute '{0}'")]
    UnknownAttribute(String),

    /// Two bindings claim the same name or bits.
    #[error("Conflicting register binding: {0}")]
    BindingConflict(String),

    /// A frame refers to a state id with no recorded scales.
    #[error("No scale state recorded for state id {0}")]
    UnknownScaleState(u8),

    /// A frame failed to parse.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The device firmware or protocol is not supported.
    #[error("Incompatible device: {0}")]
    Incompatible(String),

    /// Local filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MokuError {
    /// Build a validation error from anything displayable.
    pub fn validation(
        field: impl Into<String>,
        value: impl ToString,
        expected: impl Into<String>,
    ) -> Self {
        MokuError::Validation {
            field: field.into(),
            value: value.to_string(),
            expected: expected.into(),
        }
    }

    /// True for errors raised by the collaborator boundary.
    pub fn is_transport(&self) -> bool {
        matches!(self, MokuError::Transport(_) | MokuError::Timeout(_))
    }
}
