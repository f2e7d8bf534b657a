//! Collaborator boundary to the device.
//!
//! The register engine never talks to a socket directly. Everything that
//! leaves the host goes through a [`Transport`]: batched register writes,
//! register reads, bulk file uploads to a device mount point, and frame
//! retrieval. Implementations report failures as `anyhow::Error`; the engine
//! wraps them into [`MokuError::Transport`](crate::error::MokuError) unchanged.

pub mod mock;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::RawFrame;

pub use mock::MockTransport;

/// One 32-bit register write, value in little-endian byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterWrite {
    /// Register address.
    pub address: u32,
    /// Register word, little-endian.
    pub bytes: [u8; 4],
}

impl RegisterWrite {
    /// Write of `word` to `address`.
    pub fn new(address: u32, word: u32) -> Self {
        Self {
            address,
            bytes: word.to_le_bytes(),
        }
    }

    /// Register value as a native integer.
    pub fn word(&self) -> u32 {
        u32::from_le_bytes(self.bytes)
    }
}

/// Identification reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Firmware build number.
    pub firmware_build: u32,
    pub protocol_version: String,
}

/// Request/reply channel to one device.
///
/// All calls block until the device answers. Register writes in one call form
/// a single transaction and are applied in slice order.
pub trait Transport: Send {
    /// Apply a batch of register writes in order.
    fn write_registers(&mut self, writes: &[RegisterWrite]) -> anyhow::Result<()>;

    /// Read the current value of each address, in request order.
    fn read_registers(&mut self, addresses: &[u32]) -> anyhow::Result<Vec<u32>>;

    /// Upload a file to the device mount point identified by `tag`.
    ///
    /// A failed upload may have been partially applied.
    fn send_file(&mut self, tag: char, path: &Path) -> anyhow::Result<()>;

    /// Wait up to `timeout` for the next captured frame; `None` on timeout.
    fn get_frame(&mut self, timeout: Duration) -> anyhow::Result<Option<RawFrame>>;

    /// Firmware build and protocol version of the connected device.
    fn device_info(&mut self) -> anyhow::Result<DeviceInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_write_bytes() {
        let w = RegisterWrite::new(96, 0x0403_0201);
        assert_eq!(w.bytes, [1, 2, 3, 4]);
        assert_eq!(w.word(), 0x0403_0201);
    }
}
