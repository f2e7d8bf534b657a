//! Mock transport for testing
//!
//! This transport simulates a device in memory so instruments can be driven
//! without hardware. It provides:
//! - A register memory updated by every successful write
//! - A log of write transactions and of every call, in order
//! - Captured bulk uploads (file contents are read at send time)
//! - A queue of frames returned by `get_frame`
//! - Controllable failure injection, including partially applied writes
//!
//! The mock is `Clone`; clones share state, so a test keeps one handle for
//! inspection while the instrument owns another.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context};

use super::{DeviceInfo, RegisterWrite, Transport};
use crate::frame::RawFrame;

/// File captured by [`Transport::send_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    /// Mount point tag.
    pub tag: char,
    /// File contents at upload time.
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    registers: BTreeMap<u32, u32>,
    transactions: Vec<Vec<RegisterWrite>>,
    uploads: Vec<Upload>,
    frames: VecDeque<RawFrame>,
    call_log: Vec<String>,
    fail_next_write: bool,
    fail_next_upload: bool,
    fail_next_read: bool,
    partial_write: Option<usize>,
    device_info: DeviceInfo,
}

/// In-memory device simulation
///
/// # Example
///
/// ```
/// use rust_moku::transport::{MockTransport, RegisterWrite, Transport};
///
/// let mut transport = MockTransport::new();
/// transport.write_registers(&[RegisterWrite::new(96, 5)]).unwrap();
/// assert_eq!(transport.register(96), 5);
/// ```
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a mock reporting a compatible firmware build.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                registers: BTreeMap::new(),
                transactions: Vec::new(),
                uploads: Vec::new(),
                frames: VecDeque::new(),
                call_log: Vec::new(),
                fail_next_write: false,
                fail_next_upload: false,
                fail_next_read: false,
                partial_write: None,
                device_info: DeviceInfo {
                    firmware_build: 474,
                    protocol_version: "7".to_string(),
                },
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report a different firmware build and protocol version.
    pub fn with_device_info(self, firmware_build: u32, protocol_version: &str) -> Self {
        self.lock().device_info = DeviceInfo {
            firmware_build,
            protocol_version: protocol_version.to_string(),
        };
        self
    }

    /// Fail the next `write_registers` call without applying anything.
    pub fn inject_write_failure(&self) {
        self.lock().fail_next_write = true;
    }

    /// Apply only the first `applied` writes of the next transaction, then fail.
    pub fn inject_partial_write(&self, applied: usize) {
        self.lock().partial_write = Some(applied);
    }

    /// Fail the next `send_file` call.
    pub fn inject_upload_failure(&self) {
        self.lock().fail_next_upload = true;
    }

    /// Fail the next `read_registers` call.
    pub fn inject_read_failure(&self) {
        self.lock().fail_next_read = true;
    }

    /// Queue a frame for `get_frame`.
    pub fn push_frame(&self, frame: RawFrame) {
        self.lock().frames.push_back(frame);
    }

    /// Set a register value directly, as if the device changed it.
    pub fn set_register(&self, address: u32, word: u32) {
        self.lock().registers.insert(address, word);
    }

    /// Current simulated register value (0 if never written).
    pub fn register(&self, address: u32) -> u32 {
        self.lock().registers.get(&address).copied().unwrap_or(0)
    }

    /// Every successful write transaction, oldest first.
    pub fn transactions(&self) -> Vec<Vec<RegisterWrite>> {
        self.lock().transactions.clone()
    }

    /// Most recent successful write transaction.
    pub fn last_transaction(&self) -> Option<Vec<RegisterWrite>> {
        self.lock().transactions.last().cloned()
    }

    /// Every successful upload, oldest first.
    pub fn uploads(&self) -> Vec<Upload> {
        self.lock().uploads.clone()
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.clone()
    }

    /// Clear the call log and the recorded transactions and uploads.
    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.call_log.clear();
        state.transactions.clear();
        state.uploads.clear();
    }
}

impl Transport for MockTransport {
    fn write_registers(&mut self, writes: &[RegisterWrite]) -> anyhow::Result<()> {
        let mut state = self.lock();
        let addresses: Vec<String> = writes.iter().map(|w| w.address.to_string()).collect();
        state
            .call_log
            .push(format!("write_registers [{}]", addresses.join(",")));

        if std::mem::take(&mut state.fail_next_write) {
            return Err(anyhow!("Injected write failure"));
        }

        if let Some(applied) = state.partial_write.take() {
            for w in writes.iter().take(applied) {
                state.registers.insert(w.address, w.word());
            }
            return Err(anyhow!(
                "Connection lost after {} of {} writes",
                applied.min(writes.len()),
                writes.len()
            ));
        }

        for w in writes {
            state.registers.insert(w.address, w.word());
        }
        state.transactions.push(writes.to_vec());
        Ok(())
    }

    fn read_registers(&mut self, addresses: &[u32]) -> anyhow::Result<Vec<u32>> {
        let mut state = self.lock();
        state
            .call_log
            .push(format!("read_registers ({})", addresses.len()));

        if std::mem::take(&mut state.fail_next_read) {
            return Err(anyhow!("Injected read failure"));
        }

        Ok(addresses
            .iter()
            .map(|a| state.registers.get(a).copied().unwrap_or(0))
            .collect())
    }

    fn send_file(&mut self, tag: char, path: &Path) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.call_log.push(format!("send_file {}", tag));

        if std::mem::take(&mut state.fail_next_upload) {
            return Err(anyhow!("Injected upload failure"));
        }

        let data = std::fs::read(path)
            .with_context(|| format!("reading upload payload {}", path.display()))?;
        state.uploads.push(Upload { tag, data });
        Ok(())
    }

    fn get_frame(&mut self, _timeout: Duration) -> anyhow::Result<Option<RawFrame>> {
        let mut state = self.lock();
        state.call_log.push("get_frame".to_string());
        Ok(state.frames.pop_front())
    }

    fn device_info(&mut self) -> anyhow::Result<DeviceInfo> {
        let mut state = self.lock();
        state.call_log.push("device_info".to_string());
        Ok(state.device_info.clone())
    }
}
