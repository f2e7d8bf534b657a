//! Dependency-ordered commit engine.
//!
//! A [`RegisterDevice`] owns an instrument's [`RegisterMap`] and its
//! [`Transport`], and turns staged attribute values into register transactions.
//!
//! ## Commit lifecycle
//!
//! ```text
//!            stage()                commit()
//!   Clean ───────────▶ Dirty ───────────────▶ Committing
//!     ▲                  ▲                        │
//!     │                  └──── transport error ───┤
//!     └──────────────────────── success ──────────┘
//! ```
//!
//! Each commit:
//! 1. resolves pending and derived values against the caller's scale state
//! 2. stamps the transaction with the next 8-bit state id
//! 3. sends data registers, then control registers, in one transaction
//! 4. records the scale state under the new state id for frame decoding
//!
//! On failure the pending set is kept, so a retry without new stages
//! reproduces the same transaction. Writes that reached the device before a
//! failure are not rolled back; [`RegisterDevice::sync`] re-reads the device
//! when the two views must be reconciled.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::codec::FieldCodec;
use crate::error::{AppResult, MokuError};
use crate::frame::Frame;
use crate::register_map::{AttributeSpec, RegisterMap};
use crate::scales::ScaleState;
use crate::transport::{DeviceInfo, RegisterWrite, Transport};

/// Control register holding the exclusive memory access flag.
pub const REG_CTL: u32 = 0;
/// Control register holding the state id of the last transaction.
pub const REG_STATE: u32 = 63;

/// Attribute holding the transaction state id.
pub const STATE_ID: &str = "state_id";
/// Attribute holding the exclusive memory access flag.
pub const MEMORY_ACCESS: &str = "mmap_access";

/// Registers every instrument binds.
pub const BASE_REGISTERS: &[AttributeSpec] = &[
    AttributeSpec::new(MEMORY_ACCESS, REG_CTL, FieldCodec::flag(0)).control(),
    AttributeSpec::new(STATE_ID, REG_STATE, FieldCodec::unsigned(0, 8)).control(),
];

/// Transaction state of a register device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    /// Model and device agree.
    Clean,
    /// Staged values have not reached the device.
    Dirty,
    /// A transaction is being built or sent.
    Committing,
}

/// Register map bound to a transport, with commit bookkeeping.
pub struct RegisterDevice {
    map: RegisterMap,
    transport: Box<dyn Transport>,
    state: CommitState,
    state_id: u8,
    history: BTreeMap<u8, ScaleState>,
}

impl std::fmt::Debug for RegisterDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterDevice")
            .field("state", &self.state)
            .field("state_id", &self.state_id)
            .field("pending", &self.map.pending())
            .finish_non_exhaustive()
    }
}

impl RegisterDevice {
    /// Bind the base registers plus `tables` and take ownership of `transport`.
    pub fn new(transport: Box<dyn Transport>, tables: &[&[AttributeSpec]]) -> AppResult<Self> {
        let mut all: Vec<&[AttributeSpec]> = vec![BASE_REGISTERS];
        all.extend_from_slice(tables);
        Ok(Self {
            map: RegisterMap::from_tables(&all)?,
            transport,
            state: CommitState::Clean,
            state_id: 0,
            history: BTreeMap::new(),
        })
    }

    /// Register map and device image.
    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    /// Underlying transport.
    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Current transaction state.
    pub fn state(&self) -> CommitState {
        if self.state == CommitState::Clean && self.map.is_dirty() {
            CommitState::Dirty
        } else {
            self.state
        }
    }

    /// State id of the last successful transaction.
    pub fn state_id(&self) -> u8 {
        self.state_id
    }

    /// Scale state recorded for a state id.
    pub fn scales_for(&self, state_id: u8) -> Option<&ScaleState> {
        self.history.get(&state_id)
    }

    // =========================================================================
    // Staging
    // =========================================================================

    /// Stage a value; see [`RegisterMap::stage`].
    pub fn stage(&mut self, name: &str, value: f64) -> AppResult<()> {
        self.map.stage(name, value)?;
        self.state = CommitState::Dirty;
        Ok(())
    }

    /// Stage a single-bit attribute.
    pub fn stage_flag(&mut self, name: &str, on: bool) -> AppResult<()> {
        self.map.stage_flag(name, on)?;
        self.state = CommitState::Dirty;
        Ok(())
    }

    /// Stage an enumerated code.
    pub fn stage_code(&mut self, name: &str, code: u32) -> AppResult<()> {
        self.map.stage_code(name, code)?;
        self.state = CommitState::Dirty;
        Ok(())
    }

    /// Flag a change held outside the register map, such as instrument state
    /// that only reaches the device through derived values.
    pub fn mark_dirty(&mut self) {
        self.state = CommitState::Dirty;
    }

    /// Last value set for `name`.
    pub fn value(&self, name: &str) -> AppResult<f64> {
        self.map.value(name)
    }

    /// Last value set for a single-bit attribute.
    pub fn flag(&self, name: &str) -> AppResult<bool> {
        self.map.flag(name)
    }

    /// Enumerated code last set for `name`.
    pub fn code(&self, name: &str) -> AppResult<u32> {
        Ok(self.map.value(name)?.round().max(0.0) as u32)
    }

    /// Device-known value of `name`.
    pub fn read(&self, name: &str, scales: &ScaleState) -> AppResult<f64> {
        self.map.read(name, scales)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Send every staged and derived change as one transaction.
    ///
    /// A commit that resolves to no writes returns without touching the
    /// transport.
    pub fn commit(&mut self, scales: &ScaleState, derived: &[(&'static str, f64)]) -> AppResult<()> {
        self.state = CommitState::Committing;
        match self.try_commit(scales, derived) {
            Ok(()) => {
                self.state = CommitState::Clean;
                Ok(())
            }
            Err(e) => {
                self.map.discard_resolved();
                self.state = CommitState::Dirty;
                warn!("commit failed, {} attribute(s) still pending: {}", self.map.pending().len(), e);
                Err(e)
            }
        }
    }

    fn try_commit(&mut self, scales: &ScaleState, derived: &[(&'static str, f64)]) -> AppResult<()> {
        self.map.resolve_dependencies(scales, derived)?;
        if !self.map.has_resolved() {
            debug!("commit: nothing to write");
            return Ok(());
        }

        let next = self.state_id.wrapping_add(1);
        let mut stamped = derived.to_vec();
        stamped.push((STATE_ID, f64::from(next)));
        self.map.resolve_dependencies(scales, &stamped)?;

        let writes = self.map.serialize_dirty();
        self.transport
            .write_registers(&writes)
            .map_err(MokuError::Transport)?;

        self.map.mark_committed();
        self.state_id = next;
        self.history.insert(next, scales.clone());
        debug!(state_id = next, registers = writes.len(), "commit complete");
        Ok(())
    }

    fn write_immediate(&mut self, name: &str, value: f64) -> AppResult<()> {
        let write: RegisterWrite = self
            .map
            .encode_immediate(name, value, &ScaleState::default())?;
        self.transport
            .write_registers(&[write])
            .map_err(MokuError::Transport)?;
        self.map.record_remote(&write);
        Ok(())
    }

    /// Run `f` with exclusive access to device memory.
    ///
    /// The access flag is written on immediately, bypassing staging, and is
    /// always written off afterwards. The first error wins; a failure to
    /// release after a successful body is reported.
    pub fn with_memory_access<T, F>(&mut self, f: F) -> AppResult<T>
    where
        F: FnOnce(&mut dyn Transport) -> AppResult<T>,
    {
        self.write_immediate(MEMORY_ACCESS, 1.0)?;
        let body = f(self.transport.as_mut());
        let release = self.write_immediate(MEMORY_ACCESS, 0.0);

        match (body, release) {
            (Err(e), Err(release_err)) => {
                warn!("memory access release failed after error: {}", release_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    /// Re-read every bound register and make the device image authoritative.
    ///
    /// Pending writes are discarded. The current scale state is recorded under
    /// the state id read back from the device.
    pub fn sync(&mut self, scales: &ScaleState) -> AppResult<()> {
        let addresses = self.map.addresses();
        let words = self
            .transport
            .read_registers(&addresses)
            .map_err(MokuError::Transport)?;
        if words.len() != addresses.len() {
            return Err(MokuError::Transport(anyhow::anyhow!(
                "read {} registers, expected {}",
                words.len(),
                addresses.len()
            )));
        }

        self.map.replace_image(addresses.into_iter().zip(words), scales);
        self.state_id = self.code(STATE_ID)?.min(u32::from(u8::MAX)) as u8;
        self.history.insert(self.state_id, scales.clone());
        self.state = CommitState::Clean;
        debug!(state_id = self.state_id, "register image re-read");
        Ok(())
    }

    /// Re-decode the device image under `scales` and record them for the
    /// current state id. Used once the scale state implied by freshly synced
    /// registers is known.
    pub fn rescale(&mut self, scales: &ScaleState) {
        self.map.redecode(scales);
        self.history.insert(self.state_id, scales.clone());
    }

    /// Wait for the next frame and pair it with its recorded scale state.
    pub fn acquire_frame(&mut self, timeout: Duration) -> AppResult<Frame> {
        let raw = self
            .transport
            .get_frame(timeout)
            .map_err(MokuError::Transport)?
            .ok_or(MokuError::Timeout(timeout))?;
        let id = u8::try_from(raw.state_id()).map_err(|_| {
            MokuError::MalformedFrame(format!("state id {} exceeds 8 bits", raw.state_id()))
        })?;
        let scales = self
            .history
            .get(&id)
            .cloned()
            .ok_or(MokuError::UnknownScaleState(id))?;
        Ok(Frame::new(raw, scales))
    }

    /// Ask the device for its identity.
    pub fn device_info(&mut self) -> AppResult<DeviceInfo> {
        self.transport.device_info().map_err(MokuError::Transport)
    }
}
