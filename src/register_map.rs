//! Named attribute bindings onto device registers.
//!
//! Each instrument declares its attributes in static tables of
//! [`AttributeSpec`]s. A [`RegisterMap`] built from those tables keeps three
//! views of the device:
//!
//! - **values**: the last engineering-unit value set for each attribute
//! - **pending**: attributes staged since the last successful commit
//! - **remote image**: the register words the device is known to hold
//!
//! Staging only records a value. Encoding happens in
//! [`RegisterMap::resolve_dependencies`], once the commit-time scale state is
//! known, and merges every dirty field into its register word on top of the
//! remote image so co-resident fields keep their bits.
//!
//! ## Write order
//!
//! Data registers are written first in ascending address order, then control
//! registers (enables, state id, access flags). Enabling a path therefore never
//! happens before the values it depends on have landed.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::codec::{FieldCodec, Transform};
use crate::error::{AppResult, MokuError};
use crate::scales::ScaleState;
use crate::transport::RegisterWrite;
use crate::validation::Range;

/// Position of a register in the serialized write list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrder {
    /// Written first, ascending by address.
    Data,
    /// Written after every data register.
    Control,
}

/// Static binding of one named attribute to a register field.
#[derive(Debug, Clone, Copy)]
pub struct AttributeSpec {
    /// Attribute name used by setters and readers.
    pub name: &'static str,
    /// Register holding the field.
    pub address: u32,
    /// Bit layout of the field.
    pub codec: FieldCodec,
    /// Engineering-unit to raw conversion.
    pub transform: Transform,
    /// Accepted engineering-unit range, if any.
    pub limits: Option<Range>,
    /// Where the register sits in a transaction.
    pub order: WriteOrder,
}

impl AttributeSpec {
    /// Data attribute with an identity transform and no limits.
    pub const fn new(name: &'static str, address: u32, codec: FieldCodec) -> Self {
        Self {
            name,
            address,
            codec,
            transform: Transform::Identity,
            limits: None,
            order: WriteOrder::Data,
        }
    }

    /// Replace the engineering-unit transform.
    pub const fn with_transform(self, transform: Transform) -> Self {
        Self { transform, ..self }
    }

    /// Engineering-unit limits checked at staging time.
    pub const fn with_limits(self, min: f64, max: f64) -> Self {
        Self {
            limits: Some(Range::new(min, max)),
            ..self
        }
    }

    /// Mark the register as a control register.
    pub const fn control(self) -> Self {
        Self {
            order: WriteOrder::Control,
            ..self
        }
    }
}

/// Attribute table and register image of one instrument instance.
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    specs: BTreeMap<&'static str, AttributeSpec>,
    values: BTreeMap<&'static str, f64>,
    pending: BTreeSet<&'static str>,
    remote: BTreeMap<u32, u32>,
    resolved: BTreeMap<u32, u32>,
    control: BTreeSet<u32>,
}

impl RegisterMap {
    /// Empty map with no bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from static tables, rejecting conflicting bindings.
    pub fn from_tables(tables: &[&[AttributeSpec]]) -> AppResult<Self> {
        let mut map = Self::new();
        for spec in tables.iter().flat_map(|t| t.iter()) {
            map.bind(*spec)?;
        }
        Ok(map)
    }

    /// Add one binding.
    ///
    /// Rejects duplicate names, fields that do not fit a register, fields that
    /// overlap another field of the same register, and registers mixing data
    /// and control bindings.
    pub fn bind(&mut self, spec: AttributeSpec) -> AppResult<()> {
        if !spec.codec.is_valid() {
            return Err(MokuError::BindingConflict(format!(
                "'{}' has a {}-bit field at offset {} outside the register",
                spec.name,
                spec.codec.width(),
                spec.codec.offset()
            )));
        }
        if self.specs.contains_key(spec.name) {
            return Err(MokuError::BindingConflict(format!(
                "'{}' is bound twice",
                spec.name
            )));
        }
        for other in self.specs.values().filter(|s| s.address == spec.address) {
            if other.codec.overlaps(&spec.codec) {
                return Err(MokuError::BindingConflict(format!(
                    "'{}' overlaps '{}' in register {}",
                    spec.name, other.name, spec.address
                )));
            }
            if other.order != spec.order {
                return Err(MokuError::BindingConflict(format!(
                    "'{}' and '{}' disagree on the write order of register {}",
                    spec.name, other.name, spec.address
                )));
            }
        }

        if spec.order == WriteOrder::Control {
            self.control.insert(spec.address);
        }
        self.values.insert(spec.name, 0.0);
        self.specs.insert(spec.name, spec);
        Ok(())
    }

    /// Binding of `name`.
    pub fn spec(&self, name: &str) -> AppResult<&AttributeSpec> {
        self.specs
            .get(name)
            .ok_or_else(|| MokuError::UnknownAttribute(name.to_string()))
    }

    /// Every bound register address, ascending.
    pub fn addresses(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = self.specs.values().map(|s| s.address).collect();
        set.into_iter().collect()
    }

    // =========================================================================
    // Staging
    // =========================================================================

    /// Record a new value for `name`.
    ///
    /// Limits are checked here, as is the codec range for transforms that do
    /// not depend on the scale state. Nothing is encoded yet.
    pub fn stage(&mut self, name: &str, value: f64) -> AppResult<()> {
        let spec = *self.spec(name)?;
        if let Some(limits) = spec.limits {
            limits.check(spec.name, value)?;
        }
        if !spec.transform.is_dependent() {
            spec.codec
                .raw_for(value, &spec.transform, &ScaleState::default())
                .map_err(|e| MokuError::validation(spec.name, value, e.to_string()))?;
        }

        trace!(attribute = spec.name, value, "staged");
        self.values.insert(spec.name, value);
        self.pending.insert(spec.name);
        Ok(())
    }

    /// Stage a single-bit attribute.
    pub fn stage_flag(&mut self, name: &str, on: bool) -> AppResult<()> {
        self.stage(name, if on { 1.0 } else { 0.0 })
    }

    /// Stage an enumerated code.
    pub fn stage_code(&mut self, name: &str, code: u32) -> AppResult<()> {
        self.stage(name, f64::from(code))
    }

    /// True while staged values await a commit.
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Staged attribute names, sorted.
    pub fn pending(&self) -> Vec<&'static str> {
        self.pending.iter().copied().collect()
    }

    /// Last value set for `name`.
    pub fn value(&self, name: &str) -> AppResult<f64> {
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| MokuError::UnknownAttribute(name.to_string()))
    }

    /// Last value set for a single-bit attribute.
    pub fn flag(&self, name: &str) -> AppResult<bool> {
        Ok(self.value(name)? != 0.0)
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Word built from the current values of every field in `address`.
    fn model_word(&self, address: u32, scales: &ScaleState) -> AppResult<u32> {
        self.specs
            .values()
            .filter(|s| s.address == address)
            .try_fold(0, |word, spec| {
                self.merge(spec, self.value(spec.name)?, word, scales)
            })
    }

    /// Word a field update starts from: this resolution's word, else the
    /// device image, else the model when the device word is unknown.
    fn base_word(
        &self,
        words: &BTreeMap<u32, u32>,
        address: u32,
        scales: &ScaleState,
    ) -> AppResult<u32> {
        match words.get(&address).or_else(|| self.remote.get(&address)) {
            Some(&word) => Ok(word),
            None => self.model_word(address, scales),
        }
    }

    fn merge(
        &self,
        spec: &AttributeSpec,
        value: f64,
        word: u32,
        scales: &ScaleState,
    ) -> AppResult<u32> {
        spec.codec
            .raw_for(value, &spec.transform, scales)
            .and_then(|raw| spec.codec.insert(word, raw))
            .map_err(|source| MokuError::RangeOverflow {
                attribute: spec.name.to_string(),
                source,
            })
    }

    /// Encode every pending attribute, then every derived value, then every
    /// other scale-dependent attribute into register words using `scales`.
    ///
    /// Derived values and stored scale-dependent values only produce a write
    /// when their bits differ from the device image, the device word is
    /// unknown, or the register is already being written. On error nothing is
    /// resolved and the pending set is untouched.
    pub fn resolve_dependencies(
        &mut self,
        scales: &ScaleState,
        derived: &[(&'static str, f64)],
    ) -> AppResult<()> {
        let mut words = BTreeMap::new();

        for name in &self.pending {
            let spec = self.spec(name)?;
            let value = self.value(name)?;
            let base = self.base_word(&words, spec.address, scales)?;
            words.insert(spec.address, self.merge(spec, value, base, scales)?);
        }

        let stored: Vec<(&'static str, f64)> = self
            .specs
            .values()
            .filter(|s| s.transform.is_dependent() && !self.pending.contains(s.name))
            .filter(|s| derived.iter().all(|&(name, _)| name != s.name))
            .map(|s| (s.name, self.values.get(s.name).copied().unwrap_or(0.0)))
            .collect();

        for &(name, value) in derived.iter().chain(&stored) {
            let spec = self.spec(name)?;
            let base = self.base_word(&words, spec.address, scales)?;
            let word = self.merge(spec, value, base, scales)?;
            let changed = self.remote.get(&spec.address) != Some(&word);
            if words.contains_key(&spec.address) || changed {
                words.insert(spec.address, word);
            }
        }

        for &(name, value) in derived {
            if let Some(slot) = self.values.get_mut(name) {
                *slot = value;
            }
        }
        self.resolved = words;
        Ok(())
    }

    /// True when the last resolution produced at least one write.
    pub fn has_resolved(&self) -> bool {
        !self.resolved.is_empty()
    }

    /// Resolved words as little-endian writes: data registers ascending, then
    /// control registers ascending.
    pub fn serialize_dirty(&self) -> Vec<RegisterWrite> {
        let (control, data): (Vec<_>, Vec<_>) = self
            .resolved
            .iter()
            .map(|(&address, &word)| RegisterWrite::new(address, word))
            .partition(|w| self.control.contains(&w.address));
        data.into_iter().chain(control).collect()
    }

    /// The resolved writes reached the device.
    pub fn mark_committed(&mut self) {
        let resolved = std::mem::take(&mut self.resolved);
        self.remote.extend(resolved);
        self.pending.clear();
    }

    /// Drop the resolved words, keeping the pending set.
    pub fn discard_resolved(&mut self) {
        self.resolved.clear();
    }

    // =========================================================================
    // Device image
    // =========================================================================

    /// Encode a single attribute against the device image, bypassing staging.
    pub fn encode_immediate(
        &self,
        name: &str,
        value: f64,
        scales: &ScaleState,
    ) -> AppResult<RegisterWrite> {
        let spec = self.spec(name)?;
        let base = match self.remote_word(spec.address) {
            Some(word) => word,
            None => self.model_word(spec.address, scales)?,
        };
        let word = self.merge(spec, value, base, scales)?;
        Ok(RegisterWrite::new(spec.address, word))
    }

    /// Record a write that reached the device outside a commit.
    pub fn record_remote(&mut self, write: &RegisterWrite) {
        self.remote.insert(write.address, write.word());
    }

    /// Word the device is known to hold at `address`, if any.
    pub fn remote_word(&self, address: u32) -> Option<u32> {
        self.remote.get(&address).copied()
    }

    /// Decode the device-known value of `name`.
    ///
    /// Falls back to the last value set while the register was never written
    /// or read.
    pub fn read(&self, name: &str, scales: &ScaleState) -> AppResult<f64> {
        let spec = self.spec(name)?;
        match self.remote_word(spec.address) {
            Some(word) => Ok(spec.codec.decode(word, &spec.transform, scales)),
            None => self.value(name),
        }
    }

    /// Replace the device image with freshly read words and make it the source
    /// of truth: pending writes are dropped and values re-decoded.
    pub fn replace_image(&mut self, words: impl IntoIterator<Item = (u32, u32)>, scales: &ScaleState) {
        self.remote = words.into_iter().collect();
        self.resolved.clear();
        self.pending.clear();
        self.redecode(scales);
    }

    /// Re-decode every value held in the device image under `scales`.
    pub fn redecode(&mut self, scales: &ScaleState) {
        for (name, spec) in &self.specs {
            if let Some(&word) = self.remote.get(&spec.address) {
                self.values
                    .insert(name, spec.codec.decode(word, &spec.transform, scales));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REG_A: u32 = 10;
    const REG_B: u32 = 11;
    const REG_CTL: u32 = 2;

    fn doubled(x: f64, s: &ScaleState) -> f64 {
        x * 2.0 / s.attenuation(crate::channel::Channel::One)
    }

    fn halved(x: f64, s: &ScaleState) -> f64 {
        x * s.attenuation(crate::channel::Channel::One) / 2.0
    }

    const TABLE: &[AttributeSpec] = &[
        AttributeSpec::new("low", REG_A, FieldCodec::unsigned(0, 3)),
        AttributeSpec::new("high", REG_A, FieldCodec::unsigned(3, 3)),
        AttributeSpec::new("level", REG_B, FieldCodec::signed(0, 7))
            .with_transform(Transform::Dependent {
                to_raw: doubled,
                from_raw: halved,
            })
            .with_limits(-60.0, 60.0),
        AttributeSpec::new("enable", REG_CTL, FieldCodec::flag(0)).control(),
    ];

    fn map() -> RegisterMap {
        RegisterMap::from_tables(&[TABLE]).unwrap()
    }

    #[test]
    fn test_duplicate_and_overlap_rejected() {
        let dup = [
            AttributeSpec::new("x", 1, FieldCodec::flag(0)),
            AttributeSpec::new("x", 2, FieldCodec::flag(0)),
        ];
        assert!(matches!(
            RegisterMap::from_tables(&[&dup]),
            Err(MokuError::BindingConflict(_))
        ));

        let overlap = [
            AttributeSpec::new("x", 1, FieldCodec::unsigned(0, 4)),
            AttributeSpec::new("y", 1, FieldCodec::unsigned(3, 2)),
        ];
        assert!(RegisterMap::from_tables(&[&overlap]).is_err());

        let mixed = [
            AttributeSpec::new("x", 1, FieldCodec::flag(0)),
            AttributeSpec::new("y", 1, FieldCodec::flag(1)).control(),
        ];
        assert!(RegisterMap::from_tables(&[&mixed]).is_err());

        let outside = [AttributeSpec::new("x", 1, FieldCodec::unsigned(31, 2))];
        assert!(RegisterMap::from_tables(&[&outside]).is_err());
    }

    #[test]
    fn test_disjoint_fields_share_one_write() {
        let mut map = map();
        map.record_remote(&RegisterWrite::new(REG_A, 0xFFFF_FF00));
        map.record_remote(&RegisterWrite::new(REG_B, 0));
        map.stage("low", 5.0).unwrap();
        map.stage("high", 2.0).unwrap();
        map.resolve_dependencies(&ScaleState::default(), &[]).unwrap();

        let writes = map.serialize_dirty();
        assert_eq!(writes, vec![RegisterWrite::new(REG_A, 0xFFFF_FF00 | (2 << 3) | 5)]);
    }

    #[test]
    fn test_limits_checked_before_staging() {
        let mut map = map();
        let err = map.stage("level", 61.0).unwrap_err();
        assert!(matches!(err, MokuError::Validation { .. }));
        assert!(!map.is_dirty());
        assert_eq!(map.value("level").unwrap(), 0.0);

        assert!(map.stage("low", 8.0).is_err());
        assert!(map.stage("nope", 1.0).is_err());
        assert!(!map.is_dirty());
    }

    #[test]
    fn test_dependent_overflow_at_resolve() {
        let mut map = map();
        map.stage("level", 60.0).unwrap();
        let err = map.resolve_dependencies(&ScaleState::default(), &[]).unwrap_err();
        assert!(matches!(err, MokuError::RangeOverflow { ref attribute, .. } if attribute == "level"));
        assert!(!map.has_resolved());
        assert_eq!(map.pending(), vec!["level"]);

        let mut attenuated = ScaleState::default();
        attenuated.frontends[0].atten = true;
        map.resolve_dependencies(&attenuated, &[]).unwrap();
        assert_eq!(map.serialize_dirty(), vec![RegisterWrite::new(REG_B, 12)]);
    }

    #[test]
    fn test_control_registers_last() {
        let mut map = map();
        map.stage_flag("enable", true).unwrap();
        map.stage("level", 10.0).unwrap();
        map.stage("low", 1.0).unwrap();
        map.resolve_dependencies(&ScaleState::default(), &[]).unwrap();
        let addresses: Vec<u32> = map.serialize_dirty().iter().map(|w| w.address).collect();
        assert_eq!(addresses, vec![REG_A, REG_B, REG_CTL]);
    }

    #[test]
    fn test_matching_derived_values_produce_no_write() {
        let mut map = map();
        let scales = ScaleState::default();
        map.record_remote(&RegisterWrite::new(REG_B, 0));
        map.resolve_dependencies(&scales, &[("level", 0.0)]).unwrap();
        assert!(!map.has_resolved());

        map.resolve_dependencies(&scales, &[("level", 5.0)]).unwrap();
        assert_eq!(map.serialize_dirty(), vec![RegisterWrite::new(REG_B, 10)]);
        map.mark_committed();
        assert_eq!(map.read("level", &scales).unwrap(), 5.0);

        map.resolve_dependencies(&scales, &[("level", 5.0)]).unwrap();
        assert!(!map.has_resolved());
    }

    #[test]
    fn test_commit_bookkeeping() {
        let mut map = map();
        let scales = ScaleState::default();
        map.record_remote(&RegisterWrite::new(REG_B, 0));
        map.stage("high", 3.0).unwrap();
        map.resolve_dependencies(&scales, &[]).unwrap();
        map.discard_resolved();
        assert!(map.is_dirty());
        assert!(!map.has_resolved());

        map.resolve_dependencies(&scales, &[]).unwrap();
        map.mark_committed();
        assert!(!map.is_dirty());
        assert_eq!(map.remote_word(REG_A), Some(3 << 3));
        assert_eq!(map.read("high", &scales).unwrap(), 3.0);
    }

    #[test]
    fn test_replace_image_redecodes_values() {
        let mut map = map();
        map.stage("low", 1.0).unwrap();
        map.replace_image([(REG_A, 0b010_110)], &ScaleState::default());
        assert!(!map.is_dirty());
        assert_eq!(map.value("low").unwrap(), 6.0);
        assert_eq!(map.value("high").unwrap(), 2.0);
        assert_eq!(map.addresses(), vec![REG_CTL, REG_A, REG_B]);
    }

    #[test]
    fn test_stored_dependent_values_follow_scales() {
        let mut map = map();
        map.record_remote(&RegisterWrite::new(REG_B, 0));
        map.stage("level", 10.0).unwrap();
        map.resolve_dependencies(&ScaleState::default(), &[]).unwrap();
        assert_eq!(map.serialize_dirty(), vec![RegisterWrite::new(REG_B, 20)]);
        map.mark_committed();

        // nothing staged, but the encoding of "level" depends on attenuation
        let mut attenuated = ScaleState::default();
        attenuated.frontends[0].atten = true;
        map.resolve_dependencies(&attenuated, &[]).unwrap();
        assert_eq!(map.serialize_dirty(), vec![RegisterWrite::new(REG_B, 2)]);
        map.mark_committed();

        map.resolve_dependencies(&attenuated, &[]).unwrap();
        assert!(!map.has_resolved());
        assert_eq!(map.read("level", &attenuated).unwrap(), 10.0);
    }

    #[test]
    fn test_unknown_registers_written_from_model() {
        let mut map = map();
        let scales = ScaleState::default();
        map.stage("high", 1.0).unwrap();
        map.resolve_dependencies(&scales, &[]).unwrap();

        // REG_B was never read, so its zero value must still be sent
        assert_eq!(
            map.serialize_dirty(),
            vec![RegisterWrite::new(REG_A, 1 << 3), RegisterWrite::new(REG_B, 0)]
        );
        assert_eq!(map.read("level", &scales).unwrap(), 0.0);
        map.mark_committed();
        assert_eq!(map.remote_word(REG_B), Some(0));
    }

    #[test]
    fn test_immediate_write_keeps_model_bits() {
        let mut map = map();
        map.stage("high", 5.0).unwrap();
        let write = map.encode_immediate("low", 2.0, &ScaleState::default()).unwrap();
        assert_eq!(write, RegisterWrite::new(REG_A, (5 << 3) | 2));
    }
}
