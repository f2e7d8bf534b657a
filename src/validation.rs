//! Engineering-unit validation helpers.
//!
//! Domain setters validate every argument before anything is staged, so a
//! rejected call leaves the instrument exactly as it was.

use std::fmt;

use crate::error::{AppResult, MokuError};

// =============================================================================
// Range
// =============================================================================

/// Inclusive numeric range.
///
/// Values must satisfy `min <= value <= max`. NaN is never contained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    /// Inclusive lower bound.
    pub min: f64,
    /// Inclusive upper bound.
    pub max: f64,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// True when `value` lies within the bounds.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Fail with a validation error naming `field` when `value` is outside.
    pub fn check(&self, field: &str, value: f64) -> AppResult<()> {
        if self.contains(value) {
            Ok(())
        } else {
            Err(MokuError::validation(field, value, self.to_string()))
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

// =============================================================================
// Discrete choices
// =============================================================================

/// Look up a case-insensitive keyword in a choice table.
pub fn check_choice<T: Copy>(field: &str, value: &str, choices: &[(&str, T)]) -> AppResult<T> {
    let wanted = value.to_lowercase();
    choices
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, v)| *v)
        .ok_or_else(|| {
            let names: Vec<&str> = choices.iter().map(|(name, _)| *name).collect();
            MokuError::validation(field, value, format!("one of {{{}}}", names.join(", ")))
        })
}

/// Number of decimal places needed to print `value` exactly, capped at 15.
pub fn decimal_places(value: f64) -> u32 {
    let mut scaled = value;
    for places in 0..15 {
        if (scaled - scaled.round()).abs() < 1e-9 {
            return places;
        }
        scaled *= 10.0;
    }
    15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_check() {
        let r = Range::new(-20.0, 20.0);
        assert!(r.check("scale", 20.0).is_ok());
        assert!(r.check("scale", -20.0).is_ok());
        let err = r.check("scale", 25.0).unwrap_err();
        assert_eq!(err.to_string(), "Invalid scale: 25 (expected [-20, 20])");
        assert!(r.check("scale", f64::NAN).is_err());
    }

    #[test]
    fn test_check_choice() {
        let table = [("rising", 0u8), ("falling", 1), ("both", 2)];
        assert_eq!(check_choice("edge", "Falling", &table).unwrap(), 1);
        let err = check_choice("edge", "up", &table).unwrap_err();
        assert!(err.to_string().contains("one of {rising, falling, both}"));
    }

    #[test]
    fn test_decimal_places() {
        assert_eq!(decimal_places(3.0), 0);
        assert_eq!(decimal_places(-0.5), 1);
        assert_eq!(decimal_places(0.25), 2);
    }
}
