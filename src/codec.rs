//! Fixed-point value codec for register bit-fields.
//!
//! Every instrument attribute ends up as a run of bits inside a 32-bit device
//! register. A [`FieldCodec`] describes where those bits live (offset, width) and
//! how they are interpreted (unsigned or two's-complement signed). A
//! [`Transform`] converts between the engineering-unit value the caller sees and
//! the raw integer stored in the field.
//!
//! # Numeric semantics
//!
//! ```text
//! raw   = round(transform.to_raw(value))        round half away from zero
//! value = transform.from_raw(sign_extend(raw))
//! ```
//!
//! A raw integer that does not fit its field is an error, never a silent wrap.
//! Quantization is deterministic: identical inputs always produce identical bits.
//!
//! # Example
//!
//! ```
//! use rust_moku::codec::{FieldCodec, Transform};
//! use rust_moku::scales::ScaleState;
//!
//! let scales = ScaleState::default();
//! let field = FieldCodec::signed(4, 8);
//! let bits = field.encode(-1.0, &Transform::Identity, &scales).unwrap();
//! assert_eq!(bits, 0xFF0);
//! assert_eq!(field.decode(bits, &Transform::Identity, &scales), -1.0);
//! ```

use std::fmt;

use thiserror::Error;

use crate::scales::ScaleState;

/// Registers are 32 bits wide.
pub const REGISTER_BITS: u8 = 32;

/// Interpretation of the bits of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signedness {
    /// Plain binary, zero-extended on decode.
    Unsigned,
    /// Two's complement, sign-extended on decode.
    Signed,
}

impl fmt::Display for Signedness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsigned => write!(f, "unsigned"),
            Self::Signed => write!(f, "signed"),
        }
    }
}

/// Errors raised by the pure codec layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("raw value {raw} does not fit a {width}-bit {signedness} field [{min}, {max})")]
    Overflow {
        raw: i64,
        width: u8,
        signedness: Signedness,
        min: i64,
        max: i64,
    },

    #[error("value {0} has no fixed-point representation")]
    NotFinite(f64),

    #[error("field of width {width} at offset {offset} does not fit a 32-bit register")]
    InvalidField { offset: u8, width: u8 },
}

/// Conversion from an engineering value to an unrounded raw value, or back.
///
/// The scale state gives dependent transforms access to live settings such as
/// frontend attenuation and calibrated converter gains.
pub type ScaleFn = fn(f64, &ScaleState) -> f64;

/// Unit conversion applied around the integer packing.
#[derive(Clone, Copy)]
pub enum Transform {
    /// The engineering value is the raw integer.
    Identity,
    /// `raw = value * factor`.
    Scale(f64),
    /// Conversion that reads other live settings through the scale state.
    Dependent { to_raw: ScaleFn, from_raw: ScaleFn },
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Identity => write!(f, "Identity"),
            Transform::Scale(factor) => f.debug_tuple("Scale").field(factor).finish(),
            Transform::Dependent { .. } => write!(f, "Dependent(<function>)"),
        }
    }
}

impl Transform {
    /// Engineering value to unrounded raw value.
    pub fn to_raw(&self, value: f64, scales: &ScaleState) -> f64 {
        match self {
            Transform::Identity => value,
            Transform::Scale(factor) => value * factor,
            Transform::Dependent { to_raw, .. } => to_raw(value, scales),
        }
    }

    /// Raw integer back to engineering units.
    pub fn from_raw(&self, raw: f64, scales: &ScaleState) -> f64 {
        match self {
            Transform::Identity => raw,
            Transform::Scale(factor) => raw / factor,
            Transform::Dependent { from_raw, .. } => from_raw(raw, scales),
        }
    }

    /// Whether the conversion depends on the scale state.
    pub fn is_dependent(&self) -> bool {
        matches!(self, Transform::Dependent { .. })
    }
}

/// Round half away from zero, rejecting NaN and infinities.
pub fn quantize(value: f64) -> Result<i64, CodecError> {
    if !value.is_finite() {
        return Err(CodecError::NotFinite(value));
    }
    // Saturating cast; out-of-range magnitudes are caught by the field bounds.
    Ok(value.round() as i64)
}

/// Location and interpretation of one bit-field inside a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldCodec {
    offset: u8,
    width: u8,
    signedness: Signedness,
}

impl FieldCodec {
    /// Unsigned field of `width` bits starting at bit `offset`.
    pub const fn unsigned(offset: u8, width: u8) -> Self {
        Self {
            offset,
            width,
            signedness: Signedness::Unsigned,
        }
    }

    /// Two's-complement field of `width` bits starting at bit `offset`.
    pub const fn signed(offset: u8, width: u8) -> Self {
        Self {
            offset,
            width,
            signedness: Signedness::Signed,
        }
    }

    /// Single-bit boolean field.
    pub const fn flag(offset: u8) -> Self {
        Self::unsigned(offset, 1)
    }

    /// Bit position of the least significant field bit.
    pub fn offset(&self) -> u8 {
        self.offset
    }

    /// Field width in bits.
    pub fn width(&self) -> u8 {
        self.width
    }

    /// How the field bits are interpreted.
    pub fn signedness(&self) -> Signedness {
        self.signedness
    }

    /// True when the field lies entirely inside a 32-bit register.
    pub fn is_valid(&self) -> bool {
        self.width >= 1 && u16::from(self.offset) + u16::from(self.width) <= u16::from(REGISTER_BITS)
    }

    fn ones(&self) -> u64 {
        (1u64 << self.width) - 1
    }

    /// Register bits occupied by this field.
    pub fn mask(&self) -> u32 {
        if !self.is_valid() {
            return 0;
        }
        ((self.ones() << self.offset) & u64::from(u32::MAX)) as u32
    }

    /// Representable raw range as `[min, max)`.
    pub fn bounds(&self) -> (i64, i64) {
        let width = self.width.clamp(1, REGISTER_BITS);
        match self.signedness {
            Signedness::Unsigned => (0, 1i64 << width),
            Signedness::Signed => {
                let half = 1i64 << (width - 1);
                (-half, half)
            }
        }
    }

    /// Whether two fields share any register bit.
    pub fn overlaps(&self, other: &FieldCodec) -> bool {
        self.mask() & other.mask() != 0
    }

    /// Position a raw integer inside the register word, checking its range.
    pub fn place(&self, raw: i64) -> Result<u32, CodecError> {
        if !self.is_valid() {
            return Err(CodecError::InvalidField {
                offset: self.offset,
                width: self.width,
            });
        }
        let (min, max) = self.bounds();
        if raw < min || raw >= max {
            return Err(CodecError::Overflow {
                raw,
                width: self.width,
                signedness: self.signedness,
                min,
                max,
            });
        }
        // Two's complement: the low `width` bits of the i64 pattern.
        let bits = (raw as u64) & self.ones();
        Ok((bits << self.offset) as u32)
    }

    /// Extract the raw integer from a register word, sign-extending if needed.
    pub fn extract(&self, word: u32) -> i64 {
        if !self.is_valid() {
            return 0;
        }
        let bits = i64::from((word & self.mask()) >> self.offset);
        match self.signedness {
            Signedness::Signed if bits & (1i64 << (self.width - 1)) != 0 => bits - (1i64 << self.width),
            _ => bits,
        }
    }

    /// Replace this field's bits in `word`, preserving every other bit.
    pub fn insert(&self, word: u32, raw: i64) -> Result<u32, CodecError> {
        Ok((word & !self.mask()) | self.place(raw)?)
    }

    /// Encode an engineering value into positioned field bits.
    pub fn encode(
        &self,
        value: f64,
        transform: &Transform,
        scales: &ScaleState,
    ) -> Result<u32, CodecError> {
        let raw = quantize(transform.to_raw(value, scales))?;
        self.place(raw)
    }

    /// Compute the raw integer an engineering value would be stored as.
    pub fn raw_for(
        &self,
        value: f64,
        transform: &Transform,
        scales: &ScaleState,
    ) -> Result<i64, CodecError> {
        let raw = quantize(transform.to_raw(value, scales))?;
        self.place(raw)?;
        Ok(raw)
    }

    /// Decode this field of a register word into engineering units.
    pub fn decode(&self, word: u32, transform: &Transform, scales: &ScaleState) -> f64 {
        transform.from_raw(self.extract(word) as f64, scales)
    }
}

// =============================================================================
// Free-standing codec operations
// =============================================================================

/// Encode `value` into an unsigned field of `width` bits at `offset`.
pub fn encode_unsigned(
    value: f64,
    width: u8,
    offset: u8,
    transform: &Transform,
    scales: &ScaleState,
) -> Result<u32, CodecError> {
    FieldCodec::unsigned(offset, width).encode(value, transform, scales)
}

/// Encode `value` into a two's-complement field of `width` bits at `offset`.
pub fn encode_signed(
    value: f64,
    width: u8,
    offset: u8,
    transform: &Transform,
    scales: &ScaleState,
) -> Result<u32, CodecError> {
    FieldCodec::signed(offset, width).encode(value, transform, scales)
}

/// Decode an unsigned field from a register word.
pub fn decode_unsigned(
    word: u32,
    width: u8,
    offset: u8,
    transform: &Transform,
    scales: &ScaleState,
) -> f64 {
    FieldCodec::unsigned(offset, width).decode(word, transform, scales)
}

/// Decode a two's-complement field from a register word.
pub fn decode_signed(
    word: u32,
    width: u8,
    offset: u8,
    transform: &Transform,
    scales: &ScaleState,
) -> f64 {
    FieldCodec::signed(offset, width).decode(word, transform, scales)
}
