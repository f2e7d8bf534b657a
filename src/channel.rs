//! Analog channel identifiers shared by every instrument.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MokuError;

/// One of the two analog channels of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    One,
    Two,
}

impl Channel {
    /// Both channels in order.
    pub const ALL: [Channel; 2] = [Channel::One, Channel::Two];

    /// Zero-based index for per-channel arrays.
    pub fn index(self) -> usize {
        match self {
            Channel::One => 0,
            Channel::Two => 1,
        }
    }

    /// One-based channel number as printed on the front panel.
    pub fn number(self) -> u8 {
        match self {
            Channel::One => 1,
            Channel::Two => 2,
        }
    }

    /// Convert a caller-supplied channel number, naming `field` on failure.
    pub fn parse(ch: u8, field: &str) -> Result<Self, MokuError> {
        match ch {
            1 => Ok(Channel::One),
            2 => Ok(Channel::Two),
            other => Err(MokuError::validation(field, other, "one of {1, 2}")),
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = MokuError;

    fn try_from(ch: u8) -> Result<Self, Self::Error> {
        Channel::parse(ch, "channel")
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.number())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parse() {
        assert_eq!(Channel::try_from(1).unwrap(), Channel::One);
        assert_eq!(Channel::try_from(2).unwrap(), Channel::Two);
        let err = Channel::parse(3, "filter channel").unwrap_err();
        assert!(err.to_string().contains("filter channel"));
    }

    #[test]
    fn test_channel_index() {
        assert_eq!(Channel::One.index(), 0);
        assert_eq!(Channel::Two.index(), 1);
        assert_eq!(Channel::Two.to_string(), "ch2");
    }
}
