//! Common Types for the RLC Stack
//!
//! Defines fundamental identifiers and enumerations shared by the RLC engines

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Logical Channel Identity (LCID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Lcid(pub u8);

impl Lcid {
    /// Highest LCID usable for a logical channel (SRB0-SRB2, DRB1-DRB8)
    pub const MAX: u8 = 10;

    /// Create a new LCID with validation
    pub fn new(value: u8) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Get the LCID value
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for Lcid {
    /// Radio bearer name carried by this channel
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0..=2 => write!(f, "SRB{}", self.0),
            n => write!(f, "DRB{}", n - 2),
        }
    }
}

/// RLC operating modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RlcMode {
    /// Transparent Mode
    Tm = 0,
    /// Unacknowledged Mode
    Um = 1,
    /// Acknowledged Mode
    Am = 2,
}

impl fmt::Display for RlcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RlcMode::Tm => "TM",
            RlcMode::Um => "UM",
            RlcMode::Am => "AM",
        };
        f.write_str(name)
    }
}

/// Error returned when a raw value does not name a valid enumeration member
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind} value: {value}")]
pub struct InvalidValue {
    /// Name of the enumeration
    pub kind: &'static str,
    /// Rejected raw value
    pub value: u32,
}

/// Sequence number field length of a data PDU header
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SnFieldLength {
    /// 5-bit SN (UM only)
    Bits5 = 5,
    /// 10-bit SN
    Bits10 = 10,
}

impl SnFieldLength {
    /// Number of distinct sequence numbers
    pub fn modulus(&self) -> u16 {
        match self {
            SnFieldLength::Bits5 => 32,
            SnFieldLength::Bits10 => 1024,
        }
    }

    /// Default receive window, half the SN space
    pub fn default_window(&self) -> u16 {
        self.modulus() / 2
    }

    /// Size in bytes of the fixed part of a data PDU header
    pub fn fixed_header_len(&self) -> usize {
        match self {
            SnFieldLength::Bits5 => 1,
            SnFieldLength::Bits10 => 2,
        }
    }

    /// Field width in bits
    pub fn bits(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for SnFieldLength {
    type Error = InvalidValue;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        SnFieldLength::from_u8(value).ok_or(InvalidValue {
            kind: "SN field length",
            value: value as u32,
        })
    }
}

impl From<SnFieldLength> for u8 {
    fn from(value: SnFieldLength) -> Self {
        value.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lcid_validation() {
        assert!(Lcid::new(0).is_some());
        assert!(Lcid::new(10).is_some());
        assert!(Lcid::new(11).is_none());
    }

    #[test]
    fn test_lcid_bearer_names() {
        assert_eq!(Lcid(1).to_string(), "SRB1");
        assert_eq!(Lcid(3).to_string(), "DRB1");
    }

    #[test]
    fn test_sn_field_length_conversion() {
        assert_eq!(SnFieldLength::try_from(5).unwrap(), SnFieldLength::Bits5);
        assert_eq!(SnFieldLength::try_from(10).unwrap().modulus(), 1024);
        assert!(SnFieldLength::try_from(12).is_err());
        assert_eq!(SnFieldLength::Bits5.default_window(), 16);
        assert_eq!(u8::from(SnFieldLength::Bits10), 10);
    }

    #[test]
    fn test_rlc_mode_from_primitive() {
        assert_eq!(RlcMode::from_u8(2), Some(RlcMode::Am));
        assert_eq!(RlcMode::from_u8(3), None);
        assert_eq!(RlcMode::Um.to_string(), "UM");
    }
}
