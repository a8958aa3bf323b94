//! 64-bit 1-Wire device addresses.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::crc::{crc8, crc8_is_valid};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Address must be 16 hex digits, got {0:?}")]
    BadLength(String),
    #[error("Invalid hex digit in address {0:?}")]
    BadDigit(String),
}

/// Device address as it appears on the wire: family code first, CRC8 last.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Address([u8; 8]);

impl Address {
    pub const LEN: usize = 8;

    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Build an address from family + 6 serial bytes, appending the CRC8.
    pub fn with_crc(family: u8, serial: [u8; 6]) -> Self {
        let mut bytes = [0u8; 8];
        bytes[0] = family;
        bytes[1..7].copy_from_slice(&serial);
        bytes[7] = crc8(&bytes[..7]);
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; 8] {
        &mut self.0
    }

    pub fn family(&self) -> u8 {
        self.0[0]
    }

    /// Address bit `index` (0..64), least significant bit of byte 0 first.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (1 << (index % 8)) != 0
    }

    pub fn set_bit(&mut self, index: usize, value: bool) {
        let mask = 1 << (index % 8);
        if value {
            self.0[index / 8] |= mask;
        } else {
            self.0[index / 8] &= !mask;
        }
    }

    /// Non-zero family and a matching CRC8.
    pub fn is_valid(&self) -> bool {
        self.0[0] != 0 && crc8_is_valid(&self.0)
    }
}

impl From<[u8; 8]> for Address {
    fn from(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }
}

/// Printed most significant byte first (CRC on the left), the way
/// addresses are engraved on devices.
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().rev() {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 16 || !s.is_ascii() {
            return Err(AddressError::BadLength(s.to_string()));
        }
        let mut bytes = [0u8; 8];
        for (i, slot) in bytes.iter_mut().rev().enumerate() {
            *slot = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| AddressError::BadDigit(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_crc_is_valid() {
        let addr = Address::with_crc(0x10, [1, 2, 3, 4, 5, 6]);
        assert!(addr.is_valid());
        assert_eq!(addr.family(), 0x10);
    }

    #[test]
    fn test_zero_family_is_invalid() {
        assert!(!Address::default().is_valid());
        assert!(!Address::with_crc(0x00, [1, 2, 3, 4, 5, 6]).is_valid());
    }

    #[test]
    fn test_bit_access() {
        let mut addr = Address::new([0x01, 0, 0, 0, 0, 0, 0, 0x80]);
        assert!(addr.bit(0));
        assert!(!addr.bit(1));
        assert!(addr.bit(63));
        addr.set_bit(9, true);
        assert_eq!(addr.bytes()[1], 0x02);
        addr.set_bit(0, false);
        assert_eq!(addr.bytes()[0], 0x00);
    }

    #[test]
    fn test_display_and_parse() {
        let addr = Address::with_crc(0x28, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let text = addr.to_string();
        assert!(text.ends_with("AA28"));
        assert_eq!(text.parse::<Address>().unwrap(), addr);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("1234".parse::<Address>().is_err());
        assert!("ZZ00000000000001".parse::<Address>().is_err());
    }
}
