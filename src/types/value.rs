//! Register and parameter contents.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A fixed-length, big-endian byte string.
///
/// Equality is byte-exact: `[0x00, 0x01]` and `[0x01]` are different values.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Value(Vec<u8>);

impl Value {
    /// Creates a value from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Creates a zero-filled value of `length` bytes.
    #[must_use]
    pub fn zeroed(length: usize) -> Self {
        Self(vec![0; length])
    }

    /// Creates a value holding `value` in `length` big-endian bytes.
    ///
    /// Shorter lengths keep the least significant bytes; longer lengths are
    /// zero-padded at the front.
    #[must_use]
    pub fn from_integer(value: u64, length: usize) -> Self {
        let be = value.to_be_bytes();
        let bytes = (0..length)
            .map(|i| {
                let from_end = length - 1 - i;
                if from_end < be.len() {
                    be[be.len() - 1 - from_end]
                } else {
                    0
                }
            })
            .collect();
        Self(bytes)
    }

    /// Parses a hex string (two digits per byte).
    pub fn from_hex(s: &str) -> Result<Self> {
        hex::decode(s).map(Self).map_err(|e| Error::InvalidValue {
            reason: format!("{s:?} is not hex: {e}"),
        })
    }

    /// Creates a value holding one byte per character, padded with zeros
    /// or truncated to `length`.
    #[must_use]
    pub fn from_ascii(s: &str, length: usize) -> Self {
        let mut bytes: Vec<u8> = s.bytes().take(length).collect();
        bytes.resize(length, 0);
        Self(bytes)
    }

    /// Parses a number typed by a user into `length` bytes.
    ///
    /// Digits after a decimal point are appended to the integer part:
    /// `"32.56"` becomes `3256`. Device definitions depend on this to carry
    /// fixed-point readings, so it is not a floating point conversion.
    pub fn parse_number(s: &str, length: usize) -> Result<Self> {
        let invalid = || Error::InvalidValue {
            reason: format!("{s:?} is not a valid number"),
        };
        let s = s.trim();
        let number = match s.split_once('.') {
            None => s.parse::<u64>().map_err(|_| invalid())?,
            Some((integer, decimals)) => {
                let integer = integer.parse::<u64>().map_err(|_| invalid())?;
                let places = u32::try_from(decimals.len()).map_err(|_| invalid())?;
                let fraction = decimals.parse::<u64>().map_err(|_| invalid())?;
                10u64
                    .checked_pow(places)
                    .and_then(|scale| integer.checked_mul(scale))
                    .and_then(|shifted| shifted.checked_add(fraction))
                    .ok_or_else(invalid)?
            }
        };
        Ok(Self::from_integer(number, length))
    }

    /// Returns the number of bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the value holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the raw bytes as an owned list.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.clone()
    }

    /// Big-endian unsigned interpretation. Only the last eight bytes count.
    #[must_use]
    pub fn to_integer(&self) -> u64 {
        self.0
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
    }

    /// One character per byte, trailing zero bytes dropped.
    #[must_use]
    pub fn to_ascii(&self) -> String {
        let end = self.0.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        self.0[..end].iter().map(|&b| char::from(b)).collect()
    }

    /// Uppercase hex, two digits per byte.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.0)
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl TryFrom<String> for Value {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::from_hex(&s)
    }
}

impl From<Value> for String {
    fn from(value: Value) -> Self {
        value.to_hex()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self.to_hex())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
