//! MAC addresses
//!
//! Accepted text forms: twelve hex digits, optionally with a `:` or `-`
//! after each pair, and whitespace around the pairs (`FFEB0864CE0A`,
//! `FF:EB:08:64:CE:0A`, `ff-eb-08-64-ce-0a`, `FF EB  08 64CE 0A`).

use std::fmt;
use std::iter::Peekable;
use std::str::{Chars, FromStr};
use thiserror::Error;

/// Number of bytes in a MAC address
pub const MAC_ADDRESS_LEN: usize = 6;

/// MAC address errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacAddressError {
    #[error("A MAC address is 6 bytes long, got {0}")]
    WrongLength(usize),

    #[error("Not a MAC address: {0:?}")]
    InvalidFormat(String),
}

/// A 6-byte hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; MAC_ADDRESS_LEN]);

impl MacAddress {
    pub const fn new(bytes: [u8; MAC_ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(&self) -> [u8; MAC_ADDRESS_LEN] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; MAC_ADDRESS_LEN]> for MacAddress {
    fn from(bytes: [u8; MAC_ADDRESS_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for MacAddress {
    type Error = MacAddressError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; MAC_ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|_| MacAddressError::WrongLength(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl PartialEq<[u8]> for MacAddress {
    fn eq(&self, other: &[u8]) -> bool {
        self.0[..] == *other
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

fn skip_whitespace(chars: &mut Peekable<Chars<'_>>) {
    while chars.next_if(|c| c.is_whitespace()).is_some() {}
}

fn hex_pair(chars: &mut Peekable<Chars<'_>>) -> Option<u8> {
    let high = chars.next()?.to_digit(16)?;
    let low = chars.next()?.to_digit(16)?;
    Some((high * 16 + low) as u8)
}

impl FromStr for MacAddress {
    type Err = MacAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MacAddressError::InvalidFormat(s.to_string());

        let mut chars = s.chars().peekable();
        let mut bytes = [0u8; MAC_ADDRESS_LEN];

        for (i, byte) in bytes.iter_mut().enumerate() {
            skip_whitespace(&mut chars);
            *byte = hex_pair(&mut chars).ok_or_else(invalid)?;
            skip_whitespace(&mut chars);
            if i + 1 < MAC_ADDRESS_LEN {
                chars.next_if(|c| *c == ':' || *c == '-');
            }
        }

        if chars.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}
