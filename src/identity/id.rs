//! Identifier derivation from the genesis state.
//!
//! Layout: `type (2) ‖ genesis (27) ‖ checksum (2)`. The genesis part is the
//! last 27 little-endian bytes of the genesis state hash; the checksum is the
//! 16-bit sum of the preceding 29 bytes, stored little-endian.

use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::field::Hash;

pub const ID_LEN: usize = 31;
pub const GENESIS_LEN: usize = 27;
pub const ID_TYPE_DEFAULT: [u8; 2] = [0x00, 0x00];

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("invalid base58 identifier: {0}")]
    Encoding(String),
    #[error("identifier must be {ID_LEN} bytes, got {0}")]
    Length(usize),
    #[error("identifier checksum mismatch")]
    Checksum,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier([u8; ID_LEN]);

impl Identifier {
    pub fn new(typ: [u8; 2], genesis: [u8; GENESIS_LEN]) -> Self {
        let checksum = checksum(&typ, &genesis);
        let mut bytes = [0u8; ID_LEN];
        bytes[..2].copy_from_slice(&typ);
        bytes[2..2 + GENESIS_LEN].copy_from_slice(&genesis);
        bytes[ID_LEN - 2..].copy_from_slice(&checksum);
        Identifier(bytes)
    }

    /// Derive the identifier of an identity from its genesis state.
    pub fn from_genesis_state(state: &Hash) -> Self {
        let mut genesis = [0u8; GENESIS_LEN];
        genesis.copy_from_slice(&state.0[32 - GENESIS_LEN..]);
        Identifier::new(ID_TYPE_DEFAULT, genesis)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        let bytes: [u8; ID_LEN] = bytes.try_into().map_err(|_| IdError::Length(bytes.len()))?;
        let id = Identifier(bytes);
        if checksum(&id.typ(), &id.genesis()) != id.checksum() {
            return Err(IdError::Checksum);
        }
        Ok(id)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn typ(&self) -> [u8; 2] {
        [self.0[0], self.0[1]]
    }

    pub fn genesis(&self) -> [u8; GENESIS_LEN] {
        let mut out = [0u8; GENESIS_LEN];
        out.copy_from_slice(&self.0[2..2 + GENESIS_LEN]);
        out
    }

    pub fn checksum(&self) -> [u8; 2] {
        [self.0[ID_LEN - 2], self.0[ID_LEN - 1]]
    }

    /// Integer form used as the circuit `userID` and contract `id`.
    pub fn to_big_int(&self) -> BigUint {
        BigUint::from_bytes_le(&self.0)
    }
}

fn checksum(typ: &[u8; 2], genesis: &[u8; GENESIS_LEN]) -> [u8; 2] {
    let sum = typ
        .iter()
        .chain(genesis.iter())
        .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)));
    sum.to_le_bytes()
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self)
    }
}

impl FromStr for Identifier {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| IdError::Encoding(e.to_string()))?;
        Identifier::from_bytes(&bytes)
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_and_checksum() {
        let mut genesis = [0u8; GENESIS_LEN];
        genesis[0] = 0xff;
        genesis[1] = 0x03;
        let id = Identifier::new(ID_TYPE_DEFAULT, genesis);
        assert_eq!(id.typ(), ID_TYPE_DEFAULT);
        assert_eq!(id.genesis(), genesis);
        // 0x0102, low byte first
        assert_eq!(id.checksum(), [0x02, 0x01]);
    }

    #[test]
    fn genesis_is_tail_of_state_bytes() {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        bytes[31] = 0;
        let id = Identifier::from_genesis_state(&Hash(bytes));
        assert_eq!(id.genesis()[0], 5);
        assert_eq!(id.genesis()[25], 30);
    }

    #[test]
    fn string_roundtrip() {
        let id = Identifier::from_genesis_state(&Hash::from_u64(0xdead_beef));
        let s = id.to_string();
        assert!(s.starts_with("11"));
        assert_eq!(s.parse::<Identifier>().unwrap(), id);
    }

    #[test]
    fn tampered_identifier_fails_checksum() {
        let id = Identifier::from_genesis_state(&Hash::from_u64(99));
        let mut bytes = *id.as_bytes();
        bytes[10] ^= 1;
        assert_eq!(Identifier::from_bytes(&bytes), Err(IdError::Checksum));
        assert_eq!(Identifier::from_bytes(&bytes[..5]), Err(IdError::Length(5)));
    }

    #[test]
    fn big_int_is_little_endian() {
        let mut genesis = [0u8; GENESIS_LEN];
        genesis[0] = 1;
        let id = Identifier::new(ID_TYPE_DEFAULT, genesis);
        // byte 2 set, checksum 0x0001 stored as [0x01, 0x00] at bytes 29..31
        let expected = BigUint::from(1u8) << 16 | BigUint::from(1u8) << (29 * 8);
        assert_eq!(id.to_big_int(), expected);
    }
}
