//! BN254 scalar-field elements and circom-compatible Poseidon hashing.
//!
//! Every tree key, tree value, root and state hash is a field element
//! carried as 32 little-endian bytes. The decimal form is what circuits,
//! contracts and JSON documents exchange.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use ark_bn254::Fr;
use light_poseidon::{Poseidon, PoseidonHasher};
use num_bigint::BigUint;
use num_traits::Num;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// BN254 scalar field order.
pub const FIELD_MODULUS: &str =
    "21888242871839275222246405745257275088548364400416034343698204186575808495617";

/// Largest input arity `poseidon_hash` accepts.
pub const MAX_POSEIDON_INPUTS: usize = 12;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("value is not inside the BN254 scalar field: {0}")]
    NotInField(String),
    #[error("invalid field element encoding: {0}")]
    InvalidEncoding(String),
    #[error("poseidon: {0}")]
    Poseidon(String),
}

pub fn modulus() -> &'static BigUint {
    static Q: OnceLock<BigUint> = OnceLock::new();
    Q.get_or_init(|| BigUint::from_str_radix(FIELD_MODULUS, 10).unwrap_or_default())
}

pub fn in_field(value: &BigUint) -> bool {
    value < modulus()
}

/// A field element stored as 32 little-endian bytes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn from_biguint(value: &BigUint) -> Result<Self, FieldError> {
        if !in_field(value) {
            return Err(FieldError::NotInField(value.to_string()));
        }
        let le = value.to_bytes_le();
        let mut bytes = [0u8; 32];
        bytes[..le.len()].copy_from_slice(&le);
        Ok(Hash(bytes))
    }

    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&value.to_le_bytes());
        Hash(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, FieldError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            FieldError::InvalidEncoding(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        let hash = Hash(bytes);
        if !in_field(&hash.to_biguint()) {
            return Err(FieldError::NotInField(hash.to_string()));
        }
        Ok(hash)
    }

    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_le(&self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Hex of the little-endian bytes, the form tree storage uses.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, FieldError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| FieldError::InvalidEncoding(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Bit `n` of the little-endian key, used as the tree path.
    pub fn path_bit(&self, n: usize) -> bool {
        self.0[n / 8] & (1 << (n % 8)) != 0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_biguint())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

impl FromStr for Hash {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = parse_big_int(s)?;
        Hash::from_biguint(&value)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse a base-10 or `0x`-prefixed hex integer.
pub fn parse_big_int(s: &str) -> Result<BigUint, FieldError> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex_digits) => BigUint::from_str_radix(hex_digits, 16),
        None => BigUint::from_str_radix(s, 10),
    };
    parsed.map_err(|e| FieldError::InvalidEncoding(format!("{s:?}: {e}")))
}

/// Circom-compatible Poseidon over BN254.
pub fn poseidon_hash(inputs: &[BigUint]) -> Result<BigUint, FieldError> {
    if inputs.is_empty() || inputs.len() > MAX_POSEIDON_INPUTS {
        return Err(FieldError::Poseidon(format!(
            "unsupported input count {}",
            inputs.len()
        )));
    }
    let mut elems = Vec::with_capacity(inputs.len());
    for input in inputs {
        if !in_field(input) {
            return Err(FieldError::NotInField(input.to_string()));
        }
        elems.push(Fr::from(input.clone()));
    }
    let mut hasher = Poseidon::<Fr>::new_circom(elems.len())
        .map_err(|e| FieldError::Poseidon(e.to_string()))?;
    let out = hasher
        .hash(&elems)
        .map_err(|e| FieldError::Poseidon(e.to_string()))?;
    Ok(BigUint::from(out))
}

/// Poseidon over field elements already in tree form.
pub fn hash_elems(elems: &[Hash]) -> Result<Hash, FieldError> {
    let ints: Vec<BigUint> = elems.iter().map(Hash::to_biguint).collect();
    Hash::from_biguint(&poseidon_hash(&ints)?)
}
