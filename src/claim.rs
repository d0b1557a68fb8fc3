//! Core claims: the 8-slot structure committed into the claims tree.
//!
//! Slot layout:
//! - `index[0]`: schema hash (bytes 0..16), flags (byte 16)
//! - `index[1]`: subject identifier, when the claim is about another identity
//! - `index[2]`, `index[3]`: index data
//! - `value[0]`: revocation nonce (bytes 0..8), expiration (bytes 8..16)
//! - `value[2]`, `value[3]`: value data
//!
//! The tree entry of a claim is `(poseidon(index), poseidon(value))`.

use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::crypto::PublicKey;
use crate::field::{hash_elems, parse_big_int, FieldError, Hash};
use crate::identity::id::Identifier;

/// Schema hash of the BabyJubJub authorization claim.
pub const AUTH_SCHEMA_HASH: &str = "ca938857241db9451ea329256b9c06e5";

/// Schema type recorded for the issuer's own auth claim.
pub const AUTH_SCHEMA_TYPE: &str = "AuthBJJCredential";

const FLAGS_BYTE: usize = 16;
const FLAG_SUBJECT_OTHER_IDEN_INDEX: u8 = 0b010;
const FLAG_EXPIRATION: u8 = 0b1000;

#[derive(Clone, Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("invalid schema hash: {0}")]
    InvalidSchemaHash(String),
    #[error("invalid slot data: {0}")]
    InvalidSlot(String),
    #[error(transparent)]
    Field(#[from] FieldError),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaHash(pub [u8; 16]);

impl SchemaHash {
    pub const fn auth() -> Self {
        SchemaHash([
            0xca, 0x93, 0x88, 0x57, 0x24, 0x1d, 0xb9, 0x45, 0x1e, 0xa3, 0x29, 0x25, 0x6b, 0x9c,
            0x06, 0xe5,
        ])
    }
}

impl FromStr for SchemaHash {
    type Err = ClaimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| ClaimError::InvalidSchemaHash(e.to_string()))?;
        let bytes: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ClaimError::InvalidSchemaHash(format!("expected 16 bytes: {s}")))?;
        Ok(SchemaHash(bytes))
    }
}

impl fmt::Display for SchemaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SchemaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchemaHash({})", self)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Claim {
    index: [Hash; 4],
    value: [Hash; 4],
}

impl Claim {
    pub fn new(schema: SchemaHash) -> Self {
        let mut index = [Hash::ZERO; 4];
        index[0].0[..16].copy_from_slice(&schema.0);
        Claim {
            index,
            value: [Hash::ZERO; 4],
        }
    }

    pub fn schema_hash(&self) -> SchemaHash {
        let mut out = [0u8; 16];
        out.copy_from_slice(&self.index[0].0[..16]);
        SchemaHash(out)
    }

    pub fn set_index_data(&mut self, a: &BigUint, b: &BigUint) -> Result<(), ClaimError> {
        self.index[2] = Hash::from_biguint(a)?;
        self.index[3] = Hash::from_biguint(b)?;
        Ok(())
    }

    pub fn set_value_data(&mut self, a: &BigUint, b: &BigUint) -> Result<(), ClaimError> {
        self.value[2] = Hash::from_biguint(a)?;
        self.value[3] = Hash::from_biguint(b)?;
        Ok(())
    }

    pub fn set_subject(&mut self, subject: &Identifier) {
        let mut slot = [0u8; 32];
        slot[..31].copy_from_slice(subject.as_bytes());
        self.index[1] = Hash(slot);
        self.index[0].0[FLAGS_BYTE] |= FLAG_SUBJECT_OTHER_IDEN_INDEX;
    }

    pub fn subject(&self) -> Option<Identifier> {
        if self.index[0].0[FLAGS_BYTE] & FLAG_SUBJECT_OTHER_IDEN_INDEX == 0 {
            return None;
        }
        Identifier::from_bytes(&self.index[1].0[..31]).ok()
    }

    pub fn set_rev_nonce(&mut self, nonce: u64) {
        self.value[0].0[..8].copy_from_slice(&nonce.to_le_bytes());
    }

    pub fn rev_nonce(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.value[0].0[..8]);
        u64::from_le_bytes(bytes)
    }

    /// Unix seconds after which the claim is no longer valid.
    pub fn set_expiration(&mut self, expiration: u64) {
        self.index[0].0[FLAGS_BYTE] |= FLAG_EXPIRATION;
        self.value[0].0[8..16].copy_from_slice(&expiration.to_le_bytes());
    }

    pub fn expiration(&self) -> Option<u64> {
        if self.index[0].0[FLAGS_BYTE] & FLAG_EXPIRATION == 0 {
            return None;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.value[0].0[8..16]);
        Some(u64::from_le_bytes(bytes))
    }

    pub fn h_index(&self) -> Result<Hash, ClaimError> {
        Ok(hash_elems(&self.index)?)
    }

    pub fn h_value(&self) -> Result<Hash, ClaimError> {
        Ok(hash_elems(&self.value)?)
    }

    pub fn hi_hv(&self) -> Result<(Hash, Hash), ClaimError> {
        Ok((self.h_index()?, self.h_value()?))
    }

    /// The 8 slots as integers, index first.
    pub fn to_ints(&self) -> Vec<BigUint> {
        self.index
            .iter()
            .chain(self.value.iter())
            .map(Hash::to_biguint)
            .collect()
    }

    pub fn from_ints(ints: &[BigUint]) -> Result<Self, ClaimError> {
        if ints.len() != 8 {
            return Err(ClaimError::InvalidSlot(format!(
                "expected 8 slots, got {}",
                ints.len()
            )));
        }
        let mut slots = [Hash::ZERO; 8];
        for (slot, int) in slots.iter_mut().zip(ints) {
            *slot = Hash::from_biguint(int)?;
        }
        Ok(Claim {
            index: [slots[0], slots[1], slots[2], slots[3]],
            value: [slots[4], slots[5], slots[6], slots[7]],
        })
    }
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim")
            .field("schema", &self.schema_hash())
            .field("rev_nonce", &self.rev_nonce())
            .finish_non_exhaustive()
    }
}

impl Serialize for Claim {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let slots: Vec<String> = self.to_ints().iter().map(BigUint::to_string).collect();
        slots.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Claim {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let slots = Vec::<String>::deserialize(deserializer)?;
        let ints = slots
            .iter()
            .map(|s| parse_big_int(s))
            .collect::<Result<Vec<_>, _>>()
            .map_err(serde::de::Error::custom)?;
        Claim::from_ints(&ints).map_err(serde::de::Error::custom)
    }
}

/// Authorization claim binding the issuer's BabyJubJub key.
pub fn new_auth_claim(public_key: &PublicKey, rev_nonce: u64) -> Result<Claim, ClaimError> {
    let mut claim = Claim::new(SchemaHash::auth());
    claim.set_index_data(&public_key.x, &public_key.y)?;
    claim.set_rev_nonce(rev_nonce);
    Ok(claim)
}

pub fn random_rev_nonce() -> u64 {
    rand::RngCore::next_u64(&mut rand::rngs::OsRng)
}

/// Raw claim request: the schema and the four data slots.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CoreClaimData {
    pub schema_hash: String,
    pub schema_type: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub index_a: Option<String>,
    #[serde(default)]
    pub index_b: Option<String>,
    #[serde(default)]
    pub value_a: Option<String>,
    #[serde(default)]
    pub value_b: Option<String>,
    #[serde(default)]
    pub expiration: Option<u64>,
}

impl CoreClaimData {
    pub fn to_claim(&self, rev_nonce: u64) -> Result<Claim, ClaimError> {
        let mut claim = Claim::new(self.schema_hash.parse()?);
        claim.set_index_data(&slot(&self.index_a)?, &slot(&self.index_b)?)?;
        claim.set_value_data(&slot(&self.value_a)?, &slot(&self.value_b)?)?;
        if let Some(subject) = &self.subject {
            let id: Identifier = subject
                .parse()
                .map_err(|e| ClaimError::InvalidSlot(format!("subject: {e}")))?;
            claim.set_subject(&id);
        }
        if let Some(expiration) = self.expiration {
            claim.set_expiration(expiration);
        }
        claim.set_rev_nonce(rev_nonce);
        Ok(claim)
    }
}

fn slot(value: &Option<String>) -> Result<BigUint, ClaimError> {
    match value {
        Some(s) => Ok(parse_big_int(s)?),
        None => Ok(BigUint::default()),
    }
}

/// Persisted claim row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub id: Uuid,
    pub schema_type: String,
    pub core_claim: Claim,
    pub subject: Option<String>,
    pub rev_nonce: u64,
    pub revoked: bool,
    pub created_at: u64,
}

impl ClaimRecord {
    pub fn new(schema_type: impl Into<String>, core_claim: Claim) -> Self {
        ClaimRecord {
            id: Uuid::new_v4(),
            schema_type: schema_type.into(),
            subject: core_claim.subject().map(|id| id.to_string()),
            rev_nonce: core_claim.rev_nonce(),
            core_claim,
            revoked: false,
            created_at: crate::now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::poseidon_hash;

    fn sample_claim() -> Claim {
        let data = CoreClaimData {
            schema_hash: "0123456789abcdef0123456789abcdef".into(),
            schema_type: "KYCAgeCredential".into(),
            index_a: Some("25".into()),
            value_a: Some("0x10".into()),
            ..Default::default()
        };
        data.to_claim(77).unwrap()
    }

    #[test]
    fn auth_schema_hash_parses() {
        assert_eq!(SchemaHash::auth().to_string(), AUTH_SCHEMA_HASH);
    }

    #[test]
    fn auth_claim_layout() {
        let pk = PublicKey {
            x: BigUint::from(11u8),
            y: BigUint::from(22u8),
        };
        let claim = new_auth_claim(&pk, 5).unwrap();
        let ints = claim.to_ints();
        assert_eq!(ints[0], BigUint::from_bytes_le(&SchemaHash::auth().0));
        assert_eq!(ints[1], BigUint::default());
        assert_eq!(ints[2], pk.x);
        assert_eq!(ints[3], pk.y);
        assert_eq!(ints[4], BigUint::from(5u8));
        assert_eq!(claim.rev_nonce(), 5);
        assert_eq!(claim.schema_hash(), SchemaHash::auth());
    }

    #[test]
    fn hi_hv_are_poseidon_of_slots() {
        let claim = sample_claim();
        let ints = claim.to_ints();
        let (hi, hv) = claim.hi_hv().unwrap();
        assert_eq!(hi.to_biguint(), poseidon_hash(&ints[..4]).unwrap());
        assert_eq!(hv.to_biguint(), poseidon_hash(&ints[4..]).unwrap());
    }

    #[test]
    fn rev_nonce_does_not_change_index() {
        let mut a = sample_claim();
        let hi = a.h_index().unwrap();
        a.set_rev_nonce(u64::MAX);
        assert_eq!(a.rev_nonce(), u64::MAX);
        assert_eq!(a.h_index().unwrap(), hi);
    }

    #[test]
    fn expiration_sets_flag() {
        let mut claim = sample_claim();
        assert_eq!(claim.expiration(), None);
        claim.set_expiration(1_700_000_000);
        assert_eq!(claim.expiration(), Some(1_700_000_000));
        assert_eq!(claim.rev_nonce(), 77);
    }

    #[test]
    fn subject_roundtrip() {
        let subject = Identifier::from_genesis_state(&Hash::from_u64(1));
        let mut claim = sample_claim();
        assert!(claim.subject().is_none());
        claim.set_subject(&subject);
        assert_eq!(claim.subject(), Some(subject));
    }

    #[test]
    fn json_is_eight_decimal_strings() {
        let claim = sample_claim();
        let json = serde_json::to_value(&claim).unwrap();
        let slots = json.as_array().unwrap();
        assert_eq!(slots.len(), 8);
        assert_eq!(slots[2], "25");
        assert_eq!(slots[6], "16");
        let back: Claim = serde_json::from_value(json).unwrap();
        assert_eq!(back, claim);
    }

    #[test]
    fn invalid_inputs_rejected() {
        let bad_schema = CoreClaimData {
            schema_hash: "abcd".into(),
            ..Default::default()
        };
        assert!(matches!(
            bad_schema.to_claim(1),
            Err(ClaimError::InvalidSchemaHash(_))
        ));

        let bad_slot = CoreClaimData {
            schema_hash: AUTH_SCHEMA_HASH.into(),
            index_a: Some("not-a-number".into()),
            ..Default::default()
        };
        assert!(bad_slot.to_claim(1).is_err());
        assert!(Claim::from_ints(&vec![BigUint::default(); 3]).is_err());
    }

    #[test]
    fn record_copies_nonce() {
        let record = ClaimRecord::new("KYCAgeCredential", sample_claim());
        assert_eq!(record.rev_nonce, 77);
        assert!(!record.revoked);
    }
}
