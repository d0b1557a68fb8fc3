//! # Issuer
//!
//! Identity state engine of a verifiable-credential issuer:
//! - **Claims tree**, **revocations tree** and **roots tree**: iden3 sparse
//!   Merkle trees over BN254 Poseidon, persisted in sled
//! - **Committed states**: a ledger of tree-root snapshots and their
//!   on-chain lifecycle (`processing` → `completed` | `failed`)
//! - **State publisher**: proves each transition with the state-transition
//!   circuit and submits it to the on-chain state contract
//! - **Proofs**: inclusion and non-revocation proofs against the last
//!   published state

pub mod claim;
pub mod config;
pub mod crypto;
pub mod field;
pub mod identity;
pub mod merkle;
pub mod publisher;
pub mod rpc;
pub mod storage;
pub mod zkp;

pub use field::Hash;

/// Largest record the storage layer will decode (16 MiB).
pub const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Serialize a value using bincode with legacy (v1-compatible) encoding.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Deserialize a value using bincode with legacy (v1-compatible) encoding.
///
/// Rejects inputs larger than `MAX_RECORD_BYTES`.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    if bytes.len() > MAX_RECORD_BYTES {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    Ok(val)
}
