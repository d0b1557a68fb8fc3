//! The on-chain state contract as seen by the publisher.
//!
//! Provider errors are classified once, here, into [`ChainError`]. No other
//! code inspects error strings or revert payloads.

use std::fmt;
use std::str::FromStr;

use ethers::abi::{decode, ParamType, Token};
use num_bigint::BigUint;

use crate::field::Hash;
use crate::zkp::ContractProof;

/// `bytes4(keccak256("Error(string)"))`
pub const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Revert reason of `getStateInfoByState` for an unknown state.
pub const STATE_DOES_NOT_EXIST: &str = "State does not exist";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("nonce too low")]
    NonceTooLow,
    #[error("state does not exist on chain")]
    StateNotFound,
    #[error("execution reverted: {0}")]
    Reverted(String),
    #[error("transaction dropped: {0}")]
    Dropped(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("invalid contract argument: {0}")]
    InvalidArgument(String),
}

/// Decode an `Error(string)` revert payload.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    let payload = data.strip_prefix(&ERROR_STRING_SELECTOR[..])?;
    match decode(&[ParamType::String], payload).ok()?.pop()? {
        Token::String(reason) => Some(reason),
        _ => None,
    }
}

/// Classify a failed call from its message and optional revert payload.
pub fn classify_error(message: &str, revert_data: Option<&[u8]>) -> ChainError {
    if let Some(reason) = revert_data.and_then(decode_revert_reason) {
        return if reason == STATE_DOES_NOT_EXIST {
            ChainError::StateNotFound
        } else {
            ChainError::Reverted(reason)
        };
    }
    if message.to_ascii_lowercase().contains("nonce too low") {
        return ChainError::NonceTooLow;
    }
    ChainError::Rpc(message.to_string())
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHash(pub [u8; 32]);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({self})")
    }
}

impl FromStr for TxHash {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| ChainError::InvalidArgument(format!("tx hash {s:?}: {e}")))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ChainError::InvalidArgument(format!("tx hash {s:?}: expected 32 bytes")))?;
        Ok(TxHash(bytes))
    }
}

/// Outcome of a mined transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MinedTx {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub number: u64,
    pub timestamp: u64,
}

/// Arguments of `transitState`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitStateArgs {
    pub id: BigUint,
    pub old_state: Hash,
    pub new_state: Hash,
    pub is_old_state_genesis: bool,
    pub proof: ContractProof,
}

#[async_trait::async_trait]
pub trait StateContract: Send + Sync {
    /// Next nonce of the publishing account, pending transactions included.
    async fn pending_nonce(&self) -> Result<u64, ChainError>;

    async fn transit_state(&self, args: &TransitStateArgs, nonce: u64)
        -> Result<TxHash, ChainError>;

    /// Wait until `tx` is mined with one confirmation.
    async fn wait_mined(&self, tx: &TxHash) -> Result<MinedTx, ChainError>;

    /// Replay a failed transaction and decode why it reverted.
    async fn revert_reason(&self, tx: &TxHash, block: u64) -> Result<Option<String>, ChainError>;

    async fn block_info(&self, number: u64) -> Result<BlockInfo, ChainError>;

    /// Whether the contract knows `state`.
    async fn state_exists(&self, state: &Hash) -> Result<bool, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::encode;

    fn revert_payload(reason: &str) -> Vec<u8> {
        let mut data = ERROR_STRING_SELECTOR.to_vec();
        data.extend(encode(&[Token::String(reason.into())]));
        data
    }

    #[test]
    fn decodes_error_string() {
        assert_eq!(
            decode_revert_reason(&revert_payload("Old state does not match")).as_deref(),
            Some("Old state does not match")
        );
    }

    #[test]
    fn rejects_other_payloads() {
        assert_eq!(decode_revert_reason(&[]), None);
        assert_eq!(decode_revert_reason(&[0x08, 0xc3, 0x79]), None);
        let mut wrong_selector = revert_payload("x");
        wrong_selector[0] = 0x4e;
        assert_eq!(decode_revert_reason(&wrong_selector), None);
        assert_eq!(decode_revert_reason(&ERROR_STRING_SELECTOR), None);
    }

    #[test]
    fn classification() {
        assert_eq!(
            classify_error("execution reverted", Some(&revert_payload(STATE_DOES_NOT_EXIST))),
            ChainError::StateNotFound
        );
        assert_eq!(
            classify_error("execution reverted", Some(&revert_payload("Proof is invalid"))),
            ChainError::Reverted("Proof is invalid".into())
        );
        assert_eq!(
            classify_error("(code: -32000, message: nonce too low)", None),
            ChainError::NonceTooLow
        );
        assert!(matches!(
            classify_error("connection refused", None),
            ChainError::Rpc(_)
        ));
    }

    #[test]
    fn tx_hash_hex() {
        let hash = TxHash([0xab; 32]);
        let text = hash.to_string();
        assert!(text.starts_with("0xabab"));
        assert_eq!(text.parse::<TxHash>().unwrap(), hash);
        assert!("0x1234".parse::<TxHash>().is_err());
    }
}
