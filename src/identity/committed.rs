//! Ledger of tree-root snapshots and their on-chain lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::field::{hash_elems, FieldError, Hash};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One committed snapshot of the three tree roots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedState {
    pub id: u64,
    pub status: Status,
    pub message: Option<String>,
    pub tx_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub block_timestamp: Option<u64>,
    pub block_number: Option<u64>,
    pub is_genesis: bool,
    pub claims_tree_root: Hash,
    pub revocations_tree_root: Hash,
    pub roots_tree_root: Hash,
}

impl CommittedState {
    /// A fresh row; the id is assigned on insert.
    pub fn new(status: Status, roots: TreeRoots, is_genesis: bool) -> Self {
        CommittedState {
            id: 0,
            status,
            message: None,
            tx_id: None,
            created_at: crate::now_millis(),
            block_timestamp: None,
            block_number: None,
            is_genesis,
            claims_tree_root: roots.claims,
            revocations_tree_root: roots.revocations,
            roots_tree_root: roots.roots,
        }
    }

    pub fn roots(&self) -> TreeRoots {
        TreeRoots {
            claims: self.claims_tree_root,
            revocations: self.revocations_tree_root,
            roots: self.roots_tree_root,
        }
    }

    pub fn state_hash(&self) -> Result<Hash, FieldError> {
        self.roots().state_hash()
    }

    /// Ordering key for "latest": creation time, then id.
    pub fn recency(&self) -> (u64, u64) {
        (self.created_at, self.id)
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = Status::Failed;
        self.message = Some(message.into());
    }

    pub fn mark_completed(&mut self, block_number: u64, block_timestamp: u64) {
        self.status = Status::Completed;
        self.block_number = Some(block_number);
        self.block_timestamp = Some(block_timestamp);
    }
}

/// The three tree roots at one instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeRoots {
    pub claims: Hash,
    pub revocations: Hash,
    pub roots: Hash,
}

impl TreeRoots {
    /// `poseidon(claims, revocations, roots)`
    pub fn state_hash(&self) -> Result<Hash, FieldError> {
        hash_elems(&[self.claims, self.revocations, self.roots])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::poseidon_hash;

    fn roots() -> TreeRoots {
        TreeRoots {
            claims: Hash::from_u64(1),
            revocations: Hash::from_u64(2),
            roots: Hash::from_u64(3),
        }
    }

    #[test]
    fn state_hash_is_poseidon_of_roots() {
        let expected = poseidon_hash(&[1u8.into(), 2u8.into(), 3u8.into()]).unwrap();
        assert_eq!(roots().state_hash().unwrap().to_biguint(), expected);
        let row = CommittedState::new(Status::Processing, roots(), false);
        assert_eq!(row.state_hash().unwrap(), roots().state_hash().unwrap());
    }

    #[test]
    fn lifecycle_helpers() {
        let mut row = CommittedState::new(Status::Processing, roots(), false);
        assert!(!row.status.is_terminal());
        row.mark_completed(10, 1_700_000_000);
        assert_eq!(row.status, Status::Completed);
        assert_eq!(row.block_number, Some(10));

        let mut row = CommittedState::new(Status::Processing, roots(), false);
        row.mark_failed("reverted");
        assert!(row.status.is_terminal());
        assert_eq!(row.message.as_deref(), Some("reverted"));
    }

    #[test]
    fn status_json() {
        assert_eq!(
            serde_json::to_string(&Status::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(Status::Failed.to_string(), "failed");
    }

    #[test]
    fn bincode_roundtrip() {
        let row = CommittedState::new(Status::Completed, roots(), true);
        let bytes = crate::serialize(&row).unwrap();
        let back: CommittedState = crate::deserialize(&bytes).unwrap();
        assert_eq!(back, row);
    }
}
