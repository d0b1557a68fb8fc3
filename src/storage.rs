//! Persistent storage for the issuer identity.
//!
//! Provides the `CommittedStateStore`, `ClaimStore` and `OfferStore` traits
//! and a sled-backed implementation holding the three tree node stores, the
//! committed-state ledger, the claim records and the credential offers in
//! one database.

pub mod tree;

use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::Transactional;
use uuid::Uuid;

use crate::claim::ClaimRecord;
use crate::identity::committed::{CommittedState, Status};
use crate::identity::offer::ClaimOffer;

pub use tree::{TreeStorage, TxTreeStorage};

use tree::{guard, ConflictSlot};

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("transaction conflict: {0}")]
    Conflict(String),
}

const AUTH_CLAIM_KEY: &[u8] = b"auth_claim";

/// The three identity trees.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeKind {
    Claims,
    Revocations,
    Roots,
}

/// Ledger of committed tree states.
pub trait CommittedStateStore {
    /// Assigns `state.id` and persists the row.
    fn insert_committed_state(&self, state: &mut CommittedState) -> Result<u64, StorageError>;
    fn update_committed_state(&self, state: &CommittedState) -> Result<(), StorageError>;
    fn get_committed_state(&self, id: u64) -> Result<Option<CommittedState>, StorageError>;
    fn committed_states_by_status(
        &self,
        status: Status,
    ) -> Result<Vec<CommittedState>, StorageError>;
    /// Most recent row with `status`, by creation time then id.
    fn latest_committed_state(
        &self,
        status: Status,
    ) -> Result<Option<CommittedState>, StorageError>;
    fn genesis_state(&self) -> Result<Option<CommittedState>, StorageError>;
}

pub trait ClaimStore {
    fn put_claim(&self, record: &ClaimRecord) -> Result<(), StorageError>;
    fn get_claim(&self, id: &Uuid) -> Result<Option<ClaimRecord>, StorageError>;
    /// The issuer's own auth claim, once genesis has been persisted.
    fn auth_claim(&self) -> Result<Option<ClaimRecord>, StorageError>;
}

/// Credential offers, keyed by their thread id.
pub trait OfferStore {
    fn put_claim_offer(&self, offer: &ClaimOffer) -> Result<(), StorageError>;
    fn get_claim_offer(&self, thread_id: &Uuid) -> Result<Option<ClaimOffer>, StorageError>;
    /// Flip `offer` to received if the stored row still equals it.
    ///
    /// Returns `false` when another caller got there first.
    fn mark_offer_received(&self, offer: &ClaimOffer) -> Result<bool, StorageError>;
}

/// Sled-backed storage implementation.
pub struct SledStorage {
    db: sled::Db,
    claims_nodes: sled::Tree,
    revocations_nodes: sled::Tree,
    roots_nodes: sled::Tree,
    committed_states: sled::Tree,
    claims: sled::Tree,
    claim_offers: sled::Tree,
}

impl SledStorage {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    /// Open a temporary in-memory sled database (for testing).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let open = |name: &str| {
            db.open_tree(name)
                .map_err(|e| StorageError::Io(e.to_string()))
        };
        Ok(SledStorage {
            claims_nodes: open("claims_tree")?,
            revocations_nodes: open("revocations_tree")?,
            roots_nodes: open("roots_tree")?,
            committed_states: open("committed_states")?,
            claims: open("claims")?,
            claim_offers: open("claim_offers")?,
            db,
        })
    }

    fn nodes_tree(&self, kind: TreeKind) -> &sled::Tree {
        match kind {
            TreeKind::Claims => &self.claims_nodes,
            TreeKind::Revocations => &self.revocations_nodes,
            TreeKind::Roots => &self.roots_nodes,
        }
    }

    /// Node store for one of the identity trees.
    pub fn tree_storage(&self, kind: TreeKind) -> TreeStorage {
        TreeStorage::new(self.nodes_tree(kind).clone())
    }

    pub fn generate_id(&self) -> Result<u64, StorageError> {
        self.db
            .generate_id()
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    /// Run `f` in one sled transaction spanning the nodes of `kind`, the
    /// claim records and the committed-state ledger.
    ///
    /// `f` may run more than once if sled detects a conflict. Returning an
    /// error from `f` rolls back every write it made.
    pub fn transaction<R, E, F>(&self, kind: TreeKind, f: F) -> Result<R, E>
    where
        F: Fn(&TxScope<'_>) -> Result<R, E>,
        E: From<StorageError>,
    {
        let trees = (self.nodes_tree(kind), &self.claims, &self.committed_states);
        let result = trees.transaction(|(nodes, claims, committed)| {
            let slot = ConflictSlot::new(None);
            let out = {
                let scope = TxScope {
                    nodes: TxTreeStorage::new(nodes, &slot),
                    claims,
                    committed,
                    conflict: &slot,
                };
                f(&scope)
            };
            if let Some(err) = slot.into_inner() {
                return Err(err.into());
            }
            out.map_err(ConflictableTransactionError::Abort)
        });
        match result {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(StorageError::Io(e.to_string()).into()),
        }
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn all_committed_states(&self) -> Result<Vec<CommittedState>, StorageError> {
        let mut rows = Vec::new();
        for entry in self.committed_states.iter() {
            let (_, bytes) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            rows.push(decode(&bytes)?);
        }
        Ok(rows)
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    crate::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    crate::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Writes available inside [`SledStorage::transaction`].
pub struct TxScope<'a> {
    nodes: TxTreeStorage<'a>,
    claims: &'a TransactionalTree,
    committed: &'a TransactionalTree,
    conflict: &'a ConflictSlot,
}

impl<'a> TxScope<'a> {
    /// Node store of the tree this transaction spans.
    pub fn nodes(&self) -> &TxTreeStorage<'a> {
        &self.nodes
    }

    pub fn put_claim(&self, record: &ClaimRecord) -> Result<(), StorageError> {
        let value = encode(record)?;
        guard(
            self.conflict,
            self.claims.insert(&record.id.as_bytes()[..], value),
        )?;
        Ok(())
    }

    pub fn get_claim(&self, id: &Uuid) -> Result<Option<ClaimRecord>, StorageError> {
        match guard(self.conflict, self.claims.get(&id.as_bytes()[..]))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write the auth claim record, mark it as the auth claim and write
    /// the genesis row.
    pub fn put_genesis(
        &self,
        auth_claim: &ClaimRecord,
        genesis: &CommittedState,
    ) -> Result<(), StorageError> {
        self.put_claim(auth_claim)?;
        guard(
            self.conflict,
            self.claims
                .insert(AUTH_CLAIM_KEY, &auth_claim.id.as_bytes()[..]),
        )?;
        self.put_committed_state(genesis)
    }

    /// Write a row whose id is already assigned.
    pub fn put_committed_state(&self, state: &CommittedState) -> Result<(), StorageError> {
        let value = encode(state)?;
        guard(
            self.conflict,
            self.committed
                .insert(&state.id.to_be_bytes()[..], value),
        )?;
        Ok(())
    }
}

impl CommittedStateStore for SledStorage {
    fn insert_committed_state(&self, state: &mut CommittedState) -> Result<u64, StorageError> {
        state.id = self.generate_id()?;
        self.update_committed_state(state)?;
        Ok(state.id)
    }

    fn update_committed_state(&self, state: &CommittedState) -> Result<(), StorageError> {
        let value = encode(state)?;
        // Big-endian ids keep sled's key order equal to insertion order.
        self.committed_states
            .insert(state.id.to_be_bytes(), value)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn get_committed_state(&self, id: u64) -> Result<Option<CommittedState>, StorageError> {
        match self
            .committed_states
            .get(id.to_be_bytes())
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn committed_states_by_status(
        &self,
        status: Status,
    ) -> Result<Vec<CommittedState>, StorageError> {
        let mut rows = self.all_committed_states()?;
        rows.retain(|row| row.status == status);
        Ok(rows)
    }

    fn latest_committed_state(
        &self,
        status: Status,
    ) -> Result<Option<CommittedState>, StorageError> {
        Ok(self
            .committed_states_by_status(status)?
            .into_iter()
            .max_by_key(CommittedState::recency))
    }

    fn genesis_state(&self) -> Result<Option<CommittedState>, StorageError> {
        Ok(self
            .all_committed_states()?
            .into_iter()
            .find(|row| row.is_genesis))
    }
}

impl ClaimStore for SledStorage {
    fn put_claim(&self, record: &ClaimRecord) -> Result<(), StorageError> {
        let value = encode(record)?;
        self.claims
            .insert(record.id.as_bytes(), value)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn get_claim(&self, id: &Uuid) -> Result<Option<ClaimRecord>, StorageError> {
        match self
            .claims
            .get(id.as_bytes())
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn auth_claim(&self) -> Result<Option<ClaimRecord>, StorageError> {
        let pointer = self
            .claims
            .get(AUTH_CLAIM_KEY)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let Some(pointer) = pointer else {
            return Ok(None);
        };
        let id = Uuid::from_slice(&pointer)
            .map_err(|e| StorageError::Serialization(format!("auth claim pointer: {e}")))?;
        self.get_claim(&id)
    }
}

impl OfferStore for SledStorage {
    fn put_claim_offer(&self, offer: &ClaimOffer) -> Result<(), StorageError> {
        let value = encode(offer)?;
        self.claim_offers
            .insert(offer.id.as_bytes(), value)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn get_claim_offer(&self, thread_id: &Uuid) -> Result<Option<ClaimOffer>, StorageError> {
        match self
            .claim_offers
            .get(thread_id.as_bytes())
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn mark_offer_received(&self, offer: &ClaimOffer) -> Result<bool, StorageError> {
        let received = ClaimOffer {
            is_received: true,
            ..offer.clone()
        };
        let swapped = self
            .claim_offers
            .compare_and_swap(
                offer.id.as_bytes(),
                Some(encode(offer)?),
                Some(encode(&received)?),
            )
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(swapped.is_ok())
    }
}
