//! The issuer's three trees and the publish-cycle entry point.
//!
//! Every tree mutation and every state-commitment preparation runs under
//! one lock, so the aggregate state hash is always computed from roots
//! observed at a single instant. Proof generation and chain I/O happen in
//! the publisher after the lock is released.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::committed::{CommittedState, Status, TreeRoots};
use super::id::Identifier;
use crate::claim::{new_auth_claim, Claim, ClaimError, ClaimRecord, AUTH_SCHEMA_TYPE};
use crate::crypto::{CryptoError, PublicKey, Signature, StateSigner};
use crate::field::{poseidon_hash, FieldError, Hash};
use crate::merkle::{MerkleError, NodeStore, OverlayStore, Proof, SparseMerkleTree};
use crate::storage::{
    ClaimStore, CommittedStateStore, SledStorage, StorageError, TreeKind, TreeStorage,
};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("the latest completed state is absent")]
    OldStateNotFound,
    #[error("state wasn't changed since the latest completed state")]
    StateWasntChanged,
    #[error("a state transition is already in flight")]
    TransitionInFlight { tx_id: Option<String> },
    #[error("claim {0} not found")]
    ClaimNotFound(Uuid),
    #[error("claim is already revoked")]
    ClaimAlreadyRevoked,
    #[error("the auth claim cannot be revoked")]
    AuthClaimRevocation,
    #[error("the genesis state already exists")]
    GenesisExists,
    #[error("the claims tree holds a different auth claim")]
    GenesisMismatch,
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl StateError {
    /// Conditions that mean "nothing to publish" rather than a failure.
    pub fn is_noop(&self) -> bool {
        matches!(
            self,
            StateError::StateWasntChanged | StateError::TransitionInFlight { .. }
        )
    }
}

/// What the state engine needs to know about the identity it serves.
#[derive(Clone)]
pub struct IdentityInfo {
    pub identifier: Identifier,
    pub auth_claim: Claim,
    pub signer: Arc<dyn StateSigner>,
}

/// A freshly created identity.
#[derive(Clone, Debug)]
pub struct Genesis {
    pub identifier: Identifier,
    pub auth_claim: ClaimRecord,
    pub state: CommittedState,
}

/// Inputs of one state transition, valid for a single publish cycle.
#[derive(Clone, Debug)]
pub struct StateTransitionInfo {
    pub identifier: Identifier,
    pub old_state: Hash,
    pub new_state: Hash,
    pub old_roots: TreeRoots,
    pub new_roots: TreeRoots,
    pub is_old_state_genesis: bool,
    pub auth_claim: Claim,
    /// Inclusion of the auth claim under the old claims root.
    pub auth_claim_mtp: Proof,
    /// Non-revocation of the auth claim under the old revocations root.
    pub auth_claim_non_rev_mtp: Proof,
    /// Signature over `poseidon(old_state, new_state)`.
    pub signature: Signature,
}

pub struct Trees {
    pub claims: SparseMerkleTree<TreeStorage>,
    pub revocations: SparseMerkleTree<TreeStorage>,
    pub roots: SparseMerkleTree<TreeStorage>,
}

impl Trees {
    pub fn roots(&self) -> TreeRoots {
        TreeRoots {
            claims: self.claims.root(),
            revocations: self.revocations.root(),
            roots: self.roots.root(),
        }
    }
}

pub struct IdentityState {
    storage: Arc<SledStorage>,
    trees: Mutex<Trees>,
}

impl IdentityState {
    pub fn new(storage: Arc<SledStorage>, max_levels: usize) -> Result<Self, StateError> {
        let trees = Trees {
            claims: SparseMerkleTree::new(storage.tree_storage(TreeKind::Claims), max_levels)?,
            revocations: SparseMerkleTree::new(
                storage.tree_storage(TreeKind::Revocations),
                max_levels,
            )?,
            roots: SparseMerkleTree::new(storage.tree_storage(TreeKind::Roots), max_levels)?,
        };
        Ok(IdentityState {
            storage,
            trees: Mutex::new(trees),
        })
    }

    pub fn storage(&self) -> &Arc<SledStorage> {
        &self.storage
    }

    pub async fn lock(&self) -> MutexGuard<'_, Trees> {
        self.trees.lock().await
    }

    pub async fn current_roots(&self) -> TreeRoots {
        self.trees.lock().await.roots()
    }

    /// `poseidon(claimsRoot, revocationsRoot, rootsRoot)` of the live trees.
    pub async fn current_state_hash(&self) -> Result<Hash, StateError> {
        Ok(self.current_roots().await.state_hash()?)
    }

    /// Add a claim to the claims tree only. `EntryIndexAlreadyExists` if
    /// its index is taken.
    pub async fn add_claim_mt(&self, claim: &Claim) -> Result<(), StateError> {
        let mut trees = self.trees.lock().await;
        let (hi, hv) = claim.hi_hv()?;
        trees.claims.add(&hi, &hv)?;
        Ok(())
    }

    /// Add a claim to the claims tree and persist its record atomically.
    pub async fn add_claim(&self, record: &ClaimRecord) -> Result<(), StateError> {
        let mut trees = self.trees.lock().await;
        let (hi, hv) = record.core_claim.hi_hv()?;
        let root = self.storage.transaction(TreeKind::Claims, |tx| {
            let root = trees.claims.stage_add(tx.nodes(), &hi, &hv)?;
            tx.put_claim(record)?;
            Ok::<_, StateError>(root)
        })?;
        trees.claims.adopt_root(root);
        tracing::debug!(claim_id = %record.id, claims_root = %root, "Claim added to claims tree");
        Ok(())
    }

    /// Mark a claim revoked and add its nonce to the revocations tree.
    pub async fn revoke_claim(&self, id: &Uuid) -> Result<ClaimRecord, StateError> {
        let mut trees = self.trees.lock().await;
        if let Some(auth) = self.storage.auth_claim()? {
            if auth.id == *id {
                return Err(StateError::AuthClaimRevocation);
            }
        }
        let (root, record) = self.storage.transaction(TreeKind::Revocations, |tx| {
            let mut record = tx.get_claim(id)?.ok_or(StateError::ClaimNotFound(*id))?;
            if record.revoked {
                return Err(StateError::ClaimAlreadyRevoked);
            }
            let nonce = Hash::from_u64(record.core_claim.rev_nonce());
            let root = trees.revocations.stage_add(tx.nodes(), &nonce, &Hash::ZERO)?;
            record.revoked = true;
            tx.put_claim(&record)?;
            Ok((root, record))
        })?;
        trees.revocations.adopt_root(root);
        tracing::info!(claim_id = %id, rev_nonce = record.rev_nonce, "Claim revoked");
        Ok(record)
    }

    /// Build the auth claim, add it to the claims tree and derive the
    /// identifier from the resulting genesis state.
    ///
    /// Re-adding the same auth claim is a no-op, so an interrupted
    /// initialization can be run again.
    pub async fn setup_genesis(
        &self,
        public_key: &PublicKey,
        rev_nonce: u64,
    ) -> Result<(Identifier, Claim), StateError> {
        let mut trees = self.trees.lock().await;
        let auth_claim = new_auth_claim(public_key, rev_nonce)?;
        let root = add_auth_claim(&trees.claims, trees.claims.store(), &auth_claim)?;
        trees.claims.adopt_root(root);
        let genesis_state = trees.roots().state_hash()?;
        let identifier = Identifier::from_genesis_state(&genesis_state);
        tracing::debug!(%identifier, state = %genesis_state, "Genesis state computed");
        Ok((identifier, auth_claim))
    }

    /// Create the identity: add the auth claim to the claims tree and
    /// persist its record with the completed genesis row, in one
    /// transaction.
    pub async fn create_genesis(
        &self,
        public_key: &PublicKey,
        rev_nonce: u64,
    ) -> Result<Genesis, StateError> {
        let mut trees = self.trees.lock().await;
        if self.storage.genesis_state()?.is_some() {
            return Err(StateError::GenesisExists);
        }
        let record = ClaimRecord::new(AUTH_SCHEMA_TYPE, new_auth_claim(public_key, rev_nonce)?);
        let id = self.storage.generate_id()?;

        let row = self.storage.transaction(TreeKind::Claims, |tx| {
            let roots = TreeRoots {
                claims: add_auth_claim(&trees.claims, tx.nodes(), &record.core_claim)?,
                revocations: trees.revocations.root(),
                roots: trees.roots.root(),
            };
            let mut row = CommittedState::new(Status::Completed, roots, true);
            row.id = id;
            tx.put_genesis(&record, &row)?;
            Ok::<_, StateError>(row)
        })?;
        trees.claims.adopt_root(row.claims_tree_root);

        let genesis_state = row.state_hash()?;
        let identifier = Identifier::from_genesis_state(&genesis_state);
        tracing::debug!(%identifier, state = %genesis_state, "Genesis state persisted");
        Ok(Genesis {
            identifier,
            auth_claim: record,
            state: row,
        })
    }

    /// Proof of `claim` in the claims tree as of `claims_root`.
    pub async fn inclusion_proof(
        &self,
        claim: &Claim,
        claims_root: &Hash,
    ) -> Result<Proof, StateError> {
        let trees = self.trees.lock().await;
        let hi = claim.h_index()?;
        let (proof, _) = trees.claims.generate_proof(&hi, Some(claims_root))?;
        Ok(proof)
    }

    /// Proof of presence or absence of `rev_nonce` in the revocations tree
    /// as of `revocations_root`.
    pub async fn revocation_proof(
        &self,
        rev_nonce: u64,
        revocations_root: &Hash,
    ) -> Result<Proof, StateError> {
        let trees = self.trees.lock().await;
        let (proof, _) = trees
            .revocations
            .generate_proof(&Hash::from_u64(rev_nonce), Some(revocations_root))?;
        Ok(proof)
    }

    /// Transition inputs from the latest completed state to the live trees.
    ///
    /// Has no side effects: the roots-tree snapshot is evaluated in memory.
    pub async fn prepare_transition_info(
        &self,
        identity: &IdentityInfo,
    ) -> Result<StateTransitionInfo, StateError> {
        let trees = self.trees.lock().await;
        self.prepare(&trees, identity)
    }

    /// Start one publish cycle.
    ///
    /// Under the lock: refuse if a transition is in flight, prepare the
    /// transition, then snapshot the old claims root into the roots tree
    /// and insert the `processing` row in one transaction.
    pub async fn generate_state_commitment(
        &self,
        identity: &IdentityInfo,
    ) -> Result<(StateTransitionInfo, CommittedState), StateError> {
        let mut trees = self.trees.lock().await;

        let processing = self
            .storage
            .committed_states_by_status(Status::Processing)?;
        if let Some(row) = processing.first() {
            return Err(StateError::TransitionInFlight {
                tx_id: row.tx_id.clone(),
            });
        }

        let info = self.prepare(&trees, identity)?;
        let id = self.storage.generate_id()?;
        let (roots_root, row) = self.storage.transaction(TreeKind::Roots, |tx| {
            let root = snapshot_claims_root(&trees.roots, tx.nodes(), &info.old_roots.claims)?;
            let roots = TreeRoots {
                roots: root,
                ..info.new_roots
            };
            let mut row = CommittedState::new(Status::Processing, roots, false);
            row.id = id;
            tx.put_committed_state(&row)?;
            Ok::<_, StateError>((root, row))
        })?;
        debug_assert_eq!(roots_root, info.new_roots.roots);
        trees.roots.adopt_root(roots_root);

        tracing::info!(
            committed_state = row.id,
            old_state = %info.old_state,
            new_state = %info.new_state,
            "State commitment generated"
        );
        Ok((info, row))
    }

    fn prepare(
        &self,
        trees: &Trees,
        identity: &IdentityInfo,
    ) -> Result<StateTransitionInfo, StateError> {
        let latest = self
            .storage
            .latest_committed_state(Status::Completed)?
            .ok_or(StateError::OldStateNotFound)?;
        let old_roots = latest.roots();
        if old_roots.claims == trees.claims.root()
            && old_roots.revocations == trees.revocations.root()
        {
            return Err(StateError::StateWasntChanged);
        }

        let overlay = OverlayStore::new(trees.roots.store());
        let roots_root = snapshot_claims_root(&trees.roots, &overlay, &old_roots.claims)?;
        let new_roots = TreeRoots {
            claims: trees.claims.root(),
            revocations: trees.revocations.root(),
            roots: roots_root,
        };
        let old_state = old_roots.state_hash()?;
        let new_state = new_roots.state_hash()?;
        if old_state == new_state {
            return Err(StateError::StateWasntChanged);
        }

        let hi = identity.auth_claim.h_index()?;
        let (auth_claim_mtp, _) = trees.claims.generate_proof(&hi, Some(&old_roots.claims))?;
        let rev_nonce = Hash::from_u64(identity.auth_claim.rev_nonce());
        let (auth_claim_non_rev_mtp, _) = trees
            .revocations
            .generate_proof(&rev_nonce, Some(&old_roots.revocations))?;

        let message = poseidon_hash(&[old_state.to_biguint(), new_state.to_biguint()])?;
        let signature = identity.signer.sign(&message)?;

        Ok(StateTransitionInfo {
            identifier: identity.identifier,
            old_state,
            new_state,
            old_roots,
            new_roots,
            is_old_state_genesis: latest.is_genesis,
            auth_claim: identity.auth_claim.clone(),
            auth_claim_mtp,
            auth_claim_non_rev_mtp,
            signature,
        })
    }
}

/// Stage the auth claim into the claims tree through `store`.
///
/// A leaf already at its index is accepted only if it holds the same value.
fn add_auth_claim<T: NodeStore + ?Sized>(
    claims: &SparseMerkleTree<TreeStorage>,
    store: &T,
    auth_claim: &Claim,
) -> Result<Hash, StateError> {
    let (hi, hv) = auth_claim.hi_hv()?;
    match claims.stage_add(store, &hi, &hv) {
        Ok(root) => Ok(root),
        Err(MerkleError::EntryIndexAlreadyExists) => {
            let (stored, _) = claims.get(&hi)?;
            if stored != hv {
                return Err(StateError::GenesisMismatch);
            }
            Ok(claims.root())
        }
        Err(e) => Err(e.into()),
    }
}

/// Add the old claims root to the roots tree, tolerating a root that was
/// already recorded by an earlier cycle.
fn snapshot_claims_root<T: NodeStore + ?Sized>(
    roots: &SparseMerkleTree<TreeStorage>,
    store: &T,
    claims_root: &Hash,
) -> Result<Hash, MerkleError> {
    match roots.stage_add(store, claims_root, &Hash::ZERO) {
        Ok(root) => Ok(root),
        Err(MerkleError::EntryIndexAlreadyExists) => Ok(roots.root()),
        Err(e) => Err(e),
    }
}
