//! The issuer identity: genesis, claims, revocations and proofs.
//!
//! An identity is either fully initialized (auth claim record and genesis
//! row both persisted) or absent. [`Identity::init`] creates or reloads it.
//! Claims reach their holders through [`offer`].

pub mod committed;
pub mod id;
pub mod offer;
pub mod state;

use std::sync::Arc;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::claim::{random_rev_nonce, Claim, ClaimError, ClaimRecord, CoreClaimData};
use crate::crypto::{CryptoError, StateSigner};
use crate::field::in_field;
use crate::merkle::Proof;
use crate::storage::{ClaimStore, CommittedStateStore, StorageError};

pub use committed::{CommittedState, Status, TreeRoots};
pub use id::Identifier;
pub use offer::{ClaimOffer, FetchRequest, IssuanceMessage, OfferMessage};
pub use state::{Genesis, IdentityInfo, IdentityState, StateError, StateTransitionInfo};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("only one of genesis state or auth claim exists")]
    PartialIdentity,
    #[error("claim was not published yet")]
    ClaimNotPublishedYet,
    #[error("claim {0} not found")]
    ClaimNotFound(Uuid),
    #[error("claim is already revoked")]
    ClaimAlreadyRevoked,
    #[error("message to sign is not a field element")]
    MessageNotInField,
    #[error("claim offer {0} not found")]
    ClaimOfferNotFound(Uuid),
    #[error("claim {0} was not offered in this thread")]
    ClaimNotOffered(Uuid),
    #[error("requester is not the claim owner")]
    NotClaimOwner,
    #[error("the offered claim was already delivered")]
    RepeatedCallback,
    #[error("message recipient is not the issuer")]
    RecipientIsNotIssuer,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error(transparent)]
    State(StateError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<StateError> for IdentityError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::ClaimAlreadyRevoked => IdentityError::ClaimAlreadyRevoked,
            StateError::ClaimNotFound(id) => IdentityError::ClaimNotFound(id),
            other => IdentityError::State(other),
        }
    }
}

/// Issuer state a proof was generated against.
///
/// Roots and the state hash are hex of their little-endian bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerState {
    pub id: Identifier,
    pub state: String,
    pub root_of_roots: String,
    pub claims_tree_root: String,
    pub revocation_tree_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

impl IssuerState {
    fn from_committed(id: Identifier, row: &CommittedState) -> Result<Self, IdentityError> {
        let state = row.state_hash().map_err(StateError::from)?;
        Ok(IssuerState {
            id,
            state: state.hex(),
            root_of_roots: row.roots_tree_root.hex(),
            claims_tree_root: row.claims_tree_root.hex(),
            revocation_tree_root: row.revocations_tree_root.hex(),
            tx_id: row.tx_id.clone(),
            block_timestamp: row.block_timestamp,
            block_number: row.block_number,
        })
    }
}

/// A claim's inclusion proof in the last published state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimMtp {
    pub issuer_data: IssuerState,
    pub mtp: Proof,
}

/// Presence or absence of a revocation nonce in the last published state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RevocationStatus {
    pub issuer: IssuerState,
    pub mtp: Proof,
}

pub struct Identity {
    state: Arc<IdentityState>,
    info: IdentityInfo,
    auth_claim_id: Uuid,
}

impl Identity {
    /// Load the persisted identity, or generate one if none exists.
    pub async fn init(
        state: Arc<IdentityState>,
        signer: Arc<dyn StateSigner>,
    ) -> Result<Self, IdentityError> {
        let storage = state.storage().clone();
        let genesis = storage.genesis_state()?;
        let auth_claim = storage.auth_claim()?;

        match (genesis, auth_claim) {
            (Some(genesis), Some(auth_claim)) => {
                tracing::info!("Identity found");
                Self::parse_identity(state, signer, &genesis, auth_claim)
            }
            (None, None) => {
                tracing::info!("Identity not found, generating a new one");
                Self::generate_new_identity(state, signer, random_rev_nonce()).await
            }
            _ => Err(IdentityError::PartialIdentity),
        }
    }

    async fn generate_new_identity(
        state: Arc<IdentityState>,
        signer: Arc<dyn StateSigner>,
        rev_nonce: u64,
    ) -> Result<Self, IdentityError> {
        let genesis = state.create_genesis(signer.public_key(), rev_nonce).await?;
        tracing::info!(identifier = %genesis.identifier, "New identity generated");
        Ok(Identity {
            state,
            info: IdentityInfo {
                identifier: genesis.identifier,
                auth_claim: genesis.auth_claim.core_claim,
                signer,
            },
            auth_claim_id: genesis.auth_claim.id,
        })
    }

    fn parse_identity(
        state: Arc<IdentityState>,
        signer: Arc<dyn StateSigner>,
        genesis: &CommittedState,
        auth_claim: ClaimRecord,
    ) -> Result<Self, IdentityError> {
        let genesis_state = genesis.state_hash().map_err(StateError::from)?;
        let identifier = Identifier::from_genesis_state(&genesis_state);
        tracing::info!(%identifier, "Identity loaded");
        Ok(Identity {
            state,
            info: IdentityInfo {
                identifier,
                auth_claim: auth_claim.core_claim,
                signer,
            },
            auth_claim_id: auth_claim.id,
        })
    }

    pub fn identifier(&self) -> Identifier {
        self.info.identifier
    }

    pub fn auth_claim(&self) -> &Claim {
        &self.info.auth_claim
    }

    pub fn auth_claim_id(&self) -> Uuid {
        self.auth_claim_id
    }

    pub fn info(&self) -> &IdentityInfo {
        &self.info
    }

    pub fn state(&self) -> &Arc<IdentityState> {
        &self.state
    }

    /// Compressed BabyJubJub signature over an in-field message.
    pub fn sign(&self, message: &BigUint) -> Result<[u8; 64], IdentityError> {
        if !in_field(message) {
            return Err(IdentityError::MessageNotInField);
        }
        Ok(self.info.signer.sign(message)?.compressed)
    }

    /// Issue a claim with a fresh revocation nonce.
    pub async fn add_claim(&self, data: &CoreClaimData) -> Result<ClaimRecord, IdentityError> {
        let claim = data.to_claim(random_rev_nonce())?;
        let record = ClaimRecord::new(data.schema_type.clone(), claim);
        self.state.add_claim(&record).await?;
        tracing::info!(claim_id = %record.id, schema_type = %record.schema_type, "Claim issued");
        Ok(record)
    }

    pub async fn revoke_claim(&self, id: &Uuid) -> Result<ClaimRecord, IdentityError> {
        Ok(self.state.revoke_claim(id).await?)
    }

    /// Inclusion proof of a claim against the last published state.
    pub async fn generate_mtp(&self, claim_id: &Uuid) -> Result<ClaimMtp, IdentityError> {
        let record = self
            .state
            .storage()
            .get_claim(claim_id)?
            .ok_or(IdentityError::ClaimNotFound(*claim_id))?;
        let latest = self.latest_completed()?;
        // Genesis carries no transaction: nothing is published yet.
        if latest.tx_id.is_none() {
            return Err(IdentityError::ClaimNotPublishedYet);
        }
        let mtp = self
            .state
            .inclusion_proof(&record.core_claim, &latest.claims_tree_root)
            .await?;
        if !mtp.existence {
            return Err(IdentityError::ClaimNotPublishedYet);
        }
        Ok(ClaimMtp {
            issuer_data: IssuerState::from_committed(self.identifier(), &latest)?,
            mtp,
        })
    }

    /// Revocation proof for `rev_nonce` against the last completed state.
    pub async fn revocation_status(&self, rev_nonce: u64) -> Result<RevocationStatus, IdentityError> {
        let latest = self.latest_completed()?;
        let mtp = self
            .state
            .revocation_proof(rev_nonce, &latest.revocations_tree_root)
            .await?;
        Ok(RevocationStatus {
            issuer: IssuerState::from_committed(self.identifier(), &latest)?,
            mtp,
        })
    }

    /// Transaction hash of the transition in flight, if any.
    pub fn publishing_tx(&self) -> Result<Option<String>, IdentityError> {
        let rows = self
            .state
            .storage()
            .committed_states_by_status(Status::Processing)?;
        Ok(rows.into_iter().find_map(|row| row.tx_id))
    }

    fn latest_completed(&self) -> Result<CommittedState, IdentityError> {
        self.state
            .storage()
            .latest_committed_state(Status::Completed)?
            .ok_or(IdentityError::State(StateError::OldStateNotFound))
    }
}
