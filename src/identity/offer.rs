//! Credential offers and the fetch callback that delivers a credential.
//!
//! The issuer offers a claim to its subject with an iden3comm offer
//! message. The holder answers on the callback URL with a fetch request in
//! the same thread and receives the claim with its inclusion proof in the
//! last published state. Each offer is delivered once.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ClaimMtp, Identifier, Identity, IdentityError};
use crate::claim::Claim;
use crate::storage::{ClaimStore, OfferStore};

pub const MEDIA_TYPE_PLAIN: &str = "application/iden3comm-plain-json";
pub const OFFER_MESSAGE_TYPE: &str = "https://iden3-communication.io/credentials/1.0/offer";
pub const FETCH_REQUEST_MESSAGE_TYPE: &str =
    "https://iden3-communication.io/credentials/1.0/fetch-request";
pub const ISSUANCE_RESPONSE_MESSAGE_TYPE: &str =
    "https://iden3-communication.io/credentials/1.0/issuance-response";
pub const SMT_PROOF_TYPE: &str = "SparseMerkleTreeProof";

/// Persisted offer, keyed by the message thread id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimOffer {
    pub id: Uuid,
    pub from: Identifier,
    pub to: Identifier,
    pub claim_id: Uuid,
    pub created_at: u64,
    pub is_received: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OfferMessage {
    pub id: Uuid,
    pub typ: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub thid: Uuid,
    pub body: OfferBody,
    pub from: Identifier,
    pub to: Identifier,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OfferBody {
    pub url: String,
    pub credentials: Vec<OfferedCredential>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OfferedCredential {
    pub id: Uuid,
    pub description: String,
}

/// Holder's request for an offered credential.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchRequest {
    pub id: Uuid,
    #[serde(default)]
    pub typ: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    pub thid: Uuid,
    pub body: FetchBody,
    pub from: Identifier,
    pub to: Identifier,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchBody {
    /// Id of the offered claim.
    pub id: Uuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssuanceMessage {
    pub id: Uuid,
    pub typ: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub thid: Uuid,
    pub body: IssuanceBody,
    pub from: Identifier,
    pub to: Identifier,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssuanceBody {
    pub credential: Credential,
}

/// An issued claim with what a verifier needs to check it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub schema_type: String,
    pub subject: Identifier,
    pub rev_nonce: u64,
    pub core_claim: Claim,
    pub proof: ClaimMtp,
    pub credential_status: CredentialStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialStatus {
    #[serde(rename = "type")]
    pub status_type: String,
    pub rev_nonce: u64,
}

impl Identity {
    /// Offer claim `claim_id` to its subject `user`.
    pub fn create_claim_offer(
        &self,
        user: &Identifier,
        claim_id: &Uuid,
        callback_url: &str,
    ) -> Result<OfferMessage, IdentityError> {
        let storage = self.state().storage();
        let record = storage
            .get_claim(claim_id)?
            .ok_or(IdentityError::ClaimNotFound(*claim_id))?;
        if record.core_claim.subject() != Some(*user) {
            return Err(IdentityError::NotClaimOwner);
        }

        let message = OfferMessage {
            id: Uuid::new_v4(),
            typ: MEDIA_TYPE_PLAIN.into(),
            message_type: OFFER_MESSAGE_TYPE.into(),
            thid: Uuid::new_v4(),
            body: OfferBody {
                url: callback_url.into(),
                credentials: vec![OfferedCredential {
                    id: record.id,
                    description: record.schema_type.clone(),
                }],
            },
            from: self.identifier(),
            to: *user,
        };
        storage.put_claim_offer(&ClaimOffer {
            id: message.thid,
            from: message.from,
            to: message.to,
            claim_id: record.id,
            created_at: crate::now_millis(),
            is_received: false,
        })?;
        tracing::info!(claim_id = %record.id, thread = %message.thid, to = %user, "Claim offered");
        Ok(message)
    }

    /// Deliver the claim offered in `request.thid` to the holder it was
    /// offered to.
    ///
    /// The offer stays open while the claim is unpublished.
    pub async fn offer_callback(
        &self,
        request: &FetchRequest,
    ) -> Result<IssuanceMessage, IdentityError> {
        if request.message_type != FETCH_REQUEST_MESSAGE_TYPE {
            return Err(IdentityError::InvalidMessage(format!(
                "unexpected message type {}",
                request.message_type
            )));
        }
        if request.to != self.identifier() {
            return Err(IdentityError::RecipientIsNotIssuer);
        }

        let storage = self.state().storage();
        let offer = storage
            .get_claim_offer(&request.thid)?
            .ok_or(IdentityError::ClaimOfferNotFound(request.thid))?;
        if offer.to != request.from {
            return Err(IdentityError::NotClaimOwner);
        }
        if offer.claim_id != request.body.id {
            return Err(IdentityError::ClaimNotOffered(request.body.id));
        }
        if offer.is_received {
            return Err(IdentityError::RepeatedCallback);
        }

        let record = storage
            .get_claim(&offer.claim_id)?
            .ok_or(IdentityError::ClaimNotFound(offer.claim_id))?;
        let proof = self.generate_mtp(&offer.claim_id).await?;
        if !storage.mark_offer_received(&offer)? {
            return Err(IdentityError::RepeatedCallback);
        }

        tracing::info!(claim_id = %record.id, thread = %offer.id, "Credential issued");
        Ok(IssuanceMessage {
            id: Uuid::new_v4(),
            typ: MEDIA_TYPE_PLAIN.into(),
            message_type: ISSUANCE_RESPONSE_MESSAGE_TYPE.into(),
            thid: offer.id,
            body: IssuanceBody {
                credential: Credential {
                    id: record.id,
                    schema_type: record.schema_type,
                    subject: offer.to,
                    rev_nonce: record.rev_nonce,
                    core_claim: record.core_claim,
                    proof,
                    credential_status: CredentialStatus {
                        status_type: SMT_PROOF_TYPE.into(),
                        rev_nonce: record.rev_nonce,
                    },
                },
            },
            from: self.identifier(),
            to: offer.to,
        })
    }
}
