//! Witness-calculator inputs for the state-transition circuit.

use serde::Serialize;

use super::ZkpError;
use crate::field::Hash;
use crate::identity::StateTransitionInfo;
use crate::merkle::Proof;

/// Inputs keyed exactly as the circuit's signals are named.
///
/// Every value is a base-10 string; Merkle siblings are zero-padded to the
/// circuit's level count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransitionInputs {
    pub auth_claim: Vec<String>,
    pub auth_claim_mtp: Vec<String>,
    pub auth_claim_non_rev_mtp: Vec<String>,
    pub auth_claim_non_rev_mtp_aux_hi: String,
    pub auth_claim_non_rev_mtp_aux_hv: String,
    pub auth_claim_non_rev_mtp_no_aux: String,
    pub claims_tree_root: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    pub new_user_state: String,
    pub old_user_state: String,
    pub is_old_state_genesis: String,
    pub rev_tree_root: String,
    pub roots_tree_root: String,
    #[serde(rename = "signatureR8x")]
    pub signature_r8x: String,
    #[serde(rename = "signatureR8y")]
    pub signature_r8y: String,
    pub signature_s: String,
}

impl StateTransitionInputs {
    pub fn new(info: &StateTransitionInfo, levels: usize) -> Result<Self, ZkpError> {
        let (aux_hi, aux_hv, no_aux) = match &info.auth_claim_non_rev_mtp.node_aux {
            Some(aux) => (aux.key.to_string(), aux.value.to_string(), "0"),
            None => ("0".to_string(), "0".to_string(), "1"),
        };
        Ok(StateTransitionInputs {
            auth_claim: info
                .auth_claim
                .to_ints()
                .iter()
                .map(|v| v.to_string())
                .collect(),
            auth_claim_mtp: siblings(&info.auth_claim_mtp, levels)?,
            auth_claim_non_rev_mtp: siblings(&info.auth_claim_non_rev_mtp, levels)?,
            auth_claim_non_rev_mtp_aux_hi: aux_hi,
            auth_claim_non_rev_mtp_aux_hv: aux_hv,
            auth_claim_non_rev_mtp_no_aux: no_aux.to_string(),
            claims_tree_root: info.old_roots.claims.to_string(),
            user_id: info.identifier.to_big_int().to_string(),
            new_user_state: info.new_state.to_string(),
            old_user_state: info.old_state.to_string(),
            is_old_state_genesis: if info.is_old_state_genesis { "1" } else { "0" }.to_string(),
            rev_tree_root: info.old_roots.revocations.to_string(),
            roots_tree_root: info.old_roots.roots.to_string(),
            signature_r8x: info.signature.r8x.to_string(),
            signature_r8y: info.signature.r8y.to_string(),
            signature_s: info.signature.s.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ZkpError> {
        serde_json::to_vec(self).map_err(|e| ZkpError::Inputs(e.to_string()))
    }
}

fn siblings(proof: &Proof, levels: usize) -> Result<Vec<String>, ZkpError> {
    Ok(proof
        .padded_siblings(levels)?
        .iter()
        .map(Hash::to_string)
        .collect())
}
