//! JSON HTTP RPC API for the issuer node.
//!
//! A thin layer over [`Identity`]: claims, their proofs, credential offers,
//! revocation status and the publish trigger. The server has no
//! authentication and binds to localhost by default.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use uuid::Uuid;

use crate::claim::{ClaimRecord, CoreClaimData};
use crate::identity::{
    ClaimMtp, FetchRequest, Identifier, Identity, IdentityError, IssuanceMessage, OfferMessage,
    RevocationStatus, StateError,
};
use crate::merkle::MerkleError;
use crate::publisher::PublishTrigger;

/// Shared RPC state.
#[derive(Clone)]
pub struct RpcState {
    pub identity: Arc<Identity>,
    pub trigger: Arc<PublishTrigger>,
    /// Base URL holders reach this server on, for offer callbacks.
    pub public_url: String,
}

impl RpcState {
    pub fn new(
        identity: Arc<Identity>,
        trigger: Arc<PublishTrigger>,
        public_url: impl Into<String>,
    ) -> Self {
        RpcState {
            identity,
            trigger,
            public_url: public_url.into(),
        }
    }

    fn callback_url(&self) -> String {
        format!("{}/offers/callback", self.public_url.trim_end_matches('/'))
    }
}

/// Build the RPC router.
pub fn router(rpc_state: RpcState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/identity", get(get_identity))
        .route("/claims", post(add_claim))
        .route("/claims/{id}/mtp", get(get_claim_mtp))
        .route("/claims/{id}/revoke", post(revoke_claim))
        .route("/offers/callback", post(offer_callback))
        .route("/offers/{user_id}/{claim_id}", get(claim_offer))
        .route("/revocations/{nonce}", get(get_revocation_status))
        .route("/publish", post(publish))
        .route("/publish/status", get(publish_status))
        .with_state(rpc_state)
}

/// Start the RPC server.
pub async fn serve(
    addr: SocketAddr,
    rpc_state: RpcState,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(rpc_state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("RPC server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

type ApiError = (StatusCode, String);

fn api_error(err: IdentityError) -> ApiError {
    let status = match &err {
        IdentityError::ClaimNotFound(_) | IdentityError::ClaimOfferNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        IdentityError::NotClaimOwner
        | IdentityError::ClaimNotOffered(_)
        | IdentityError::RepeatedCallback => StatusCode::FORBIDDEN,
        IdentityError::ClaimNotPublishedYet
        | IdentityError::ClaimAlreadyRevoked
        | IdentityError::State(StateError::Merkle(MerkleError::EntryIndexAlreadyExists)) => {
            StatusCode::CONFLICT
        }
        IdentityError::Claim(_)
        | IdentityError::MessageNotInField
        | IdentityError::RecipientIsNotIssuer
        | IdentityError::InvalidMessage(_)
        | IdentityError::State(StateError::AuthClaimRevocation) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "RPC request failed");
    }
    (status, err.to_string())
}

fn parse_claim_id(id: &str) -> Result<Uuid, ApiError> {
    id.parse()
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid claim id: {}", e)))
}

// ── GET /health ──

async fn health() -> &'static str {
    "ok"
}

// ── GET /identity ──

#[derive(Serialize)]
struct IdentityResponse {
    identifier: String,
    auth_claim_id: Uuid,
    auth_claim: crate::claim::Claim,
    current_state: String,
}

async fn get_identity(State(state): State<RpcState>) -> Result<Json<IdentityResponse>, ApiError> {
    let identity = &state.identity;
    let current_state = identity
        .state()
        .current_state_hash()
        .await
        .map_err(|e| api_error(e.into()))?;
    Ok(Json(IdentityResponse {
        identifier: identity.identifier().to_string(),
        auth_claim_id: identity.auth_claim_id(),
        auth_claim: identity.auth_claim().clone(),
        current_state: current_state.hex(),
    }))
}

// ── POST /claims ──

async fn add_claim(
    State(state): State<RpcState>,
    Json(req): Json<CoreClaimData>,
) -> Result<(StatusCode, Json<ClaimRecord>), ApiError> {
    let record = state.identity.add_claim(&req).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(record)))
}

// ── GET /claims/{id}/mtp ──

async fn get_claim_mtp(
    State(state): State<RpcState>,
    Path(id): Path<String>,
) -> Result<Json<ClaimMtp>, ApiError> {
    let id = parse_claim_id(&id)?;
    state
        .identity
        .generate_mtp(&id)
        .await
        .map(Json)
        .map_err(api_error)
}

// ── POST /claims/{id}/revoke ──

async fn revoke_claim(
    State(state): State<RpcState>,
    Path(id): Path<String>,
) -> Result<Json<ClaimRecord>, ApiError> {
    let id = parse_claim_id(&id)?;
    state
        .identity
        .revoke_claim(&id)
        .await
        .map(Json)
        .map_err(api_error)
}

// ── GET /offers/{user_id}/{claim_id} ──

async fn claim_offer(
    State(state): State<RpcState>,
    Path((user_id, claim_id)): Path<(String, String)>,
) -> Result<Json<OfferMessage>, ApiError> {
    let user: Identifier = user_id
        .parse()
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid user id: {}", e)))?;
    let claim_id = parse_claim_id(&claim_id)?;
    state
        .identity
        .create_claim_offer(&user, &claim_id, &state.callback_url())
        .map(Json)
        .map_err(api_error)
}

// ── POST /offers/callback ──

async fn offer_callback(
    State(state): State<RpcState>,
    Json(req): Json<FetchRequest>,
) -> Result<Json<IssuanceMessage>, ApiError> {
    state
        .identity
        .offer_callback(&req)
        .await
        .map(Json)
        .map_err(api_error)
}

// ── GET /revocations/{nonce} ──

async fn get_revocation_status(
    State(state): State<RpcState>,
    Path(nonce): Path<u64>,
) -> Result<Json<RevocationStatus>, ApiError> {
    state
        .identity
        .revocation_status(nonce)
        .await
        .map(Json)
        .map_err(api_error)
}

// ── POST /publish ──

async fn publish(State(state): State<RpcState>) -> StatusCode {
    state.trigger.fire();
    StatusCode::ACCEPTED
}

// ── GET /publish/status ──

#[derive(Serialize)]
struct PublishStatusResponse {
    tx_id: Option<String>,
}

async fn publish_status(State(state): State<RpcState>) -> Result<Response, ApiError> {
    match state.identity.publishing_tx().map_err(api_error)? {
        Some(tx_id) => Ok(Json(PublishStatusResponse { tx_id: Some(tx_id) }).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode as HttpStatus};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::crypto::BabyJubJubKey;
    use crate::identity::{CommittedState, IdentityState, Status};
    use crate::storage::{CommittedStateStore, SledStorage};

    async fn test_rpc_state() -> RpcState {
        let storage = Arc::new(SledStorage::open_temporary().unwrap());
        let state = Arc::new(IdentityState::new(storage, 40).unwrap());
        let signer = Arc::new(BabyJubJubKey::generate().unwrap());
        let identity = Identity::init(state, signer).await.unwrap();
        RpcState::new(
            Arc::new(identity),
            Arc::new(PublishTrigger::new()),
            "http://127.0.0.1:8000/",
        )
    }

    async fn send(
        app: &Router,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> (HttpStatus, Vec<u8>) {
        let mut request = Request::builder().method(method).uri(path);
        if body.is_some() {
            request = request.header("content-type", "application/json");
        }
        let body = match body {
            Some(json) => axum::body::Body::from(json.to_string()),
            None => axum::body::Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, bytes.to_vec())
    }

    fn json(bytes: &[u8]) -> serde_json::Value {
        serde_json::from_slice(bytes).unwrap_or_else(|e| {
            panic!(
                "JSON parse error: {} (body={:?})",
                e,
                String::from_utf8_lossy(bytes)
            )
        })
    }

    const CLAIM: &str = r#"{"schema_hash":"0123456789abcdef0123456789abcdef","schema_type":"KYC","index_a":"42"}"#;

    #[tokio::test]
    async fn health_ok() {
        let app = router(test_rpc_state().await);
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn identity_reports_identifier() {
        let state = test_rpc_state().await;
        let expected = state.identity.identifier().to_string();
        let app = router(state);
        let (status, body) = send(&app, "GET", "/identity", None).await;
        assert_eq!(status, HttpStatus::OK);
        let body = json(&body);
        assert_eq!(body["identifier"], expected);
        assert_eq!(body["auth_claim"].as_array().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn claim_lifecycle() {
        let app = router(test_rpc_state().await);
        let (status, body) = send(&app, "POST", "/claims", Some(CLAIM)).await;
        assert_eq!(status, HttpStatus::CREATED);
        let id = json(&body)["id"].as_str().unwrap().to_string();

        // Not in any published state yet.
        let (status, _) = send(&app, "GET", &format!("/claims/{}/mtp", id), None).await;
        assert_eq!(status, HttpStatus::CONFLICT);

        let (status, body) = send(&app, "POST", &format!("/claims/{}/revoke", id), None).await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json(&body)["revoked"], true);

        let (status, _) = send(&app, "POST", &format!("/claims/{}/revoke", id), None).await;
        assert_eq!(status, HttpStatus::CONFLICT);
    }

    #[tokio::test]
    async fn duplicate_claim_conflicts() {
        let app = router(test_rpc_state().await);
        let (status, _) = send(&app, "POST", "/claims", Some(CLAIM)).await;
        assert_eq!(status, HttpStatus::CREATED);
        // Same index slots, fresh revocation nonce: same leaf index.
        let (status, _) = send(&app, "POST", "/claims", Some(CLAIM)).await;
        assert_eq!(status, HttpStatus::CONFLICT);
    }

    #[tokio::test]
    async fn bad_claim_rejected() {
        let app = router(test_rpc_state().await);
        let bad = r#"{"schema_hash":"zz","schema_type":"KYC"}"#;
        let (status, _) = send(&app, "POST", "/claims", Some(bad)).await;
        assert_eq!(status, HttpStatus::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_claim_not_found() {
        let app = router(test_rpc_state().await);
        let path = format!("/claims/{}/revoke", Uuid::new_v4());
        let (status, _) = send(&app, "POST", &path, None).await;
        assert_eq!(status, HttpStatus::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/claims/not-a-uuid/mtp", None).await;
        assert_eq!(status, HttpStatus::BAD_REQUEST);
    }

    #[tokio::test]
    async fn auth_claim_cannot_be_revoked() {
        let state = test_rpc_state().await;
        let path = format!("/claims/{}/revoke", state.identity.auth_claim_id());
        let app = router(state);
        let (status, _) = send(&app, "POST", &path, None).await;
        assert_eq!(status, HttpStatus::BAD_REQUEST);
    }

    #[tokio::test]
    async fn publish_status_reports_processing_tx() {
        let state = test_rpc_state().await;
        let storage = state.identity.state().storage().clone();
        let app = router(state);

        let (status, _) = send(&app, "GET", "/publish/status", None).await;
        assert_eq!(status, HttpStatus::NO_CONTENT);

        let genesis = storage.genesis_state().unwrap().unwrap();
        let mut row = CommittedState::new(Status::Processing, genesis.roots(), false);
        row.tx_id = Some("0xabc".into());
        storage.insert_committed_state(&mut row).unwrap();

        let (status, body) = send(&app, "GET", "/publish/status", None).await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json(&body)["tx_id"], "0xabc");
    }

    #[tokio::test]
    async fn publish_fires_trigger() {
        let state = test_rpc_state().await;
        let trigger = state.trigger.clone();
        let app = router(state);
        let (status, _) = send(&app, "POST", "/publish", None).await;
        assert_eq!(status, HttpStatus::ACCEPTED);
        tokio::time::timeout(std::time::Duration::from_secs(1), trigger.fired())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn offer_then_callback() {
        let state = test_rpc_state().await;
        let identity = state.identity.clone();
        let app = router(state);

        let holder = Identifier::from_genesis_state(&crate::field::Hash::from_u64(77));
        let claim = format!(
            r#"{{"schema_hash":"0123456789abcdef0123456789abcdef","schema_type":"KYC","subject":"{}","index_a":"42"}}"#,
            holder
        );
        let (status, body) = send(&app, "POST", "/claims", Some(&claim)).await;
        assert_eq!(status, HttpStatus::CREATED);
        let claim_id = json(&body)["id"].as_str().unwrap().to_string();

        let (status, body) =
            send(&app, "GET", &format!("/offers/{}/{}", holder, claim_id), None).await;
        assert_eq!(status, HttpStatus::OK);
        let offer = json(&body);
        assert_eq!(offer["body"]["url"], "http://127.0.0.1:8000/offers/callback");
        assert_eq!(offer["to"], holder.to_string());

        let (status, _) = send(&app, "GET", &format!("/offers/nope/{}", claim_id), None).await;
        assert_eq!(status, HttpStatus::BAD_REQUEST);

        let fetch = serde_json::json!({
            "id": Uuid::new_v4(),
            "type": crate::identity::offer::FETCH_REQUEST_MESSAGE_TYPE,
            "thid": offer["thid"],
            "body": { "id": claim_id },
            "from": holder.to_string(),
            "to": identity.identifier().to_string(),
        })
        .to_string();

        // Not published yet.
        let (status, _) = send(&app, "POST", "/offers/callback", Some(&fetch)).await;
        assert_eq!(status, HttpStatus::CONFLICT);

        let (_, mut row) = identity
            .state()
            .generate_state_commitment(identity.info())
            .await
            .unwrap();
        row.tx_id = Some("0xabc".into());
        row.mark_completed(3, 1_700_000_000);
        identity.state().storage().update_committed_state(&row).unwrap();

        let (status, body) = send(&app, "POST", "/offers/callback", Some(&fetch)).await;
        assert_eq!(status, HttpStatus::OK);
        let issued = json(&body);
        assert_eq!(issued["body"]["credential"]["id"], claim_id);
        assert_eq!(issued["thid"], offer["thid"]);

        // The refresh endpoint serves the same proof.
        let (status, body) =
            send(&app, "GET", &format!("/claims/{}/mtp", claim_id), None).await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json(&body), issued["body"]["credential"]["proof"]);

        let (status, _) = send(&app, "POST", "/offers/callback", Some(&fetch)).await;
        assert_eq!(status, HttpStatus::FORBIDDEN);
    }

    #[tokio::test]
    async fn revocation_status_against_genesis() {
        let app = router(test_rpc_state().await);
        let (status, body) = send(&app, "GET", "/revocations/12", None).await;
        // The genesis state is completed, so a proof is available.
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json(&body)["mtp"]["existence"], false);
    }
}
