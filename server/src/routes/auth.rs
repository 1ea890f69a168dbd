//! `POST /api/auth/challenge` and `POST /api/auth/verify` (spec.md §6
//! supplement).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, Result};
use crate::state::AppState;

#[derive(Serialize)]
struct ChallengeResponse {
    nonce: String,
}

async fn challenge(State(state): State<Arc<AppState>>) -> Json<ChallengeResponse> {
    Json(ChallengeResponse {
        nonce: state.auth.issue_challenge(),
    })
}

#[derive(Deserialize)]
struct VerifyRequest {
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Serialize)]
struct VerifyResponse {
    token: String,
    expires_at: u64,
}

async fn verify(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>> {
    let token = match (body.nonce, body.signature, body.password) {
        (Some(nonce), Some(signature), None) => state.auth.verify_signature(&nonce, &signature)?,
        (None, None, Some(password)) => state.auth.verify_password(&password)?,
        _ => {
            return Err(ApiError::BadRequest(
                "expected either {nonce, signature} or {password}".to_string(),
            ))
        }
    };
    let expires_at = termcast_core::session::unix_now_secs() + state.config.token_ttl.as_secs();
    Ok(Json(VerifyResponse { token, expires_at }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/auth/challenge", post(challenge))
        .route("/api/auth/verify", post(verify))
}
