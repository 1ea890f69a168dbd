//! Bearer-token extraction shared by control and streaming routes. Accepts
//! either `Authorization: Bearer <token>` or a `?token=` query parameter —
//! the latter exists because browser `EventSource`/`WebSocket` clients
//! cannot set arbitrary headers (spec.md §4.5).

use axum::http::HeaderMap;

use crate::error::ApiError;
use crate::state::AppState;

pub fn extract_token<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = value.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token);
            }
        }
    }
    query_token
}

pub fn authenticate(state: &AppState, headers: &HeaderMap, query_token: Option<&str>) -> Result<(), ApiError> {
    match extract_token(headers, query_token) {
        Some(token) => state.auth.verify_token(token).map_err(ApiError::from),
        None => state.auth.verify_token("").map_err(|_| ApiError::Unauthorized),
    }
}
