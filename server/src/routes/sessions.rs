//! Session CRUD + input/resize (spec.md §6).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use termcast_core::session::{SessionConfig, SessionId, SessionSummary};

use crate::authn::authenticate;
use crate::error::{ApiError, Result};
use crate::state::AppState;

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn parse_session_id(raw: &str) -> Result<SessionId> {
    uuid::Uuid::parse_str(raw)
        .map(SessionId)
        .map_err(|_| ApiError::BadRequest(format!("invalid session id: {raw}")))
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
    Json(config): Json<SessionConfig>,
) -> Result<Json<SessionSummary>> {
    authenticate(&state, &headers, q.token.as_deref())?;
    let id = state.sessions.create(config).await?;
    let summary = state.sessions.get(id)?.summary(id).await;
    state.events.publish(
        termcast_core::events::Event::new("session.created").with_session(id),
    );
    Ok(Json(summary))
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
) -> Result<Json<Vec<SessionSummary>>> {
    authenticate(&state, &headers, q.token.as_deref())?;
    Ok(Json(state.sessions.list().await))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>> {
    authenticate(&state, &headers, q.token.as_deref())?;
    let id = parse_session_id(&id)?;
    let ctx = state.sessions.get(id)?;
    Ok(Json(ctx.summary(id).await))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    authenticate(&state, &headers, q.token.as_deref())?;
    let id = parse_session_id(&id)?;
    state.sessions.delete(id)?;
    state.events.publish(
        termcast_core::events::Event::new("session.deleted").with_session(id),
    );
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InputBody {
    Key { r#type: KeyTag, name: String },
    Data { data: String },
}

#[derive(Deserialize)]
enum KeyTag {
    #[serde(rename = "key")]
    Key,
}

impl InputBody {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            InputBody::Key { name, .. } => termcast_core::wire::encode_key_name(&name),
            InputBody::Data { data } => data.into_bytes(),
        }
    }
}

async fn write_input(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
    Path(id): Path<String>,
    Json(body): Json<InputBody>,
) -> Result<StatusCode> {
    authenticate(&state, &headers, q.token.as_deref())?;
    let id = parse_session_id(&id)?;
    state.sessions.write_input(id, body.into_bytes()).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct ResizeBody {
    cols: u16,
    rows: u16,
}

async fn resize_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
    Path(id): Path<String>,
    Json(body): Json<ResizeBody>,
) -> Result<StatusCode> {
    authenticate(&state, &headers, q.token.as_deref())?;
    let id = parse_session_id(&id)?;
    state.sessions.resize(id, body.cols, body.rows).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/{id}",
            get(get_session).delete(delete_session),
        )
        .route("/api/sessions/{id}/input", post(write_input))
        .route("/api/sessions/{id}/resize", post(resize_session))
}
