//! Real-time transports (spec.md §6): the text-record SSE stream and the
//! binary screen-snapshot WebSocket. Mounted on a router with no rate-limit
//! or timeout layers (see `routes::build_router`) — long-lived connections
//! are the exemption spec.md §4.5/§9 calls for, expressed structurally.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use termcast_core::session::SessionId;
use termcast_core::wire::{encode_snapshot_frame, encode_text_record, TextRecord};

use crate::authn::authenticate;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    uuid::Uuid::parse_str(raw)
        .map(SessionId)
        .map_err(|_| ApiError::BadRequest(format!("invalid session id: {raw}")))
}

fn now_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// `GET /api/sessions/{id}/stream` — asciinema-v2-shaped JSON text records
/// delivered as SSE `data:` frames.
async fn text_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    authenticate(&state, &headers, q.token.as_deref())?;
    let id = parse_session_id(&id)?;
    let ctx = state.sessions.get(id)?;

    let recent = ctx.recent_output.dump();
    let (_sub_id, rx) = ctx.fanout.attach_text().await;
    let backlog = if recent.is_empty() {
        None
    } else {
        Some(TextRecord::Output {
            t: now_f64(),
            data: recent,
        })
    };

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|record| (record, rx))
    });
    let stream = futures_util::stream::iter(backlog).chain(stream).map(|record| {
        Ok(SseEvent::default().data(encode_text_record(&record).trim_end().to_string()))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientControlMessage {
    Input { data: String },
    Key { name: String },
    Resize { cols: u16, rows: u16 },
}

/// `GET /api/sessions/{id}/ws` — binary screen-snapshot transport (spec.md
/// §6 `0xBF` envelope). Also accepts JSON control messages for input/resize
/// over the same socket.
async fn binary_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    authenticate(&state, &headers, q.token.as_deref())?;
    let id = parse_session_id(&id)?;
    let _ = state.sessions.get(id)?; // validate existence before upgrading
    let state = Arc::clone(&state);
    Ok(ws.on_upgrade(move |socket| handle_binary_socket(socket, state, id)))
}

async fn handle_binary_socket(socket: WebSocket, state: Arc<AppState>, id: SessionId) {
    let ctx = match state.sessions.get(id) {
        Ok(ctx) => ctx,
        Err(_) => return,
    };
    let (sub_id, mut snapshot_rx) = ctx.fanout.attach_binary().await;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let id_str = id.to_string();
    let send_task = async move {
        while let Some(snapshot) = snapshot_rx.recv().await {
            let frame = encode_snapshot_frame(&id_str, &snapshot);
            if ws_tx.send(Message::Binary(frame.into())).await.is_err() {
                break;
            }
        }
    };

    let recv_state = Arc::clone(&state);
    let recv_task = async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let Message::Text(text) = msg else { continue };
            let Ok(control) = serde_json::from_str::<ClientControlMessage>(&text) else {
                continue;
            };
            match control {
                ClientControlMessage::Input { data } => {
                    let _ = recv_state.sessions.write_input(id, data.into_bytes()).await;
                }
                ClientControlMessage::Key { name } => {
                    let bytes = termcast_core::wire::encode_key_name(&name);
                    let _ = recv_state.sessions.write_input(id, bytes).await;
                }
                ClientControlMessage::Resize { cols, rows } => {
                    let _ = recv_state.sessions.resize(id, cols, rows).await;
                }
            }
        }
    };

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }
    ctx.fanout.detach(sub_id).await;
}

/// `GET /api/events` — process-wide lifecycle event bus as SSE.
async fn event_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    authenticate(&state, &headers, q.token.as_deref())?;
    let rx = state.events.subscribe();
    let (tx, out_rx) = tokio::sync::mpsc::channel(32);
    tokio::spawn(termcast_core::events::pump_subscriber(
        rx,
        state.events.heartbeat_interval(),
        state.events.client_timeout(),
        tx,
    ));
    let stream = tokio_stream::wrappers::ReceiverStream::new(out_rx).map(|event| {
        let json = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().event(event.kind.clone()).data(json))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sessions/{id}/stream", get(text_stream))
        .route("/api/sessions/{id}/ws", get(binary_stream))
        .route("/api/events", get(event_stream))
}
