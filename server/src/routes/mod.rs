//! Router assembly (spec.md §4.5). Control routes (session CRUD, auth) carry
//! the rate-limit and request-timeout layers; streaming routes and `/healthz`
//! are mounted outside them entirely, which is how the stream exemption
//! named in spec.md §4.5/§9 is expressed structurally rather than with a
//! runtime allow-list.

mod auth;
mod health;
mod sessions;
mod streams;

use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::Router;
use tower::timeout::TimeoutLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::ratelimit::rate_limit_middleware;
use crate::state::AppState;

const CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_router(state: Arc<AppState>) -> Router {
    let control = Router::new()
        .merge(sessions::router())
        .merge(auth::router())
        .layer(TimeoutLayer::new(CONTROL_REQUEST_TIMEOUT))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit_middleware,
        ));

    let streaming = streams::router();
    let health = health::router();

    Router::new()
        .merge(control)
        .merge(streaming)
        .merge(health)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
