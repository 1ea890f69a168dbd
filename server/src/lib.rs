//! termcast server: Axum HTTP/WebSocket control plane for termcast-core.

mod authn;
mod error;
mod ratelimit;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use termcast_core::auth::Authenticator;
use termcast_core::config::Config;
use termcast_core::events::EventBus;
use termcast_core::persist::PersistenceStore;
use termcast_core::session::SessionManager;
use tracing::info;

use crate::ratelimit::RateLimiterStore;
use crate::state::AppState;

/// Failure categories for `run_server`, mapped onto spec.md §6's process
/// exit codes: `1` configuration error, `2` bind error, `>2` reserved.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(#[source] anyhow::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

/// Build the shared application state from a loaded `Config`.
fn build_state(config: &'static Config) -> anyhow::Result<Arc<AppState>> {
    let persistence = match &config.persist_dir {
        Some(dir) => Some(Arc::new(PersistenceStore::new(dir.clone())?)),
        None => None,
    };
    let sessions = SessionManager::new(
        config.session_limit,
        persistence,
        config.recent_output_window_bytes,
    );
    sessions.restore_from_disk()?;

    let trusted_keys = Vec::new(); // no external key-distribution mechanism in this core yet
    let auth = Authenticator::new(
        config.auth_mode,
        trusted_keys,
        config.auth_password.clone(),
        config.jwt_secret.clone(),
        config.token_ttl,
    );

    Ok(Arc::new(AppState {
        sessions,
        events: Arc::new(EventBus::new(config.heartbeat_interval, config.client_timeout)),
        auth: Arc::new(auth),
        rate_limiter: RateLimiterStore::new(config.rate_limit_per_min),
        config,
    }))
}

/// Spawn the background session-reaper loop (spec.md §4.2's `cleanup_exited`).
fn spawn_reaper(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            ticker.tick().await;
            state.sessions.cleanup_exited().await;
        }
    });
}

/// Run the termcast HTTP/WebSocket server until ctrl-c is received.
pub async fn run_server(config: &'static Config) -> Result<(), RunError> {
    let addr: SocketAddr = config
        .bind_address
        .parse()
        .map_err(|e| RunError::Config(anyhow::anyhow!("invalid bind address {:?}: {e}", config.bind_address)))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| RunError::Bind { addr: addr.to_string(), source })?;
    info!(%addr, "termcastd listening");
    serve(listener, config).await.map_err(RunError::Runtime)
}

/// Serve on an already-bound listener. Split out from `run_server` so tests
/// can bind an ephemeral port (`127.0.0.1:0`) and learn the real address via
/// `TcpListener::local_addr` before handing the listener over.
pub async fn serve(listener: tokio::net::TcpListener, config: &'static Config) -> anyhow::Result<()> {
    let state = build_state(config)?;
    spawn_reaper(Arc::clone(&state));
    let app = routes::build_router(Arc::clone(&state));
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining connections");
}
