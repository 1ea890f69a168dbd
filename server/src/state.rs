//! Shared application state injected into every handler.

use std::sync::Arc;

use termcast_core::auth::Authenticator;
use termcast_core::config::Config;
use termcast_core::events::EventBus;
use termcast_core::session::SessionManager;

use crate::ratelimit::RateLimiterStore;

pub struct AppState {
    pub sessions: SessionManager,
    pub events: Arc<EventBus>,
    pub auth: Arc<Authenticator>,
    pub rate_limiter: RateLimiterStore,
    pub config: &'static Config,
}
