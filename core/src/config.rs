//! Global config singleton. Loaded once from the environment; every
//! component calls `ensure_loaded()` so the first caller does the work and
//! later callers get the same instance (spec.md §6).

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Authentication mode (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Challenge,
    Password,
    Disabled,
}

impl AuthMode {
    fn from_env(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "challenge" => AuthMode::Challenge,
            "password" => AuthMode::Password,
            _ => AuthMode::Disabled,
        }
    }
}

/// Process-wide configuration, populated once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// `BIND_ADDRESS` — interface:port for the HTTP listener.
    pub bind_address: String,
    /// `AUTH_MODE` — challenge|password|disabled.
    pub auth_mode: AuthMode,
    /// `SESSION_LIMIT` — cap on concurrent sessions. `None` = unbounded.
    pub session_limit: Option<usize>,
    /// `PERSIST_DIR` — directory for session metadata. `None` disables persistence.
    pub persist_dir: Option<PathBuf>,
    /// `HEARTBEAT_INTERVAL_SECS` — event-bus heartbeat cadence (spec.md §4.4).
    pub heartbeat_interval: Duration,
    /// `CLIENT_TIMEOUT_SECS` — event-bus subscriber inactivity timeout.
    pub client_timeout: Duration,
    /// `RATE_LIMIT_PER_MIN` — token-bucket quota for control operations.
    pub rate_limit_per_min: u32,
    /// `RECENT_OUTPUT_WINDOW_BYTES` — recent-output ring size per session.
    pub recent_output_window_bytes: usize,
    /// `TOKEN_TTL_SECS` — bearer token lifetime once minted.
    pub token_ttl: Duration,
    /// Password credential, when `auth_mode == Password`.
    pub auth_password: Option<String>,
    /// HMAC signing secret for bearer tokens.
    pub jwt_secret: String,
}

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:4024";
const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_CLIENT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_RATE_LIMIT_PER_MIN: u32 = 60;
const DEFAULT_RECENT_OUTPUT_WINDOW_BYTES: usize = 2 * 1024 * 1024;
const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            auth_mode: AuthMode::Disabled,
            session_limit: None,
            persist_dir: None,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            client_timeout: Duration::from_secs(DEFAULT_CLIENT_TIMEOUT_SECS),
            rate_limit_per_min: DEFAULT_RATE_LIMIT_PER_MIN,
            recent_output_window_bytes: DEFAULT_RECENT_OUTPUT_WINDOW_BYTES,
            token_ttl: Duration::from_secs(DEFAULT_TOKEN_TTL_SECS),
            auth_password: None,
            jwt_secret: "termcast-dev-secret-change-me".to_string(),
        }
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Ensure config is loaded (idempotent). Reads the environment on first
/// call; later callers get the same instance.
pub fn ensure_loaded() -> &'static Config {
    CONFIG.get_or_init(load_from_env)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_string(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn load_from_env() -> Config {
    let defaults = Config::default();
    Config {
        bind_address: env_string("BIND_ADDRESS").unwrap_or(defaults.bind_address),
        auth_mode: env_string("AUTH_MODE")
            .map(|s| AuthMode::from_env(&s))
            .unwrap_or(defaults.auth_mode),
        session_limit: env_string("SESSION_LIMIT").and_then(|v| v.parse().ok()),
        persist_dir: env_string("PERSIST_DIR").map(PathBuf::from),
        heartbeat_interval: Duration::from_secs(env_u64(
            "HEARTBEAT_INTERVAL_SECS",
            DEFAULT_HEARTBEAT_SECS,
        )),
        client_timeout: Duration::from_secs(env_u64(
            "CLIENT_TIMEOUT_SECS",
            DEFAULT_CLIENT_TIMEOUT_SECS,
        )),
        rate_limit_per_min: env_string("RATE_LIMIT_PER_MIN")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT_PER_MIN),
        recent_output_window_bytes: env_string("RECENT_OUTPUT_WINDOW_BYTES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RECENT_OUTPUT_WINDOW_BYTES),
        token_ttl: Duration::from_secs(env_u64("TOKEN_TTL_SECS", DEFAULT_TOKEN_TTL_SECS)),
        auth_password: env_string("AUTH_PASSWORD"),
        jwt_secret: env_string("JWT_SECRET").unwrap_or(defaults.jwt_secret),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.auth_mode, AuthMode::Disabled);
        assert!(c.session_limit.is_none());
        assert_eq!(c.rate_limit_per_min, DEFAULT_RATE_LIMIT_PER_MIN);
    }

    #[test]
    fn auth_mode_parses_known_values() {
        assert_eq!(AuthMode::from_env("challenge"), AuthMode::Challenge);
        assert_eq!(AuthMode::from_env("Password"), AuthMode::Password);
        assert_eq!(AuthMode::from_env("nonsense"), AuthMode::Disabled);
    }
}
