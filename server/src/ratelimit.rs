//! Per-IP rate limiting for control-plane routes (spec.md §4.5), built on
//! governor's keyed limiter. Streaming routes are mounted outside this
//! middleware's router nest entirely (see `routes::build_router`), not
//! exempted by allow-list.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;

use crate::error::ApiError;
use crate::state::AppState;

/// Keyed per-IP limiter: governor manages the IP→bucket map and garbage
/// collects idle buckets automatically.
pub struct RateLimiterStore {
    limiter: RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>,
}

impl RateLimiterStore {
    pub fn new(per_minute: u32) -> Self {
        let per_minute = NonZeroU32::new(per_minute).unwrap_or(nonzero!(60u32));
        Self {
            limiter: RateLimiter::keyed(Quota::per_minute(per_minute)),
        }
    }

    pub fn check(&self, ip: IpAddr) -> Result<(), ApiError> {
        self.limiter.check_key(&ip).map_err(|_| ApiError::RateLimited)
    }
}

/// Axum middleware applied only to control routes: rejects with 429 once an
/// IP's quota is spent.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match state.rate_limiter.check(addr.ip()) {
        Ok(()) => next.run(request).await,
        Err(e) => axum::response::IntoResponse::into_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn allows_requests_under_quota() {
        let store = RateLimiterStore::new(5);
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        for _ in 0..5 {
            assert!(store.check(ip).is_ok());
        }
    }

    #[test]
    fn rejects_requests_over_quota() {
        let store = RateLimiterStore::new(2);
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        assert!(store.check(ip).is_ok());
        assert!(store.check(ip).is_ok());
        assert!(store.check(ip).is_err());
    }

    #[test]
    fn tracks_ips_independently() {
        let store = RateLimiterStore::new(1);
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert!(store.check(a).is_ok());
        assert!(store.check(b).is_ok());
        assert!(store.check(a).is_err());
    }
}
