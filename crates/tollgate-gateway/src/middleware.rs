//! Gateway middleware.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    middleware::Next,
    response::Response,
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
};

use crate::api::{self, ApiError};
use crate::server::GatewayState;

/// Per-client throttle for administrative calls.
pub struct AdminThrottle {
    clients: RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>,
    clock: DefaultClock,
}

impl AdminThrottle {
    /// Create a throttle allowing `requests_per_minute` per client address.
    #[must_use]
    pub fn new(requests_per_minute: u32) -> Self {
        let quota =
            Quota::per_minute(NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN));
        Self {
            clients: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
        }
    }

    /// Check a request from `client`. Returns the wait in whole seconds when
    /// the client is over its quota.
    #[must_use]
    pub fn check(&self, client: IpAddr) -> Option<u64> {
        self.clients.check_key(&client).err().map(|not_until| {
            let wait = not_until.wait_time_from(self.clock.now());
            wait.as_secs() + u64::from(wait.subsec_nanos() > 0)
        })
    }
}

impl Default for AdminThrottle {
    fn default() -> Self {
        Self::new(120)
    }
}

/// Throttle administrative routes per client address.
///
/// Requests without connection info (in-process callers) share one bucket.
pub async fn throttle_admin(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |info| info.0.ip());

    if let Some(wait) = state.throttle.check(client) {
        tracing::debug!(%client, wait, "Admin request throttled");
        let mut response = ApiError::new(api::RATE_LIMITED, "Too many admin requests")
            .with_status(StatusCode::TOO_MANY_REQUESTS);
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(wait.max(1)));
        return response;
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_is_per_client() {
        let throttle = AdminThrottle::new(2);
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        assert!(throttle.check(a).is_none());
        assert!(throttle.check(a).is_none());
        let wait = throttle.check(a).unwrap();
        assert!(wait <= 60);

        assert!(throttle.check(b).is_none());
    }

    #[test]
    fn test_zero_quota_clamped() {
        let throttle = AdminThrottle::new(0);
        assert!(throttle.check(IpAddr::V4(Ipv4Addr::LOCALHOST)).is_none());
    }
}
