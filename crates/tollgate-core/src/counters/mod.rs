//! Counter storage.
//!
//! Counters are plain integers addressed by string keys. Each key receives an
//! expiry when it is first created and is never extended afterwards, so a
//! window's counters vanish on their own once the window is over.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::clock::Clock;
use crate::config::{Config, CounterBackend};

pub use memory::MemoryCounterStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisCounterStore;

/// Counter store errors.
#[derive(Error, Debug)]
pub enum CounterError {
    /// Could not reach the backend.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Backend rejected or failed the command.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Call did not complete within the configured bound.
    #[error("Counter store call timed out after {0:?}")]
    Timeout(Duration),

    /// Backend is not compiled into this build.
    #[error("Counter backend unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for counter store operations.
pub type CounterResult<T> = Result<T, CounterError>;

/// Shared counters with atomic increments and per-key expiry.
#[async_trait::async_trait]
pub trait CounterStore: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Atomically add `amount` and return the new value. A key created by this
    /// call expires after `ttl`.
    async fn increment_and_get(&self, key: &str, amount: u64, ttl: Duration) -> CounterResult<u64>;

    /// Current value; absent or expired keys read as 0.
    async fn get(&self, key: &str) -> CounterResult<u64>;

    /// Apply several increments in one round trip. Returns new values in order.
    async fn increment_many(
        &self,
        increments: &[(String, u64)],
        ttl: Duration,
    ) -> CounterResult<Vec<u64>>;

    /// Read several keys in one round trip. Returns values in order.
    async fn get_many(&self, keys: &[String]) -> CounterResult<Vec<u64>>;
}

/// Open the counter store selected by configuration.
///
/// # Errors
///
/// Returns error if the Redis URL is invalid, or the redis backend is
/// configured but not compiled in.
pub fn open_counter_store(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> CounterResult<Arc<dyn CounterStore>> {
    match config.counters.backend {
        CounterBackend::Memory => Ok(Arc::new(MemoryCounterStore::new(clock))),
        #[cfg(feature = "redis")]
        CounterBackend::Redis => {
            let timeout = Duration::from_millis(config.limiter.store_timeout_ms);
            Ok(Arc::new(RedisCounterStore::new(
                &config.counters.redis_url,
                timeout,
            )?))
        }
        #[cfg(not(feature = "redis"))]
        CounterBackend::Redis => Err(CounterError::Unavailable(
            "built without the `redis` feature".to_string(),
        )),
    }
}
