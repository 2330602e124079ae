//! Redis counter store.
//!
//! Increments run as a single Lua script so a batch is one atomic round trip.
//! The script sets an expiry only on keys that do not already carry one, which
//! keeps the expiry anchored to the moment the window's key was created.
//!
//! Every batch the limiter sends shares one hash tag, so scripts and `MGET`
//! stay within a single slot on Redis Cluster.

use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tokio::time::timeout;

use super::{CounterError, CounterResult, CounterStore};

const INCREMENT_SCRIPT: &str = r"
local ttl = tonumber(ARGV[1])
local out = {}
for i, key in ipairs(KEYS) do
    out[i] = redis.call('INCRBY', key, ARGV[i + 1])
    if redis.call('TTL', key) == -1 then
        redis.call('EXPIRE', key, ttl)
    end
end
return out
";

/// Counter store shared across gateway instances through Redis.
pub struct RedisCounterStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    script: redis::Script,
    call_timeout: Duration,
}

impl RedisCounterStore {
    /// Create a store for `redis_url`. No connection is made until first use.
    ///
    /// # Errors
    ///
    /// Returns error if the URL cannot be parsed.
    pub fn new(redis_url: &str, call_timeout: Duration) -> CounterResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CounterError::Connection(format!("Invalid Redis URL: {e}")))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            script: redis::Script::new(INCREMENT_SCRIPT),
            call_timeout,
        })
    }

    async fn connection(&self) -> CounterResult<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                tracing::debug!("Opening Redis connection manager");
                timeout(self.call_timeout, self.client.get_connection_manager())
                    .await
                    .map_err(|_| CounterError::Timeout(self.call_timeout))?
                    .map_err(|e| CounterError::Connection(e.to_string()))
            })
            .await?;
        Ok(manager.clone())
    }

    async fn bounded<T, F>(&self, fut: F) -> CounterResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        timeout(self.call_timeout, fut)
            .await
            .map_err(|_| CounterError::Timeout(self.call_timeout))?
            .map_err(|e| {
                if e.is_io_error() || e.is_connection_dropped() {
                    CounterError::Connection(e.to_string())
                } else {
                    CounterError::Backend(e.to_string())
                }
            })
    }
}

#[async_trait::async_trait]
impl CounterStore for RedisCounterStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn increment_and_get(&self, key: &str, amount: u64, ttl: Duration) -> CounterResult<u64> {
        let values = self
            .increment_many(&[(key.to_string(), amount)], ttl)
            .await?;
        values
            .first()
            .copied()
            .ok_or_else(|| CounterError::Backend("empty script reply".to_string()))
    }

    async fn get(&self, key: &str) -> CounterResult<u64> {
        let values = self.get_many(&[key.to_string()]).await?;
        Ok(values.first().copied().unwrap_or(0))
    }

    async fn increment_many(
        &self,
        increments: &[(String, u64)],
        ttl: Duration,
    ) -> CounterResult<Vec<u64>> {
        if increments.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;
        let mut invocation = self.script.prepare_invoke();
        invocation.arg(ttl.as_secs().max(1));
        for (key, amount) in increments {
            invocation.key(key).arg(*amount);
        }

        let values: Vec<u64> = self.bounded(invocation.invoke_async(&mut conn)).await?;
        if values.len() != increments.len() {
            return Err(CounterError::Backend(format!(
                "script returned {} values for {} keys",
                values.len(),
                increments.len()
            )));
        }
        Ok(values)
    }

    async fn get_many(&self, keys: &[String]) -> CounterResult<Vec<u64>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("MGET");
        cmd.arg(keys);
        let values: Vec<Option<u64>> = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(values.into_iter().map(|v| v.unwrap_or(0)).collect())
    }
}
