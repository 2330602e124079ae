//! In-process counter store.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use super::{CounterResult, CounterStore};
use crate::clock::Clock;

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: u64,
    expires_at: u64,
}

/// Counter store kept in a sharded map.
///
/// Suitable for tests and single-instance deployments. Expiry is evaluated
/// lazily against the injected clock; call [`purge_expired`](Self::purge_expired)
/// periodically to reclaim memory.
pub struct MemoryCounterStore {
    slots: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
        }
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now_secs();
        self.slots.iter().filter(|s| s.expires_at > now).count()
    }

    /// Whether no live keys remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired keys. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_secs();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.expires_at > now);
        before - self.slots.len()
    }

    fn increment(&self, key: &str, amount: u64, ttl: Duration) -> u64 {
        let now = self.clock.now_secs();
        let fresh = Slot {
            value: 0,
            expires_at: now + ttl.as_secs(),
        };

        let mut slot = self.slots.entry(key.to_string()).or_insert(fresh);
        if slot.expires_at <= now {
            *slot = fresh;
        }
        slot.value = slot.value.saturating_add(amount);
        slot.value
    }

    fn read(&self, key: &str) -> u64 {
        let now = self.clock.now_secs();
        self.slots
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map_or(0, |slot| slot.value)
    }
}

#[async_trait::async_trait]
impl CounterStore for MemoryCounterStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn increment_and_get(&self, key: &str, amount: u64, ttl: Duration) -> CounterResult<u64> {
        Ok(self.increment(key, amount, ttl))
    }

    async fn get(&self, key: &str) -> CounterResult<u64> {
        Ok(self.read(key))
    }

    async fn increment_many(
        &self,
        increments: &[(String, u64)],
        ttl: Duration,
    ) -> CounterResult<Vec<u64>> {
        Ok(increments
            .iter()
            .map(|(key, amount)| self.increment(key, *amount, ttl))
            .collect())
    }

    async fn get_many(&self, keys: &[String]) -> CounterResult<Vec<u64>> {
        Ok(keys.iter().map(|key| self.read(key)).collect())
    }
}
