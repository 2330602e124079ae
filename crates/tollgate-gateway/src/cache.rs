//! Short-lived cache of resolved usage plans.
//!
//! Every admitted request reads its plan, so plans are served from a TTL cache
//! in front of the plan store. Concurrent misses for one key share a single
//! store read. Missing plans are not cached, so a plan created through another
//! instance becomes visible on the next request.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tollgate_core::plans::{PlanStore, PlanStoreError};
use tollgate_core::types::{PlanKey, UsagePlan};

/// Default time a plan may be served from cache.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Default number of cached plans.
pub const DEFAULT_CAPACITY: u64 = 10_000;

enum LoadError {
    Missing,
    Store(PlanStoreError),
}

/// TTL cache over a [`PlanStore`].
pub struct PlanCache {
    store: Arc<dyn PlanStore>,
    plans: Cache<PlanKey, Arc<UsagePlan>>,
}

impl PlanCache {
    /// Create a cache with the default TTL and capacity.
    #[must_use]
    pub fn new(store: Arc<dyn PlanStore>) -> Self {
        Self::with_settings(store, DEFAULT_TTL, DEFAULT_CAPACITY)
    }

    /// Create a cache with explicit settings.
    #[must_use]
    pub fn with_settings(store: Arc<dyn PlanStore>, ttl: Duration, capacity: u64) -> Self {
        let plans = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { store, plans }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PlanStore> {
        &self.store
    }

    /// Resolve a plan, reading through to the store on a miss.
    ///
    /// # Errors
    ///
    /// Returns error if the store read fails.
    pub async fn get(&self, key: &PlanKey) -> Result<Option<Arc<UsagePlan>>, PlanStoreError> {
        let store = self.store.clone();
        let lookup = key.clone();
        let loaded = self
            .plans
            .try_get_with(key.clone(), async move {
                match store.get(&lookup).await {
                    Ok(Some(plan)) => Ok(Arc::new(plan)),
                    Ok(None) => Err(LoadError::Missing),
                    Err(e) => Err(LoadError::Store(e)),
                }
            })
            .await;

        match loaded {
            Ok(plan) => Ok(Some(plan)),
            Err(e) => match e.as_ref() {
                LoadError::Missing => Ok(None),
                LoadError::Store(e) => Err(PlanStoreError::Storage(e.to_string())),
            },
        }
    }

    /// Drop a cached plan so the next read goes to the store.
    pub async fn invalidate(&self, key: &PlanKey) {
        self.plans.invalidate(key).await;
    }

    /// Number of cached plans (approximate).
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.plans.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tollgate_core::plans::{MemoryPlanStore, PlanStoreResult};
    use tollgate_core::types::EntityType;

    /// Store wrapper counting reads.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryPlanStore,
        reads: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PlanStore for CountingStore {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn get(&self, key: &PlanKey) -> PlanStoreResult<Option<UsagePlan>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.get(key).await
        }

        async fn put(&self, plan: &UsagePlan) -> PlanStoreResult<()> {
            self.inner.put(plan).await
        }

        async fn deactivate(&self, key: &PlanKey, at: i64) -> PlanStoreResult<Option<UsagePlan>> {
            self.inner.deactivate(key, at).await
        }

        async fn delete(&self, key: &PlanKey) -> PlanStoreResult<bool> {
            self.inner.delete(key).await
        }

        async fn list_by_tenant(&self, tenant_id: &str) -> PlanStoreResult<Vec<UsagePlan>> {
            self.inner.list_by_tenant(tenant_id).await
        }
    }

    #[tokio::test]
    async fn test_hit_avoids_store() {
        let store = Arc::new(CountingStore::default());
        let plan = UsagePlan::new("alice", EntityType::User);
        store.put(&plan).await.unwrap();

        let cache = PlanCache::new(store.clone());
        assert!(cache.get(&plan.key()).await.unwrap().is_some());
        assert!(cache.get(&plan.key()).await.unwrap().is_some());
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_coalesce() {
        let store = Arc::new(CountingStore::default());
        let plan = UsagePlan::new("alice", EntityType::User);
        store.put(&plan).await.unwrap();

        let cache = Arc::new(PlanCache::new(store.clone()));
        let lookups = (0..16).map(|_| {
            let cache = cache.clone();
            let key = plan.key();
            async move { cache.get(&key).await }
        });
        for result in futures::future::join_all(lookups).await {
            assert!(result.unwrap().is_some());
        }
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_plans_are_not_cached() {
        let store = Arc::new(CountingStore::default());
        let cache = PlanCache::new(store.clone());
        let key = PlanKey::new("late", EntityType::User);

        assert!(cache.get(&key).await.unwrap().is_none());
        store.put(&UsagePlan::new("late", EntityType::User)).await.unwrap();
        assert!(cache.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_reloads() {
        let store = Arc::new(CountingStore::default());
        let plan = UsagePlan::new("alice", EntityType::User);
        store.put(&plan).await.unwrap();
        let cache = PlanCache::new(store.clone());

        assert!(cache.get(&plan.key()).await.unwrap().unwrap().active);
        store.deactivate(&plan.key(), 1).await.unwrap();
        assert!(cache.get(&plan.key()).await.unwrap().unwrap().active);

        cache.invalidate(&plan.key()).await;
        assert!(!cache.get(&plan.key()).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let store = Arc::new(CountingStore::default());
        let plan = UsagePlan::new("alice", EntityType::User);
        store.put(&plan).await.unwrap();
        let cache = PlanCache::with_settings(store.clone(), Duration::from_millis(50), 10);

        cache.get(&plan.key()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        cache.get(&plan.key()).await.unwrap();
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
    }
}
