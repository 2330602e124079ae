//! Usage plan storage.
//!
//! Plans are keyed by `(entity_id, entity_type)` and read on every admitted
//! request, so backends favour point lookups. Listing by tenant is a native
//! query of each backend, not something the engine relies on.

mod memory;
mod sled_store;

use std::sync::Arc;

use thiserror::Error;

use crate::config::{Config, PlanBackend};
use crate::types::{PlanKey, UsagePlan};

pub use memory::MemoryPlanStore;
pub use sled_store::SledPlanStore;

/// Plan store errors.
#[derive(Error, Debug)]
pub enum PlanStoreError {
    /// Backend storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Stored record could not be decoded.
    #[error("Corrupt plan record for {key}: {reason}")]
    Corrupt {
        /// Plan key.
        key: String,
        /// Decoder message.
        reason: String,
    },
}

/// Result alias for plan store operations.
pub type PlanStoreResult<T> = Result<T, PlanStoreError>;

/// Durable keyed store of usage plans.
#[async_trait::async_trait]
pub trait PlanStore: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Fetch a plan. `None` means not found.
    async fn get(&self, key: &PlanKey) -> PlanStoreResult<Option<UsagePlan>>;

    /// Insert or replace a plan (last writer wins).
    async fn put(&self, plan: &UsagePlan) -> PlanStoreResult<()>;

    /// Set `active = false` and `updated_at = at`, returning the updated
    /// plan, or `None` if absent.
    async fn deactivate(&self, key: &PlanKey, at: i64) -> PlanStoreResult<Option<UsagePlan>>;

    /// Remove a plan permanently. Reserved for operator tooling.
    async fn delete(&self, key: &PlanKey) -> PlanStoreResult<bool>;

    /// List all plans belonging to a tenant.
    async fn list_by_tenant(&self, tenant_id: &str) -> PlanStoreResult<Vec<UsagePlan>>;
}

/// Open the plan store selected by configuration.
///
/// # Errors
///
/// Returns error if the sled database cannot be opened.
pub fn open_plan_store(config: &Config) -> PlanStoreResult<Arc<dyn PlanStore>> {
    match config.plans.backend {
        PlanBackend::Memory => Ok(Arc::new(MemoryPlanStore::new())),
        PlanBackend::Sled => {
            let path = config.plans_path();
            tracing::debug!(path = %path.display(), "Opening sled plan store");
            Ok(Arc::new(SledPlanStore::open(&path)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory_store() {
        let mut config = Config::default();
        config.plans.backend = PlanBackend::Memory;
        let store = open_plan_store(&config).unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[test]
    fn test_open_sled_store_at_configured_path() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.plans.path = Some(temp.path().join("plans"));
        let store = open_plan_store(&config).unwrap();
        assert_eq!(store.name(), "sled");
    }
}
