//! In-memory plan store.

use std::collections::HashMap;

use tokio::sync::RwLock;

use super::{PlanStore, PlanStoreResult};
use crate::types::{PlanKey, UsagePlan};

/// In-memory plan store (for tests and single-instance deployments).
#[derive(Debug, Default)]
pub struct MemoryPlanStore {
    plans: RwLock<HashMap<PlanKey, UsagePlan>>,
}

impl MemoryPlanStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored plans.
    pub async fn count(&self) -> usize {
        self.plans.read().await.len()
    }
}

#[async_trait::async_trait]
impl PlanStore for MemoryPlanStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &PlanKey) -> PlanStoreResult<Option<UsagePlan>> {
        Ok(self.plans.read().await.get(key).cloned())
    }

    async fn put(&self, plan: &UsagePlan) -> PlanStoreResult<()> {
        self.plans.write().await.insert(plan.key(), plan.clone());
        Ok(())
    }

    async fn deactivate(&self, key: &PlanKey, at: i64) -> PlanStoreResult<Option<UsagePlan>> {
        let mut plans = self.plans.write().await;
        Ok(plans.get_mut(key).map(|plan| {
            plan.active = false;
            plan.updated_at = Some(at);
            plan.clone()
        }))
    }

    async fn delete(&self, key: &PlanKey) -> PlanStoreResult<bool> {
        Ok(self.plans.write().await.remove(key).is_some())
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> PlanStoreResult<Vec<UsagePlan>> {
        let plans = self.plans.read().await;
        let mut found: Vec<UsagePlan> = plans
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .cloned()
            .collect();
        found.sort_by_key(UsagePlan::key);
        Ok(found)
    }
}
