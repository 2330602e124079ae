//! Plan store backed by sled.
//!
//! Layout of the `usage_plans` tree:
//! - `plan:{entity_id}:{ENTITY_TYPE}` → JSON-encoded [`UsagePlan`]
//! - `idx:tenant:{tenant_id}:{entity_id}:{ENTITY_TYPE}` → plan record key

use std::path::Path;

use super::{PlanStore, PlanStoreError, PlanStoreResult};
use crate::types::{PlanKey, UsagePlan};

const TREE_NAME: &str = "usage_plans";

/// Plan store backed by an embedded sled database.
pub struct SledPlanStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledPlanStore {
    /// Open or create a plan store at the given path.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened.
    pub fn open(path: &Path) -> PlanStoreResult<Self> {
        let db = sled::open(path)
            .map_err(|e| PlanStoreError::Storage(format!("Failed to open plan database: {e}")))?;
        Self::with_db(db)
    }

    /// Create a plan store with an existing sled database.
    ///
    /// # Errors
    ///
    /// Returns error if tree cannot be opened.
    pub fn with_db(db: sled::Db) -> PlanStoreResult<Self> {
        let tree = db
            .open_tree(TREE_NAME)
            .map_err(|e| PlanStoreError::Storage(format!("Failed to open plans tree: {e}")))?;

        Ok(Self { db, tree })
    }

    /// Get the underlying sled database.
    #[must_use]
    pub const fn db(&self) -> &sled::Db {
        &self.db
    }

    /// Count stored plans, excluding index entries.
    #[must_use]
    pub fn count(&self) -> usize {
        self.tree.scan_prefix(b"plan:").count()
    }

    fn record_key(key: &PlanKey) -> String {
        format!("plan:{key}")
    }

    fn tenant_index_key(tenant_id: &str, key: &PlanKey) -> String {
        format!("idx:tenant:{tenant_id}:{key}")
    }

    fn decode(key: &PlanKey, bytes: &[u8]) -> PlanStoreResult<UsagePlan> {
        serde_json::from_slice(bytes).map_err(|e| PlanStoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn read(&self, key: &PlanKey) -> PlanStoreResult<Option<UsagePlan>> {
        match self.tree.get(Self::record_key(key).as_bytes()) {
            Ok(Some(value)) => Self::decode(key, &value).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(PlanStoreError::Storage(format!("Get error: {e}"))),
        }
    }

    fn write(&self, plan: &UsagePlan, previous: Option<&UsagePlan>) -> PlanStoreResult<()> {
        let key = plan.key();
        let value = serde_json::to_vec(plan)
            .map_err(|e| PlanStoreError::Storage(format!("Serialization error: {e}")))?;

        let mut batch = sled::Batch::default();
        if let Some(previous) = previous.filter(|p| p.tenant_id != plan.tenant_id) {
            batch.remove(Self::tenant_index_key(&previous.tenant_id, &key).as_bytes());
        }
        batch.insert(Self::record_key(&key).as_bytes(), value);
        batch.insert(
            Self::tenant_index_key(&plan.tenant_id, &key).as_bytes(),
            Self::record_key(&key).as_bytes(),
        );

        self.tree
            .apply_batch(batch)
            .map_err(|e| PlanStoreError::Storage(format!("Insert error: {e}")))?;

        self.flush()
    }

    fn flush(&self) -> PlanStoreResult<()> {
        self.tree
            .flush()
            .map_err(|e| PlanStoreError::Storage(format!("Flush error: {e}")))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl PlanStore for SledPlanStore {
    fn name(&self) -> &'static str {
        "sled"
    }

    async fn get(&self, key: &PlanKey) -> PlanStoreResult<Option<UsagePlan>> {
        self.read(key)
    }

    async fn put(&self, plan: &UsagePlan) -> PlanStoreResult<()> {
        let previous = self.read(&plan.key())?;
        self.write(plan, previous.as_ref())
    }

    async fn deactivate(&self, key: &PlanKey, at: i64) -> PlanStoreResult<Option<UsagePlan>> {
        let Some(mut plan) = self.read(key)? else {
            return Ok(None);
        };

        plan.active = false;
        plan.updated_at = Some(at);
        self.write(&plan, None)?;
        Ok(Some(plan))
    }

    async fn delete(&self, key: &PlanKey) -> PlanStoreResult<bool> {
        let Some(plan) = self.read(key)? else {
            return Ok(false);
        };

        let mut batch = sled::Batch::default();
        batch.remove(Self::tenant_index_key(&plan.tenant_id, key).as_bytes());
        batch.remove(Self::record_key(key).as_bytes());
        self.tree
            .apply_batch(batch)
            .map_err(|e| PlanStoreError::Storage(format!("Delete error: {e}")))?;

        self.flush()?;
        Ok(true)
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> PlanStoreResult<Vec<UsagePlan>> {
        let prefix = format!("idx:tenant:{tenant_id}:");
        let mut plans = Vec::new();

        for result in self.tree.scan_prefix(prefix.as_bytes()) {
            let (_, record_key) =
                result.map_err(|e| PlanStoreError::Storage(format!("Iter error: {e}")))?;

            let value = self
                .tree
                .get(&record_key)
                .map_err(|e| PlanStoreError::Storage(format!("Get error: {e}")))?;

            // Index entries can outlive a record removed by another process.
            let Some(value) = value else {
                tracing::warn!(
                    tenant = tenant_id,
                    record = %String::from_utf8_lossy(&record_key),
                    "Dangling tenant index entry"
                );
                continue;
            };

            let plan: UsagePlan = serde_json::from_slice(&value).map_err(|e| {
                PlanStoreError::Corrupt {
                    key: String::from_utf8_lossy(&record_key).into_owned(),
                    reason: e.to_string(),
                }
            })?;

            // Concurrent puts moving a plan between tenants can leave the old
            // index entry behind.
            if plan.tenant_id != tenant_id {
                tracing::debug!(
                    tenant = tenant_id,
                    owner = %plan.tenant_id,
                    plan = %plan.key(),
                    "Stale tenant index entry"
                );
                continue;
            }
            plans.push(plan);
        }

        Ok(plans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityType, RateLimits};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_read_after_write() {
        let temp = tempdir().unwrap();
        let store = SledPlanStore::open(temp.path()).unwrap();

        let plan = UsagePlan::new("svc", EntityType::Service)
            .with_tenant("acme")
            .with_permissions(["model-a"])
            .with_model_limit("model-a", RateLimits::new(1, 2, 3));
        store.put(&plan).await.unwrap();

        let loaded = store.get(&plan.key()).await.unwrap().unwrap();
        assert_eq!(loaded, plan);
        assert_eq!(store.count(), 1);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let temp = tempdir().unwrap();
        let plan = UsagePlan::new("alice", EntityType::User);
        {
            let store = SledPlanStore::open(temp.path()).unwrap();
            store.put(&plan).await.unwrap();
        }

        let store = SledPlanStore::open(temp.path()).unwrap();
        assert!(store.get(&plan.key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_tenant_index_follows_tenant_changes() {
        let temp = tempdir().unwrap();
        let store = SledPlanStore::open(temp.path()).unwrap();

        let plan = UsagePlan::new("alice", EntityType::User).with_tenant("acme");
        store.put(&plan).await.unwrap();
        assert_eq!(store.list_by_tenant("acme").await.unwrap().len(), 1);

        let moved = plan.with_tenant("globex");
        store.put(&moved).await.unwrap();
        assert!(store.list_by_tenant("acme").await.unwrap().is_empty());
        assert_eq!(store.list_by_tenant("globex").await.unwrap(), vec![moved]);
    }

    #[tokio::test]
    async fn test_tenant_prefix_does_not_overlap() {
        let temp = tempdir().unwrap();
        let store = SledPlanStore::open(temp.path()).unwrap();

        store
            .put(&UsagePlan::new("a", EntityType::User).with_tenant("acme"))
            .await
            .unwrap();
        store
            .put(&UsagePlan::new("b", EntityType::User).with_tenant("acme-labs"))
            .await
            .unwrap();

        assert_eq!(store.list_by_tenant("acme").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deactivate_and_delete() {
        let temp = tempdir().unwrap();
        let store = SledPlanStore::open(temp.path()).unwrap();
        let plan = UsagePlan::new("alice", EntityType::ApiKey).with_tenant("acme");
        store.put(&plan).await.unwrap();

        let deactivated = store.deactivate(&plan.key(), 1_700_000_000).await.unwrap().unwrap();
        assert!(!deactivated.active);
        assert_eq!(deactivated.updated_at, Some(1_700_000_000));
        assert!(!store.get(&plan.key()).await.unwrap().unwrap().active);
        assert_eq!(store.list_by_tenant("acme").await.unwrap().len(), 1);

        assert!(store.delete(&plan.key()).await.unwrap());
        assert!(!store.delete(&plan.key()).await.unwrap());
        assert!(store.get(&plan.key()).await.unwrap().is_none());
        assert!(store.list_by_tenant("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_tenant_index_is_ignored() {
        let temp = tempdir().unwrap();
        let store = SledPlanStore::open(temp.path()).unwrap();
        let plan = UsagePlan::new("alice", EntityType::User).with_tenant("globex");
        store.put(&plan).await.unwrap();

        // Index entry left under the previous tenant by an interleaved move.
        let key = plan.key();
        store
            .tree
            .insert(
                SledPlanStore::tenant_index_key("acme", &key).as_bytes(),
                SledPlanStore::record_key(&key).as_bytes(),
            )
            .unwrap();

        assert!(store.list_by_tenant("acme").await.unwrap().is_empty());
        let globex = store.list_by_tenant("globex").await.unwrap();
        assert_eq!(globex.len(), 1);
        assert_eq!(globex[0].entity_id, "alice");
    }
}
