//! Usage plan administration.
//!
//! A thin façade over the plan store that validates input, keeps timestamps,
//! and invalidates the plan cache on every write.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use thiserror::Error;
use tollgate_core::clock::{Clock, SystemClock};
use tollgate_core::plans::PlanStoreError;
use tollgate_core::types::{
    DEFAULT_TENANT_ID, EntityType, ModelPermissions, PlanKey, RateLimits, UsagePlan,
};
use tollgate_core::validation::{self, ValidationError};
use validator::Validate;

use crate::api::{self, ApiError};
use crate::cache::PlanCache;

/// Administration errors.
#[derive(Error, Debug)]
pub enum AdminError {
    /// No plan with this key.
    #[error("Usage plan not found: {0}")]
    NotFound(PlanKey),

    /// Request failed validation.
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Plan store failed.
    #[error(transparent)]
    Store(#[from] PlanStoreError),
}

impl From<ValidationError> for AdminError {
    fn from(e: ValidationError) -> Self {
        Self::Invalid(e.to_string())
    }
}

impl From<validator::ValidationErrors> for AdminError {
    fn from(e: validator::ValidationErrors) -> Self {
        Self::Invalid(e.to_string())
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::NotFound(_) => (StatusCode::NOT_FOUND, api::NOT_FOUND),
            Self::Invalid(_) => (StatusCode::UNPROCESSABLE_ENTITY, api::INVALID_REQUEST),
            Self::Store(e) => {
                tracing::error!(error = %e, "Plan store failure");
                (StatusCode::SERVICE_UNAVAILABLE, api::STORE_UNAVAILABLE)
            }
        };
        ApiError::new(code, self.to_string()).with_status(status)
    }
}

fn identifier(value: &str) -> Result<(), validator::ValidationError> {
    validation::validate_identifier("identifier", value).map_err(|e| {
        let mut err = validator::ValidationError::new("identifier");
        err.message = Some(e.to_string().into());
        err
    })
}

fn model_ids(values: &Vec<String>) -> Result<(), validator::ValidationError> {
    for value in values {
        validation::validate_model_id(value).map_err(|e| {
            let mut err = validator::ValidationError::new("model_id");
            err.message = Some(e.to_string().into());
            err
        })?;
    }
    Ok(())
}

/// Request to create (or replace) a usage plan.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateUsagePlan {
    /// Billable principal identifier.
    #[validate(custom(function = "identifier"))]
    pub entity_id: String,
    /// Kind of principal.
    pub entity_type: EntityType,
    /// Owning tenant; defaults to `SYSTEM`.
    #[serde(default)]
    #[validate(custom(function = "identifier"))]
    pub tenant_id: Option<String>,
    /// Cost budget linkage.
    #[serde(default)]
    #[validate(length(min = 1, max = 256))]
    pub budget_id: Option<String>,
    /// Permitted models, `"*"` for all.
    #[serde(default)]
    #[validate(custom(function = "model_ids"))]
    pub model_permissions: Vec<String>,
    /// Defaults to `true`.
    #[serde(default)]
    pub active: Option<bool>,
    /// Limits for models without an override.
    #[serde(default)]
    pub default_limits: Option<RateLimits>,
    /// Per-model overrides.
    #[serde(default)]
    pub model_limits: HashMap<String, RateLimits>,
    /// Opaque passthrough data.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CreateUsagePlan {
    /// Minimal request for a plan with defaults.
    #[must_use]
    pub fn new(entity_id: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type,
            tenant_id: None,
            budget_id: None,
            model_permissions: Vec::new(),
            active: None,
            default_limits: None,
            model_limits: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Composite key of the plan this request creates.
    #[must_use]
    pub fn key(&self) -> PlanKey {
        PlanKey::new(self.entity_id.clone(), self.entity_type)
    }
}

/// Partial rate limits. Absent dimensions keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RateLimitsPatch {
    /// Input tokens per minute.
    #[serde(default)]
    pub input_tpm: Option<u64>,
    /// Output tokens per minute.
    #[serde(default)]
    pub output_tpm: Option<u64>,
    /// Requests per minute.
    #[serde(default)]
    pub rpm: Option<u64>,
}

impl RateLimitsPatch {
    /// Overlay the present dimensions onto `base`.
    #[must_use]
    pub fn apply_to(self, base: RateLimits) -> RateLimits {
        RateLimits {
            input_tpm: self.input_tpm.unwrap_or(base.input_tpm),
            output_tpm: self.output_tpm.unwrap_or(base.output_tpm),
            rpm: self.rpm.unwrap_or(base.rpm),
        }
    }
}

impl From<RateLimits> for RateLimitsPatch {
    fn from(limits: RateLimits) -> Self {
        Self {
            input_tpm: Some(limits.input_tpm),
            output_tpm: Some(limits.output_tpm),
            rpm: Some(limits.rpm),
        }
    }
}

/// Partial update of a usage plan. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UsagePlanPatch {
    /// Dimensions of the default limits to change.
    #[serde(default)]
    pub default_limits: Option<RateLimitsPatch>,
    /// Per-model override changes. A `null` entry removes the override; a new
    /// override starts from the plan's default limits.
    #[serde(default)]
    pub model_limits: Option<HashMap<String, Option<RateLimitsPatch>>>,
    /// Replacement permission set.
    #[serde(default)]
    pub model_permissions: Option<BTreeSet<String>>,
    /// Activate or deactivate.
    #[serde(default)]
    pub active: Option<bool>,
    /// Move to another tenant.
    #[serde(default)]
    #[validate(custom(function = "identifier"))]
    pub tenant_id: Option<String>,
    /// New budget linkage.
    #[serde(default)]
    #[validate(length(min = 1, max = 256))]
    pub budget_id: Option<String>,
    /// Replacement metadata.
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl UsagePlanPatch {
    fn apply(self, plan: &mut UsagePlan) {
        if let Some(limits) = self.default_limits {
            plan.default_limits = limits.apply_to(plan.default_limits);
        }
        if let Some(model_limits) = self.model_limits {
            for (model, change) in model_limits {
                match change {
                    Some(limits) => {
                        let base = plan
                            .model_limits
                            .get(&model)
                            .copied()
                            .unwrap_or(plan.default_limits);
                        plan.model_limits.insert(model, limits.apply_to(base));
                    }
                    None => {
                        plan.model_limits.remove(&model);
                    }
                }
            }
        }
        if let Some(permissions) = self.model_permissions {
            plan.model_permissions = ModelPermissions(permissions);
        }
        if let Some(active) = self.active {
            plan.active = active;
        }
        if let Some(tenant_id) = self.tenant_id {
            plan.tenant_id = tenant_id;
        }
        if let Some(budget_id) = self.budget_id {
            plan.budget_id = Some(budget_id);
        }
        if let Some(metadata) = self.metadata {
            plan.metadata = metadata;
        }
    }
}

/// Administrative operations on usage plans.
pub struct UsagePlanAdmin {
    cache: Arc<PlanCache>,
    clock: Arc<dyn Clock>,
}

impl UsagePlanAdmin {
    /// Create a façade writing through `cache` to its store.
    #[must_use]
    pub fn new(cache: Arc<PlanCache>) -> Self {
        Self::with_clock(cache, Arc::new(SystemClock))
    }

    /// Create a façade stamping plans with times from `clock`.
    #[must_use]
    pub fn with_clock(cache: Arc<PlanCache>, clock: Arc<dyn Clock>) -> Self {
        Self { cache, clock }
    }

    /// The plan cache invalidated by this façade.
    #[must_use]
    pub const fn cache(&self) -> &Arc<PlanCache> {
        &self.cache
    }

    /// Create or replace a plan. An existing plan keeps its `created_at`.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::Invalid` for bad input, or a store error.
    pub async fn create_usage_plan(&self, request: CreateUsagePlan) -> Result<UsagePlan, AdminError> {
        request.validate()?;

        let key = request.key();
        let now = self.clock.timestamp();
        let existing = self.cache.store().get(&key).await?;

        let plan = UsagePlan {
            entity_id: request.entity_id,
            entity_type: request.entity_type,
            tenant_id: request
                .tenant_id
                .unwrap_or_else(|| DEFAULT_TENANT_ID.to_string()),
            budget_id: request.budget_id,
            model_permissions: request.model_permissions.into_iter().collect(),
            active: request.active.unwrap_or(true),
            default_limits: request.default_limits.unwrap_or_default(),
            model_limits: request.model_limits,
            metadata: request.metadata,
            created_at: existing.as_ref().map_or(now, |p| p.created_at),
            updated_at: existing.as_ref().map(|_| now),
        };
        validation::validate_plan(&plan)?;

        self.cache.store().put(&plan).await?;
        self.cache.invalidate(&key).await;

        tracing::info!(
            plan = %key,
            tenant = %plan.tenant_id,
            replaced = existing.is_some(),
            "Usage plan saved"
        );
        Ok(plan)
    }

    /// Fetch a plan directly from the store.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::NotFound` if absent, or a store error.
    pub async fn get_usage_plan(&self, key: &PlanKey) -> Result<UsagePlan, AdminError> {
        self.cache
            .store()
            .get(key)
            .await?
            .ok_or_else(|| AdminError::NotFound(key.clone()))
    }

    /// Apply a partial update.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::NotFound` if absent, `AdminError::Invalid` if the
    /// result does not validate, or a store error.
    pub async fn update_usage_plan(
        &self,
        key: &PlanKey,
        patch: UsagePlanPatch,
    ) -> Result<UsagePlan, AdminError> {
        patch.validate()?;
        if let Some(models) = &patch.model_permissions {
            for model in models {
                validation::validate_model_id(model)?;
            }
        }

        let mut plan = self.get_usage_plan(key).await?;
        patch.apply(&mut plan);
        plan.updated_at = Some(self.clock.timestamp());
        validation::validate_plan(&plan)?;

        self.cache.store().put(&plan).await?;
        self.cache.invalidate(key).await;

        tracing::info!(plan = %key, active = plan.active, "Usage plan updated");
        Ok(plan)
    }

    /// Deactivate a plan. Plans are never deleted through this API.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::NotFound` if absent, or a store error.
    pub async fn deactivate_usage_plan(&self, key: &PlanKey) -> Result<UsagePlan, AdminError> {
        let plan = self
            .cache
            .store()
            .deactivate(key, self.clock.timestamp())
            .await?
            .ok_or_else(|| AdminError::NotFound(key.clone()))?;
        self.cache.invalidate(key).await;

        tracing::info!(plan = %key, "Usage plan deactivated");
        Ok(plan)
    }

    /// List a tenant's plans using the store's native query.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::Invalid` for a malformed tenant id, or a store error.
    pub async fn list_usage_plans(&self, tenant_id: &str) -> Result<Vec<UsagePlan>, AdminError> {
        validation::validate_identifier("tenant_id", tenant_id)?;
        Ok(self.cache.store().list_by_tenant(tenant_id).await?)
    }
}
