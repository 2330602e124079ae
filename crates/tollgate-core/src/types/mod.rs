//! Core types used throughout Tollgate.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::clock::{Clock, SystemClock};
use crate::validation::ValidationError;

/// Tenant assigned to plans created without an explicit tenant.
pub const DEFAULT_TENANT_ID: &str = "SYSTEM";

/// Model permission entry granting access to every model.
pub const MODEL_WILDCARD: &str = "*";

/// Kind of billable principal a usage plan governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    /// An individual user.
    User,
    /// A backend service.
    Service,
    /// A single API key.
    ApiKey,
    /// A department.
    Department,
    /// A project.
    Project,
}

impl EntityType {
    /// All entity types, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::User,
        Self::Service,
        Self::ApiKey,
        Self::Department,
        Self::Project,
    ];

    /// Get string representation (the wire form).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Service => "SERVICE",
            Self::ApiKey => "API_KEY",
            Self::Department => "DEPARTMENT",
            Self::Project => "PROJECT",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "USER" => Ok(Self::User),
            "SERVICE" => Ok(Self::Service),
            "API_KEY" => Ok(Self::ApiKey),
            "DEPARTMENT" => Ok(Self::Department),
            "PROJECT" => Ok(Self::Project),
            _ => Err(ValidationError::UnknownEntityType(s.to_string())),
        }
    }
}

/// Composite identity of a usage plan.
///
/// Displayed as `entity_id:ENTITY_TYPE`. The entity id is the partition key so
/// that many entities sharing one type spread across shards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanKey {
    /// Billable principal identifier.
    pub entity_id: String,
    /// Kind of principal.
    pub entity_type: EntityType,
}

impl PlanKey {
    /// Create a new plan key.
    #[must_use]
    pub fn new(entity_id: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type,
        }
    }
}

impl fmt::Display for PlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_id, self.entity_type)
    }
}

/// Per-minute limits for the three metered dimensions.
///
/// A value of 0 blocks the dimension entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    /// Input tokens per minute.
    #[serde(default = "default_input_tpm")]
    pub input_tpm: u64,
    /// Output tokens per minute.
    #[serde(default = "default_output_tpm")]
    pub output_tpm: u64,
    /// Requests per minute.
    #[serde(default = "default_rpm")]
    pub rpm: u64,
}

impl RateLimits {
    /// Create limits from explicit values.
    #[must_use]
    pub const fn new(input_tpm: u64, output_tpm: u64, rpm: u64) -> Self {
        Self {
            input_tpm,
            output_tpm,
            rpm,
        }
    }

    /// Limits that block every dimension.
    #[must_use]
    pub const fn blocked() -> Self {
        Self::new(0, 0, 0)
    }

    /// Get the limit for one metric.
    #[must_use]
    pub const fn get(&self, metric: Metric) -> u64 {
        match metric {
            Metric::Rpm => self.rpm,
            Metric::InputTpm => self.input_tpm,
            Metric::OutputTpm => self.output_tpm,
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::new(default_input_tpm(), default_output_tpm(), default_rpm())
    }
}

const fn default_input_tpm() -> u64 {
    40_000
}

const fn default_output_tpm() -> u64 {
    10_000
}

const fn default_rpm() -> u64 {
    60
}

/// A metered dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Requests per minute.
    Rpm,
    /// Input tokens per minute.
    InputTpm,
    /// Output tokens per minute.
    OutputTpm,
}

impl Metric {
    /// Metrics in evaluation order.
    pub const ALL: [Self; 3] = [Self::Rpm, Self::InputTpm, Self::OutputTpm];

    /// Get string representation, as used in counter keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Rpm => "rpm",
            Self::InputTpm => "input_tpm",
            Self::OutputTpm => "output_tpm",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of models an entity may invoke; `"*"` permits every model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelPermissions(pub BTreeSet<String>);

impl ModelPermissions {
    /// Permissions granting every model.
    #[must_use]
    pub fn all() -> Self {
        Self(BTreeSet::from([MODEL_WILDCARD.to_string()]))
    }

    /// Check whether a model may be invoked.
    #[must_use]
    pub fn permits(&self, model_id: &str) -> bool {
        self.0.contains(MODEL_WILDCARD) || self.0.contains(model_id)
    }

    /// Whether the wildcard is present.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0.contains(MODEL_WILDCARD)
    }

    /// Iterate the permitted model ids.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Whether no model is permitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for ModelPermissions {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Configuration record governing one billable principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePlan {
    /// Billable principal identifier (partition key).
    pub entity_id: String,
    /// Kind of principal.
    pub entity_type: EntityType,
    /// Tenant grouping for isolation and reporting.
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,
    /// Cost budget linkage. Carried, not enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<String>,
    /// Models this entity may invoke.
    #[serde(default)]
    pub model_permissions: ModelPermissions,
    /// Inactive plans reject every request.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Limits applied to models without an override.
    #[serde(default)]
    pub default_limits: RateLimits,
    /// Per-model limit overrides.
    #[serde(default)]
    pub model_limits: HashMap<String, RateLimits>,
    /// Opaque passthrough data.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Creation time, seconds since epoch.
    pub created_at: i64,
    /// Last administrative change, seconds since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

fn default_tenant_id() -> String {
    DEFAULT_TENANT_ID.to_string()
}

const fn default_active() -> bool {
    true
}

impl UsagePlan {
    /// Create an active plan with default limits and no model permissions,
    /// stamped with the wall clock.
    #[must_use]
    pub fn new(entity_id: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type,
            tenant_id: default_tenant_id(),
            budget_id: None,
            model_permissions: ModelPermissions::default(),
            active: true,
            default_limits: RateLimits::default(),
            model_limits: HashMap::new(),
            metadata: HashMap::new(),
            created_at: SystemClock.timestamp(),
            updated_at: None,
        }
    }

    /// Set the tenant.
    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    /// Set the permitted models.
    #[must_use]
    pub fn with_permissions<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.model_permissions = models.into_iter().collect();
        self
    }

    /// Set the default limits.
    #[must_use]
    pub const fn with_default_limits(mut self, limits: RateLimits) -> Self {
        self.default_limits = limits;
        self
    }

    /// Add a per-model override.
    #[must_use]
    pub fn with_model_limit(mut self, model_id: impl Into<String>, limits: RateLimits) -> Self {
        self.model_limits.insert(model_id.into(), limits);
        self
    }

    /// Composite identity of this plan.
    #[must_use]
    pub fn key(&self) -> PlanKey {
        PlanKey::new(self.entity_id.clone(), self.entity_type)
    }

    /// Limits governing a model: the override if present, else the defaults.
    #[must_use]
    pub fn limits_for_model(&self, model_id: &str) -> RateLimits {
        self.model_limits
            .get(model_id)
            .copied()
            .unwrap_or(self.default_limits)
    }

    /// Check whether this plan permits a model.
    #[must_use]
    pub fn permits_model(&self, model_id: &str) -> bool {
        self.model_permissions.permits(model_id)
    }
}

/// Token counts of one model invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input/prompt tokens.
    pub input_tokens: u64,
    /// Output/completion tokens.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Create token usage.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Usage of an attempt that consumed no tokens.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_entity_type_parsing() {
        assert_eq!("user".parse::<EntityType>().unwrap(), EntityType::User);
        assert_eq!("API_KEY".parse::<EntityType>().unwrap(), EntityType::ApiKey);
        assert_eq!("api-key".parse::<EntityType>().unwrap(), EntityType::ApiKey);
        assert!("team".parse::<EntityType>().is_err());

        for kind in EntityType::ALL {
            assert_eq!(kind.as_str().parse::<EntityType>().unwrap(), kind);
        }
    }

    #[test]
    fn test_entity_type_wire_form() {
        let json = serde_json::to_string(&EntityType::ApiKey).unwrap();
        assert_eq!(json, "\"API_KEY\"");
    }

    #[test]
    fn test_plan_key_display() {
        let key = PlanKey::new("alice", EntityType::User);
        assert_eq!(key.to_string(), "alice:USER");
    }

    #[test]
    fn test_limits_for_model_falls_back_to_defaults() {
        let plan = UsagePlan::new("svc", EntityType::Service)
            .with_default_limits(RateLimits::new(500, 500, 10))
            .with_model_limit("big-model", RateLimits::new(100, 100, 100));

        assert_eq!(plan.limits_for_model("big-model").input_tpm, 100);
        assert_eq!(plan.limits_for_model("small-model").input_tpm, 500);
    }

    #[test]
    fn test_model_permissions() {
        let plan = UsagePlan::new("alice", EntityType::User).with_permissions(["model-a"]);
        assert!(plan.permits_model("model-a"));
        assert!(!plan.permits_model("model-b"));

        let plan = plan.with_permissions([MODEL_WILDCARD]);
        assert!(plan.permits_model("model-b"));
        assert!(plan.model_permissions.is_wildcard());

        let plan = UsagePlan::new("bob", EntityType::User);
        assert!(!plan.permits_model("model-a"));
    }

    #[test]
    fn test_plan_json_defaults() {
        let plan: UsagePlan = serde_json::from_str(
            r#"{"entity_id":"alice","entity_type":"USER","created_at":1700000000}"#,
        )
        .unwrap();

        assert_eq!(plan.tenant_id, DEFAULT_TENANT_ID);
        assert!(plan.active);
        assert_eq!(plan.default_limits, RateLimits::default());
        assert_eq!(plan.default_limits.input_tpm, 40_000);
        assert_eq!(plan.default_limits.output_tpm, 10_000);
        assert_eq!(plan.default_limits.rpm, 60);
        assert!(plan.model_permissions.is_empty());
    }

    #[test]
    fn test_negative_limits_rejected() {
        let result: Result<RateLimits, _> =
            serde_json::from_str(r#"{"input_tpm":-1,"output_tpm":10,"rpm":1}"#);
        assert!(result.is_err());
    }
}
