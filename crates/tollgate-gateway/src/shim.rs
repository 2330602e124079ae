//! Gateway integration hooks.
//!
//! A model-invocation handler calls [`AdmissionShim::admit`] before dispatching
//! to the provider and [`AdmissionShim::record`] with the actual token counts
//! afterwards:
//!
//! ```ignore
//! let ticket = shim.admit(&caller, model, estimate).await.into_result()?;
//! let outcome = provider.invoke(request).await;
//! let usage = outcome.as_ref().map_or(TokenUsage::none(), |r| r.usage);
//! let _ = shim.record(ticket, usage).await;
//! ```
//!
//! A ticket dropped without being recorded (the request was cancelled before
//! dispatch) leaves the counters untouched.

use std::sync::Arc;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tollgate_core::types::{EntityType, PlanKey, TokenUsage, UsagePlan};
use tollgate_core::validation;
use tollgate_limiter::{LimiterError, RateLimitResult, RateLimiter, RejectReason, UsageSnapshot};

use crate::cache::PlanCache;

/// Identity of the caller, as resolved by the gateway's authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerIdentity {
    /// Billable principal identifier.
    pub entity_id: String,
    /// Kind of principal.
    pub entity_type: EntityType,
}

impl CallerIdentity {
    /// Create an identity.
    #[must_use]
    pub fn new(entity_id: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type,
        }
    }

    /// Key of the plan governing this caller.
    #[must_use]
    pub fn plan_key(&self) -> PlanKey {
        PlanKey::new(self.entity_id.clone(), self.entity_type)
    }
}

impl From<PlanKey> for CallerIdentity {
    fn from(key: PlanKey) -> Self {
        Self::new(key.entity_id, key.entity_type)
    }
}

/// Expected token counts of a request, known before dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEstimate {
    /// Estimated input tokens.
    pub input_tokens: u64,
    /// Estimated output tokens (typically the request's max tokens).
    pub output_tokens: u64,
}

impl TokenEstimate {
    /// Create an estimate.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

/// Permission to dispatch one request. Redeem with [`AdmissionShim::record`].
#[derive(Debug)]
#[must_use = "a granted request must be recorded once the model call finishes"]
pub struct AdmissionTicket {
    plan: Arc<UsagePlan>,
    model_id: String,
    decision: RateLimitResult,
}

impl AdmissionTicket {
    /// The plan the request was admitted under.
    #[must_use]
    pub fn plan(&self) -> &UsagePlan {
        &self.plan
    }

    /// The admitted model.
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// The admission decision, with the window snapshot when metered.
    #[must_use]
    pub const fn decision(&self) -> &RateLimitResult {
        &self.decision
    }
}

/// A rejected request, convertible into an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRejection(pub RateLimitResult);

impl AdmissionRejection {
    /// HTTP status for the rejection reason.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self.0.reason {
            RejectReason::RpmExceeded
            | RejectReason::InputTpmExceeded
            | RejectReason::OutputTpmExceeded => StatusCode::TOO_MANY_REQUESTS,
            RejectReason::ServiceDegraded => StatusCode::SERVICE_UNAVAILABLE,
            RejectReason::Ok
            | RejectReason::PlanInactive
            | RejectReason::ModelNotPermitted
            | RejectReason::PlanNotFound
            | RejectReason::PlanInvalid => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for AdmissionRejection {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = self.0.retry_after_seconds;
        let mut response = (status, Json(self.0)).into_response();
        if retry_after > 0 {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

/// Outcome of [`AdmissionShim::admit`].
#[derive(Debug)]
pub enum Admission {
    /// Dispatch the request, then record its usage with the ticket.
    Granted(AdmissionTicket),
    /// Do not dispatch; return the rejection to the client.
    Rejected(RateLimitResult),
}

impl Admission {
    /// Whether the request was admitted.
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    /// The decision behind this outcome.
    #[must_use]
    pub const fn decision(&self) -> &RateLimitResult {
        match self {
            Self::Granted(ticket) => &ticket.decision,
            Self::Rejected(result) => result,
        }
    }

    /// Convert into a `Result` for use with `?` in handlers.
    ///
    /// # Errors
    ///
    /// Returns the rejection when the request was not admitted.
    pub fn into_result(self) -> Result<AdmissionTicket, AdmissionRejection> {
        match self {
            Self::Granted(ticket) => Ok(ticket),
            Self::Rejected(result) => Err(AdmissionRejection(result)),
        }
    }
}

/// Pre-call check and post-call record hooks.
pub struct AdmissionShim {
    plans: Arc<PlanCache>,
    limiter: Arc<RateLimiter>,
}

impl AdmissionShim {
    /// Create hooks over a plan cache and limiter.
    #[must_use]
    pub const fn new(plans: Arc<PlanCache>, limiter: Arc<RateLimiter>) -> Self {
        Self { plans, limiter }
    }

    /// The engine behind these hooks.
    #[must_use]
    pub const fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Decide whether `identity` may invoke `model_id`.
    pub async fn admit(
        &self,
        identity: &CallerIdentity,
        model_id: &str,
        estimate: TokenEstimate,
    ) -> Admission {
        let key = identity.plan_key();

        if let Err(e) = validation::validate_identifier("entity_id", &key.entity_id) {
            tracing::warn!(entity = %key, error = %e, "Malformed caller identity");
            return self.reject_config(RejectReason::PlanNotFound);
        }

        let plan = match self.plans.get(&key).await {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                tracing::warn!(entity = %key, model = model_id, "No usage plan for caller");
                return self.reject_config(RejectReason::PlanNotFound);
            }
            Err(e) => {
                tracing::warn!(
                    entity = %key,
                    model = model_id,
                    operation = "load_plan",
                    error = %e,
                    "Plan store unavailable"
                );
                let decision = self.limiter.degraded();
                if !decision.allowed {
                    return Admission::Rejected(decision);
                }
                // Failing open: no plan to check against, but usage is still metered.
                let plan = UsagePlan::new(key.entity_id.clone(), key.entity_type)
                    .with_permissions([model_id]);
                return Admission::Granted(AdmissionTicket {
                    plan: Arc::new(plan),
                    model_id: model_id.to_string(),
                    decision,
                });
            }
        };

        if let Err(e) = validation::validate_plan(&plan) {
            tracing::error!(entity = %key, error = %e, "Stored usage plan is invalid");
            return self.reject_config(RejectReason::PlanInvalid);
        }

        let decision = self
            .limiter
            .check_limit(
                &plan,
                model_id,
                estimate.input_tokens,
                estimate.output_tokens,
            )
            .await;

        if decision.allowed {
            Admission::Granted(AdmissionTicket {
                plan,
                model_id: model_id.to_string(),
                decision,
            })
        } else {
            Admission::Rejected(decision)
        }
    }

    /// Record the actual usage of an admitted request.
    ///
    /// Call this for failed provider calls too, with [`TokenUsage::none`], so
    /// the request still counts against the requests-per-minute limit. A
    /// failure here is logged and returned; it never fails the request
    /// retroactively.
    ///
    /// # Errors
    ///
    /// Returns `LimiterError` if the counter store write fails.
    pub async fn record(
        &self,
        ticket: AdmissionTicket,
        usage: TokenUsage,
    ) -> Result<UsageSnapshot, LimiterError> {
        self.limiter
            .record_usage(
                &ticket.plan,
                &ticket.model_id,
                usage.input_tokens,
                usage.output_tokens,
            )
            .await
    }

    fn reject_config(&self, reason: RejectReason) -> Admission {
        self.limiter.stats().record_decision(reason);
        Admission::Rejected(RateLimitResult::reject(reason, 0, None))
    }
}
