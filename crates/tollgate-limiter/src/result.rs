//! Admission decisions.

use serde::{Deserialize, Serialize};
use std::fmt;
use tollgate_core::types::{Metric, RateLimits};

/// Why a request was admitted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// Admitted.
    Ok,
    /// Plan exists but is deactivated.
    PlanInactive,
    /// Plan does not permit the requested model.
    ModelNotPermitted,
    /// Request count limit reached for this window.
    RpmExceeded,
    /// Input token limit would be exceeded.
    InputTpmExceeded,
    /// Output token limit would be exceeded.
    OutputTpmExceeded,
    /// No plan exists for the caller.
    PlanNotFound,
    /// Stored plan failed validation.
    PlanInvalid,
    /// Backing stores unavailable and the limiter fails closed.
    ServiceDegraded,
}

impl RejectReason {
    /// All reasons.
    pub const ALL: [Self; 9] = [
        Self::Ok,
        Self::PlanInactive,
        Self::ModelNotPermitted,
        Self::RpmExceeded,
        Self::InputTpmExceeded,
        Self::OutputTpmExceeded,
        Self::PlanNotFound,
        Self::PlanInvalid,
        Self::ServiceDegraded,
    ];

    /// Get string representation (the wire form).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::PlanInactive => "PLAN_INACTIVE",
            Self::ModelNotPermitted => "MODEL_NOT_PERMITTED",
            Self::RpmExceeded => "RPM_EXCEEDED",
            Self::InputTpmExceeded => "INPUT_TPM_EXCEEDED",
            Self::OutputTpmExceeded => "OUTPUT_TPM_EXCEEDED",
            Self::PlanNotFound => "PLAN_NOT_FOUND",
            Self::PlanInvalid => "PLAN_INVALID",
            Self::ServiceDegraded => "SERVICE_DEGRADED",
        }
    }

    /// Position in [`Self::ALL`].
    #[must_use]
    pub const fn index(&self) -> usize {
        *self as usize
    }

    /// The reason used when `metric` is over its limit.
    #[must_use]
    pub const fn exceeded(metric: Metric) -> Self {
        match metric {
            Metric::Rpm => Self::RpmExceeded,
            Metric::InputTpm => Self::InputTpmExceeded,
            Metric::OutputTpm => Self::OutputTpmExceeded,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current value and limit of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricUsage {
    /// Counter value in the current window.
    pub current: u64,
    /// Configured limit.
    pub limit: u64,
}

impl MetricUsage {
    /// Capacity left before the limit, saturating at zero.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current)
    }
}

/// Counters of one plan/model in one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// First second of the window, epoch seconds.
    pub window_start: u64,
    /// Requests.
    pub rpm: MetricUsage,
    /// Input tokens.
    pub input_tpm: MetricUsage,
    /// Output tokens.
    pub output_tpm: MetricUsage,
}

impl UsageSnapshot {
    /// Build a snapshot from counter values in evaluation order.
    #[must_use]
    pub const fn new(window_start: u64, values: [u64; 3], limits: &RateLimits) -> Self {
        Self {
            window_start,
            rpm: MetricUsage {
                current: values[0],
                limit: limits.rpm,
            },
            input_tpm: MetricUsage {
                current: values[1],
                limit: limits.input_tpm,
            },
            output_tpm: MetricUsage {
                current: values[2],
                limit: limits.output_tpm,
            },
        }
    }

    /// Usage of one metric.
    #[must_use]
    pub const fn metric(&self, metric: Metric) -> MetricUsage {
        match metric {
            Metric::Rpm => self.rpm,
            Metric::InputTpm => self.input_tpm,
            Metric::OutputTpm => self.output_tpm,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResult {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Why.
    pub reason: RejectReason,
    /// Seconds to wait before retrying; 0 when allowed or when waiting will not help.
    pub retry_after_seconds: u64,
    /// Window counters at decision time, when they were read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
}

impl RateLimitResult {
    /// An admitted request.
    #[must_use]
    pub const fn allow(usage: Option<UsageSnapshot>) -> Self {
        Self {
            allowed: true,
            reason: RejectReason::Ok,
            retry_after_seconds: 0,
            usage,
        }
    }

    /// A rejected request.
    #[must_use]
    pub const fn reject(
        reason: RejectReason,
        retry_after_seconds: u64,
        usage: Option<UsageSnapshot>,
    ) -> Self {
        Self {
            allowed: false,
            reason,
            retry_after_seconds,
            usage,
        }
    }
}
