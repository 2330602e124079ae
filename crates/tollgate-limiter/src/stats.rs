//! Admission statistics.
//!
//! Counts every decision by reason and accumulates recorded tokens per model.
//! Process-local; the authoritative usage lives in the counter store.
//!
//! Model names come from callers, so at most [`MAX_TRACKED_MODELS`] get their
//! own entry. Usage for any further model accrues under [`OVERFLOW_MODEL`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use tollgate_core::types::TokenUsage;

use crate::result::RejectReason;

/// Models tracked individually before usage folds into [`OVERFLOW_MODEL`].
pub const MAX_TRACKED_MODELS: usize = 256;

/// Entry collecting usage for models past the tracking limit.
pub const OVERFLOW_MODEL: &str = "(other)";

/// Decision and usage counters for one limiter.
pub struct AdmissionStats {
    decisions: [AtomicU64; RejectReason::ALL.len()],
    record_failures: AtomicU64,
    models: RwLock<HashMap<String, ModelUsage>>,
}

/// Recorded usage for a model.
#[derive(Debug, Default)]
struct ModelUsage {
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    request_count: AtomicU64,
}

impl AdmissionStats {
    /// Create empty statistics.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decisions: std::array::from_fn(|_| AtomicU64::new(0)),
            record_failures: AtomicU64::new(0),
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Count one admission decision.
    pub fn record_decision(&self, reason: RejectReason) {
        self.decisions[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed usage record.
    pub fn record_failure(&self) {
        self.record_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Accumulate recorded token usage for a model.
    pub fn record_usage(&self, model: &str, usage: &TokenUsage) {
        {
            let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
            let entry = models.get(model).or_else(|| {
                (models.len() >= MAX_TRACKED_MODELS)
                    .then(|| models.get(OVERFLOW_MODEL))
                    .flatten()
            });
            if let Some(entry) = entry {
                entry.add(usage);
                return;
            }
        }

        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = models.get(model) {
            entry.add(usage);
            return;
        }
        let name = if models.len() < MAX_TRACKED_MODELS {
            model
        } else {
            OVERFLOW_MODEL
        };
        models.entry(name.to_string()).or_default().add(usage);
    }

    /// Number of decisions with `reason`.
    #[must_use]
    pub fn decisions(&self, reason: RejectReason) -> u64 {
        self.decisions[reason.index()].load(Ordering::Relaxed)
    }

    /// Recorded usage for one model.
    #[must_use]
    pub fn model_usage(&self, model: &str) -> Option<TokenUsageSummary> {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        models.get(model).map(ModelUsage::summary)
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let decisions: BTreeMap<String, u64> = RejectReason::ALL
            .iter()
            .map(|reason| (reason.as_str().to_string(), self.decisions(*reason)))
            .collect();

        let admitted = self.decisions(RejectReason::Ok);
        let rejected = RejectReason::ALL
            .iter()
            .filter(|reason| **reason != RejectReason::Ok)
            .fold(0u64, |sum, reason| sum.saturating_add(self.decisions(*reason)));

        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        let mut recorded = TokenUsageSummary::default();
        let per_model: BTreeMap<String, TokenUsageSummary> = models
            .iter()
            .map(|(model, usage)| {
                let summary = usage.summary();
                recorded.input_tokens += summary.input_tokens;
                recorded.output_tokens += summary.output_tokens;
                recorded.request_count += summary.request_count;
                (model.clone(), summary)
            })
            .collect();

        StatsSnapshot {
            admitted,
            rejected,
            decisions,
            record_failures: self.record_failures.load(Ordering::Relaxed),
            recorded,
            models: per_model,
        }
    }
}

impl Default for AdmissionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelUsage {
    fn add(&self, usage: &TokenUsage) {
        self.input_tokens
            .fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(usage.output_tokens, Ordering::Relaxed);
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> TokenUsageSummary {
        TokenUsageSummary {
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            request_count: self.request_count.load(Ordering::Relaxed),
        }
    }
}

/// Summary of token usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsageSummary {
    /// Total input tokens.
    pub input_tokens: u64,
    /// Total output tokens.
    pub output_tokens: u64,
    /// Total recorded requests.
    pub request_count: u64,
}

impl TokenUsageSummary {
    /// Get total tokens (input + output).
    #[must_use]
    pub const fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Serializable view of [`AdmissionStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Requests admitted.
    pub admitted: u64,
    /// Requests rejected for any reason.
    pub rejected: u64,
    /// Decisions keyed by reason.
    pub decisions: BTreeMap<String, u64>,
    /// Usage records that failed to reach the counter store.
    pub record_failures: u64,
    /// Recorded usage across all models.
    pub recorded: TokenUsageSummary,
    /// Recorded usage per model.
    pub models: BTreeMap<String, TokenUsageSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_tracking() {
        let stats = AdmissionStats::new();
        stats.record_usage("claude-3-5-sonnet", &TokenUsage::new(100, 50));
        stats.record_usage("claude-3-5-sonnet", &TokenUsage::new(200, 100));

        let usage = stats.model_usage("claude-3-5-sonnet").unwrap();
        assert_eq!(usage.input_tokens, 300);
        assert_eq!(usage.output_tokens, 150);
        assert_eq!(usage.request_count, 2);
        assert!(stats.model_usage("other").is_none());
    }

    #[test]
    fn test_snapshot_totals() {
        let stats = AdmissionStats::new();
        stats.record_usage("model1", &TokenUsage::new(100, 50));
        stats.record_usage("model2", &TokenUsage::new(200, 100));
        stats.record_decision(RejectReason::Ok);
        stats.record_decision(RejectReason::Ok);
        stats.record_decision(RejectReason::RpmExceeded);
        stats.record_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.admitted, 2);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.decisions["RPM_EXCEEDED"], 1);
        assert_eq!(snapshot.decisions["PLAN_NOT_FOUND"], 0);
        assert_eq!(snapshot.record_failures, 1);
        assert_eq!(snapshot.recorded.total_tokens(), 450);
        assert_eq!(snapshot.models.len(), 2);
    }

    #[test]
    fn test_distinct_models_are_capped() {
        let stats = AdmissionStats::new();
        for i in 0..20_000u64 {
            stats.record_usage(&format!("model-{i}"), &TokenUsage::new(1, 2));
        }
        // Models seen before the cap keep their own entry.
        stats.record_usage("model-0", &TokenUsage::new(1, 2));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.models.len(), MAX_TRACKED_MODELS + 1);
        assert_eq!(snapshot.models["model-0"].request_count, 2);
        assert_eq!(
            snapshot.models[OVERFLOW_MODEL].request_count,
            20_000 - MAX_TRACKED_MODELS as u64
        );
        assert!(stats.model_usage("model-19999").is_none());
        assert_eq!(snapshot.recorded.request_count, 20_001);
        assert_eq!(snapshot.recorded.total_tokens(), 3 * 20_001);
    }
}
