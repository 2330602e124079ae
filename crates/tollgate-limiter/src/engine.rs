//! The rate limiter engine.
//!
//! Checks peek at the current window without reserving anything; usage is
//! committed afterwards by [`RateLimiter::record_usage`] with the actual token
//! counts. Two concurrent checks can therefore both pass and together overshoot
//! a limit by up to one request's worth. Limits are best-effort, not hard caps.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tollgate_core::clock::Clock;
use tollgate_core::config::{FailureMode, LimiterSettings};
use tollgate_core::counters::{CounterError, CounterStore};
use tollgate_core::types::{Metric, TokenUsage, UsagePlan};
use tollgate_core::validation::{ValidationError, validate_model_id};

use crate::result::{RateLimitResult, RejectReason, UsageSnapshot};
use crate::stats::AdmissionStats;
use crate::window::{FixedWindow, window_keys};

/// Errors surfaced by the engine.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Counter store failed or timed out.
    #[error("Counter store error: {0}")]
    Counter(#[from] CounterError),

    /// Model id cannot be used in a counter key.
    #[error("Invalid model id: {0}")]
    InvalidModel(#[from] ValidationError),
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Window length.
    pub window: FixedWindow,
    /// Expiry applied to newly created counter keys.
    pub counter_ttl: Duration,
    /// Prefix of every counter key.
    pub key_prefix: String,
    /// Behaviour when the counter store fails.
    pub failure_mode: FailureMode,
    /// Upper bound on one counter store call.
    pub store_timeout: Duration,
}

impl LimiterConfig {
    /// Build from the `limiter` config section.
    #[must_use]
    pub fn from_settings(settings: &LimiterSettings) -> Self {
        Self {
            window: FixedWindow::new(settings.window_secs),
            counter_ttl: Duration::from_secs(settings.counter_ttl_secs),
            key_prefix: settings.key_prefix.clone(),
            failure_mode: settings.failure_mode,
            store_timeout: Duration::from_millis(settings.store_timeout_ms),
        }
    }

    /// Set the failure mode.
    #[must_use]
    pub const fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self::from_settings(&LimiterSettings::default())
    }
}

/// Fixed-window admission checks and usage recording over a shared counter store.
pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    config: LimiterConfig,
    stats: AdmissionStats,
}

impl RateLimiter {
    /// Create an engine.
    #[must_use]
    pub fn new(
        counters: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        config: LimiterConfig,
    ) -> Self {
        Self {
            counters,
            clock,
            config,
            stats: AdmissionStats::new(),
        }
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Decision statistics.
    #[must_use]
    pub const fn stats(&self) -> &AdmissionStats {
        &self.stats
    }

    /// Time source for window buckets.
    #[must_use]
    pub const fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Decide whether a request may proceed, applying the failure policy when
    /// the counter store is unavailable.
    pub async fn check_limit(
        &self,
        plan: &UsagePlan,
        model_id: &str,
        est_input_tokens: u64,
        est_output_tokens: u64,
    ) -> RateLimitResult {
        match self
            .evaluate(plan, model_id, est_input_tokens, est_output_tokens)
            .await
        {
            Ok(result) => {
                self.stats.record_decision(result.reason);
                result
            }
            Err(e) => {
                tracing::warn!(
                    entity = %plan.key(),
                    model = model_id,
                    operation = "check_limit",
                    error = %e,
                    "Counter store unavailable"
                );
                self.degraded()
            }
        }
    }

    /// Decide whether a request may proceed, returning counter store failures
    /// to the caller instead of applying the failure policy.
    ///
    /// # Errors
    ///
    /// Returns `LimiterError::Counter` if the window counters cannot be read.
    pub async fn try_check_limit(
        &self,
        plan: &UsagePlan,
        model_id: &str,
        est_input_tokens: u64,
        est_output_tokens: u64,
    ) -> Result<RateLimitResult, LimiterError> {
        let result = self
            .evaluate(plan, model_id, est_input_tokens, est_output_tokens)
            .await?;
        self.stats.record_decision(result.reason);
        Ok(result)
    }

    /// Result for a request whose plan or counters could not be read.
    ///
    /// Fail closed rejects with `SERVICE_DEGRADED`; fail open admits unmetered.
    pub fn degraded(&self) -> RateLimitResult {
        let result = match self.config.failure_mode {
            FailureMode::Closed => RateLimitResult::reject(RejectReason::ServiceDegraded, 1, None),
            FailureMode::Open => RateLimitResult::allow(None),
        };
        self.stats.record_decision(result.reason);
        result
    }

    async fn evaluate(
        &self,
        plan: &UsagePlan,
        model_id: &str,
        est_input_tokens: u64,
        est_output_tokens: u64,
    ) -> Result<RateLimitResult, LimiterError> {
        if !plan.active {
            tracing::debug!(entity = %plan.key(), "Rejected: plan inactive");
            return Ok(RateLimitResult::reject(RejectReason::PlanInactive, 0, None));
        }

        if validate_model_id(model_id).is_err() || !plan.permits_model(model_id) {
            tracing::debug!(entity = %plan.key(), model = model_id, "Rejected: model not permitted");
            return Ok(RateLimitResult::reject(
                RejectReason::ModelNotPermitted,
                0,
                None,
            ));
        }

        let limits = plan.limits_for_model(model_id);
        let now = self.clock.now_secs();
        let window = self.config.window;
        let keys = window_keys(
            &self.config.key_prefix,
            &plan.key(),
            model_id,
            window.bucket(now),
        );

        let values = self.read_window(&keys).await?;
        let snapshot = UsageSnapshot::new(window.start(now), values, &limits);

        let estimates = [1, est_input_tokens, est_output_tokens];
        for (i, metric) in Metric::ALL.into_iter().enumerate() {
            let limit = limits.get(metric);
            let estimate = estimates[i];

            let over = if limit == 0 {
                true
            } else if estimate == 0 {
                // Nothing to charge against this metric.
                false
            } else {
                values[i].saturating_add(estimate) > limit
            };

            if over {
                tracing::debug!(
                    entity = %plan.key(),
                    model = model_id,
                    metric = %metric,
                    current = values[i],
                    estimate,
                    limit,
                    "Rejected: limit exceeded"
                );
                return Ok(RateLimitResult::reject(
                    RejectReason::exceeded(metric),
                    window.retry_after(now),
                    Some(snapshot),
                ));
            }
        }

        Ok(RateLimitResult::allow(Some(snapshot)))
    }

    async fn read_window(&self, keys: &[String; 3]) -> Result<[u64; 3], LimiterError> {
        let values = tokio::time::timeout(self.config.store_timeout, self.counters.get_many(keys))
            .await
            .map_err(|_| CounterError::Timeout(self.config.store_timeout))??;

        match values.as_slice() {
            &[rpm, input, output] => Ok([rpm, input, output]),
            _ => Err(LimiterError::Counter(CounterError::Backend(format!(
                "expected 3 counter values, got {}",
                values.len()
            )))),
        }
    }

    /// Commit actual usage for a completed (or failed) model call.
    ///
    /// Adds one request and the given token counts to the current window in a
    /// single batched write. Not idempotent: recording twice counts twice.
    ///
    /// # Errors
    ///
    /// Returns `LimiterError` if the counter store fails or times out. The
    /// write is not retried.
    pub async fn record_usage(
        &self,
        plan: &UsagePlan,
        model_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<UsageSnapshot, LimiterError> {
        validate_model_id(model_id)?;

        let now = self.clock.now_secs();
        let window = self.config.window;
        let [rpm_key, input_key, output_key] = window_keys(
            &self.config.key_prefix,
            &plan.key(),
            model_id,
            window.bucket(now),
        );
        let increments = [
            (rpm_key, 1),
            (input_key, input_tokens),
            (output_key, output_tokens),
        ];

        let write = self
            .counters
            .increment_many(&increments, self.config.counter_ttl);
        let result = match tokio::time::timeout(self.config.store_timeout, write).await {
            Ok(result) => result.map_err(LimiterError::from),
            Err(_) => Err(CounterError::Timeout(self.config.store_timeout).into()),
        };

        let values = match result {
            Ok(values) => values,
            Err(e) => {
                self.stats.record_failure();
                tracing::warn!(
                    entity = %plan.key(),
                    model = model_id,
                    operation = "record_usage",
                    input_tokens,
                    output_tokens,
                    error = %e,
                    "Failed to record usage"
                );
                return Err(e);
            }
        };

        self.stats
            .record_usage(model_id, &TokenUsage::new(input_tokens, output_tokens));

        let limits = plan.limits_for_model(model_id);
        let values: [u64; 3] = match values.as_slice() {
            &[rpm, input, output] => [rpm, input, output],
            _ => {
                return Err(LimiterError::Counter(CounterError::Backend(format!(
                    "expected 3 counter values, got {}",
                    values.len()
                ))));
            }
        };
        Ok(UsageSnapshot::new(window.start(now), values, &limits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tollgate_core::clock::ManualClock;
    use tollgate_core::counters::{CounterResult, MemoryCounterStore};
    use tollgate_core::types::{EntityType, MODEL_WILDCARD, RateLimits};

    /// Start of a window, so tests control exactly how far into it they are.
    const T0: u64 = 1_700_000_040;

    struct Harness {
        clock: Arc<ManualClock>,
        counters: Arc<MemoryCounterStore>,
        limiter: RateLimiter,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(T0));
        let counters = Arc::new(MemoryCounterStore::new(clock.clone()));
        let limiter = RateLimiter::new(counters.clone(), clock.clone(), LimiterConfig::default());
        Harness {
            clock,
            counters,
            limiter,
        }
    }

    fn plan(limits: RateLimits) -> UsagePlan {
        UsagePlan::new("alice", EntityType::User)
            .with_permissions(["model-a"])
            .with_default_limits(limits)
    }

    /// Counter store that always fails.
    struct DownCounterStore;

    #[async_trait::async_trait]
    impl CounterStore for DownCounterStore {
        fn name(&self) -> &'static str {
            "down"
        }

        async fn increment_and_get(&self, _: &str, _: u64, _: Duration) -> CounterResult<u64> {
            Err(CounterError::Connection("refused".to_string()))
        }

        async fn get(&self, _: &str) -> CounterResult<u64> {
            Err(CounterError::Connection("refused".to_string()))
        }

        async fn increment_many(&self, _: &[(String, u64)], _: Duration) -> CounterResult<Vec<u64>> {
            Err(CounterError::Connection("refused".to_string()))
        }

        async fn get_many(&self, _: &[String]) -> CounterResult<Vec<u64>> {
            Err(CounterError::Connection("refused".to_string()))
        }
    }

    /// Counter store that never answers.
    struct HungCounterStore;

    #[async_trait::async_trait]
    impl CounterStore for HungCounterStore {
        fn name(&self) -> &'static str {
            "hung"
        }

        async fn increment_and_get(&self, _: &str, _: u64, _: Duration) -> CounterResult<u64> {
            futures::future::pending().await
        }

        async fn get(&self, _: &str) -> CounterResult<u64> {
            futures::future::pending().await
        }

        async fn increment_many(&self, _: &[(String, u64)], _: Duration) -> CounterResult<Vec<u64>> {
            futures::future::pending().await
        }

        async fn get_many(&self, _: &[String]) -> CounterResult<Vec<u64>> {
            futures::future::pending().await
        }
    }

    fn limiter_over(counters: Arc<dyn CounterStore>, mode: FailureMode) -> RateLimiter {
        RateLimiter::new(
            counters,
            Arc::new(ManualClock::new(T0)),
            LimiterConfig::default().with_failure_mode(mode),
        )
    }

    #[tokio::test]
    async fn test_inactive_plan_always_rejects() {
        let h = harness();
        let mut plan = plan(RateLimits::new(1_000_000, 1_000_000, 1_000_000));
        plan.active = false;

        for _ in 0..3 {
            let result = h.limiter.check_limit(&plan, "model-a", 10, 10).await;
            assert!(!result.allowed);
            assert_eq!(result.reason, RejectReason::PlanInactive);
            assert_eq!(result.retry_after_seconds, 0);
        }
        assert_eq!(h.limiter.stats().decisions(RejectReason::PlanInactive), 3);
    }

    #[tokio::test]
    async fn test_model_permission_check_is_idempotent() {
        let h = harness();
        let plan = plan(RateLimits::default());

        for _ in 0..5 {
            let result = h.limiter.check_limit(&plan, "model-b", 1, 1).await;
            assert_eq!(result.reason, RejectReason::ModelNotPermitted);
            assert_eq!(result.retry_after_seconds, 0);
        }

        let wildcard = plan.clone().with_permissions([MODEL_WILDCARD]);
        assert!(h.limiter.check_limit(&wildcard, "model-b", 1, 1).await.allowed);
    }

    #[tokio::test]
    async fn test_malformed_model_id_not_permitted() {
        let h = harness();
        let plan = plan(RateLimits::default()).with_permissions([MODEL_WILDCARD]);
        let result = h.limiter.check_limit(&plan, "", 1, 1).await;
        assert_eq!(result.reason, RejectReason::ModelNotPermitted);
        assert!(h.limiter.record_usage(&plan, "bad\nmodel", 1, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_rpm_two_scenario() {
        let h = harness();
        let plan = plan(RateLimits::new(1000, 1000, 2));
        h.clock.advance(10);

        for _ in 0..2 {
            let result = h.limiter.check_limit(&plan, "model-a", 10, 10).await;
            assert!(result.allowed);
            h.limiter.record_usage(&plan, "model-a", 10, 10).await.unwrap();
        }

        let result = h.limiter.check_limit(&plan, "model-a", 10, 10).await;
        assert!(!result.allowed);
        assert_eq!(result.reason, RejectReason::RpmExceeded);
        assert_eq!(result.retry_after_seconds, 50);

        let usage = result.usage.unwrap();
        assert_eq!(usage.rpm.current, 2);
        assert_eq!(usage.input_tpm.current, 20);
        assert_eq!(usage.window_start, T0);

        // Next window starts clean.
        h.clock.advance(50);
        assert!(h.limiter.check_limit(&plan, "model-a", 10, 10).await.allowed);
    }

    #[tokio::test]
    async fn test_model_override_scenario() {
        let h = harness();
        let plan = UsagePlan::new("svc", EntityType::Service)
            .with_permissions(["big-model", "small-model"])
            .with_default_limits(RateLimits::new(500, 500, 10))
            .with_model_limit("big-model", RateLimits::new(100, 100, 100));

        let result = h.limiter.check_limit(&plan, "big-model", 150, 10).await;
        assert_eq!(result.reason, RejectReason::InputTpmExceeded);
        assert!(result.retry_after_seconds >= 1);
        assert_eq!(result.usage.unwrap().input_tpm.limit, 100);

        let result = h.limiter.check_limit(&plan, "small-model", 150, 10).await;
        assert!(result.allowed);
        assert_eq!(result.usage.unwrap().input_tpm.limit, 500);
    }

    #[tokio::test]
    async fn test_output_tpm_rejection() {
        let h = harness();
        let plan = plan(RateLimits::new(1000, 100, 10));
        h.limiter.record_usage(&plan, "model-a", 0, 90).await.unwrap();

        let result = h.limiter.check_limit(&plan, "model-a", 10, 11).await;
        assert_eq!(result.reason, RejectReason::OutputTpmExceeded);

        // Exactly reaching the limit is allowed.
        assert!(h.limiter.check_limit(&plan, "model-a", 10, 10).await.allowed);
    }

    #[tokio::test]
    async fn test_evaluation_order_reports_rpm_first() {
        let h = harness();
        let plan = plan(RateLimits::new(10, 10, 1));
        h.limiter.record_usage(&plan, "model-a", 10, 10).await.unwrap();

        let result = h.limiter.check_limit(&plan, "model-a", 5, 5).await;
        assert_eq!(result.reason, RejectReason::RpmExceeded);
    }

    #[tokio::test]
    async fn test_zero_limit_always_rejects() {
        let h = harness();

        let result = h
            .limiter
            .check_limit(&plan(RateLimits::new(1000, 1000, 0)), "model-a", 0, 0)
            .await;
        assert_eq!(result.reason, RejectReason::RpmExceeded);

        let result = h
            .limiter
            .check_limit(&plan(RateLimits::new(0, 1000, 10)), "model-a", 0, 0)
            .await;
        assert_eq!(result.reason, RejectReason::InputTpmExceeded);
    }

    #[tokio::test]
    async fn test_zero_estimate_checks_only_rpm() {
        let h = harness();
        let plan = plan(RateLimits::new(100, 100, 10));
        h.limiter.record_usage(&plan, "model-a", 500, 500).await.unwrap();

        // Token windows are exhausted but nothing is being charged against them.
        let result = h.limiter.check_limit(&plan, "model-a", 0, 0).await;
        assert!(result.allowed);

        let result = h.limiter.check_limit(&plan, "model-a", 1, 0).await;
        assert_eq!(result.reason, RejectReason::InputTpmExceeded);
    }

    #[tokio::test]
    async fn test_check_does_not_commit() {
        let h = harness();
        let plan = plan(RateLimits::new(1000, 1000, 1));

        for _ in 0..10 {
            assert!(h.limiter.check_limit(&plan, "model-a", 100, 100).await.allowed);
        }
        assert!(h.counters.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_is_monotonic_within_window() {
        let h = harness();
        let plan = plan(RateLimits::new(100, 1000, 1000));
        h.limiter.record_usage(&plan, "model-a", 90, 0).await.unwrap();

        assert_eq!(
            h.limiter.check_limit(&plan, "model-a", 20, 1).await.reason,
            RejectReason::InputTpmExceeded
        );

        for _ in 0..3 {
            h.clock.advance(5);
            h.limiter.record_usage(&plan, "model-a", 1, 1).await.unwrap();
            let result = h.limiter.check_limit(&plan, "model-a", 20, 1).await;
            assert!(!result.allowed);
        }
    }

    #[tokio::test]
    async fn test_window_reset_and_counter_expiry() {
        let h = harness();
        let plan = plan(RateLimits::new(1000, 1000, 10));
        let snapshot = h.limiter.record_usage(&plan, "model-a", 7, 3).await.unwrap();
        assert_eq!(snapshot.rpm.current, 1);
        assert_eq!(snapshot.input_tpm.current, 7);

        h.clock.advance(60);
        let result = h.limiter.check_limit(&plan, "model-a", 1, 1).await;
        let usage = result.usage.unwrap();
        assert_eq!(usage.rpm.current, 0);
        assert_eq!(usage.window_start, T0 + 60);

        // The old bucket's keys expire 90s after creation.
        let old_key = crate::window::counter_key(
            "tollgate:",
            &plan.key(),
            "model-a",
            Metric::Rpm,
            T0 / 60,
        );
        assert_eq!(h.counters.get(&old_key).await.unwrap(), 1);
        h.clock.advance(30);
        assert_eq!(h.counters.get(&old_key).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_commute() {
        let h = harness();
        let limiter = Arc::new(h.limiter);
        let plan = Arc::new(plan(RateLimits::default()));

        let tasks: Vec<_> = (0..50u64)
            .map(|i| {
                let limiter = limiter.clone();
                let plan = plan.clone();
                tokio::spawn(async move {
                    limiter.record_usage(&plan, "model-a", i, 2 * i).await.unwrap();
                })
            })
            .collect();
        futures::future::join_all(tasks).await;

        let usage = limiter.check_limit(&plan, "model-a", 1, 1).await.usage.unwrap();
        assert_eq!(usage.rpm.current, 50);
        assert_eq!(usage.input_tpm.current, (0..50).sum::<u64>());
        assert_eq!(usage.output_tpm.current, 2 * (0..50).sum::<u64>());

        let recorded = limiter.stats().model_usage("model-a").unwrap();
        assert_eq!(recorded.request_count, 50);
    }

    #[tokio::test]
    async fn test_fail_closed() {
        let limiter = limiter_over(Arc::new(DownCounterStore), FailureMode::Closed);
        let plan = plan(RateLimits::default());

        let result = limiter.check_limit(&plan, "model-a", 1, 1).await;
        assert_eq!(
            result,
            RateLimitResult::reject(RejectReason::ServiceDegraded, 1, None)
        );
        assert!(limiter.try_check_limit(&plan, "model-a", 1, 1).await.is_err());
        assert!(limiter.record_usage(&plan, "model-a", 1, 1).await.is_err());
        assert_eq!(limiter.stats().snapshot().record_failures, 1);
    }

    #[tokio::test]
    async fn test_fail_open() {
        let limiter = limiter_over(Arc::new(DownCounterStore), FailureMode::Open);
        let plan = plan(RateLimits::default());

        let result = limiter.check_limit(&plan, "model-a", 1, 1).await;
        assert!(result.allowed);
        assert_eq!(result.reason, RejectReason::Ok);
        assert!(result.usage.is_none());
    }

    #[tokio::test]
    async fn test_config_rejections_skip_the_store() {
        let limiter = limiter_over(Arc::new(DownCounterStore), FailureMode::Closed);
        let mut plan = plan(RateLimits::default());

        let result = limiter.check_limit(&plan, "model-z", 1, 1).await;
        assert_eq!(result.reason, RejectReason::ModelNotPermitted);

        plan.active = false;
        let result = limiter.check_limit(&plan, "model-a", 1, 1).await;
        assert_eq!(result.reason, RejectReason::PlanInactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_is_bounded() {
        let limiter = limiter_over(Arc::new(HungCounterStore), FailureMode::Closed);
        let plan = plan(RateLimits::default());

        let result = limiter.check_limit(&plan, "model-a", 1, 1).await;
        assert_eq!(result.reason, RejectReason::ServiceDegraded);

        let err = limiter.record_usage(&plan, "model-a", 1, 1).await.unwrap_err();
        assert!(matches!(err, LimiterError::Counter(CounterError::Timeout(_))));
    }
}
