//! Check command - dry-run an admission decision.

use anyhow::Result;
use clap::Args;
use tollgate_core::Config;
use tollgate_core::config::CounterBackend;
use tollgate_core::types::EntityType;
use tollgate_gateway::{AdmissionShim, CallerIdentity, Gateway, TokenEstimate};

use crate::ui;

/// Check command arguments.
#[derive(Debug, Clone, Args)]
pub struct CheckArgs {
    /// Entity type: user, service, api_key, department, project
    pub entity_type: EntityType,

    /// Entity identifier
    pub entity_id: String,

    /// Model to check
    #[arg(long)]
    pub model: String,

    /// Estimated input tokens
    #[arg(long, default_value_t = 0)]
    pub input_tokens: u64,

    /// Estimated output tokens
    #[arg(long, default_value_t = 0)]
    pub output_tokens: u64,
}

/// Run the check command.
///
/// The decision is evaluated against the configured stores but never
/// recorded, so it does not consume quota.
pub async fn run_check(config: &Config, args: CheckArgs, json: bool) -> Result<()> {
    if let Some(warning) = private_counters_warning(config) {
        // Keep JSON output parseable.
        if json {
            tracing::warn!("{warning}");
        } else {
            ui::warning(warning);
        }
    }

    let gateway = Gateway::from_config(config)?;
    let allowed = check_with(&gateway.shim(), &args, json).await?;
    if !allowed {
        tracing::debug!(entity = %args.entity_id, model = %args.model, "Dry run rejected");
    }
    Ok(())
}

/// In-memory counters belong to the process that created them, so a dry run
/// from the CLI never sees a running gateway's windows.
fn private_counters_warning(config: &Config) -> Option<&'static str> {
    match config.counters.backend {
        CounterBackend::Memory => Some(
            "Counter backend is 'memory': usage recorded by a running gateway is not visible, \
             so window limits are checked against empty counters",
        ),
        CounterBackend::Redis => None,
    }
}

async fn check_with(shim: &AdmissionShim, args: &CheckArgs, json: bool) -> Result<bool> {
    let identity = CallerIdentity::new(args.entity_id.clone(), args.entity_type);
    let estimate = TokenEstimate::new(args.input_tokens, args.output_tokens);

    let admission = shim.admit(&identity, &args.model, estimate).await;
    let allowed = admission.is_granted();

    if json {
        println!("{}", serde_json::to_string_pretty(admission.decision())?);
    } else {
        ui::header(&format!("Admission for {} on {}", identity.plan_key(), args.model));
        ui::decision(admission.decision());
    }

    // Dry run: a granted ticket is dropped unrecorded.
    drop(admission);

    Ok(allowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tollgate_core::clock::ManualClock;
    use tollgate_core::counters::MemoryCounterStore;
    use tollgate_core::plans::{MemoryPlanStore, PlanStore};
    use tollgate_core::types::{RateLimits, UsagePlan};
    use tollgate_gateway::PlanCache;
    use tollgate_limiter::{LimiterConfig, RateLimiter};

    async fn shim() -> AdmissionShim {
        let store = Arc::new(MemoryPlanStore::new());
        store
            .put(
                &UsagePlan::new("alice", EntityType::User)
                    .with_permissions(["model-a"])
                    .with_default_limits(RateLimits::new(1000, 1000, 1)),
            )
            .await
            .unwrap();

        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let limiter = RateLimiter::new(
            Arc::new(MemoryCounterStore::new(clock.clone())),
            clock,
            LimiterConfig::default(),
        );
        AdmissionShim::new(Arc::new(PlanCache::new(store)), Arc::new(limiter))
    }

    fn args(model: &str) -> CheckArgs {
        CheckArgs {
            entity_type: EntityType::User,
            entity_id: "alice".to_string(),
            model: model.to_string(),
            input_tokens: 10,
            output_tokens: 10,
        }
    }

    #[tokio::test]
    async fn test_dry_run_does_not_consume_quota() {
        let shim = shim().await;
        // rpm is 1, so a recorded check would reject the second call.
        assert!(check_with(&shim, &args("model-a"), true).await.unwrap());
        assert!(check_with(&shim, &args("model-a"), true).await.unwrap());
    }

    #[test]
    fn test_warns_without_shared_counters() {
        let mut config = Config::default();
        config.counters.backend = CounterBackend::Memory;
        assert!(private_counters_warning(&config).is_some());

        config.counters.backend = CounterBackend::Redis;
        assert!(private_counters_warning(&config).is_none());
    }

    #[tokio::test]
    async fn test_rejected_model() {
        let shim = shim().await;
        assert!(!check_with(&shim, &args("model-b"), true).await.unwrap());
    }
}
