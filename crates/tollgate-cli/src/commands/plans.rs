//! Plans command - manage usage plans in the configured plan store.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tollgate_core::Config;
use tollgate_core::plans::open_plan_store;
use tollgate_core::types::{DEFAULT_TENANT_ID, EntityType, PlanKey, RateLimits, UsagePlan};
use tollgate_gateway::{
    CreateUsagePlan, PlanCache, RateLimitsPatch, UsagePlanAdmin, UsagePlanPatch,
};

use crate::ui;

/// Identifies one plan.
#[derive(Debug, Clone, Args)]
pub struct PlanKeyArgs {
    /// Entity type: user, service, api_key, department, project
    pub entity_type: EntityType,

    /// Entity identifier
    pub entity_id: String,
}

impl PlanKeyArgs {
    fn key(&self) -> PlanKey {
        PlanKey::new(self.entity_id.clone(), self.entity_type)
    }
}

/// Limit flags shared by create and update.
#[derive(Debug, Clone, Default, Args)]
pub struct LimitArgs {
    /// Requests per minute
    #[arg(long)]
    pub rpm: Option<u64>,

    /// Input tokens per minute
    #[arg(long)]
    pub input_tpm: Option<u64>,

    /// Output tokens per minute
    #[arg(long)]
    pub output_tpm: Option<u64>,

    /// Per-model override as MODEL=INPUT_TPM,OUTPUT_TPM,RPM (repeatable)
    #[arg(long = "model-limit", value_parser = parse_model_limit)]
    pub model_limits: Vec<(String, RateLimits)>,
}

impl LimitArgs {
    fn is_empty(&self) -> bool {
        self.rpm.is_none() && self.input_tpm.is_none() && self.output_tpm.is_none()
    }

    const fn patch(&self) -> RateLimitsPatch {
        RateLimitsPatch {
            input_tpm: self.input_tpm,
            output_tpm: self.output_tpm,
            rpm: self.rpm,
        }
    }
}

/// Plan actions.
#[derive(Debug, Clone, Subcommand)]
pub enum PlansAction {
    /// Create or replace a usage plan
    Create {
        #[command(flatten)]
        key: PlanKeyArgs,

        /// Owning tenant
        #[arg(long)]
        tenant: Option<String>,

        /// Cost budget identifier
        #[arg(long)]
        budget: Option<String>,

        /// Permitted model, or "*" for all (repeatable)
        #[arg(long = "model")]
        models: Vec<String>,

        #[command(flatten)]
        limits: LimitArgs,

        /// Create the plan deactivated
        #[arg(long)]
        inactive: bool,
    },

    /// Show a usage plan
    Get {
        #[command(flatten)]
        key: PlanKeyArgs,
    },

    /// List the usage plans of a tenant
    List {
        /// Tenant identifier
        #[arg(long, default_value = DEFAULT_TENANT_ID)]
        tenant: String,
    },

    /// Update fields of a usage plan
    Update {
        #[command(flatten)]
        key: PlanKeyArgs,

        /// Move to another tenant
        #[arg(long)]
        tenant: Option<String>,

        /// New cost budget identifier
        #[arg(long)]
        budget: Option<String>,

        /// Replace permitted models (repeatable)
        #[arg(long = "model")]
        models: Vec<String>,

        #[command(flatten)]
        limits: LimitArgs,

        /// Activate or deactivate
        #[arg(long)]
        active: Option<bool>,
    },

    /// Deactivate a usage plan
    Deactivate {
        #[command(flatten)]
        key: PlanKeyArgs,
    },
}

/// Parse `MODEL=INPUT_TPM,OUTPUT_TPM,RPM`.
fn parse_model_limit(value: &str) -> Result<(String, RateLimits), String> {
    let (model, limits) = value
        .split_once('=')
        .ok_or_else(|| format!("expected MODEL=INPUT_TPM,OUTPUT_TPM,RPM, got '{value}'"))?;

    let numbers = limits
        .split(',')
        .map(|n| n.trim().parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid limit in '{value}': {e}"))?;

    match numbers.as_slice() {
        [input_tpm, output_tpm, rpm] if !model.is_empty() => Ok((
            model.to_string(),
            RateLimits::new(*input_tpm, *output_tpm, *rpm),
        )),
        _ => Err(format!(
            "expected MODEL=INPUT_TPM,OUTPUT_TPM,RPM, got '{value}'"
        )),
    }
}

/// Run the plans command.
pub async fn run_plans(config: &Config, action: PlansAction, json: bool) -> Result<()> {
    let store = open_plan_store(config).with_context(|| {
        format!(
            "Failed to open plan store at {} (is the gateway running?)",
            config.plans_path().display()
        )
    })?;
    let admin = UsagePlanAdmin::new(Arc::new(PlanCache::new(store)));
    run_with(&admin, action, json).await
}

async fn run_with(admin: &UsagePlanAdmin, action: PlansAction, json: bool) -> Result<()> {
    match action {
        PlansAction::Create {
            key,
            tenant,
            budget,
            models,
            limits,
            inactive,
        } => {
            let mut request = CreateUsagePlan::new(key.entity_id, key.entity_type);
            request.tenant_id = tenant;
            request.budget_id = budget;
            request.model_permissions = models;
            request.active = Some(!inactive);
            if !limits.is_empty() {
                request.default_limits = Some(limits.patch().apply_to(RateLimits::default()));
            }
            request.model_limits = limits.model_limits.into_iter().collect();

            let plan = admin.create_usage_plan(request).await?;
            show(&plan, json)?;
            if !json {
                ui::success("Usage plan saved");
            }
        }

        PlansAction::Get { key } => {
            let plan = admin.get_usage_plan(&key.key()).await?;
            show(&plan, json)?;
        }

        PlansAction::List { tenant } => {
            let plans = admin.list_usage_plans(&tenant).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plans)?);
            } else {
                list(&tenant, &plans);
            }
        }

        PlansAction::Update {
            key,
            tenant,
            budget,
            models,
            limits,
            active,
        } => {
            let key = key.key();
            let mut patch = UsagePlanPatch {
                tenant_id: tenant,
                budget_id: budget,
                active,
                ..UsagePlanPatch::default()
            };
            if !models.is_empty() {
                patch.model_permissions = Some(models.into_iter().collect::<BTreeSet<_>>());
            }
            if !limits.is_empty() {
                patch.default_limits = Some(limits.patch());
            }
            if !limits.model_limits.is_empty() {
                patch.model_limits = Some(
                    limits
                        .model_limits
                        .into_iter()
                        .map(|(model, full)| (model, Some(RateLimitsPatch::from(full))))
                        .collect(),
                );
            }

            let plan = admin.update_usage_plan(&key, patch).await?;
            show(&plan, json)?;
            if !json {
                ui::success("Usage plan updated");
            }
        }

        PlansAction::Deactivate { key } => {
            let plan = admin.deactivate_usage_plan(&key.key()).await?;
            show(&plan, json)?;
            if !json {
                ui::success("Usage plan deactivated");
            }
        }
    }

    Ok(())
}

fn show(plan: &UsagePlan, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(plan)?);
    } else {
        ui::plan(plan);
    }
    Ok(())
}

fn list(tenant: &str, plans: &[UsagePlan]) {
    ui::header(&format!("Usage plans for tenant {tenant}"));
    if plans.is_empty() {
        ui::info("No usage plans");
        return;
    }

    ui::table_row(&[("TYPE", 12), ("ENTITY", 32), ("ACTIVE", 8), ("RPM", 10)]);
    for plan in plans {
        let rpm = plan.default_limits.rpm.to_string();
        ui::table_row(&[
            (plan.entity_type.as_str(), 12),
            (&plan.entity_id, 32),
            (if plan.active { "yes" } else { "no" }, 8),
            (&rpm, 10),
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tollgate_core::plans::MemoryPlanStore;

    fn admin() -> UsagePlanAdmin {
        UsagePlanAdmin::new(Arc::new(PlanCache::new(Arc::new(MemoryPlanStore::new()))))
    }

    fn key(entity_id: &str) -> PlanKeyArgs {
        PlanKeyArgs {
            entity_type: EntityType::User,
            entity_id: entity_id.to_string(),
        }
    }

    #[test]
    fn test_parse_model_limit() {
        assert_eq!(
            parse_model_limit("big-model=1000,500,10").unwrap(),
            ("big-model".to_string(), RateLimits::new(1000, 500, 10))
        );
        assert!(parse_model_limit("big-model").is_err());
        assert!(parse_model_limit("=1,2,3").is_err());
        assert!(parse_model_limit("m=1,2").is_err());
        assert!(parse_model_limit("m=1,x,3").is_err());
    }

    #[test]
    fn test_limit_flags_patch_only_given_dimensions() {
        let args = LimitArgs {
            rpm: Some(5),
            ..LimitArgs::default()
        };
        assert_eq!(
            args.patch().apply_to(RateLimits::new(1, 2, 3)),
            RateLimits::new(1, 2, 5)
        );
    }

    #[tokio::test]
    async fn test_create_then_update_merges_limits() {
        let admin = admin();

        run_with(
            &admin,
            PlansAction::Create {
                key: key("alice"),
                tenant: Some("acme".to_string()),
                budget: None,
                models: vec!["model-a".to_string()],
                limits: LimitArgs {
                    rpm: Some(2),
                    model_limits: vec![("model-a".to_string(), RateLimits::new(10, 10, 1))],
                    ..LimitArgs::default()
                },
                inactive: false,
            },
            true,
        )
        .await
        .unwrap();

        run_with(
            &admin,
            PlansAction::Update {
                key: key("alice"),
                tenant: None,
                budget: None,
                models: Vec::new(),
                limits: LimitArgs {
                    output_tpm: Some(7),
                    model_limits: vec![("model-b".to_string(), RateLimits::new(20, 20, 2))],
                    ..LimitArgs::default()
                },
                active: None,
            },
            true,
        )
        .await
        .unwrap();

        let plan = admin.get_usage_plan(&key("alice").key()).await.unwrap();
        assert_eq!(plan.tenant_id, "acme");
        assert_eq!(plan.default_limits, RateLimits::new(40_000, 7, 2));
        assert_eq!(plan.model_limits.len(), 2);
        assert!(plan.permits_model("model-a"));
        assert!(!plan.permits_model("model-b"));
    }

    #[tokio::test]
    async fn test_missing_plan_is_an_error() {
        let admin = admin();
        let result = run_with(&admin, PlansAction::Get { key: key("ghost") }, true).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_deactivate() {
        let admin = admin();
        admin
            .create_usage_plan(CreateUsagePlan::new("bob", EntityType::User))
            .await
            .unwrap();

        run_with(&admin, PlansAction::Deactivate { key: key("bob") }, true)
            .await
            .unwrap();
        assert!(!admin.get_usage_plan(&key("bob").key()).await.unwrap().active);
    }
}
