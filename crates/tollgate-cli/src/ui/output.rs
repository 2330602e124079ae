//! Formatted output utilities.

use console::style;
use tollgate_core::types::{RateLimits, UsagePlan};
use tollgate_limiter::RateLimitResult;

/// Print a success message with checkmark.
pub fn success(msg: &str) {
    println!("{} {}", style("✓").green().bold(), msg);
}

/// Print an error message with X.
pub fn error(msg: &str) {
    eprintln!("{} {}", style("✗").red().bold(), msg);
}

/// Print a warning message.
pub fn warning(msg: &str) {
    println!("{} {}", style("⚠").yellow().bold(), msg);
}

/// Print an info message.
pub fn info(msg: &str) {
    println!("{} {}", style("ℹ").blue().bold(), msg);
}

/// Print a header/section title.
pub fn header(msg: &str) {
    println!("\n{}", style(msg).bold().underlined());
}

/// Print a key-value pair.
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", style(key).bold(), value);
}

/// Print a table row.
pub fn table_row(cols: &[(&str, usize)]) {
    for (text, width) in cols {
        print!("{text:width$}");
    }
    println!();
}

fn limits(limits: &RateLimits) -> String {
    format!(
        "rpm {} / input_tpm {} / output_tpm {}",
        limits.rpm, limits.input_tpm, limits.output_tpm
    )
}

/// Print a usage plan summary.
pub fn plan(plan: &UsagePlan) {
    header(&format!("{} ({})", plan.entity_id, plan.entity_type));
    kv("Tenant", &plan.tenant_id);
    kv("Budget", plan.budget_id.as_deref().unwrap_or("-"));
    if plan.active {
        kv("Active", &style("yes").green().to_string());
    } else {
        kv("Active", &style("no").red().to_string());
    }

    let models: Vec<&str> = plan.model_permissions.iter().collect();
    kv(
        "Models",
        &if models.is_empty() {
            style("none").dim().to_string()
        } else {
            models.join(", ")
        },
    );
    kv("Default limits", &limits(&plan.default_limits));

    let mut overrides: Vec<_> = plan.model_limits.iter().collect();
    overrides.sort_by(|a, b| a.0.cmp(b.0));
    for (model, model_limits) in overrides {
        kv(&format!("  {model}"), &limits(model_limits));
    }
}

/// Print an admission decision.
pub fn decision(result: &RateLimitResult) {
    if result.allowed {
        success("Admitted");
    } else {
        warning(&format!("Rejected: {}", result.reason));
    }

    if result.retry_after_seconds > 0 {
        kv("Retry after", &format!("{}s", result.retry_after_seconds));
    }

    if let Some(usage) = &result.usage {
        kv("Window start", &usage.window_start.to_string());
        for (name, metric) in [
            ("rpm", &usage.rpm),
            ("input_tpm", &usage.input_tpm),
            ("output_tpm", &usage.output_tpm),
        ] {
            kv(
                name,
                &format!(
                    "{} / {} ({} remaining)",
                    metric.current,
                    metric.limit,
                    metric.remaining()
                ),
            );
        }
    }
}

/// Print the Tollgate banner.
pub fn banner() {
    println!(
        "{}",
        style(
            r"
  _        _ _             _
 | |_ ___ | | | __ _  __ _| |_ ___
 | __/ _ \| | |/ _` |/ _` | __/ _ \
 | || (_) | | | (_| | (_| | ||  __/
  \__\___/|_|_|\__, |\__,_|\__\___|
               |___/
"
        )
        .cyan()
    );
}
