//! CLI command implementations.

pub mod check;
pub mod config;
pub mod gateway;
pub mod plans;

pub use check::run_check;
pub use config::run_config;
pub use gateway::run_gateway;
pub use plans::run_plans;

use std::path::Path;

use anyhow::Context;
use tollgate_core::Config;

/// Load configuration from `path`, or the default location, with
/// environment overrides applied.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        return Config::load_default().context("Failed to load configuration");
    };

    let mut config = Config::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.apply_overrides(|var| std::env::var(var).ok())?;
    config.validate()?;
    Ok(config)
}
