//! Config show/validate command.

use std::path::Path;

use anyhow::Result;
use clap::Subcommand;
use tollgate_core::Config;

use crate::ui;

/// Config actions.
#[derive(Debug, Clone, Copy, Default, Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration
    #[default]
    Show,

    /// Validate the configuration file
    Validate,

    /// Write a default configuration file if none exists
    Init,
}

/// Run the config command.
pub fn run_config(path: Option<&Path>, action: ConfigAction) -> Result<()> {
    let config_path = path.map_or_else(Config::default_path, Path::to_path_buf);

    match action {
        ConfigAction::Show => show_config(path),
        ConfigAction::Validate => {
            validate_config(&config_path);
            Ok(())
        }
        ConfigAction::Init => init_config(&config_path),
    }
}

/// Show the configuration after defaults and environment overrides.
fn show_config(path: Option<&Path>) -> Result<()> {
    let config = super::load_config(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Validate the configuration file, reporting each stage.
fn validate_config(config_path: &Path) {
    ui::header("Validating Configuration");
    ui::kv("File", &config_path.display().to_string());

    if !config_path.exists() {
        ui::warning("Config file not found, defaults apply");
        return;
    }

    let content = match std::fs::read_to_string(config_path) {
        Ok(content) => content,
        Err(e) => {
            ui::error(&format!("Cannot read file: {e}"));
            return;
        }
    };

    if let Err(e) = json5::from_str::<serde_json::Value>(&content) {
        ui::error(&format!("Syntax error: {e}"));
        return;
    }
    ui::success("Syntax: Valid JSON5");

    let mut config = match json5::from_str::<Config>(&content) {
        Ok(config) => config,
        Err(e) => {
            ui::error(&format!("Schema error: {e}"));
            return;
        }
    };
    ui::success("Schema: All sections parse");

    if let Err(e) = config.apply_overrides(|var| std::env::var(var).ok()) {
        ui::error(&format!("Environment: {e}"));
        return;
    }

    match config.validate() {
        Ok(()) => ui::success("Values: Configuration is valid"),
        Err(e) => ui::error(&e.to_string()),
    }
}

/// Write the default configuration.
fn init_config(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        ui::info(&format!(
            "Config file already exists: {}",
            config_path.display()
        ));
        return Ok(());
    }

    Config::default().save(config_path)?;
    ui::success(&format!("Wrote {}", config_path.display()));
    Ok(())
}
