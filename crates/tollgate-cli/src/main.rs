//! Tollgate CLI - admission control and usage metering for LLM gateways.

mod commands;
mod ui;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tollgate_core::Config;
use tollgate_core::config::{GlobalSettings, LogFormat};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use commands::{
    check::CheckArgs, config::ConfigAction, gateway::GatewayAction, plans::PlansAction,
};

#[derive(Parser)]
#[command(name = "tollgate")]
#[command(about = "Tollgate - per-tenant admission control for LLM gateways")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to $TOLLGATE_STATE_DIR/tollgate.json)
    #[arg(long, global = true, env = "TOLLGATE_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Print JSON instead of formatted output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Gateway operations
    Gateway {
        #[command(subcommand)]
        action: GatewayAction,
    },

    /// Usage plan management
    Plans {
        #[command(subcommand)]
        action: PlansAction,
    },

    /// Dry-run an admission check without consuming quota
    Check(CheckArgs),

    /// Configuration show/validate
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

fn init_logging(verbose: bool, settings: &GlobalSettings) {
    let default_level = if verbose || settings.debug {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    match settings.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).init(),
    }
}

/// Load configuration and install logging per its settings.
fn setup(verbose: bool, config_path: Option<&Path>) -> anyhow::Result<Config> {
    let config = commands::load_config(config_path);
    let settings = config
        .as_ref()
        .map(|c| c.settings.clone())
        .unwrap_or_default();
    init_logging(verbose, &settings);
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let Some(command) = cli.command else {
        ui::banner();
        ui::info("Run 'tollgate gateway run' to start the admin API, or 'tollgate --help' for all commands.");
        return Ok(());
    };

    match command {
        Commands::Gateway { action } => {
            let config = setup(cli.verbose, config_path)?;
            commands::run_gateway(config, action).await?;
        }
        Commands::Plans { action } => {
            let config = setup(cli.verbose, config_path)?;
            commands::run_plans(&config, action, cli.json).await?;
        }
        Commands::Check(args) => {
            let config = setup(cli.verbose, config_path)?;
            commands::run_check(&config, args, cli.json).await?;
        }
        Commands::Config { action } => {
            // Config commands report their own load errors.
            init_logging(cli.verbose, &GlobalSettings::default());
            commands::run_config(config_path, action.unwrap_or_default())?;
        }
    }

    Ok(())
}
