//! Gateway command - start and probe the admin server.

use crate::ui;
use anyhow::Result;
use clap::Subcommand;
use tollgate_core::Config;
use tollgate_core::config::{BindMode, CounterBackend, FailureMode, PlanBackend};

/// Gateway actions.
#[derive(Debug, Clone, Subcommand)]
pub enum GatewayAction {
    /// Start the gateway server
    Run {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (local, public, or a host)
        #[arg(long)]
        bind: Option<String>,

        /// Force start even if the port is in use
        #[arg(long)]
        force: bool,
    },

    /// Check gateway status
    Status,
}

/// Run the gateway command.
pub async fn run_gateway(config: Config, action: GatewayAction) -> Result<()> {
    match action {
        GatewayAction::Run { port, bind, force } => run_server(config, port, bind, force).await,
        GatewayAction::Status => gateway_status(&config).await,
    }
}

fn bind_mode(bind: &str) -> BindMode {
    match bind {
        "local" | "loopback" => BindMode::Local,
        "public" | "lan" => BindMode::Public,
        host => BindMode::Custom(host.to_string()),
    }
}

async fn run_server(
    mut config: Config,
    port: Option<u16>,
    bind: Option<String>,
    force: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.gateway.port = port;
    }
    if let Some(bind) = bind {
        config.gateway.mode = bind_mode(&bind);
    }

    let address = config.gateway.bind_address();

    if !force && std::net::TcpListener::bind(&address).is_err() {
        ui::error(&format!(
            "Address {address} is already in use. Use --force to override."
        ));
        return Ok(());
    }

    ui::banner();
    ui::header("Starting Tollgate Gateway");
    ui::kv("Address", &address);
    ui::kv(
        "Plans",
        match config.plans.backend {
            PlanBackend::Memory => "memory",
            PlanBackend::Sled => "sled",
        },
    );
    ui::kv(
        "Counters",
        match config.counters.backend {
            CounterBackend::Memory => "memory",
            CounterBackend::Redis => "redis",
        },
    );
    ui::kv(
        "Failure mode",
        match config.limiter.failure_mode {
            FailureMode::Closed => "closed",
            FailureMode::Open => "open",
        },
    );
    println!();

    ui::info("Press Ctrl+C to stop");
    println!();

    tollgate_gateway::start(&config).await?;

    Ok(())
}

async fn gateway_status(config: &Config) -> Result<()> {
    ui::header("Gateway Status");

    let port = config.gateway.port;
    let client = reqwest::Client::new();

    match client
        .get(format!("http://127.0.0.1:{port}/health"))
        .timeout(std::time::Duration::from_secs(2))
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            ui::success(&format!("Gateway is running on port {port}"));
            if let Ok(body) = resp.json::<serde_json::Value>().await {
                if let Some(version) = body.get("version").and_then(|v| v.as_str()) {
                    ui::kv("Version", version);
                }
                if let Some(status) = body.get("status").and_then(|v| v.as_str()) {
                    ui::kv("Status", status);
                }
            }
        }
        Ok(resp) => {
            ui::warning(&format!("Health check returned {}", resp.status()));
        }
        Err(e) => {
            tracing::debug!(error = %e, "Health check failed");
            ui::warning(&format!("Gateway is not running on port {port}"));
            ui::info("Start with: tollgate gateway run");
        }
    }

    Ok(())
}
