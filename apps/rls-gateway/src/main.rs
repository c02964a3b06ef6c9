mod config;
mod routes;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use modkit_rls::{ProcessClient, RlsState, UrlConnector};
use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, LoggingConfig};

/// RLS gateway - serves requests against `PostgreSQL` under per-request row-level security context
#[derive(Parser)]
#[command(name = "rls-gateway")]
#[command(about = "Serves requests against PostgreSQL under per-request row-level security context")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port override for HTTP server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print effective configuration (JSON) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = cli.config.as_ref().filter(|p| !p.is_file()) {
        anyhow::bail!("config file does not exist: {}", path.display());
    }

    // 1) defaults -> 2) YAML (if provided) -> 3) env (APP__*) -> 4) CLI overrides
    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_cli_overrides(cli.port, cli.verbose);

    if cli.print_config {
        println!(
            "{}",
            serde_json::to_string_pretty(&config.redacted()?)?
        );
        return Ok(());
    }

    init_logging(&config.logging)?;

    // invalid role names abort startup here
    let rls = config
        .rls
        .clone()
        .resolve()
        .context("invalid rls configuration")?;
    tracing::info!(
        scoped = rls.needs_scope(),
        session_key = ?rls.session_config_key,
        role_claim = ?rls.role_claim,
        default_role = ?rls.default_role.as_ref().map(ToString::to_string),
        "RLS configuration resolved"
    );

    let client = Arc::new(ProcessClient::new(
        Arc::new(UrlConnector::new(config.database.connect_options())),
        rls.startup_role().cloned(),
    ));
    let app = routes::router(RlsState::new(rls, client), config.server.timeout());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
    tracing::info!(addr = %config.server.bind_addr, "HTTP server bound");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!(e))
}

fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .with_context(|| format!("invalid log level '{}'", cfg.level))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if cfg.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
    .map_err(|e| anyhow::anyhow!(e))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("HTTP server shutting down gracefully");
}
