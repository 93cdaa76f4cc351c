//! filerocket relay server

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;

use filerocket_relay_core::logging::{log_startup, setup_logging, LoggingConfig};
use filerocket_relay_core::{spawn_sweeper, RelayConfig, RelayCoordinator};
use filerocket_server::{serve, AppState};

#[derive(Debug, Parser)]
#[command(name = "filerocket", version, about = "Pickup-code file relay")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "FILEROCKET_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides `server.bind_address`
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level, overrides `logging.level`
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = RelayConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.json_logs {
        config.logging.json = true;
    }

    setup_logging(LoggingConfig::from_settings(&config.logging)?)?;
    log_startup(env!("CARGO_PKG_VERSION"));

    let coordinator = RelayCoordinator::from_config(&config)
        .await
        .context("initialising session registry")?;
    let sweeper = spawn_sweeper(
        coordinator.clone(),
        config.session.sweep_interval(),
        config.session.idle_timeout(),
    );

    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("binding {}", config.server.bind_address))?;
    info!("Relay listening on {}", listener.local_addr()?);

    serve(listener, AppState::new(coordinator, &config.server), shutdown_signal()).await?;

    sweeper.abort();
    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
