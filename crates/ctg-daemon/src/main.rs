//! CTG Relay Daemon - Main entry point
//!
//! Accepts sensor connections, persists their readings, relays them to the
//! inference service, and pushes results to observers.

mod api;
mod auth;
mod config;
mod control;
mod observer_ws;
mod sensor_ws;
mod server;
mod state;

use anyhow::Result;
use clap::Parser;
use ctg_core::MemoryExamRepository;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "ctgd")]
#[command(about = "CTG sensor ingestion and inference relay daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "ctg-relay.toml")]
    config: PathBuf,

    /// Bind address for web server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("CTG relay v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = config::load_config(&args.config)?;

    // Override bind address if specified
    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    info!(
        bind = %config.daemon.bind,
        sensors = config.sensors.entities.len(),
        inference = %config.inference.url,
        "Configuration loaded"
    );

    let repo = Arc::new(MemoryExamRepository::with_retention(
        config.storage.retained_rows,
    ));
    let state = state::AppState::new(config.clone(), repo)?;

    server::run(state, &config.daemon.bind, config.daemon.tls.as_ref()).await?;

    Ok(())
}
