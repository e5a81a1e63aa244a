//! Message Queue Broker
//!
//! Standalone broker service for the task orchestration system. It holds
//! the consumer registry, persists message records and fans messages out
//! to registered consumers over HTTP.
// This is the entry point for the broker binary. It is responsible for:
// - Initializing logging and configuration.
// - Opening the broker database and warming the consumer cache.
// - Starting the HTTP server and handling graceful shutdown.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use shared::config::BrokerConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

use mqueue::{broker, AppState};

/// Command-line arguments for the broker
#[derive(Parser, Debug)]
#[command(name = "mqueue-broker")]
#[command(about = "Message queue broker that fans messages out to registered consumers", long_about = None)]
struct CliArgs {
    /// Path to the broker configuration file (broker.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the listen address from config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the data directory from config file
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; RUST_LOG controls verbosity, default info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();

    let mut config: BrokerConfig = shared::config::load_config_file(&args.config_file)?;

    // Apply command-line overrides on top of the file configuration.
    if let Some(listen_address) = args.listen_address {
        config.listen_address = listen_address;
    }
    if let Some(data_dir) = args.data_dir {
        config.store.data_dir = data_dir;
    }
    config.validate()?;

    info!(
        listen_address = %config.listen_address,
        data_dir = %config.store.data_dir.display(),
        "Broker configuration loaded"
    );

    let state = AppState::new(&config).await?;
    let router = broker::create_router(state);

    let listen_address: SocketAddr = config
        .listen_address
        .parse()
        .expect("listen address validated above");
    let listener = tokio::net::TcpListener::bind(listen_address)
        .await
        .with_context(|| format!("Failed to bind {}", listen_address))?;

    info!("Broker listening on {}", listen_address);

    // Serve until interrupted; ctrl-c triggers a graceful stop.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Broker server error")?;

    info!("Broker shutdown complete");
    Ok(())
}
