//! RustChat - real-time TCP chat server
//!
//! Every chunk a client sends is rebroadcast to all other connected clients.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rustchat::{
    config::ConfigManager,
    metrics::{Metrics, MetricsServer},
    ConnectionManager, ShutdownCoordinator,
};

/// CLI arguments for RustChat
#[derive(Parser, Debug)]
#[command(name = "rustchat")]
#[command(about = "RustChat - real-time TCP chat server")]
#[command(version)]
#[command(long_about = "
RustChat - real-time TCP chat server

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file (when it exists)
3. Environment variables (when no configuration file exists)
4. Built-in defaults

Environment variables:
  RUSTCHAT_BIND_ADDR          - Bind address (e.g., 127.0.0.1:3030)
  RUSTCHAT_MAX_CONNECTIONS    - Maximum concurrent connections
  RUSTCHAT_IDLE_TIMEOUT       - Disconnect silent clients after this long (e.g., 10m)
  RUSTCHAT_READ_CHUNK_SIZE    - Bytes read per receive
  RUSTCHAT_LOG_LEVEL          - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "rustchat.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    /// Host to bind to (overrides config file)
    #[arg(long, help = "Host to bind to (e.g., 127.0.0.1)")]
    pub host: Option<IpAddr>,

    /// Port to bind to (overrides config file)
    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Maximum number of concurrent connections
    #[arg(long, help = "Maximum number of concurrent connections")]
    pub max_connections: Option<usize>,

    /// Idle timeout (e.g., 30s, 10m)
    #[arg(long, value_parser = humantime::parse_duration, help = "Disconnect clients silent for this long")]
    pub idle_timeout: Option<Duration>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Configuration file if present, otherwise environment; CLI flags override either
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    // Reject bad levels before EnvFilter sees them.
    config
        .validate_logging_config()
        .context("Invalid log level")?;

    init_tracing(&args, &config.logging.level);

    info!("Starting RustChat v{}", env!("CARGO_PKG_VERSION"));
    if args.config.exists() {
        info!("Configuration loaded from {}", args.config.display());
    } else {
        info!("Config file {} not found, using environment and defaults", args.config.display());
    }

    config.merge_with_cli_args(
        args.host,
        args.port,
        args.max_connections,
        args.idle_timeout,
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Bind address: {}", config.server.bind_addr);
        info!("  Max connections: {}", config.server.max_connections);
        info!("  Read chunk size: {} bytes", config.server.read_chunk_size);
        info!("  Idle timeout: {:?}", config.server.idle_timeout);
        info!(
            "  Metrics: {}",
            if config.metrics.enabled {
                config.metrics.bind_addr.to_string()
            } else {
                "disabled".to_string()
            }
        );
        return Ok(());
    }

    let metrics = Arc::new(Metrics::new().context("Failed to create metrics registry")?);

    let metrics_handle = if config.metrics.enabled {
        let server = MetricsServer::bind(Arc::clone(&metrics), config.metrics.bind_addr).await?;
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        info!("Metrics server disabled");
        None
    };

    let mut manager = ConnectionManager::new(Arc::new(config), Arc::clone(&metrics));
    manager
        .bind()
        .await
        .context("Failed to start chat server")?;
    let manager = Arc::new(manager);

    let shutdown_coordinator = ShutdownCoordinator::new();
    let mut shutdown_rx = shutdown_coordinator.subscribe();

    let accept_manager = Arc::clone(&manager);
    let mut server_handle = tokio::spawn(async move { accept_manager.accept_connections().await });

    info!("Press Ctrl+C or send SIGTERM to shut down");

    let signal_task = tokio::spawn(async move {
        if let Err(e) = shutdown_coordinator.listen_for_signals().await {
            error!("Error setting up signal handlers: {}", e);
        }
    });

    let server_result = tokio::select! {
        joined = &mut server_handle => Some(joined),
        _ = shutdown_rx.recv() => None,
    };

    let outcome = match server_result {
        Some(Ok(Ok(()))) => {
            info!("Accept loop finished");
            Ok(())
        }
        Some(Ok(Err(e))) => {
            error!("Server error: {}", e);
            Err(anyhow::Error::new(e).context("Chat server stopped"))
        }
        Some(Err(e)) => {
            error!("Server task failed: {}", e);
            Err(anyhow::Error::new(e).context("Chat server task failed"))
        }
        None => {
            info!("Initiating graceful shutdown...");
            Ok(())
        }
    };

    let remaining = manager.shutdown().await;
    if remaining > 0 {
        warn!("{} connections still open at exit", remaining);
    }

    server_handle.abort();
    signal_task.abort();
    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    info!("Server shutdown complete");
    outcome
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, configured_level: &str) {
    let log_level = if args.verbose { "debug" } else { configured_level };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();
}
