//! tcp-relay: forwards every client connection to a fixed upstream.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tcp_relay::{
    config::{CliOverrides, ConfigManager},
    metrics::{Metrics, MetricsServer},
    Listener, RelayEngine, ShutdownCoordinator,
};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "tcp-relay")]
#[command(about = "Byte-transparent TCP relay")]
#[command(version)]
#[command(long_about = "
Byte-transparent TCP relay.

Every client accepted on LISTEN gets its own new connection to UPSTREAM;
bytes are copied unmodified in both directions until either side closes.

Configuration priority (highest to lowest), validated once merged:
1. Command-line arguments
2. Configuration file
3. Environment variables (RELAY_LISTEN_ADDR, RELAY_UPSTREAM_ADDR,
   RELAY_BUFFER_SIZE, RELAY_CONNECT_TIMEOUT, RELAY_MAX_CONNECTIONS,
   RELAY_LOG_LEVEL)
4. Built-in defaults (127.0.0.1:6380 -> 127.0.0.1:6379)
")]
pub struct CliArgs {
    /// Local address to accept clients on
    pub listen: Option<String>,

    /// Upstream address every client is relayed to
    pub upstream: Option<String>,

    #[arg(short, long, default_value = "relay.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    #[arg(long, help = "Log level (trace, debug, info, warn, error)")]
    pub log_level: Option<String>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Relay buffer size in bytes")]
    pub buffer_size: Option<usize>,

    #[arg(long, help = "Maximum number of concurrent relay pairs")]
    pub max_connections: Option<usize>,

    #[arg(long, help = "Upstream connect timeout in seconds")]
    pub connect_timeout: Option<u64>,

    #[arg(long, help = "Serve /metrics, /health and /pairs on this address")]
    pub metrics_addr: Option<String>,

    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            listen: self.listen.clone(),
            upstream: self.upstream.clone(),
            buffer_size: self.buffer_size,
            max_connections: self.max_connections,
            connect_timeout: self.connect_timeout,
            metrics_addr: self.metrics_addr.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = ConfigManager::load(&args.config)?;

    init_tracing(&args, &config.monitoring.log_level);
    info!("Starting tcp-relay v{}", env!("CARGO_PKG_VERSION"));

    config.merge_with_cli_args(&args.overrides());
    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Listen address: {}", config.server.listen_addr);
        info!("  Upstream address: {}", config.server.upstream_addr);
        info!("  Buffer size: {} bytes", config.server.buffer_size);
        info!("  Max connections: {}", config.server.max_connections);
        info!("  Connect timeout: {:?}", config.server.connect_timeout);
        return Ok(());
    }

    let config = Arc::new(config);
    let shutdown = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let metrics = Arc::new(Metrics::new().context("Failed to initialize metrics")?);
    let engine = Arc::new(RelayEngine::from_config(&config, Arc::clone(&metrics)));

    let listener = Listener::bind(
        Arc::clone(&config),
        Arc::clone(&engine),
        Arc::clone(&metrics),
        shutdown.clone(),
    )
    .await
    .context("Failed to start listener")?;

    let metrics_handle = match config.monitoring.metrics_addr {
        Some(addr) => {
            let server = MetricsServer::bind(
                addr,
                Arc::clone(&metrics),
                Arc::clone(&engine),
                config.monitoring.prometheus_enabled,
            )
            .await?;
            Some(tokio::spawn(server.run(shutdown.subscribe())))
        }
        None => None,
    };

    let listener = Arc::new(listener);
    let accept_loop = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.run().await })
    };

    if let Err(e) = shutdown.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
        shutdown.trigger();
    }

    info!("Initiating graceful shutdown...");
    match accept_loop.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Listener failed: {:#}", e),
        Err(e) => error!("Listener task failed: {}", e),
    }

    let remaining = listener.shutdown().await;
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    info!(remaining_pairs = remaining, "Relay shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, configured_level: &str) {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or(configured_level)
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true),
        )
        .with(env_filter)
        .init();
}
