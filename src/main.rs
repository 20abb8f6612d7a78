//! Mantaro API bootstrap
//!
//! Loads `api.json`, sets up the Redis connection pool, and keeps it alive
//! until the process is asked to stop.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

use mantaro_cache::CachePool;
use mantaro_core::config::cache::CacheConfig;
use mantaro_core::config::logging::LoggingConfig;
use mantaro_core::config::{Config, DEFAULT_CONFIG_FILE};
use mantaro_core::error::AppError;

/// Exit status used after a fresh configuration template was written.
const TEMPLATE_CREATED_EXIT: i32 = -1;

#[derive(Debug, Parser)]
#[command(name = "mantaro-api", version, about = "Mantaro API service bootstrap")]
struct Cli {
    /// Path to the API configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Redis connection URL.
    #[arg(long, env = "MANTARO_REDIS_URL", default_value = "redis://localhost")]
    redis_url: String,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format: `pretty` or `json`.
    #[arg(long, default_value = "pretty")]
    log_format: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(&LoggingConfig {
        level: cli.log_level.clone(),
        format: cli.log_format.clone(),
    });

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) if e.is_template_created() => std::process::exit(TEMPLATE_CREATED_EXIT),
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config, &cli).await {
        tracing::error!("Startup error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize tracing/logging
fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

async fn run(config: Config, cli: &Cli) -> Result<(), AppError> {
    tracing::info!(
        port = config.port,
        check_old_patrons = config.check_old_patrons,
        user_agent = %config.user_agent,
        "Configuration loaded"
    );

    let cache_config = CacheConfig {
        redis_url: cli.redis_url.clone(),
        ..Default::default()
    };
    let pool: CachePool = CachePool::connect(&cache_config)?;

    match pool.health_check_async().await {
        Ok(true) => tracing::info!("Redis is reachable"),
        Ok(false) => tracing::warn!("Redis answered PING unexpectedly"),
        Err(e) => tracing::warn!("Redis health check failed: {}", e),
    }

    tracing::info!("Mantaro API v{} ready", env!("CARGO_PKG_VERSION"));
    shutdown_signal().await;

    tracing::info!("Shutdown signal received");
    pool.shutdown();
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
