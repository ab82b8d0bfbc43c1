use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quotagate::config::{LogFormat, LoggingConfig, QuotagateConfig, StoreBackend};
use quotagate::ratelimit::LimiterRegistry;
use quotagate::store::{CounterStore, InMemoryStore, RedisStore};
use quotagate::web::{build_router, HttpServer};

/// Distributed rate limiting for HTTP endpoints.
#[derive(Debug, Parser)]
#[command(name = "quotagate", version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = QuotagateConfig::load(args.config.as_deref())?;
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging);

    info!("Starting Quotagate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Redis => Arc::new(RedisStore::connect(&config.store.redis_url).await?),
        StoreBackend::Memory => {
            warn!("Using the in-memory store; limits are not shared between instances");
            Arc::new(InMemoryStore::new())
        }
    };

    let registry = LimiterRegistry::new(store)
        .with_key_prefix(config.rate_limiting.key_prefix.clone())
        .with_store_timeout(Duration::from_millis(config.store.timeout_ms));
    let router = build_router(&config, &registry)?;
    for limiter in registry.limiters() {
        info!(
            namespace = %limiter.namespace(),
            capacity = limiter.policy().capacity(),
            block = ?limiter.policy().block(),
            "Rate limiter registered"
        );
    }
    info!(limiters = registry.len(), "Rate limiters initialized");

    HttpServer::new(config.server.listen_addr, router)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Quotagate Rate Limiting Service stopped");
    Ok(())
}

/// Initialize tracing. `RUST_LOG` takes precedence over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
