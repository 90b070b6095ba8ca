use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::routing::get;
use axum::Router;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, StoreConfig};
use gatekeeper::http::HttpServer;
use gatekeeper::store::{MemoryStore, RedisStore, Store};

/// Points charged for a bulk export.
const EXPORT_COST: u64 = 10;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Demo HTTP service protected by the Gatekeeper rate limiter.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => GatekeeperConfig::load(path)?,
        None => {
            warn!("No configuration file given, using defaults");
            GatekeeperConfig::default()
        }
    };
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    let store: Arc<dyn Store> = match &config.store {
        StoreConfig::Memory {
            sweep_interval_secs,
        } => {
            let store = Arc::new(MemoryStore::new());
            store.spawn_sweeper(Duration::from_secs(*sweep_interval_secs));
            store
        }
        StoreConfig::Redis { .. } => {
            let redis = config.store.redis().unwrap_or_default();
            Arc::new(RedisStore::connect(redis).await?)
        }
    };

    let limiter = Arc::new(config.limiter.build_limiter(store)?);
    info!(
        algorithm = %limiter.algorithm(),
        window_ms = limiter.window().as_millis() as u64,
        "Rate limiter initialized"
    );

    let layer = config.limiter.layer(limiter).cost_fn(|request: &Request| {
        if request.uri().path() == "/export" {
            EXPORT_COST
        } else {
            1
        }
    });

    let router = Router::new()
        .route("/", get(|| async { "Hello from behind the rate limiter\n" }))
        .route("/export", get(|| async { "export complete\n" }))
        .layer(layer);

    HttpServer::new(config.server.http_addr, router)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Gatekeeper stopped");
    Ok(())
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
