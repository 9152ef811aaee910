use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use access_limiter::config::{AccessLimiterConfig, RedisStorageConfig, StorageConfig};
use access_limiter::counter::{CounterOption, RateCounter};
use access_limiter::storage;

/// Drive a rate counter in a tight loop and report its speed once per second.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use Redis at this address instead of the configured storage
    #[arg(long)]
    redis: Option<String>,

    /// Counter name
    #[arg(long, default_value = "test")]
    name: String,

    /// Dimension tokens
    #[arg(long = "dim", default_values = ["shoes", "oid-001"])]
    dims: Vec<String>,

    #[arg(long, default_value_t = 15000)]
    quota: i64,

    #[arg(long, default_value_t = 1000)]
    qps: i64,

    /// Reset the consumed quota every this many seconds
    #[arg(long, default_value_t = 20)]
    reset_every: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    info!("Starting access limiter demo");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = AccessLimiterConfig::load(args.config.as_deref())?;
    if let Some(address) = &args.redis {
        config.storage = StorageConfig::Redis(RedisStorageConfig::new(address.clone()));
    }

    let storage = storage::connect(&config.storage)?;
    let counter = Arc::new(RateCounter::with_config(&args.name, storage, &config.counter));

    let dims: Vec<&str> = args.dims.iter().map(String::as_str).collect();
    counter
        .update_options(
            &[CounterOption::limit_quota(args.quota), CounterOption::limit_qps(args.qps)],
            &dims,
        )
        .await?;

    let consumed = Arc::new(AtomicU64::new(0));
    let rejected = Arc::new(AtomicU64::new(0));

    let consumer = {
        let counter = counter.clone();
        let dims = args.dims.clone();
        let consumed = consumed.clone();
        let rejected = rejected.clone();
        tokio::spawn(async move {
            let dims: Vec<&str> = dims.iter().map(String::as_str).collect();
            loop {
                match counter.consume(1, &dims).await {
                    Ok(()) => {
                        consumed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) if e.is_limit_exceeded() => {
                        rejected.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(error = %e, "Consume failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
                tokio::task::yield_now().await;
            }
        })
    };

    let resetter = {
        let counter = counter.clone();
        let dims = args.dims.clone();
        let period = Duration::from_secs(args.reset_every.max(1));
        tokio::spawn(async move {
            let dims: Vec<&str> = dims.iter().map(String::as_str).collect();
            loop {
                tokio::time::sleep(period).await;
                info!("Reset quota");
                if let Err(e) = counter.reset(&dims).await {
                    warn!(error = %e, "Reset failed");
                }
            }
        })
    };

    let reporter = {
        let counter = counter.clone();
        let dims = args.dims.clone();
        tokio::spawn(async move {
            let dims: Vec<&str> = dims.iter().map(String::as_str).collect();
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                info!(
                    qps = counter.consume_speed(&dims),
                    consumed = consumed.load(Ordering::Relaxed),
                    rejected = rejected.load(Ordering::Relaxed),
                    "Counter status"
                );
            }
        })
    };

    shutdown_signal().await;

    consumer.abort();
    resetter.abort();
    reporter.abort();

    info!("Access limiter demo stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
