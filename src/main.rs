mod api;
mod config;
mod error;
mod normalizer;
mod rate_limit;
mod reconciler;
mod retry;
mod scheduler;
mod source;
mod store;
mod sweeper;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthRegistry;
use crate::api::latency::FetchLatency;
use crate::api::routes::{router, ApiState};
use crate::config::{Config, StoreBackend};
use crate::error::{AppError, Result};
use crate::rate_limit::FetchRateLimiter;
use crate::scheduler::{FeedLoop, LoopContext, LoopSettings};
use crate::source::{HttpBoardSource, JsonBoardParser};
use crate::store::{DocumentStore, MemoryStore, SqliteStore};
use crate::sweeper::RetentionSweeper;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Store ---
    let store: Arc<dyn DocumentStore> = match cfg.store_backend {
        StoreBackend::Sqlite => Arc::new(SqliteStore::connect(&cfg.db_path).await?),
        StoreBackend::Memory => {
            warn!("STORE_BACKEND=memory: documents are kept in-process and lost on exit");
            MemoryStore::new()
        }
    };

    // --- Shared handles ---
    let source = HttpBoardSource::new(cfg.fetch_timeout).map_err(|e| AppError::Config(e.to_string()))?;
    let health = Arc::new(HealthRegistry::new(cfg.feeds.iter().map(|f| f.id.clone())));
    let latency = Arc::new(FetchLatency::new());
    let ctx = LoopContext {
        source: Arc::new(source),
        parser: Arc::new(JsonBoardParser),
        store: Arc::clone(&store),
        limiter: Arc::new(FetchRateLimiter::per_minute(cfg.fetch_rate_per_min)),
        health: Arc::clone(&health),
        latency: Arc::clone(&latency),
    };
    let settings = LoopSettings::from_config(&cfg);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // --- Feed loops ---
    for feed in &cfg.feeds {
        let feed_loop = FeedLoop::new(feed.clone(), ctx.clone(), settings.clone(), shutdown_rx.clone());
        tasks.push(tokio::spawn(feed_loop.run()));
    }
    info!(
        feeds = cfg.feeds.len(),
        miss_threshold = cfg.miss_threshold,
        live_secs = cfg.cadence.live.as_secs(),
        upcoming_secs = cfg.cadence.upcoming.as_secs(),
        idle_secs = cfg.cadence.idle.as_secs(),
        "Started {} feed loops: {}",
        cfg.feeds.len(),
        cfg.feeds.iter().map(|f| f.id.as_str()).collect::<Vec<_>>().join(", "),
    );

    // --- Retention sweeper ---
    let sweeper = RetentionSweeper::new(Arc::clone(&store), &cfg, shutdown_rx.clone());
    tasks.push(tokio::spawn(sweeper.run()));

    // --- HTTP API ---
    if cfg.api_port == 0 {
        info!("API_PORT=0: HTTP API disabled");
    } else {
        let app = router(ApiState { store, health, latency });
        let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
        let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
        info!("HTTP API listening on {bind_addr}");

        let api_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(wait_for_shutdown(api_shutdown))
                .await;
            if let Err(e) = served {
                error!("HTTP API error: {e}");
            }
        }));
    }

    // --- Run until Ctrl-C or the lifetime ceiling ---
    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => error!("Ctrl-C handler failed, shutting down: {e}"),
        },
        _ = lifetime_elapsed(cfg.max_runtime) => {
            info!("Maximum runtime reached, shutting down");
        }
    }

    let _ = shutdown_tx.send(true);
    for res in futures_util::future::join_all(tasks).await {
        if let Err(e) = res {
            error!("Task ended abnormally: {e}");
        }
    }
    info!("Shutdown complete");
    Ok(())
}

async fn lifetime_elapsed(limit: Option<Duration>) {
    match limit {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
