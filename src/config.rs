use std::time::Duration;

use crate::error::{AppError, Result};
use crate::retry::RetryPolicy;

/// Fallback interval when nothing on the board is time-sensitive (seconds).
pub const IDLE_REFRESH_SECS: u64 = 600;

/// Live-board cadence is clamped into this range (seconds).
pub const LIVE_REFRESH_RANGE: (u64, u64) = (5, 15);

/// Number of recent tick errors kept per feed for the /health endpoint.
pub const HEALTH_ERROR_HISTORY: usize = 10;

/// One independently polled competition board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

/// Feed-level refresh cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cadence {
    pub live: Duration,
    pub upcoming: Duration,
    pub idle: Duration,
    /// Upcoming matches starting within this window keep the board on the upcoming cadence.
    pub upcoming_horizon: Duration,
    /// Maximum age of the last full-board fetch before a live-only tick is upgraded.
    pub full_refresh: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            live: Duration::from_secs(15),
            upcoming: Duration::from_secs(180),
            idle: Duration::from_secs(IDLE_REFRESH_SECS),
            upcoming_horizon: Duration::from_secs(3600),
            full_refresh: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub store_backend: StoreBackend,
    pub db_path: String,
    /// 0 disables the HTTP API.
    pub api_port: u16,
    pub feeds: Vec<FeedConfig>,
    pub cadence: Cadence,
    pub fetch_timeout: Duration,
    /// Consecutive missing cycles before a live match is marked completed (MISS_THRESHOLD)
    pub miss_threshold: u32,
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub sweep_batch_size: usize,
    /// None = run until Ctrl-C.
    pub max_runtime: Option<Duration>,
    pub retry: RetryPolicy,
    pub fetch_rate_per_min: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let feeds = parse_feeds(&std::env::var("FEEDS").unwrap_or_default())?;
        if feeds.is_empty() {
            return Err(AppError::Config(
                "FEEDS must list at least one feed, e.g. FEEDS=tt_cup=https://host/boards/tt_cup".to_string(),
            ));
        }

        let store_backend = match std::env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "sqlite".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "sqlite" => StoreBackend::Sqlite,
            "memory" => StoreBackend::Memory,
            other => {
                return Err(AppError::Config(format!(
                    "STORE_BACKEND must be 'sqlite' or 'memory', got '{other}'"
                )))
            }
        };

        let live_secs = env_u64("LIVE_REFRESH_SECS", 15).clamp(LIVE_REFRESH_RANGE.0, LIVE_REFRESH_RANGE.1);
        let upcoming_secs = env_u64("UPCOMING_REFRESH_SECS", 180).max(live_secs);
        let idle_secs = env_u64("IDLE_REFRESH_SECS", IDLE_REFRESH_SECS).max(upcoming_secs);

        let max_runtime_hours = env_u64("MAX_RUNTIME_HOURS", 24);

        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            store_backend,
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "tracker.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            feeds,
            cadence: Cadence {
                live: Duration::from_secs(live_secs),
                upcoming: Duration::from_secs(upcoming_secs),
                idle: Duration::from_secs(idle_secs),
                upcoming_horizon: minutes(env_u64("UPCOMING_HORIZON_MINS", 60)),
                full_refresh: Duration::from_secs(env_u64("FULL_REFRESH_SECS", 300)),
            },
            fetch_timeout: Duration::from_secs(env_u64("FETCH_TIMEOUT_SECS", 30).max(1)),
            miss_threshold: saturating_u32(env_u64("MISS_THRESHOLD", 2)).max(1),
            retention: days(env_u64("RETENTION_DAYS", 7)),
            sweep_interval: hours(env_u64("SWEEP_INTERVAL_HOURS", 6).max(1)),
            sweep_batch_size: usize::try_from(env_u64("SWEEP_BATCH_SIZE", 100)).unwrap_or(usize::MAX).max(1),
            max_runtime: (max_runtime_hours > 0).then(|| hours(max_runtime_hours)),
            retry: RetryPolicy::from_env(),
            fetch_rate_per_min: saturating_u32(env_u64("FETCH_RATE_PER_MIN", 60)).max(1),
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}

fn hours(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(3600))
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(86_400))
}

fn saturating_u32(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Parse `id=url,id=url`. Ids must be unique and non-empty.
pub fn parse_feeds(raw: &str) -> Result<Vec<FeedConfig>> {
    let mut feeds: Vec<FeedConfig> = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((id, url)) = entry.split_once('=') else {
            return Err(AppError::Config(format!("feed entry '{entry}' must look like id=url")));
        };
        let (id, url) = (id.trim(), url.trim());
        if id.is_empty() || url.is_empty() {
            return Err(AppError::Config(format!("feed entry '{entry}' has an empty id or url")));
        }
        if feeds.iter().any(|f| f.id == id) {
            return Err(AppError::Config(format!("feed id '{id}' is listed twice")));
        }
        feeds.push(FeedConfig { id: id.to_string(), url: url.to_string() });
    }
    Ok(feeds)
}
