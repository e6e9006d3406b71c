//! Shared health state for the /health endpoint.
//! Updated by every feed loop at the end of each tick, read by the API.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::HEALTH_ERROR_HISTORY;

/// Errors shown per feed in a health report.
const ERRORS_SHOWN: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct TickError {
    pub at: DateTime<Utc>,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
struct FeedHealth {
    last_tick_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    ticks: u64,
    consecutive_failures: u32,
    live: usize,
    upcoming: usize,
    next_interval_secs: u64,
    errors: VecDeque<TickError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    /// No feed has finished a tick yet.
    Starting,
    Healthy,
    /// At least one feed's latest tick failed.
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedReport {
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub seconds_since_last_tick: Option<i64>,
    pub ticks: u64,
    pub consecutive_failures: u32,
    pub live: usize,
    pub upcoming: usize,
    pub next_interval_secs: u64,
    pub recent_errors: Vec<TickError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub uptime_seconds: i64,
    pub feeds: BTreeMap<String, FeedReport>,
}

/// What a successful tick reports back.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickOutcome {
    pub live: usize,
    pub upcoming: usize,
    pub next_interval_secs: u64,
}

pub struct HealthRegistry {
    started_at: DateTime<Utc>,
    feeds: Mutex<BTreeMap<String, FeedHealth>>,
}

impl HealthRegistry {
    pub fn new(feed_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            started_at: Utc::now(),
            feeds: Mutex::new(feed_ids.into_iter().map(|id| (id, FeedHealth::default())).collect()),
        }
    }

    pub fn record_success(&self, feed: &str, at: DateTime<Utc>, outcome: TickOutcome) {
        let mut feeds = self.feeds.lock();
        let h = feeds.entry(feed.to_string()).or_default();
        h.last_tick_at = Some(at);
        h.last_success_at = Some(at);
        h.ticks += 1;
        h.consecutive_failures = 0;
        h.live = outcome.live;
        h.upcoming = outcome.upcoming;
        h.next_interval_secs = outcome.next_interval_secs;
    }

    pub fn record_failure(&self, feed: &str, at: DateTime<Utc>, error: String, next_interval_secs: u64) {
        let mut feeds = self.feeds.lock();
        let h = feeds.entry(feed.to_string()).or_default();
        h.last_tick_at = Some(at);
        h.ticks += 1;
        h.consecutive_failures = h.consecutive_failures.saturating_add(1);
        h.next_interval_secs = next_interval_secs;
        h.errors.push_back(TickError { at, error });
        while h.errors.len() > HEALTH_ERROR_HISTORY {
            h.errors.pop_front();
        }
    }

    pub fn report(&self, now: DateTime<Utc>) -> HealthReport {
        let feeds = self.feeds.lock();

        let status = if feeds.values().all(|h| h.last_tick_at.is_none()) {
            OverallStatus::Starting
        } else if feeds.values().any(|h| h.consecutive_failures > 0) {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };

        let feeds = feeds
            .iter()
            .map(|(id, h)| {
                let report = FeedReport {
                    last_tick_at: h.last_tick_at,
                    last_success_at: h.last_success_at,
                    seconds_since_last_tick: h.last_tick_at.map(|t| (now - t).num_seconds()),
                    ticks: h.ticks,
                    consecutive_failures: h.consecutive_failures,
                    live: h.live,
                    upcoming: h.upcoming,
                    next_interval_secs: h.next_interval_secs,
                    recent_errors: h.errors.iter().rev().take(ERRORS_SHOWN).rev().cloned().collect(),
                };
                (id.clone(), report)
            })
            .collect();

        HealthReport {
            status,
            uptime_seconds: (now - self.started_at).num_seconds(),
            feeds,
        }
    }
}
