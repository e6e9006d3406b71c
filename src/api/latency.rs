//! In-memory histogram of board fetch latency, across all feeds.
//! Feed loops record each successful fetch; /stats reads percentiles.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// Values stored in milliseconds.
pub struct FetchLatency {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
    pub max_ms: Option<u64>,
}

impl FetchLatency {
    /// Tracks 1ms to 10 minutes, 3 significant figures.
    pub fn new() -> Self {
        let histogram =
            hdrhistogram::Histogram::new_with_bounds(1, 600_000, 3).expect("valid histogram bounds");
        Self { inner: Mutex::new(histogram) }
    }

    pub fn record(&self, d: Duration) {
        let ms = d.as_millis().clamp(1, 600_000) as u64;
        let _ = self.inner.lock().record(ms);
    }

    pub fn summary(&self) -> LatencySummary {
        let h = self.inner.lock();
        if h.len() == 0 {
            return LatencySummary::default();
        }
        LatencySummary {
            samples: h.len(),
            p50_ms: Some(h.value_at_quantile(0.5)),
            p95_ms: Some(h.value_at_quantile(0.95)),
            p99_ms: Some(h.value_at_quantile(0.99)),
            max_ms: Some(h.max()),
        }
    }
}

impl Default for FetchLatency {
    fn default() -> Self {
        Self::new()
    }
}
