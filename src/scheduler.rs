use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::health::{HealthRegistry, TickOutcome};
use crate::api::latency::FetchLatency;
use crate::config::{Cadence, Config, FeedConfig};
use crate::error::{CycleError, FetchError};
use crate::normalizer::{normalize_batch, NormalizeStats, NormalizedBatch};
use crate::rate_limit::FetchRateLimiter;
use crate::reconciler::{reconcile, Change, ReconcilePolicy, ReconcileSummary};
use crate::retry::{retry_async, RetryPolicy};
use crate::source::{FetchMode, RawSnapshot, SnapshotParser, SnapshotSource};
use crate::store::{DocumentFilter, DocumentStore};
use crate::types::{MatchDocument, MatchStatus};

// ---------------------------------------------------------------------------
// Status mix and cadence
// ---------------------------------------------------------------------------

/// Per-feed counts of tracked matches by status, taken after reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusMix {
    pub live: usize,
    /// Upcoming and starting within the horizon, or with no known start time.
    pub upcoming_near: usize,
    pub upcoming_far: usize,
    pub completed: usize,
    pub unknown: usize,
}

impl StatusMix {
    pub fn from_documents<'a>(
        docs: impl IntoIterator<Item = &'a MatchDocument>,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Self {
        let far_after = chrono::Duration::from_std(horizon).ok().and_then(|h| now.checked_add_signed(h));
        let mut mix = Self::default();
        for doc in docs {
            match doc.status {
                MatchStatus::Live => mix.live += 1,
                MatchStatus::Upcoming => match doc.start_time {
                    Some(start) if far_after.map_or(false, |limit| start > limit) => mix.upcoming_far += 1,
                    _ => mix.upcoming_near += 1,
                },
                MatchStatus::Completed => mix.completed += 1,
                MatchStatus::Unknown => mix.unknown += 1,
            }
        }
        mix
    }

    pub fn upcoming(&self) -> usize {
        self.upcoming_near + self.upcoming_far
    }
}

impl Cadence {
    /// Any Live → live interval; else any near-term Upcoming → upcoming interval; else idle.
    pub fn next_interval(&self, mix: &StatusMix) -> Duration {
        if mix.live > 0 {
            self.live
        } else if mix.upcoming_near > 0 {
            self.upcoming
        } else {
            self.idle.max(self.upcoming)
        }
    }
}

/// Full board on the first tick, when nothing is live, or when the last full
/// fetch is older than `full_refresh`. Otherwise only the live section.
pub fn select_mode(since_full: Option<Duration>, full_refresh: Duration, mix: &StatusMix) -> FetchMode {
    match since_full {
        None => FetchMode::Full,
        Some(_) if mix.live == 0 => FetchMode::Full,
        Some(age) if age >= full_refresh => FetchMode::Full,
        Some(_) => FetchMode::LiveOnly,
    }
}

// ---------------------------------------------------------------------------
// FeedLoop
// ---------------------------------------------------------------------------

/// Handles shared by every feed loop.
#[derive(Clone)]
pub struct LoopContext {
    pub source: Arc<dyn SnapshotSource>,
    pub parser: Arc<dyn SnapshotParser>,
    pub store: Arc<dyn DocumentStore>,
    pub limiter: Arc<FetchRateLimiter>,
    pub health: Arc<HealthRegistry>,
    pub latency: Arc<FetchLatency>,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub cadence: Cadence,
    pub retry: RetryPolicy,
    pub fetch_timeout: Duration,
    pub policy: ReconcilePolicy,
}

impl LoopSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            cadence: cfg.cadence.clone(),
            retry: cfg.retry.clone(),
            fetch_timeout: cfg.fetch_timeout,
            policy: ReconcilePolicy { miss_threshold: cfg.miss_threshold },
        }
    }
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub mode: FetchMode,
    pub normalize: NormalizeStats,
    pub summary: ReconcileSummary,
    pub written: usize,
    pub write_failures: usize,
}

/// Polls one feed until shutdown. Owns the feed's status mix; the only writer for the feed's ids.
pub struct FeedLoop {
    feed: FeedConfig,
    ctx: LoopContext,
    settings: LoopSettings,
    shutdown: watch::Receiver<bool>,
    mix: StatusMix,
    last_full: Option<Instant>,
}

impl FeedLoop {
    pub fn new(feed: FeedConfig, ctx: LoopContext, settings: LoopSettings, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            feed,
            ctx,
            settings,
            shutdown,
            mix: StatusMix::default(),
            last_full: None,
        }
    }

    #[cfg(test)]
    pub fn mix(&self) -> StatusMix {
        self.mix
    }

    pub async fn run(mut self) {
        info!(feed = %self.feed.id, url = %self.feed.url, "feed loop started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let tick_at = Utc::now();
            let result = self.tick().await;
            let interval = self.settings.cadence.next_interval(&self.mix);
            self.report_tick(tick_at, &result, interval);

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(feed = %self.feed.id, "feed loop stopped");
    }

    /// Log the tick and record it on the health registry. A tick that lost
    /// document writes counts as a failure.
    fn report_tick(&self, tick_at: DateTime<Utc>, result: &Result<TickReport, CycleError>, interval: Duration) {
        let feed = self.feed.id.as_str();
        let interval_secs = interval.as_secs();
        match result {
            Ok(report) => {
                let summary = &report.summary;
                info!(
                    feed,
                    mode = %report.mode,
                    records = report.normalize.total,
                    dropped = report.normalize.dropped(),
                    created = summary.created,
                    updated = summary.updated,
                    unchanged = summary.unchanged,
                    missed = summary.missed,
                    completed = summary.completed,
                    anomalies = summary.anomalies,
                    written = report.written,
                    write_failures = report.write_failures,
                    live = self.mix.live,
                    upcoming = self.mix.upcoming(),
                    next_in_secs = interval_secs,
                    "Tick complete: +{} created, {} updated, {} unchanged, {} completed",
                    summary.created,
                    summary.updated,
                    summary.unchanged,
                    summary.completed,
                );
                if report.write_failures > 0 {
                    let msg = format!("{} document writes failed", report.write_failures);
                    self.ctx.health.record_failure(feed, tick_at, msg, interval_secs);
                } else {
                    let outcome = TickOutcome {
                        live: self.mix.live,
                        upcoming: self.mix.upcoming(),
                        next_interval_secs: interval_secs,
                    };
                    self.ctx.health.record_success(feed, tick_at, outcome);
                }
            }
            Err(e) => {
                warn!(feed, next_in_secs = interval_secs, "tick abandoned: {e}");
                self.ctx.health.record_failure(feed, tick_at, e.to_string(), interval_secs);
            }
        }
    }

    /// One reconciliation cycle: fetch → parse → normalize → read → reconcile → persist.
    pub async fn tick(&mut self) -> Result<TickReport, CycleError> {
        let feed = self.feed.id.clone();
        let since_full = self.last_full.map(|t| t.elapsed());
        let mode = select_mode(since_full, self.settings.cadence.full_refresh, &self.mix);
        let retry = &self.settings.retry;

        let this = &*self;
        let snapshot = retry_async(retry, "fetch", move || this.fetch_once(mode)).await?;

        let parsed = self.ctx.parser.parse(&snapshot);
        let first_failure = parsed.iter().find_map(|r| r.as_ref().err().map(|f| f.to_string()));
        let NormalizedBatch { records, stats: normalize, rejected_ids } =
            normalize_batch(&feed, snapshot.fetched_at, parsed);
        // Nothing usable on a non-empty board: not evidence that anything left it.
        if normalize.total > 0 && normalize.accepted == 0 {
            let reason = first_failure
                .unwrap_or_else(|| format!("all {} records rejected: {:?}", normalize.total, normalize));
            return Err(CycleError::Unreadable(reason));
        }
        if normalize.dropped() > 0 {
            debug!(feed = %feed, ?normalize, "records dropped during normalization");
        }
        if mode == FetchMode::Full {
            self.last_full = Some(Instant::now());
        }

        // Read-before-diff: batch ids plus the feed's Live documents for miss tracking.
        let store = &*self.ctx.store;
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let ids = &ids;
        let live_filter = DocumentFilter::live_in_feed(&feed);
        let live_filter = &live_filter;

        let known = retry_async(retry, "read batch", move || store.get_many(ids)).await?;
        let live = retry_async(retry, "read live", move || store.query(live_filter)).await?;
        let previous: HashMap<String, MatchDocument> =
            known.into_iter().chain(live).map(|d| (d.id.clone(), d)).collect();

        let results = reconcile(
            &feed,
            snapshot.fetched_at,
            &records,
            &rejected_ids,
            &previous,
            &self.settings.policy,
        );

        for anomaly in results.iter().filter_map(|r| r.anomaly.as_ref()) {
            warn!(
                feed = %feed,
                id = %anomaly.id,
                from = %anomaly.from,
                to = %anomaly.to,
                "anomalous status transition {} → {}",
                anomaly.from,
                anomaly.to,
            );
        }

        for r in &results {
            if r.changes.contains(&Change::Created) {
                debug!(feed = %feed, id = %r.document.id, "tracking new match {}", r.document.label());
            } else if r.changes.contains(&Change::Disappeared) {
                info!(feed = %feed, id = %r.document.id, "{} dropped off the live board, marked completed", r.document.label());
            }
        }

        let mut written = 0;
        let mut write_failures = 0;
        for reconciled in results.iter().filter(|r| r.changed()) {
            let doc = &reconciled.document;
            match retry_async(retry, "upsert", move || store.upsert(doc)).await {
                Ok(()) => written += 1,
                Err(e) => {
                    // Dropped for this cycle; the next read-before-diff sees the old state and redoes it.
                    write_failures += 1;
                    warn!(feed = %feed, id = %doc.id, "document write discarded: {e}");
                }
            }
        }

        // Rejected but still listed matches keep their stored status in the mix.
        let reconciled_ids: HashSet<&str> = results.iter().map(|r| r.document.id.as_str()).collect();
        let held = rejected_ids
            .iter()
            .filter(|id| !reconciled_ids.contains(id.as_str()))
            .filter_map(|id| previous.get(id));
        let mut mix = StatusMix::from_documents(
            results.iter().map(|r| &r.document).chain(held),
            Utc::now(),
            self.settings.cadence.upcoming_horizon,
        );
        if mode == FetchMode::LiveOnly {
            mix.upcoming_near = self.mix.upcoming_near;
            mix.upcoming_far = self.mix.upcoming_far;
        }
        self.mix = mix;

        let summary = ReconcileSummary::of(&results);
        Ok(TickReport { mode, normalize, summary, written, write_failures })
    }

    async fn fetch_once(&self, mode: FetchMode) -> Result<RawSnapshot, FetchError> {
        self.ctx.limiter.acquire(&self.feed.id).await;
        let started = Instant::now();
        let snapshot = tokio::time::timeout(self.settings.fetch_timeout, self.ctx.source.fetch(&self.feed, mode))
            .await
            .map_err(|_| FetchError::Timeout(self.settings.fetch_timeout))??;
        self.ctx.latency.record(started.elapsed());
        Ok(snapshot)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::JsonBoardParser;
    use crate::store::MemoryStore;
    use crate::types::StatusReason;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct ScriptedSource {
        script: Mutex<VecDeque<Result<String, FetchError>>>,
        modes: Mutex<Vec<FetchMode>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<String, FetchError>>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()), modes: Mutex::new(Vec::new()) })
        }

        fn calls(&self) -> usize {
            self.modes.lock().len()
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch(&self, feed: &FeedConfig, mode: FetchMode) -> Result<RawSnapshot, FetchError> {
            self.modes.lock().push(mode);
            let next = self
                .script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Fatal("script exhausted".to_string())));
            next.map(|body| RawSnapshot { feed: feed.id.clone(), mode, fetched_at: Utc::now(), body })
        }
    }

    fn settings() -> LoopSettings {
        LoopSettings {
            cadence: Cadence::default(),
            retry: RetryPolicy { max_attempts: 3, base_delay_ms: 1, max_delay_ms: 2 },
            fetch_timeout: Duration::from_secs(5),
            policy: ReconcilePolicy::default(),
        }
    }

    fn feed_loop(source: Arc<ScriptedSource>, store: Arc<MemoryStore>) -> (FeedLoop, watch::Sender<bool>) {
        feed_loop_with(source, store, settings())
    }

    fn feed_loop_with(
        source: Arc<dyn SnapshotSource>,
        store: Arc<dyn DocumentStore>,
        settings: LoopSettings,
    ) -> (FeedLoop, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let ctx = LoopContext {
            source,
            parser: Arc::new(JsonBoardParser),
            store,
            limiter: Arc::new(FetchRateLimiter::per_minute(6_000)),
            health: Arc::new(HealthRegistry::new(["tt".to_string()])),
            latency: Arc::new(FetchLatency::new()),
        };
        let feed = FeedConfig { id: "tt".to_string(), url: "http://board.test/tt".to_string() };
        (FeedLoop::new(feed, ctx, settings, rx), tx)
    }

    fn board(matches: &[(&str, &str, &[&str])]) -> String {
        let items: Vec<serde_json::Value> = matches
            .iter()
            .map(|(event, status, periods)| {
                serde_json::json!({
                    "event_id": event,
                    "participants": [{"name": format!("{event} home")}, {"name": format!("{event} away")}],
                    "status": status,
                    "score": {"periods": periods},
                })
            })
            .collect();
        serde_json::json!({ "matches": items }).to_string()
    }

    async fn only_doc(store: &MemoryStore) -> MatchDocument {
        let mut docs = store.query(&DocumentFilter::default()).await.unwrap();
        assert_eq!(docs.len(), 1);
        docs.remove(0)
    }

    #[test]
    fn cadence_follows_the_status_mix() {
        let c = Cadence::default();
        let live = StatusMix { live: 1, upcoming_near: 3, ..Default::default() };
        let near = StatusMix { upcoming_near: 1, upcoming_far: 4, ..Default::default() };
        let far = StatusMix { upcoming_far: 4, completed: 9, ..Default::default() };
        assert_eq!(c.next_interval(&live), c.live);
        assert_eq!(c.next_interval(&near), c.upcoming);
        assert_eq!(c.next_interval(&far), c.idle);
        assert_eq!(c.next_interval(&StatusMix::default()), c.idle);
    }

    #[test]
    fn mode_upgrades_to_full_when_needed() {
        let live = StatusMix { live: 2, ..Default::default() };
        let full = Duration::from_secs(300);
        assert_eq!(select_mode(None, full, &live), FetchMode::Full);
        assert_eq!(select_mode(Some(Duration::from_secs(30)), full, &live), FetchMode::LiveOnly);
        assert_eq!(select_mode(Some(Duration::from_secs(300)), full, &live), FetchMode::Full);
        assert_eq!(select_mode(Some(Duration::from_secs(30)), full, &StatusMix::default()), FetchMode::Full);
    }

    #[test]
    fn mix_splits_upcoming_by_horizon() {
        use crate::store::test_support::document;
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut soon = document("a", "tt", MatchStatus::Upcoming, now);
        soon.start_time = Some(now + chrono::Duration::minutes(30));
        let mut later = document("b", "tt", MatchStatus::Upcoming, now);
        later.start_time = Some(now + chrono::Duration::hours(5));
        let unscheduled = document("c", "tt", MatchStatus::Upcoming, now);
        let live = document("d", "tt", MatchStatus::Live, now);

        let docs = [soon, later, unscheduled, live];
        let mix = StatusMix::from_documents(&docs, now, Duration::from_secs(3600));
        assert_eq!(mix, StatusMix { live: 1, upcoming_near: 2, upcoming_far: 1, completed: 0, unknown: 0 });
    }

    #[tokio::test]
    async fn ticks_create_then_append_score_history() {
        let source = ScriptedSource::new(vec![
            Ok(board(&[("m1", "live", &["3-2"])])),
            Ok(board(&[("m1", "live", &["11-9"])])),
        ]);
        let store = MemoryStore::new();
        let (mut lp, _tx) = feed_loop(source, store.clone());

        let first = lp.tick().await.unwrap();
        assert_eq!(first.mode, FetchMode::Full);
        assert_eq!(first.summary.created, 1);
        let doc = only_doc(&store).await;
        assert_eq!(doc.score_history.len(), 1);
        assert_eq!(doc.status_history.len(), 1);

        let second = lp.tick().await.unwrap();
        assert_eq!(second.mode, FetchMode::LiveOnly);
        assert_eq!(second.written, 1);
        let doc = only_doc(&store).await;
        assert_eq!(doc.score_history.len(), 2);
        assert_eq!(doc.status_history.len(), 1);
        assert!(doc.odds_history.is_empty());
        assert_eq!(lp.mix().live, 1);
    }

    #[tokio::test]
    async fn unchanged_board_writes_nothing() {
        let body = board(&[("m1", "upcoming", &[])]);
        let source = ScriptedSource::new(vec![Ok(body.clone()), Ok(body)]);
        let store = MemoryStore::new();
        let (mut lp, _tx) = feed_loop(source, store.clone());

        lp.tick().await.unwrap();
        let before = serde_json::to_vec(&only_doc(&store).await).unwrap();
        let report = lp.tick().await.unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(report.summary.unchanged, 1);
        assert_eq!(serde_json::to_vec(&only_doc(&store).await).unwrap(), before);
    }

    #[tokio::test]
    async fn live_match_dropping_off_is_completed_on_the_second_miss() {
        let source = ScriptedSource::new(vec![
            Ok(board(&[("m1", "live", &["1-0"]), ("m2", "live", &["0-0"])])),
            Ok(board(&[("m2", "live", &["1-0"])])),
            Ok(board(&[("m2", "live", &["2-0"])])),
        ]);
        let store = MemoryStore::new();
        let (mut lp, _tx) = feed_loop(source, store.clone());

        lp.tick().await.unwrap();
        let second = lp.tick().await.unwrap();
        assert_eq!(second.summary.missed, 1);
        assert_eq!(store.query(&DocumentFilter::live_in_feed("tt")).await.unwrap().len(), 2);

        let third = lp.tick().await.unwrap();
        assert_eq!(third.summary.completed, 1);
        let done = store
            .query(&DocumentFilter { statuses: vec![MatchStatus::Completed], ..Default::default() })
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        let last = done[0].status_history.last().unwrap();
        assert_eq!(last.reason, Some(StatusReason::Disappeared));
        assert_eq!(done[0].status_history.len(), 2);
    }

    #[tokio::test]
    async fn transient_fetch_failures_are_retried() {
        let source = ScriptedSource::new(vec![
            Err(FetchError::Transient("connection reset".to_string())),
            Ok(board(&[("m1", "upcoming", &[])])),
        ]);
        let store = MemoryStore::new();
        let (mut lp, _tx) = feed_loop(source.clone(), store.clone());

        lp.tick().await.unwrap();
        assert_eq!(source.calls(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn fatal_fetch_abandons_the_tick_without_touching_state() {
        let source = ScriptedSource::new(vec![
            Ok(board(&[("m1", "live", &["1-0"])])),
            Err(FetchError::Fatal("404".to_string())),
            Err(FetchError::Fatal("404".to_string())),
        ]);
        let store = MemoryStore::new();
        let (mut lp, _tx) = feed_loop(source.clone(), store.clone());

        lp.tick().await.unwrap();
        assert!(matches!(lp.tick().await, Err(CycleError::Fetch(FetchError::Fatal(_)))));
        assert!(lp.tick().await.is_err());
        assert_eq!(source.calls(), 3);

        // Failed fetches are not misses.
        let doc = only_doc(&store).await;
        assert_eq!(doc.status, MatchStatus::Live);
        assert_eq!(doc.missed_cycles, 0);
    }

    #[tokio::test]
    async fn unreadable_board_is_not_an_empty_board() {
        let source = ScriptedSource::new(vec![
            Ok(board(&[("m1", "live", &["1-0"])])),
            Ok("<html>captcha</html>".to_string()),
            Ok("<html>captcha</html>".to_string()),
        ]);
        let store = MemoryStore::new();
        let (mut lp, _tx) = feed_loop(source, store.clone());

        lp.tick().await.unwrap();
        assert!(matches!(lp.tick().await, Err(CycleError::Unreadable(_))));
        assert!(matches!(lp.tick().await, Err(CycleError::Unreadable(_))));
        assert_eq!(only_doc(&store).await.status, MatchStatus::Live);
    }

    #[tokio::test]
    async fn board_with_only_rejected_records_is_unreadable() {
        let source = ScriptedSource::new(vec![
            Ok(board(&[("m1", "live", &["1-0"])])),
            Ok(board(&[("m1", "in progress", &["1-0"])])),
            Ok(board(&[("m1", "in progress", &["2-0"])])),
        ]);
        let store = MemoryStore::new();
        let (mut lp, _tx) = feed_loop(source, store.clone());

        lp.tick().await.unwrap();
        assert!(matches!(lp.tick().await, Err(CycleError::Unreadable(_))));
        assert!(matches!(lp.tick().await, Err(CycleError::Unreadable(_))));

        let doc = only_doc(&store).await;
        assert_eq!(doc.status, MatchStatus::Live);
        assert_eq!(doc.missed_cycles, 0);
        assert_eq!(doc.status_history.len(), 1);
    }

    #[tokio::test]
    async fn rejected_record_with_event_id_is_not_a_miss() {
        let source = ScriptedSource::new(vec![
            Ok(board(&[("m1", "live", &["1-0"]), ("m2", "live", &["0-0"])])),
            Ok(board(&[("m1", "in progress", &["1-0"]), ("m2", "live", &["1-0"])])),
            Ok(board(&[("m1", "in progress", &["2-0"]), ("m2", "live", &["2-0"])])),
        ]);
        let store = MemoryStore::new();
        let (mut lp, _tx) = feed_loop(source, store.clone());

        lp.tick().await.unwrap();
        for _ in 0..2 {
            let report = lp.tick().await.unwrap();
            assert_eq!(report.normalize.rejected_status, 1);
            assert_eq!(report.summary.missed, 0);
            assert_eq!(report.summary.completed, 0);
            assert_eq!(lp.mix().live, 2);
        }

        let live = store.query(&DocumentFilter::live_in_feed("tt")).await.unwrap();
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|d| d.missed_cycles == 0 && d.status_history.len() == 1));
    }

    /// Fails every upsert of one id while `failures` lasts.
    struct FailingWrites {
        inner: Arc<MemoryStore>,
        id: String,
        failures: Mutex<usize>,
    }

    #[async_trait]
    impl DocumentStore for FailingWrites {
        async fn get(&self, id: &str) -> Result<Option<MatchDocument>, crate::error::StoreError> {
            self.inner.get(id).await
        }

        async fn get_many(&self, ids: &[String]) -> Result<Vec<MatchDocument>, crate::error::StoreError> {
            self.inner.get_many(ids).await
        }

        async fn upsert(&self, doc: &MatchDocument) -> Result<(), crate::error::StoreError> {
            if doc.id == self.id {
                let mut left = self.failures.lock();
                if *left > 0 {
                    *left -= 1;
                    return Err(crate::error::StoreError::Backend(sqlx::Error::PoolTimedOut));
                }
            }
            self.inner.upsert(doc).await
        }

        async fn query(&self, filter: &DocumentFilter) -> Result<Vec<MatchDocument>, crate::error::StoreError> {
            self.inner.query(filter).await
        }

        async fn delete(&self, id: &str) -> Result<bool, crate::error::StoreError> {
            self.inner.delete(id).await
        }

        async fn stats(&self) -> Result<crate::store::StoreStats, crate::error::StoreError> {
            self.inner.stats().await
        }
    }

    #[tokio::test]
    async fn discarded_write_is_redone_once_on_the_next_tick() {
        let source = ScriptedSource::new(vec![
            Ok(board(&[("m1", "live", &["1-0"]), ("m2", "live", &["0-0"])])),
            Ok(board(&[("m1", "live", &["2-0"]), ("m2", "live", &["1-0"])])),
            Ok(board(&[("m1", "live", &["2-0"]), ("m2", "live", &["1-0"])])),
        ]);
        let inner = MemoryStore::new();
        let (mut lp, _tx) = feed_loop_with(source, inner.clone(), settings());
        lp.tick().await.unwrap();
        let m1 = inner
            .query(&DocumentFilter::default())
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.participants[0].name == "m1 home")
            .unwrap();

        // Every attempt of the second tick fails for m1.
        let attempts = settings().retry.max_attempts as usize;
        let failing: Arc<dyn DocumentStore> =
            Arc::new(FailingWrites { inner: inner.clone(), id: m1.id.clone(), failures: Mutex::new(attempts) });
        lp.ctx.store = failing;

        let tick_at = Utc::now();
        let second = lp.tick().await;
        let report = second.as_ref().unwrap();
        assert_eq!(report.write_failures, 1);
        assert_eq!(report.written, 1);
        lp.report_tick(tick_at, &second, Duration::from_secs(15));
        let health = lp.ctx.health.report(Utc::now());
        assert_eq!(health.status, crate::api::health::OverallStatus::Degraded);
        assert_eq!(health.feeds["tt"].consecutive_failures, 1);
        assert_eq!(inner.get(&m1.id).await.unwrap().unwrap().score_history.len(), 1);

        // The unchanged board is diffed against the stored state and the entry lands once.
        let third = lp.tick().await.unwrap();
        assert_eq!(third.write_failures, 0);
        assert_eq!(third.written, 1);
        let stored = inner.get(&m1.id).await.unwrap().unwrap();
        assert_eq!(stored.score_history.len(), 2);
        assert_eq!(stored.score.unwrap().periods, vec!["2-0"]);
    }

    /// Never answers within the fetch timeout.
    struct StalledSource {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl SnapshotSource for StalledSource {
        async fn fetch(&self, _feed: &FeedConfig, _mode: FetchMode) -> Result<RawSnapshot, FetchError> {
            *self.calls.lock() += 1;
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(FetchError::Fatal("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn slow_source_times_out_after_every_attempt() {
        let source = Arc::new(StalledSource { calls: Mutex::new(0) });
        let store = MemoryStore::new();
        let mut settings = settings();
        settings.fetch_timeout = Duration::from_millis(20);
        let (mut lp, _tx) = feed_loop_with(source.clone(), store.clone(), settings);

        let result = lp.tick().await;
        assert!(matches!(result, Err(CycleError::Fetch(FetchError::Timeout(_)))));
        assert_eq!(*source.calls.lock(), 3);
        assert!(store.is_empty());
        assert_eq!(lp.ctx.latency.summary().samples, 0);
    }

    #[tokio::test]
    async fn live_only_ticks_keep_upcoming_counts_from_the_full_fetch() {
        let source = ScriptedSource::new(vec![
            Ok(board(&[("m1", "live", &["1-0"]), ("m2", "upcoming", &[])])),
            Ok(board(&[("m1", "live", &["2-0"])])),
        ]);
        let store = MemoryStore::new();
        let (mut lp, _tx) = feed_loop(source.clone(), store);

        lp.tick().await.unwrap();
        assert_eq!(lp.mix().upcoming_near, 1);
        lp.tick().await.unwrap();
        assert_eq!(*source.modes.lock(), vec![FetchMode::Full, FetchMode::LiveOnly]);
        assert_eq!(lp.mix().upcoming_near, 1);
        assert_eq!(lp.mix().live, 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_reports_health() {
        let source = ScriptedSource::new(vec![Ok(board(&[("m1", "upcoming", &[])]))]);
        let store = MemoryStore::new();
        let (lp, tx) = feed_loop(source, store.clone());
        let health = lp.ctx.health.clone();

        let handle = tokio::spawn(lp.run());
        // First tick runs immediately, then the loop sleeps on the upcoming cadence.
        for _ in 0..100 {
            if health.report(Utc::now()).feeds["tt"].ticks > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        assert_eq!(store.len(), 1);
        let report = health.report(Utc::now());
        assert_eq!(report.feeds["tt"].ticks, 1);
        assert_eq!(report.feeds["tt"].next_interval_secs, Cadence::default().upcoming.as_secs());
    }
}
