use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::StoreError;
use crate::retry::{retry_async, RetryPolicy};
use crate::store::{DocumentFilter, DocumentStore};
use crate::types::{MatchDocument, MatchStatus};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub deleted: usize,
    /// Candidates that changed status or were touched since the query.
    pub skipped: usize,
    pub failed: usize,
}

/// Oldest `last_updated` that is still retained, or `None` if the window reaches past the epoch range.
pub fn cutoff(now: DateTime<Utc>, retention: Duration) -> Option<DateTime<Utc>> {
    let retention = chrono::Duration::from_std(retention).ok()?;
    now.checked_sub_signed(retention)
}

/// Completed or Unknown and untouched for longer than the retention window.
/// Live and Upcoming documents are never expired, whatever their age.
pub fn is_expired(doc: &MatchDocument, now: DateTime<Utc>, retention: Duration) -> bool {
    doc.status.is_expirable() && cutoff(now, retention).map_or(false, |c| doc.last_updated < c)
}

/// Background task that deletes stale finished documents every `interval`.
pub struct RetentionSweeper {
    store: Arc<dyn DocumentStore>,
    retention: Duration,
    interval: Duration,
    batch_size: usize,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn DocumentStore>, cfg: &Config, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            store,
            retention: cfg.retention,
            interval: cfg.sweep_interval,
            batch_size: cfg.sweep_batch_size.max(1),
            retry: cfg.retry.clone(),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *self.shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sweep_once(Utc::now()).await {
                error!("Retention sweep error: {e}");
            }
        }
        info!("retention sweeper stopped");
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        let Some(before) = cutoff(now, self.retention) else {
            return Ok(report);
        };
        let filter = DocumentFilter {
            feed: None,
            statuses: vec![MatchStatus::Completed, MatchStatus::Unknown],
            last_updated_before: Some(before),
            limit: Some(self.batch_size),
            ..DocumentFilter::default()
        };
        let filter = &filter;
        let store = &*self.store;
        let retry = &self.retry;

        loop {
            let batch = retry_async(retry, "sweep query", move || store.query(filter)).await?;
            let batch_len = batch.len();
            let mut progressed = false;

            for candidate in batch {
                report.examined += 1;
                let id = candidate.id.as_str();

                // Re-read: the owning feed loop may have revived it since the query.
                let current = match retry_async(retry, "sweep get", move || store.get(id)).await {
                    Ok(current) => current,
                    Err(e) => {
                        warn!(id, "sweep re-check failed: {e}");
                        report.failed += 1;
                        continue;
                    }
                };
                match current {
                    Some(doc) if is_expired(&doc, now, self.retention) => {
                        match retry_async(retry, "sweep delete", move || store.delete(id)).await {
                            Ok(true) => {
                                report.deleted += 1;
                                progressed = true;
                            }
                            Ok(false) => report.skipped += 1,
                            Err(e) => {
                                warn!(id, "sweep delete failed: {e}");
                                report.failed += 1;
                            }
                        }
                    }
                    _ => report.skipped += 1,
                }
            }

            // A short batch is the last one; a batch with no deletions would come back unchanged.
            if batch_len < self.batch_size || !progressed {
                break;
            }
        }

        info!(
            examined = report.examined,
            deleted = report.deleted,
            skipped = report.skipped,
            failed = report.failed,
            "Retention sweep complete: {} deleted, {} failed",
            report.deleted,
            report.failed,
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::document;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    const WEEK: Duration = Duration::from_secs(7 * 86_400);

    fn sweeper(store: Arc<MemoryStore>, batch_size: usize) -> RetentionSweeper {
        let (_tx, rx) = watch::channel(false);
        RetentionSweeper {
            store,
            retention: WEEK,
            interval: Duration::from_secs(3600),
            batch_size,
            retry: RetryPolicy { max_attempts: 2, base_delay_ms: 1, max_delay_ms: 2 },
            shutdown: rx,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 20, 0, 0, 0).unwrap()
    }

    #[test]
    fn only_finished_documents_past_retention_expire() {
        let old = now() - chrono::Duration::days(8);
        let fresh = now() - chrono::Duration::days(6);
        assert!(is_expired(&document("a", "tt", MatchStatus::Completed, old), now(), WEEK));
        assert!(is_expired(&document("b", "tt", MatchStatus::Unknown, old), now(), WEEK));
        assert!(!is_expired(&document("c", "tt", MatchStatus::Live, old), now(), WEEK));
        assert!(!is_expired(&document("d", "tt", MatchStatus::Upcoming, old), now(), WEEK));
        assert!(!is_expired(&document("e", "tt", MatchStatus::Completed, fresh), now(), WEEK));
    }

    #[test]
    fn absurd_retention_expires_nothing() {
        let ancient = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        let doc = document("a", "tt", MatchStatus::Completed, ancient);
        assert!(!is_expired(&doc, now(), Duration::from_secs(u64::MAX)));
    }

    #[tokio::test]
    async fn sweep_deletes_stale_completed_and_keeps_live() {
        let store = MemoryStore::new();
        let old = now() - chrono::Duration::days(8);
        store.upsert(&document("done", "tt", MatchStatus::Completed, old)).await.unwrap();
        store.upsert(&document("live", "tt", MatchStatus::Live, old)).await.unwrap();
        store.upsert(&document("recent", "tt", MatchStatus::Completed, now())).await.unwrap();

        let report = sweeper(store.clone(), 100).sweep_once(now()).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(store.get("done").await.unwrap().is_none());
        assert!(store.get("live").await.unwrap().is_some());
        assert!(store.get("recent").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_works_through_multiple_batches() {
        let store = MemoryStore::new();
        let old = now() - chrono::Duration::days(30);
        for i in 0..7 {
            let status = if i % 2 == 0 { MatchStatus::Completed } else { MatchStatus::Unknown };
            store.upsert(&document(&format!("m{i}"), "tt", status, old)).await.unwrap();
        }
        let report = sweeper(store.clone(), 3).sweep_once(now()).await.unwrap();
        assert_eq!(report.deleted, 7);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let store = MemoryStore::new();
        let (tx, rx) = watch::channel(false);
        let mut sw = sweeper(store, 10);
        sw.shutdown = rx;
        let handle = tokio::spawn(sw.run());
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
