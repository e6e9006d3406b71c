pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::types::{MatchDocument, MatchStatus};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Result order by `last_updated`; ties are always broken by ascending id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// Selection over persisted documents. Empty `statuses` matches every status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentFilter {
    pub feed: Option<String>,
    pub statuses: Vec<MatchStatus>,
    /// Strictly older than this instant.
    pub last_updated_before: Option<DateTime<Utc>>,
    /// At or after this instant.
    pub updated_since: Option<DateTime<Utc>>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl DocumentFilter {
    pub fn live_in_feed(feed: &str) -> Self {
        Self {
            feed: Some(feed.to_string()),
            statuses: vec![MatchStatus::Live],
            ..Self::default()
        }
    }

    pub fn matches(&self, doc: &MatchDocument) -> bool {
        self.feed.as_deref().map_or(true, |f| doc.feed == f)
            && (self.statuses.is_empty() || self.statuses.contains(&doc.status))
            && self.last_updated_before.map_or(true, |cutoff| doc.last_updated < cutoff)
            && self.updated_since.map_or(true, |since| doc.last_updated >= since)
    }

    /// Sort in place by this filter's order, then apply its limit.
    pub(crate) fn arrange(&self, docs: &mut Vec<MatchDocument>) {
        docs.sort_by(|a, b| {
            let by_time = match self.order {
                SortOrder::OldestFirst => a.last_updated.cmp(&b.last_updated),
                SortOrder::NewestFirst => b.last_updated.cmp(&a.last_updated),
            };
            by_time.then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_feed: BTreeMap<String, u64>,
}

impl StoreStats {
    fn count(&mut self, feed: &str, status: &str, n: u64) {
        self.total += n;
        *self.by_status.entry(status.to_string()).or_default() += n;
        *self.by_feed.entry(feed.to_string()).or_default() += n;
    }
}

/// Persistence for match documents. Implementations must make `upsert` atomic per
/// document: a reader sees either the old body or the new one, never a mix.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<MatchDocument>, StoreError>;

    /// Documents for whichever of `ids` exist. Order is unspecified.
    async fn get_many(&self, ids: &[String]) -> Result<Vec<MatchDocument>, StoreError>;

    async fn upsert(&self, doc: &MatchDocument) -> Result<(), StoreError>;

    async fn query(&self, filter: &DocumentFilter) -> Result<Vec<MatchDocument>, StoreError>;

    /// Returns whether a document was removed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}
