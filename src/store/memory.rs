use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{DocumentFilter, DocumentStore, StoreStats};
use crate::error::StoreError;
use crate::types::MatchDocument;

/// Process-local document store. Used with `STORE_BACKEND=memory` and by tests.
#[derive(Default)]
pub struct MemoryStore {
    /// id → document
    docs: DashMap<String, MatchDocument>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<MatchDocument>, StoreError> {
        Ok(self.docs.get(id).map(|d| d.clone()))
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<MatchDocument>, StoreError> {
        Ok(ids.iter().filter_map(|id| self.docs.get(id).map(|d| d.clone())).collect())
    }

    async fn upsert(&self, doc: &MatchDocument) -> Result<(), StoreError> {
        match self.docs.entry(doc.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if e.get().feed != doc.feed {
                    return Err(StoreError::Conflict { id: doc.id.clone(), owner: e.get().feed.clone() });
                }
                e.insert(doc.clone());
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(doc.clone());
            }
        }
        Ok(())
    }

    async fn query(&self, filter: &DocumentFilter) -> Result<Vec<MatchDocument>, StoreError> {
        let mut out: Vec<MatchDocument> = self
            .docs
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        filter.arrange(&mut out);
        Ok(out)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.docs.remove(id).is_some())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats::default();
        for entry in self.docs.iter() {
            let d = entry.value();
            stats.count(&d.feed, d.status.as_str(), 1);
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
