use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::info;

use super::{DocumentFilter, DocumentStore, SortOrder, StoreStats};
use crate::error::{Result, StoreError};
use crate::types::MatchDocument;

/// SQLite caps bound parameters per statement; `get_many` chunks below that.
const MAX_IDS_PER_QUERY: usize = 500;

/// Indexed columns are copies of document fields; `body` is the source of truth.
#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    id: String,
    body: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    feed: String,
    status: String,
    n: i64,
}

impl DocumentRow {
    fn decode(self) -> std::result::Result<MatchDocument, StoreError> {
        serde_json::from_str(&self.body).map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.id)))
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and run pending migrations.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database ready at {path}");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, id: &str) -> std::result::Result<Option<MatchDocument>, StoreError> {
        let row = sqlx::query_as::<_, DocumentRow>("SELECT id, body FROM match_documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(DocumentRow::decode).transpose()
    }

    async fn get_many(&self, ids: &[String]) -> std::result::Result<Vec<MatchDocument>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_IDS_PER_QUERY) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT id, body FROM match_documents WHERE id IN (");
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");

            let rows = qb.build_query_as::<DocumentRow>().fetch_all(&self.pool).await?;
            for row in rows {
                out.push(row.decode()?);
            }
        }
        Ok(out)
    }

    async fn upsert(&self, doc: &MatchDocument) -> std::result::Result<(), StoreError> {
        let body = serde_json::to_string(doc)?;
        let result = sqlx::query(
            r#"
            INSERT INTO match_documents (id, feed, status, created_at_ms, last_updated_ms, body)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                last_updated_ms = excluded.last_updated_ms,
                body = excluded.body
            WHERE match_documents.feed = excluded.feed
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.feed)
        .bind(doc.status.as_str())
        .bind(doc.created_at.timestamp_millis())
        .bind(doc.last_updated.timestamp_millis())
        .bind(body)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let owner: Option<String> = sqlx::query_scalar("SELECT feed FROM match_documents WHERE id = ?")
                .bind(&doc.id)
                .fetch_optional(&self.pool)
                .await?;
            return Err(StoreError::Conflict { id: doc.id.clone(), owner: owner.unwrap_or_default() });
        }
        Ok(())
    }

    async fn query(&self, filter: &DocumentFilter) -> std::result::Result<Vec<MatchDocument>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT id, body FROM match_documents WHERE 1 = 1");
        if let Some(feed) = &filter.feed {
            qb.push(" AND feed = ").push_bind(feed.clone());
        }
        if !filter.statuses.is_empty() {
            qb.push(" AND status IN (");
            let mut separated = qb.separated(", ");
            for status in &filter.statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
        if let Some(cutoff) = filter.last_updated_before {
            qb.push(" AND last_updated_ms < ").push_bind(cutoff.timestamp_millis());
        }
        if let Some(since) = filter.updated_since {
            qb.push(" AND last_updated_ms >= ").push_bind(since.timestamp_millis());
        }
        qb.push(match filter.order {
            SortOrder::OldestFirst => " ORDER BY last_updated_ms ASC, id ASC",
            SortOrder::NewestFirst => " ORDER BY last_updated_ms DESC, id ASC",
        });
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = qb.build_query_as::<DocumentRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(DocumentRow::decode).collect()
    }

    async fn delete(&self, id: &str) -> std::result::Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM match_documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn stats(&self) -> std::result::Result<StoreStats, StoreError> {
        let rows = sqlx::query_as::<_, StatsRow>(
            "SELECT feed, status, COUNT(*) AS n FROM match_documents GROUP BY feed, status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = StoreStats::default();
        for row in rows {
            stats.count(&row.feed, &row.status, u64::try_from(row.n).unwrap_or(0));
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
