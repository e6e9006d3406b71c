use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::FeedConfig;
use crate::error::{is_retryable_status, FetchError, ParseFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// The whole board: live, upcoming and recently finished matches.
    Full,
    /// Only matches currently in play. Cheaper, used between full fetches.
    LiveOnly,
}

impl std::fmt::Display for FetchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchMode::Full => write!(f, "full"),
            FetchMode::LiveOnly => write!(f, "live_only"),
        }
    }
}

/// Raw board content for one feed, as returned by the source.
#[derive(Debug, Clone)]
pub struct RawSnapshot {
    pub feed: String,
    pub mode: FetchMode,
    pub fetched_at: DateTime<Utc>,
    pub body: String,
}

// ---------------------------------------------------------------------------
// Raw records, loosely typed and validated by the normalizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawParticipant {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawScore {
    #[serde(default)]
    pub current_period: Option<u32>,
    #[serde(default)]
    pub periods: Vec<String>,
    #[serde(default)]
    pub total_games: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMatch {
    /// Upstream event id, when the board exposes one.
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub participants: Vec<RawParticipant>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub score: Option<RawScore>,
    /// Outcome label → price; prices may be strings ("+150"), numbers or null.
    #[serde(default)]
    pub odds: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub league: Option<String>,
    #[serde(default)]
    pub tournament: Option<String>,
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, feed: &FeedConfig, mode: FetchMode) -> Result<RawSnapshot, FetchError>;
}

/// Turns a snapshot into per-record results. One bad record never fails the batch.
pub trait SnapshotParser: Send + Sync {
    fn parse(&self, snapshot: &RawSnapshot) -> Vec<Result<RawMatch, ParseFailure>>;
}

// ---------------------------------------------------------------------------
// HTTP JSON board source
// ---------------------------------------------------------------------------

/// Fetches a board rendered as JSON. `LiveOnly` adds `live=true` to the query string.
pub struct HttpBoardSource {
    client: reqwest::Client,
}

impl HttpBoardSource {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Fatal(format!("building HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

pub fn board_url(base: &str, mode: FetchMode) -> String {
    match mode {
        FetchMode::Full => base.to_string(),
        FetchMode::LiveOnly => {
            let sep = if base.contains('?') { '&' } else { '?' };
            format!("{base}{sep}live=true")
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpBoardSource {
    async fn fetch(&self, feed: &FeedConfig, mode: FetchMode) -> Result<RawSnapshot, FetchError> {
        let url = board_url(&feed.url, mode);
        debug!(feed = %feed.id, %mode, "fetching {url}");

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let msg = format!("{url} returned {status}");
            return Err(if is_retryable_status(status.as_u16()) {
                FetchError::Transient(msg)
            } else {
                FetchError::Fatal(msg)
            });
        }

        let body = resp.text().await?;
        Ok(RawSnapshot {
            feed: feed.id.clone(),
            mode,
            fetched_at: Utc::now(),
            body,
        })
    }
}

/// Parses `[{...}, ...]` or `{"matches": [{...}, ...]}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonBoardParser;

impl SnapshotParser for JsonBoardParser {
    fn parse(&self, snapshot: &RawSnapshot) -> Vec<Result<RawMatch, ParseFailure>> {
        let root: serde_json::Value = match serde_json::from_str(&snapshot.body) {
            Ok(v) => v,
            Err(e) => {
                return vec![Err(ParseFailure { index: 0, reason: format!("board is not JSON: {e}") })];
            }
        };

        let items = match root {
            serde_json::Value::Array(items) => items,
            serde_json::Value::Object(mut obj) => match obj.remove("matches") {
                Some(serde_json::Value::Array(items)) => items,
                _ => {
                    return vec![Err(ParseFailure { index: 0, reason: "board has no 'matches' array".to_string() })];
                }
            },
            _ => return vec![Err(ParseFailure { index: 0, reason: "board root is not a list".to_string() })],
        };

        debug!(feed = %snapshot.feed, mode = %snapshot.mode, records = items.len(), "parsed board");
        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                serde_json::from_value::<RawMatch>(item).map_err(|e| ParseFailure { index, reason: e.to_string() })
            })
            .collect()
    }
}
