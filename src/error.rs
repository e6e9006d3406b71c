use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Store(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

// ---------------------------------------------------------------------------
// Pipeline errors
// ---------------------------------------------------------------------------

/// Errors that can be worth another attempt.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// One raw record could not be turned into a canonical match. The record is dropped;
/// the rest of the batch continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("feed id is empty")]
    MissingFeed,

    #[error("expected 2 participants, found {0}")]
    ParticipantCount(usize),

    #[error("participant {0} has no name")]
    MissingParticipant(usize),

    #[error("status is missing")]
    MissingStatus,

    #[error("unrecognised status '{0}'")]
    UnknownStatus(String),

    #[error("malformed score: {0}")]
    MalformedScore(String),

    #[error("malformed odds for '{0}'")]
    MalformedOdds(String),

    #[error("malformed start time '{0}'")]
    MalformedStartTime(String),
}

/// A single entry of a board snapshot that the parser could not read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record {index}: {reason}")]
pub struct ParseFailure {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Network hiccup, upstream 5xx, throttling. Retried with backoff.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    /// Bad URL, 4xx, unreadable body. The tick is abandoned.
    #[error("fetch failed: {0}")]
    Fatal(String),
}

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::Timeout(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            return FetchError::Transient(e.to_string());
        }
        match e.status() {
            Some(status) if is_retryable_status(status.as_u16()) => FetchError::Transient(e.to_string()),
            _ => FetchError::Fatal(e.to_string()),
        }
    }
}

/// 408, 425, 429 and every 5xx are worth retrying; any other status is final.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429 | 500..=599)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[from] sqlx::Error),

    #[error("document serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),

    /// An upsert tried to move an existing id to a different feed.
    #[error("document {id} belongs to feed '{owner}'")]
    Conflict { id: String, owner: String },
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Backend(e) => match e {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
                sqlx::Error::Database(db) => {
                    let msg = db.message();
                    msg.contains("locked") || msg.contains("busy")
                }
                _ => false,
            },
            StoreError::Serialization(_) | StoreError::Corrupt(_) | StoreError::Conflict { .. } => false,
        }
    }
}

/// Why a reconciliation cycle was abandoned. The feed loop logs it and waits for the next tick.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Every record failed to parse, so absence from the board means nothing this cycle.
    #[error("board unreadable: {0}")]
    Unreadable(String),
}
