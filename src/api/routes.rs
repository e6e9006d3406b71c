use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::api::health::{HealthRegistry, HealthReport};
use crate::api::latency::{FetchLatency, LatencySummary};
use crate::error::AppError;
use crate::store::{DocumentFilter, DocumentStore, SortOrder, StoreStats};
use crate::types::{
    MatchDocument, MatchStatus, Odds, OddsEntry, Participant, Score, ScoreEntry, StatusEntry,
};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1_000;
/// Widest look-back accepted by `hours` (30 days).
const MAX_WINDOW_HOURS: i64 = 720;
const DEFAULT_ODDS_WINDOW_HOURS: i64 = 24;
const DEFAULT_SCORE_WINDOW_HOURS: i64 = 2;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn DocumentStore>,
    pub health: Arc<HealthRegistry>,
    pub latency: Arc<FetchLatency>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(get_health))
        .route("/stats", get(get_stats))
        .route("/matches", get(get_matches))
        .route("/matches/:id", get(get_match))
        .route("/matches/:id/score_history", get(get_score_history))
        .route("/matches/:id/odds_history", get(get_odds_history))
        .route("/matches/:id/status_history", get(get_status_history))
        .route("/changes/odds", get(get_odds_changes))
        .route("/changes/scores", get(get_score_changes))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct MatchesQuery {
    pub feed: Option<String>,
    /// Comma-separated, e.g. `live,upcoming`.
    pub status: Option<String>,
    pub limit: Option<usize>,
    /// Only documents updated within the last `hours`.
    pub hours: Option<i64>,
    /// Only documents updated at or after this unix time (ms).
    pub since: Option<i64>,
    /// `newest` (default) or `oldest`.
    pub order: Option<String>,
}

impl MatchesQuery {
    fn filter(&self, now: DateTime<Utc>) -> Result<DocumentFilter, AppError> {
        let statuses = match &self.status {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    MatchStatus::parse(&s.to_ascii_lowercase())
                        .ok_or_else(|| AppError::BadRequest(format!("unknown status '{s}'")))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        let order = match self.order.as_deref().map(str::trim) {
            None | Some("") | Some("newest") => SortOrder::NewestFirst,
            Some("oldest") => SortOrder::OldestFirst,
            Some(other) => return Err(AppError::BadRequest(format!("order must be 'newest' or 'oldest', got '{other}'"))),
        };
        let since_ms = match self.since {
            Some(ms) => Some(
                DateTime::<Utc>::from_timestamp_millis(ms)
                    .ok_or_else(|| AppError::BadRequest(format!("since {ms} is out of range")))?,
            ),
            None => None,
        };
        // Both bounds given: the later one applies.
        let updated_since = match (self.hours.map(|h| window_start(now, h)), since_ms) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Ok(DocumentFilter {
            feed: non_empty(&self.feed),
            statuses,
            updated_since,
            order,
            limit: Some(clamp_limit(self.limit)),
            ..DocumentFilter::default()
        })
    }
}

/// Look-back window for the recent-changes endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ChangesQuery {
    pub feed: Option<String>,
    pub hours: Option<i64>,
    pub limit: Option<usize>,
}

fn non_empty(s: &Option<String>) -> Option<String> {
    s.clone().filter(|v| !v.is_empty())
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

fn window_start(now: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    now - Duration::hours(hours.clamp(1, MAX_WINDOW_HOURS))
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// A document without its history logs.
#[derive(Debug, Serialize)]
pub struct MatchSummary {
    pub id: String,
    pub feed: String,
    pub status: MatchStatus,
    pub participants: [Participant; 2],
    pub score: Option<Score>,
    pub odds: Odds,
    pub start_time: Option<DateTime<Utc>>,
    pub league: Option<String>,
    pub tournament: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl From<MatchDocument> for MatchSummary {
    fn from(d: MatchDocument) -> Self {
        Self {
            id: d.id,
            feed: d.feed,
            status: d.status,
            participants: d.participants,
            score: d.score,
            odds: d.odds,
            start_time: d.start_time,
            league: d.league,
            tournament: d.tournament,
            last_updated: d.last_updated,
        }
    }
}

/// A match whose prices moved at least once after it was first seen.
#[derive(Debug, Serialize)]
pub struct OddsChangeSummary {
    pub id: String,
    pub feed: String,
    pub status: MatchStatus,
    pub participants: [Participant; 2],
    pub league: Option<String>,
    pub odds_changes: usize,
    pub initial_odds: Option<OddsEntry>,
    pub latest_odds: Option<OddsEntry>,
    pub last_updated: DateTime<Utc>,
}

/// A live match with recorded score progression.
#[derive(Debug, Serialize)]
pub struct ScoreChangeSummary {
    pub id: String,
    pub feed: String,
    pub participants: [Participant; 2],
    pub league: Option<String>,
    pub score_updates: usize,
    pub current_score: Option<Score>,
    pub latest_change: Option<ScoreEntry>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub documents: StoreStats,
    pub fetch_latency: LatencySummary,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn root() -> &'static str {
    "Live board tracker - OK"
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthReport> {
    Json(state.health.report(Utc::now()))
}

async fn get_stats(State(state): State<ApiState>) -> Result<Json<StatsResponse>, AppError> {
    let documents = state.store.stats().await?;
    Ok(Json(StatsResponse { documents, fetch_latency: state.latency.summary() }))
}

async fn get_matches(
    State(state): State<ApiState>,
    Query(params): Query<MatchesQuery>,
) -> Result<Json<Vec<MatchSummary>>, AppError> {
    let filter = params.filter(Utc::now())?;
    let docs = state.store.query(&filter).await?;
    Ok(Json(docs.into_iter().map(MatchSummary::from).collect()))
}

/// Newest-first documents in the window, before the per-endpoint predicate and limit.
async fn recent(
    state: &ApiState,
    params: &ChangesQuery,
    statuses: Vec<MatchStatus>,
    default_hours: i64,
) -> Result<Vec<MatchDocument>, AppError> {
    let filter = DocumentFilter {
        feed: non_empty(&params.feed),
        statuses,
        updated_since: Some(window_start(Utc::now(), params.hours.unwrap_or(default_hours))),
        order: SortOrder::NewestFirst,
        ..DocumentFilter::default()
    };
    Ok(state.store.query(&filter).await?)
}

async fn get_odds_changes(
    State(state): State<ApiState>,
    Query(params): Query<ChangesQuery>,
) -> Result<Json<Vec<OddsChangeSummary>>, AppError> {
    let docs = recent(&state, &params, Vec::new(), DEFAULT_ODDS_WINDOW_HOURS).await?;
    let out = docs
        .into_iter()
        .filter(|d| d.odds_history.len() > 1)
        .take(clamp_limit(params.limit))
        .map(|d| OddsChangeSummary {
            odds_changes: d.odds_history.len() - 1,
            initial_odds: d.odds_history.first().cloned(),
            latest_odds: d.odds_history.last().cloned(),
            id: d.id,
            feed: d.feed,
            status: d.status,
            participants: d.participants,
            league: d.league,
            last_updated: d.last_updated,
        })
        .collect();
    Ok(Json(out))
}

async fn get_score_changes(
    State(state): State<ApiState>,
    Query(params): Query<ChangesQuery>,
) -> Result<Json<Vec<ScoreChangeSummary>>, AppError> {
    let docs = recent(&state, &params, vec![MatchStatus::Live], DEFAULT_SCORE_WINDOW_HOURS).await?;
    let out = docs
        .into_iter()
        .filter(|d| !d.score_history.is_empty())
        .take(clamp_limit(params.limit))
        .map(|d| ScoreChangeSummary {
            score_updates: d.score_history.len(),
            latest_change: d.score_history.last().cloned(),
            id: d.id,
            feed: d.feed,
            participants: d.participants,
            league: d.league,
            current_score: d.score,
            last_updated: d.last_updated,
        })
        .collect();
    Ok(Json(out))
}

async fn load(state: &ApiState, id: &str) -> Result<MatchDocument, AppError> {
    state
        .store
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("match {id}")))
}

async fn get_match(State(state): State<ApiState>, Path(id): Path<String>) -> Result<Json<MatchDocument>, AppError> {
    Ok(Json(load(&state, &id).await?))
}

async fn get_score_history(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ScoreEntry>>, AppError> {
    Ok(Json(load(&state, &id).await?.score_history))
}

async fn get_odds_history(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<OddsEntry>>, AppError> {
    Ok(Json(load(&state, &id).await?.odds_history))
}

async fn get_status_history(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<StatusEntry>>, AppError> {
    Ok(Json(load(&state, &id).await?.status_history))
}
