use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Upcoming,
    Live,
    Completed,
    Unknown,
}

impl MatchStatus {
    /// Position on the expected Upcoming → Live → Completed path.
    /// `Unknown` sits outside the path and never counts as a regression.
    fn progress(self) -> Option<u8> {
        match self {
            MatchStatus::Upcoming => Some(0),
            MatchStatus::Live => Some(1),
            MatchStatus::Completed => Some(2),
            MatchStatus::Unknown => None,
        }
    }

    /// True when moving from `self` to `next` walks backwards along the path.
    pub fn regresses_to(self, next: MatchStatus) -> bool {
        match (self.progress(), next.progress()) {
            (Some(from), Some(to)) => to < from,
            _ => false,
        }
    }

    /// Statuses the retention sweeper is allowed to delete.
    pub fn is_expirable(self) -> bool {
        matches!(self, MatchStatus::Completed | MatchStatus::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Upcoming => "upcoming",
            MatchStatus::Live => "live",
            MatchStatus::Completed => "completed",
            MatchStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upcoming" => Some(MatchStatus::Upcoming),
            "live" => Some(MatchStatus::Live),
            "completed" => Some(MatchStatus::Completed),
            "unknown" => Some(MatchStatus::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Canonical match record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    /// 1-based index of the period currently being played.
    pub current_period: u32,
    /// Per-period results in play order, e.g. `["11-9", "3-2"]`.
    pub periods: Vec<String>,
    /// Overall games tally when the board shows one, e.g. `"14-11"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_games: Option<String>,
}

/// Outcome label → displayed price. A `None` price means the outcome is listed but suspended.
pub type Odds = BTreeMap<String, Option<String>>;

/// One observed match at one point in time, produced by the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRecord {
    pub id: String,
    pub feed: String,
    pub status: MatchStatus,
    pub participants: [Participant; 2],
    pub score: Option<Score>,
    pub odds: Odds,
    pub start_time: Option<DateTime<Utc>>,
    pub league: Option<String>,
    pub tournament: Option<String>,
    pub observed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// History entries: each carries only what changed at `timestamp`
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub periods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_games: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OddsEntry {
    pub timestamp: DateTime<Utc>,
    /// Only the outcomes whose price moved. An outcome that left the board is recorded as null.
    pub prices: Odds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusReason {
    /// Synthetic completion: the match dropped off a live board.
    Disappeared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub timestamp: DateTime<Utc>,
    pub status: MatchStatus,
    #[serde(default, skip_serializing_if = "is_false")]
    pub anomalous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<StatusReason>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

// ---------------------------------------------------------------------------
// Persisted document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDocument {
    pub id: String,
    pub feed: String,
    pub status: MatchStatus,
    pub participants: [Participant; 2],
    #[serde(default)]
    pub score: Option<Score>,
    #[serde(default)]
    pub odds: Odds,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub league: Option<String>,
    #[serde(default)]
    pub tournament: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// Consecutive cycles a Live match has been missing from its board.
    #[serde(default)]
    pub missed_cycles: u32,
    #[serde(default)]
    pub score_history: Vec<ScoreEntry>,
    #[serde(default)]
    pub odds_history: Vec<OddsEntry>,
    #[serde(default)]
    pub status_history: Vec<StatusEntry>,
    /// Fields written by other versions. Kept so a rewrite never drops them.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MatchDocument {
    pub fn label(&self) -> String {
        format!("{} vs {}", self.participants[0].name, self.participants[1].name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
