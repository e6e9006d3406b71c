//! Diffs a normalized batch against persisted documents and appends history.
//!
//! Everything here is pure. The diff is always taken against the documents the
//! caller read from the store, never against anything accumulated in memory, so
//! running the same batch against the same `previous` twice yields the same
//! output and no duplicate history entries.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::types::{
    MatchDocument, MatchRecord, MatchStatus, Odds, OddsEntry, Score, ScoreEntry, StatusEntry, StatusReason,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// Consecutive cycles a Live match may be missing before it is marked Completed.
    pub miss_threshold: u32,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self { miss_threshold: 2 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Change {
    Created,
    Score,
    Odds,
    Status,
    /// Participants, league, tournament or start time moved. No history entry.
    Metadata,
    /// A Live match was absent from the batch but is still under the threshold.
    Missed,
    /// A Live match reached the miss threshold and was completed.
    Disappeared,
    /// A previously missed match is back on the board.
    Reappeared,
}

/// Status moved backwards along Upcoming → Live → Completed. Applied anyway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnomalousTransition {
    pub id: String,
    pub from: MatchStatus,
    pub to: MatchStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub document: MatchDocument,
    /// Empty when the document is identical to the persisted one.
    pub changes: Vec<Change>,
    pub anomaly: Option<AnomalousTransition>,
}

impl Reconciled {
    pub fn changed(&self) -> bool {
        !self.changes.is_empty()
    }

    fn unchanged(document: MatchDocument) -> Self {
        Self { document, changes: Vec::new(), anomaly: None }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub missed: usize,
    pub completed: usize,
    pub anomalies: usize,
}

impl ReconcileSummary {
    pub fn of(results: &[Reconciled]) -> Self {
        let mut s = Self::default();
        for r in results {
            if r.changes.contains(&Change::Created) {
                s.created += 1;
            } else if r.changes.contains(&Change::Disappeared) {
                s.completed += 1;
            } else if r.changes == [Change::Missed] {
                s.missed += 1;
            } else if r.changed() {
                s.updated += 1;
            } else {
                s.unchanged += 1;
            }
            if r.anomaly.is_some() {
                s.anomalies += 1;
            }
        }
        s
    }
}

/// Reconcile one feed's batch.
///
/// `previous` must hold the persisted document for every id in `batch` that has
/// one, plus the feed's Live documents (for disappearance detection). Documents
/// are returned for every batch id (sorted by id) followed by every missed Live
/// document (sorted by id); only those with `changed()` need persisting.
///
/// `still_listed` holds ids the board showed but whose records were rejected.
/// Those documents are neither updated nor counted as missed.
pub fn reconcile(
    feed: &str,
    observed_at: DateTime<Utc>,
    batch: &[MatchRecord],
    still_listed: &HashSet<String>,
    previous: &HashMap<String, MatchDocument>,
    policy: &ReconcilePolicy,
) -> Vec<Reconciled> {
    // Later records for the same id win.
    let mut by_id: BTreeMap<&str, &MatchRecord> = BTreeMap::new();
    for record in batch.iter().filter(|r| r.feed == feed) {
        by_id.insert(record.id.as_str(), record);
    }

    let mut out: Vec<Reconciled> = by_id
        .values()
        .map(|record| match previous.get(&record.id) {
            Some(prev) => apply_record(prev, record),
            None => create_document(record),
        })
        .collect();

    let seen: HashSet<&str> = by_id.keys().copied().collect();
    let mut missing: Vec<&MatchDocument> = previous
        .values()
        .filter(|d| d.feed == feed && d.status == MatchStatus::Live)
        .filter(|d| !seen.contains(d.id.as_str()) && !still_listed.contains(&d.id))
        .collect();
    missing.sort_by(|a, b| a.id.cmp(&b.id));

    out.extend(missing.into_iter().map(|prev| apply_miss(prev, observed_at, policy)));
    out
}

/// Timestamp for a new entry: never earlier than the last entry of the same log.
fn stamp(last: Option<DateTime<Utc>>, at: DateTime<Utc>) -> DateTime<Utc> {
    last.map_or(at, |l| l.max(at))
}

fn create_document(record: &MatchRecord) -> Reconciled {
    let ts = record.observed_at;
    let score_history = record
        .score
        .as_ref()
        .map(|s| {
            vec![ScoreEntry {
                timestamp: ts,
                current_period: Some(s.current_period),
                periods: Some(s.periods.clone()),
                total_games: s.total_games.clone(),
            }]
        })
        .unwrap_or_default();
    let odds_history = if record.odds.is_empty() {
        Vec::new()
    } else {
        vec![OddsEntry { timestamp: ts, prices: record.odds.clone() }]
    };

    let document = MatchDocument {
        id: record.id.clone(),
        feed: record.feed.clone(),
        status: record.status,
        participants: record.participants.clone(),
        score: record.score.clone(),
        odds: record.odds.clone(),
        start_time: record.start_time,
        league: record.league.clone(),
        tournament: record.tournament.clone(),
        created_at: ts,
        last_updated: ts,
        missed_cycles: 0,
        score_history,
        odds_history,
        status_history: vec![StatusEntry { timestamp: ts, status: record.status, anomalous: false, reason: None }],
        extra: serde_json::Map::new(),
    };

    Reconciled { document, changes: vec![Change::Created], anomaly: None }
}

fn apply_record(prev: &MatchDocument, record: &MatchRecord) -> Reconciled {
    let mut doc = prev.clone();
    let mut changes = Vec::new();
    let mut anomaly = None;

    // A record without a score or odds means the board isn't showing them right now,
    // not that they were cleared.
    if let Some(score) = &record.score {
        let last = doc.score_history.last().map(|e| e.timestamp);
        if let Some((entry, merged)) = score_entry(doc.score.as_ref(), score, last, record.observed_at) {
            doc.score_history.push(entry);
            doc.score = Some(merged);
            changes.push(Change::Score);
        }
    }

    if !record.odds.is_empty() {
        let moved = odds_diff(&doc.odds, &record.odds);
        if !moved.is_empty() {
            let timestamp = stamp(doc.odds_history.last().map(|e| e.timestamp), record.observed_at);
            doc.odds_history.push(OddsEntry { timestamp, prices: moved });
            doc.odds = record.odds.clone();
            changes.push(Change::Odds);
        }
    }

    if record.status != doc.status {
        let timestamp = stamp(doc.status_history.last().map(|e| e.timestamp), record.observed_at);
        let anomalous = doc.status.regresses_to(record.status);
        if anomalous {
            anomaly = Some(AnomalousTransition {
                id: doc.id.clone(),
                from: doc.status,
                to: record.status,
                at: timestamp,
            });
        }
        doc.status_history.push(StatusEntry { timestamp, status: record.status, anomalous, reason: None });
        doc.status = record.status;
        changes.push(Change::Status);
    }

    if apply_metadata(&mut doc, record) {
        changes.push(Change::Metadata);
    }

    if !changes.is_empty() {
        doc.last_updated = doc.last_updated.max(record.observed_at);
    }

    if doc.missed_cycles != 0 {
        doc.missed_cycles = 0;
        changes.push(Change::Reappeared);
    }

    if changes.is_empty() {
        return Reconciled::unchanged(doc);
    }
    Reconciled { document: doc, changes, anomaly }
}

fn apply_miss(prev: &MatchDocument, observed_at: DateTime<Utc>, policy: &ReconcilePolicy) -> Reconciled {
    let mut doc = prev.clone();
    doc.missed_cycles = doc.missed_cycles.saturating_add(1);

    if doc.missed_cycles < policy.miss_threshold {
        return Reconciled { document: doc, changes: vec![Change::Missed], anomaly: None };
    }

    let timestamp = stamp(doc.status_history.last().map(|e| e.timestamp), observed_at);
    doc.status_history.push(StatusEntry {
        timestamp,
        status: MatchStatus::Completed,
        anomalous: false,
        reason: Some(StatusReason::Disappeared),
    });
    doc.status = MatchStatus::Completed;
    doc.last_updated = doc.last_updated.max(observed_at);

    Reconciled { document: doc, changes: vec![Change::Disappeared], anomaly: None }
}

/// Entry holding only the score sub-fields that moved, plus the merged score,
/// or `None` when nothing did. A games total the board stopped showing is kept.
fn score_entry(
    old: Option<&Score>,
    new: &Score,
    last: Option<DateTime<Utc>>,
    at: DateTime<Utc>,
) -> Option<(ScoreEntry, Score)> {
    let old_total = old.and_then(|o| o.total_games.clone());
    let merged = Score { total_games: new.total_games.clone().or_else(|| old_total.clone()), ..new.clone() };

    let period_moved = old.map_or(true, |o| o.current_period != merged.current_period);
    let periods_moved = old.map_or(true, |o| o.periods != merged.periods);
    let total_moved = merged.total_games != old_total;
    if !period_moved && !periods_moved && !total_moved {
        return None;
    }
    let entry = ScoreEntry {
        timestamp: stamp(last, at),
        current_period: period_moved.then_some(merged.current_period),
        periods: periods_moved.then(|| merged.periods.clone()),
        total_games: if total_moved { merged.total_games.clone() } else { None },
    };
    Some((entry, merged))
}

/// Outcomes whose price differs. Outcomes that left the board map to `None`.
fn odds_diff(old: &Odds, new: &Odds) -> Odds {
    let mut moved = Odds::new();
    for (label, price) in new {
        if old.get(label) != Some(price) {
            moved.insert(label.clone(), price.clone());
        }
    }
    for label in old.keys() {
        if !new.contains_key(label) {
            moved.insert(label.clone(), None);
        }
    }
    moved
}

/// Overwrite descriptive fields the record actually carries. Returns whether anything moved.
fn apply_metadata(doc: &mut MatchDocument, record: &MatchRecord) -> bool {
    let mut moved = false;
    if doc.participants != record.participants {
        doc.participants = record.participants.clone();
        moved = true;
    }
    if record.start_time.is_some() && doc.start_time != record.start_time {
        doc.start_time = record.start_time;
        moved = true;
    }
    if record.league.is_some() && doc.league != record.league {
        doc.league = record.league.clone();
        moved = true;
    }
    if record.tournament.is_some() && doc.tournament != record.tournament {
        doc.tournament = record.tournament.clone();
        moved = true;
    }
    moved
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
