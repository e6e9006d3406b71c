//! Raw board records → canonical [`MatchRecord`]s.
//!
//! Pure and deterministic: the same raw record, feed and observation time
//! always produce the same record, including the same id.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::{NormalizationError, ParseFailure};
use crate::source::{RawMatch, RawParticipant, RawScore};
use crate::types::{MatchRecord, MatchStatus, Odds, Participant, Score};

/// Hex chars of the SHA-256 digest kept in the id (128 bits).
const ID_DIGEST_CHARS: usize = 32;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NormalizeStats {
    pub total: usize,
    pub accepted: usize,
    pub parse_failures: usize,
    pub rejected_participants: usize,
    pub rejected_status: usize,
    pub rejected_score: usize,
    pub rejected_odds: usize,
    pub rejected_start_time: usize,
    pub rejected_feed: usize,
}

impl NormalizeStats {
    pub fn dropped(&self) -> usize {
        self.total - self.accepted
    }

    fn count(&mut self, e: &NormalizationError) {
        match e {
            NormalizationError::MissingFeed => self.rejected_feed += 1,
            NormalizationError::ParticipantCount(_) | NormalizationError::MissingParticipant(_) => {
                self.rejected_participants += 1
            }
            NormalizationError::MissingStatus | NormalizationError::UnknownStatus(_) => self.rejected_status += 1,
            NormalizationError::MalformedScore(_) => self.rejected_score += 1,
            NormalizationError::MalformedOdds(_) => self.rejected_odds += 1,
            NormalizationError::MalformedStartTime(_) => self.rejected_start_time += 1,
        }
    }
}

/// Output of [`normalize_batch`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NormalizedBatch {
    pub records: Vec<MatchRecord>,
    pub stats: NormalizeStats,
    /// Ids of rejected records that still identify a match (via the upstream event id).
    /// The match is on the board even though this observation of it was unusable.
    pub rejected_ids: HashSet<String>,
}

/// Normalize a whole parser output. Failed records are dropped and counted.
pub fn normalize_batch(
    feed: &str,
    observed_at: DateTime<Utc>,
    parsed: Vec<Result<RawMatch, ParseFailure>>,
) -> NormalizedBatch {
    let mut stats = NormalizeStats { total: parsed.len(), ..Default::default() };
    let mut records = Vec::with_capacity(parsed.len());
    let mut rejected_ids = HashSet::new();

    for item in parsed {
        let raw = match item {
            Ok(raw) => raw,
            Err(_) => {
                stats.parse_failures += 1;
                continue;
            }
        };
        match normalize(feed, observed_at, &raw) {
            Ok(record) => records.push(record),
            Err(e) => {
                stats.count(&e);
                if let Some(id) = rejected_id(feed, &raw) {
                    rejected_ids.insert(id);
                }
            }
        }
    }

    stats.accepted = records.len();
    NormalizedBatch { records, stats, rejected_ids }
}

fn rejected_id(feed: &str, raw: &RawMatch) -> Option<String> {
    let feed = feed.trim();
    let event_id = clean_event_id(raw.event_id.as_deref())?;
    (!feed.is_empty()).then(|| digest_id(feed, &["event", event_id]))
}

fn clean_event_id(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

pub fn normalize(feed: &str, observed_at: DateTime<Utc>, raw: &RawMatch) -> Result<MatchRecord, NormalizationError> {
    let feed = feed.trim();
    if feed.is_empty() {
        return Err(NormalizationError::MissingFeed);
    }

    let participants = normalize_participants(&raw.participants)?;
    let status = normalize_status(raw.status.as_deref())?;
    let score = raw.score.as_ref().map(normalize_score).transpose()?.flatten();
    let odds = normalize_odds(&raw.odds)?;
    let start_time = raw
        .start_time
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| NormalizationError::MalformedStartTime(s.to_string()))
        })
        .transpose()?;

    let event_id = clean_event_id(raw.event_id.as_deref());
    let id = match_id(feed, &participants, start_time, event_id);

    Ok(MatchRecord {
        id,
        feed: feed.to_string(),
        status,
        participants,
        score,
        odds,
        start_time,
        league: clean(raw.league.as_deref()),
        tournament: clean(raw.tournament.as_deref()),
        observed_at,
    })
}

/// Stable id: `{feed}-{sha256 prefix}`. Hashes the upstream event id when the board
/// has one, otherwise the participants (case/whitespace-insensitive) and start time.
/// Components are length-prefixed so no two distinct inputs share an encoding.
pub fn match_id(
    feed: &str,
    participants: &[Participant; 2],
    start_time: Option<DateTime<Utc>>,
    event_id: Option<&str>,
) -> String {
    match event_id {
        Some(eid) => digest_id(feed, &["event", eid]),
        None => {
            let home = name_key(&participants[0].name);
            let away = name_key(&participants[1].name);
            let start = start_time.map(|t| t.to_rfc3339()).unwrap_or_default();
            digest_id(feed, &["pair", home.as_str(), away.as_str(), start.as_str()])
        }
    }
}

fn digest_id(feed: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in std::iter::once(feed).chain(parts.iter().copied()) {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{feed}-{}", &digest[..ID_DIGEST_CHARS])
}

fn name_key(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn clean(s: Option<&str>) -> Option<String> {
    s.map(|s| s.split_whitespace().collect::<Vec<_>>().join(" ")).filter(|s| !s.is_empty())
}

fn normalize_participants(raw: &[RawParticipant]) -> Result<[Participant; 2], NormalizationError> {
    if raw.len() != 2 {
        return Err(NormalizationError::ParticipantCount(raw.len()));
    }
    let one = |i: usize| -> Result<Participant, NormalizationError> {
        let name = clean(raw[i].name.as_deref()).ok_or(NormalizationError::MissingParticipant(i))?;
        Ok(Participant {
            name,
            rank: raw[i].rank,
            country: clean(raw[i].country.as_deref()),
        })
    };
    Ok([one(0)?, one(1)?])
}

fn normalize_status(raw: Option<&str>) -> Result<MatchStatus, NormalizationError> {
    let s = raw.map(str::trim).filter(|s| !s.is_empty()).ok_or(NormalizationError::MissingStatus)?;
    let status = match s.to_ascii_lowercase().as_str() {
        "live" | "in_play" | "inplay" | "in-play" => MatchStatus::Live,
        "upcoming" | "scheduled" | "pre" | "prematch" | "not_started" => MatchStatus::Upcoming,
        "completed" | "ended" | "finished" | "final" | "closed" => MatchStatus::Completed,
        "unknown" => MatchStatus::Unknown,
        _ => return Err(NormalizationError::UnknownStatus(s.to_string())),
    };
    Ok(status)
}

/// `Ok(None)` when the board shows no score yet.
fn normalize_score(raw: &RawScore) -> Result<Option<Score>, NormalizationError> {
    let periods = raw
        .periods
        .iter()
        .map(|p| normalize_period(p))
        .collect::<Result<Vec<_>, _>>()?;

    if periods.is_empty() {
        return match raw.current_period {
            None => Ok(None),
            Some(_) => Err(NormalizationError::MalformedScore("current period without period results".to_string())),
        };
    }

    let current_period = raw.current_period.unwrap_or(periods.len() as u32);
    if current_period == 0 || current_period as usize > periods.len() {
        return Err(NormalizationError::MalformedScore(format!(
            "current period {current_period} outside 1..={}",
            periods.len()
        )));
    }
    let total_games = raw
        .total_games
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(normalize_period)
        .transpose()?;
    Ok(Some(Score { current_period, periods, total_games }))
}

/// `"11 - 9"` → `"11-9"`. Both sides must be non-negative integers.
fn normalize_period(p: &str) -> Result<String, NormalizationError> {
    let malformed = || NormalizationError::MalformedScore(format!("period '{p}'"));
    let (a, b) = p.split_once('-').ok_or_else(malformed)?;
    let a: u32 = a.trim().parse().map_err(|_| malformed())?;
    let b: u32 = b.trim().parse().map_err(|_| malformed())?;
    Ok(format!("{a}-{b}"))
}

fn normalize_odds(raw: &std::collections::BTreeMap<String, serde_json::Value>) -> Result<Odds, NormalizationError> {
    let mut odds = Odds::new();
    for (label, value) in raw {
        let label = label.trim();
        if label.is_empty() {
            continue;
        }
        let price = match value {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => return Err(NormalizationError::MalformedOdds(label.to_string())),
        };
        odds.insert(label.to_string(), price);
    }
    Ok(odds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn raw(a: &str, b: &str, status: &str) -> RawMatch {
        RawMatch {
            participants: vec![
                RawParticipant { name: Some(a.to_string()), ..Default::default() },
                RawParticipant { name: Some(b.to_string()), ..Default::default() },
            ],
            status: Some(status.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn normalizes_a_complete_record() {
        let mut r = raw("Jan  Novak", "Petr Svoboda", "In-Play");
        r.score = Some(RawScore {
            periods: vec!["11 - 9".into(), "3-2".into()],
            total_games: Some("14 - 11".into()),
            ..Default::default()
        });
        r.odds.insert("Jan Novak".into(), serde_json::json!("-120"));
        r.odds.insert("Petr Svoboda".into(), serde_json::json!(105));
        r.odds.insert("Draw".into(), serde_json::Value::Null);
        r.start_time = Some("2026-03-01T11:30:00+01:00".into());

        let m = normalize("liga_pro", at(), &r).unwrap();
        assert_eq!(m.status, MatchStatus::Live);
        assert_eq!(m.participants[0].name, "Jan Novak");
        let score = m.score.unwrap();
        assert_eq!(score.current_period, 2);
        assert_eq!(score.periods, vec!["11-9", "3-2"]);
        assert_eq!(score.total_games.as_deref(), Some("14-11"));
        assert_eq!(m.odds.get("Petr Svoboda"), Some(&Some("105".to_string())));
        assert_eq!(m.odds.get("Draw"), Some(&None));
        assert_eq!(m.start_time, Some(Utc.with_ymd_and_hms(2026, 3, 1, 10, 30, 0).unwrap()));
        assert!(m.id.starts_with("liga_pro-"));
    }

    #[test]
    fn id_is_stable_across_observations_and_formatting() {
        let a = normalize("tt", at(), &raw("Jan Novak", "Petr Svoboda", "live")).unwrap();
        let later = at() + chrono::Duration::minutes(5);
        let b = normalize("tt", later, &raw(" jan  NOVAK ", "Petr Svoboda", "upcoming")).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn id_separates_feeds_order_and_start_times() {
        let base = normalize("tt", at(), &raw("A", "B", "live")).unwrap();
        let other_feed = normalize("tt2", at(), &raw("A", "B", "live")).unwrap();
        let swapped = normalize("tt", at(), &raw("B", "A", "live")).unwrap();
        let mut timed = raw("A", "B", "live");
        timed.start_time = Some("2026-03-01T13:00:00Z".into());
        let timed = normalize("tt", at(), &timed).unwrap();
        let merged = normalize("tt", at(), &raw("AB", "x", "live")).unwrap();

        let ids = [&base.id, &other_feed.id, &swapped.id, &timed.id, &merged.id];
        for (i, x) in ids.iter().enumerate() {
            for y in &ids[i + 1..] {
                assert_ne!(x, y);
            }
        }
    }

    #[test]
    fn upstream_event_id_wins_over_participants() {
        let mut a = raw("A", "B", "live");
        a.event_id = Some("98765".into());
        let mut b = raw("A (renamed)", "B", "live");
        b.event_id = Some("98765".into());
        assert_eq!(normalize("tt", at(), &a).unwrap().id, normalize("tt", at(), &b).unwrap().id);
    }

    #[test]
    fn rejects_missing_required_fields() {
        let mut one_player = raw("A", "B", "live");
        one_player.participants.pop();
        assert_eq!(normalize("tt", at(), &one_player), Err(NormalizationError::ParticipantCount(1)));

        let blank = raw("A", "  ", "live");
        assert_eq!(normalize("tt", at(), &blank), Err(NormalizationError::MissingParticipant(1)));

        let mut no_status = raw("A", "B", "live");
        no_status.status = None;
        assert_eq!(normalize("tt", at(), &no_status), Err(NormalizationError::MissingStatus));

        assert!(matches!(
            normalize("tt", at(), &raw("A", "B", "postponed")),
            Err(NormalizationError::UnknownStatus(_))
        ));
        assert_eq!(normalize(" ", at(), &raw("A", "B", "live")), Err(NormalizationError::MissingFeed));
    }

    #[test]
    fn rejects_malformed_score_and_start_time() {
        let mut bad_period = raw("A", "B", "live");
        bad_period.score = Some(RawScore { periods: vec!["eleven-9".into()], ..Default::default() });
        assert!(matches!(normalize("tt", at(), &bad_period), Err(NormalizationError::MalformedScore(_))));

        let mut out_of_range = raw("A", "B", "live");
        out_of_range.score = Some(RawScore { current_period: Some(3), periods: vec!["1-0".into()], ..Default::default() });
        assert!(matches!(normalize("tt", at(), &out_of_range), Err(NormalizationError::MalformedScore(_))));

        let mut bad_time = raw("A", "B", "upcoming");
        bad_time.start_time = Some("tomorrow".into());
        assert!(matches!(normalize("tt", at(), &bad_time), Err(NormalizationError::MalformedStartTime(_))));
    }

    #[test]
    fn empty_score_means_not_started() {
        let mut r = raw("A", "B", "upcoming");
        r.score = Some(RawScore::default());
        assert_eq!(normalize("tt", at(), &r).unwrap().score, None);
    }

    #[test]
    fn batch_drops_and_counts_failures() {
        let parsed = vec![
            Ok(raw("A", "B", "live")),
            Err(ParseFailure { index: 1, reason: "bad".into() }),
            Ok(raw("C", "D", "nonsense")),
            Ok(raw("E", "F", "upcoming")),
        ];
        let NormalizedBatch { records, stats, rejected_ids } = normalize_batch("tt", at(), parsed);
        assert_eq!(records.len(), 2);
        assert!(rejected_ids.is_empty());
        assert_eq!(stats.total, 4);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.parse_failures, 1);
        assert_eq!(stats.rejected_status, 1);
        assert_eq!(stats.dropped(), 2);
    }

    #[test]
    fn rejected_records_with_an_event_id_keep_their_id() {
        let mut good = raw("A", "B", "live");
        good.event_id = Some("ev-1".into());
        let accepted = normalize("tt", at(), &good).unwrap();

        let mut bad = good.clone();
        bad.status = Some("in progress".into());
        let mut anonymous = raw("C", "D", "in progress");
        anonymous.event_id = Some("  ".into());

        let batch = normalize_batch("tt", at(), vec![Ok(bad), Ok(anonymous)]);
        assert!(batch.records.is_empty());
        assert_eq!(batch.stats.rejected_status, 2);
        assert_eq!(batch.rejected_ids, HashSet::from([accepted.id]));
    }
}
