use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StatType {
    Points,
    Rebounds,
    Assists,
    Threes,
}

impl StatType {
    pub const ALL: [StatType; 4] = [
        StatType::Points,
        StatType::Rebounds,
        StatType::Assists,
        StatType::Threes,
    ];

    /// Column name used in stat records and the ledger.
    pub fn as_str(self) -> &'static str {
        match self {
            StatType::Points => "PTS",
            StatType::Rebounds => "REB",
            StatType::Assists => "AST",
            StatType::Threes => "FG3M",
        }
    }

    /// Market key used by the lines provider.
    pub fn market_key(self) -> &'static str {
        match self {
            StatType::Points => "player_points",
            StatType::Rebounds => "player_rebounds",
            StatType::Assists => "player_assists",
            StatType::Threes => "player_threes",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pts" | "points" | "player_points" => Some(StatType::Points),
            "reb" | "rebounds" | "player_rebounds" => Some(StatType::Rebounds),
            "ast" | "assists" | "player_assists" => Some(StatType::Assists),
            "fg3m" | "threes" | "player_threes" => Some(StatType::Threes),
            _ => None,
        }
    }
}

impl fmt::Display for StatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive calendar window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// Season window ending at `as_of`. Seasons start on 1 October.
    pub fn season_to_date(as_of: NaiveDate) -> Self {
        let start_year = if as_of.month() >= 10 {
            as_of.year()
        } else {
            as_of.year() - 1
        };
        let start = NaiveDate::from_ymd_opt(start_year, 10, 1).unwrap_or(as_of);
        Self::new(start, as_of)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// One event row as reported by the stats provider, before it enters the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct EventStatLine {
    pub event_id: String,
    pub event_date: NaiveDate,
    pub stats: BTreeMap<String, f64>,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatRecord {
    pub player_id: String,
    pub event_id: String,
    pub event_date: NaiveDate,
    pub stats: BTreeMap<String, f64>,
    pub fetched_at: DateTime<Utc>,
    pub is_final: bool,
}

impl StatRecord {
    pub fn value(&self, stat: StatType) -> Option<f64> {
        self.stats
            .get(stat.as_str())
            .copied()
            .filter(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketLine {
    pub player_id: String,
    pub player_name: String,
    pub stat: StatType,
    pub event_id: String,
    pub event_start: DateTime<Utc>,
    pub event_date: NaiveDate,
    pub line: f64,
    pub over_price: Option<i32>,
    pub under_price: Option<i32>,
    pub bookmaker: String,
    pub is_latest: bool,
    pub collected_at: DateTime<Utc>,
}

impl MarketLine {
    pub fn key(&self) -> NaturalKey {
        NaturalKey {
            player_id: self.player_id.clone(),
            stat: self.stat,
            event_id: self.event_id.clone(),
        }
    }

    pub fn price_for(&self, direction: Direction) -> Option<i32> {
        match direction {
            Direction::Over => self.over_price,
            Direction::Under => self.under_price,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NaturalKey {
    pub player_id: String,
    pub stat: StatType,
    pub event_id: String,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.player_id, self.stat, self.event_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlayState {
    Open,
    Locked,
    Graded,
}

impl PlayState {
    pub fn as_str(self) -> &'static str {
        match self {
            PlayState::Open => "OPEN",
            PlayState::Locked => "LOCKED",
            PlayState::Graded => "GRADED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "OPEN" => Some(PlayState::Open),
            "LOCKED" => Some(PlayState::Locked),
            "GRADED" => Some(PlayState::Graded),
            _ => None,
        }
    }

    /// GRADED -> GRADED is the re-grade path; nothing moves backward.
    pub fn can_transition_to(self, next: PlayState) -> bool {
        matches!(
            (self, next),
            (PlayState::Open, PlayState::Locked)
                | (PlayState::Locked, PlayState::Graded)
                | (PlayState::Graded, PlayState::Graded)
        )
    }
}

impl fmt::Display for PlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Confidence {
    None,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::None => "none",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(Confidence::None),
            "medium" => Some(Confidence::Medium),
            "high" => Some(Confidence::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Over,
    Under,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Over => "OVER",
            Direction::Under => "UNDER",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "OVER" => Some(Direction::Over),
            "UNDER" => Some(Direction::Under),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GradeOutcome {
    Win,
    Loss,
    Push,
}

impl GradeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            GradeOutcome::Win => "WIN",
            GradeOutcome::Loss => "LOSS",
            GradeOutcome::Push => "PUSH",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "WIN" => Some(GradeOutcome::Win),
            "LOSS" => Some(GradeOutcome::Loss),
            "PUSH" => Some(GradeOutcome::Push),
            _ => None,
        }
    }

    /// A push is neither correct nor incorrect.
    pub fn was_correct(self) -> Option<bool> {
        match self {
            GradeOutcome::Win => Some(true),
            GradeOutcome::Loss => Some(false),
            GradeOutcome::Push => None,
        }
    }

    /// Grades `actual` against `line` in the recommended `direction`.
    /// Values within `push_tolerance` of the line are a push; a tolerance of 0.0 means exact equality.
    pub fn grade(direction: Direction, line: f64, actual: f64, push_tolerance: f64) -> Self {
        let diff = actual - line;
        if diff == 0.0 || diff.abs() <= push_tolerance.max(0.0) {
            return GradeOutcome::Push;
        }
        let went_over = diff > 0.0;
        match (direction, went_over) {
            (Direction::Over, true) | (Direction::Under, false) => GradeOutcome::Win,
            _ => GradeOutcome::Loss,
        }
    }
}

impl fmt::Display for GradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative recommendation record for one natural key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Play {
    pub id: i64,
    pub player_id: String,
    pub player_name: String,
    pub stat: StatType,
    pub event_id: String,
    pub event_start: DateTime<Utc>,
    pub event_date: NaiveDate,
    pub line: f64,
    pub season_avg: f64,
    pub recent_avg: f64,
    pub stddev: f64,
    pub games_played: u32,
    pub expected: f64,
    pub deviation: f64,
    pub score: f64,
    pub confidence: Confidence,
    pub confidence_pct: f64,
    pub direction: Direction,
    pub price: Option<i32>,
    pub bookmaker: String,
    pub state: PlayState,
    pub actual: Option<f64>,
    pub outcome: Option<GradeOutcome>,
    pub was_correct: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub graded_at: Option<DateTime<Utc>>,
}

impl Play {
    pub fn key(&self) -> NaturalKey {
        NaturalKey {
            player_id: self.player_id.clone(),
            stat: self.stat,
            event_id: self.event_id.clone(),
        }
    }

    pub fn is_final_at(&self, now: DateTime<Utc>, finality: Duration) -> bool {
        now >= self.event_start + finality
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiCallLogEntry {
    pub provider: String,
    pub endpoint: String,
    pub player_id: Option<String>,
    pub cache_hit: bool,
    pub called_at: DateTime<Utc>,
}
