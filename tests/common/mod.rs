#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use props_tracker::config::TrackerConfig;
use props_tracker::error::FetchError;
use props_tracker::lines_fetch::LinesProvider;
use props_tracker::model::{DateWindow, EventStatLine, MarketLine, StatType};
use props_tracker::stats_fetch::StatsProvider;

pub const TATUM: &str = "1628369";
pub const EVENT: &str = "evt-bos-lal";

/// In-process stats provider with scripted logs and failures.
#[derive(Default)]
pub struct ScriptedStats {
    calls: Cell<usize>,
    logs: RefCell<HashMap<String, Vec<EventStatLine>>>,
    queued_failures: RefCell<VecDeque<FetchError>>,
    down: RefCell<HashSet<String>>,
}

impl ScriptedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_log(&self, player_id: &str, lines: Vec<EventStatLine>) {
        self.logs.borrow_mut().insert(player_id.to_string(), lines);
    }

    pub fn push_game(&self, player_id: &str, line: EventStatLine) {
        self.logs
            .borrow_mut()
            .entry(player_id.to_string())
            .or_default()
            .push(line);
    }

    pub fn fail_next(&self, err: FetchError) {
        self.queued_failures.borrow_mut().push_back(err);
    }

    /// Every call for this player times out.
    pub fn take_down(&self, player_id: &str) {
        self.down.borrow_mut().insert(player_id.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl StatsProvider for ScriptedStats {
    fn name(&self) -> &str {
        "scripted_stats"
    }

    fn fetch_player_event_log(
        &self,
        player_id: &str,
        window: &DateWindow,
    ) -> Result<Vec<EventStatLine>, FetchError> {
        self.calls.set(self.calls.get() + 1);
        if let Some(err) = self.queued_failures.borrow_mut().pop_front() {
            return Err(err);
        }
        if self.down.borrow().contains(player_id) {
            return Err(FetchError::Timeout("scripted outage".to_string()));
        }
        Ok(self
            .logs
            .borrow()
            .get(player_id)
            .map(|lines| {
                lines
                    .iter()
                    .filter(|l| window.contains(l.event_date))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Lines provider that replays a fixed board, stamped with the requested collection time.
#[derive(Default)]
pub struct BoardLines {
    pub board: RefCell<Vec<MarketLine>>,
    pub failures: RefCell<VecDeque<FetchError>>,
}

impl LinesProvider for BoardLines {
    fn name(&self) -> &str {
        "board_lines"
    }

    fn fetch_lines(
        &self,
        date: NaiveDate,
        collected_at: DateTime<Utc>,
    ) -> Result<Vec<MarketLine>, FetchError> {
        if let Some(err) = self.failures.borrow_mut().pop_front() {
            return Err(err);
        }
        Ok(self
            .board
            .borrow()
            .iter()
            .filter(|l| l.event_date == date)
            .map(|l| MarketLine {
                collected_at,
                ..l.clone()
            })
            .collect())
    }
}

pub fn test_config() -> TrackerConfig {
    TrackerConfig {
        call_delay: Duration::ZERO,
        max_attempts: 3,
        ..TrackerConfig::default()
    }
}

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, d).expect("valid january date")
}

pub fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, d, h, m, 0).unwrap()
}

/// Tip-off of the test event: 18:30 local on 15 January at UTC-6.
pub fn tip() -> DateTime<Utc> {
    at(16, 0, 30)
}

pub fn game(event_id: &str, date: NaiveDate, pts: f64, is_final: bool) -> EventStatLine {
    let mut stats = BTreeMap::new();
    stats.insert(StatType::Points.as_str().to_string(), pts);
    stats.insert(StatType::Rebounds.as_str().to_string(), 7.0);
    EventStatLine {
        event_id: event_id.to_string(),
        event_date: date,
        stats,
        is_final,
    }
}

/// Ten final games on 1..=10 January scoring 20, 22, .., 38.
/// Season mean 29, last-five mean 34, sample stddev ≈ 6.055, expected 31.5.
pub fn rising_season() -> Vec<EventStatLine> {
    (1..=10u32)
        .map(|d| game(&format!("g{d:02}"), day(d), 18.0 + 2.0 * d as f64, true))
        .collect()
}

pub fn points_line(player_id: &str, value: f64, bookmaker: &str, collected_at: DateTime<Utc>) -> MarketLine {
    MarketLine {
        player_id: player_id.to_string(),
        player_name: format!("Player {player_id}"),
        stat: StatType::Points,
        event_id: EVENT.to_string(),
        event_start: tip(),
        event_date: day(15),
        line: value,
        over_price: Some(-110),
        under_price: Some(-115),
        bookmaker: bookmaker.to_string(),
        is_latest: true,
        collected_at,
    }
}
