use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::baseline::Baseline;
use crate::engine::{Evaluation, profit_for};
use crate::error::{Result, TrackerError};
use crate::model::{
    Confidence, DateWindow, Direction, GradeOutcome, MarketLine, NaturalKey, Play, PlayState,
    StatType,
};
use crate::store::{Store, bool_to_i64, date_col, date_str, opt_ts_col, ts, ts_col};

const PLAY_COLUMNS: &str = "id, player_id, player_name, stat, event_id, event_start, event_date, \
     line, season_avg, recent_avg, stddev, games_played, expected, deviation, score, confidence, \
     confidence_pct, direction, price, bookmaker, state, actual, outcome, was_correct, \
     created_at, updated_at, locked_at, graded_at";

/// Result of applying one evaluated observation to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(i64),
    Updated(i64),
    /// Same values, or an observation older than the record's `updated_at`.
    Unchanged(i64),
    /// The latest evaluation of an OPEN record is a no-play; the record keeps its last play.
    Retained(i64),
    SkippedNoPlay,
    /// No record exists and the event has already started.
    SkippedStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradeChange {
    Graded(GradeOutcome),
    Regraded {
        from: Option<GradeOutcome>,
        to: GradeOutcome,
    },
    Unchanged,
    NotFinal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RecordSummary {
    pub wins: usize,
    pub losses: usize,
    pub pushes: usize,
    pub pending: usize,
    /// Wins over decided plays; `None` until something is decided.
    pub hit_rate: Option<f64>,
    /// Net result of a flat stake on every graded play, at each play's recorded price.
    pub profit: f64,
    /// `profit` in stakes.
    pub units: f64,
}

/// Sole writer of the `plays` table. Every mutation is one immediate transaction.
pub struct Ledger<'a> {
    store: &'a Store,
}

enum Decision {
    Done(UpsertOutcome),
    Rejected(PlayState),
}

impl<'a> Ledger<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Creates or refreshes the record for `line`'s natural key.
    ///
    /// Only OPEN records for events that have not started accept new observations; anything
    /// else is `StaleWriteRejected`. An OPEN record whose event has started is locked on the way.
    pub fn record_evaluation(
        &self,
        line: &MarketLine,
        baseline: &Baseline,
        eval: &Evaluation,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let key = line.key();
        let decision = self.store.atomic(|tx| {
            let Some(existing) = load_by_key(tx, &key)? else {
                if now >= line.event_start {
                    return Ok(Decision::Done(UpsertOutcome::SkippedStarted));
                }
                let Some(fields) = PlayFields::build(line, baseline, eval) else {
                    return Ok(Decision::Done(UpsertOutcome::SkippedNoPlay));
                };
                let id = insert_play(tx, line, &fields)?;
                return Ok(Decision::Done(UpsertOutcome::Created(id)));
            };

            if existing.state == PlayState::Open && now >= existing.event_start {
                set_locked(tx, existing.id, now)?;
                return Ok(Decision::Rejected(PlayState::Locked));
            }
            if existing.state != PlayState::Open {
                return Ok(Decision::Rejected(existing.state));
            }
            if line.collected_at < existing.updated_at {
                return Ok(Decision::Done(UpsertOutcome::Unchanged(existing.id)));
            }
            let Some(fields) = PlayFields::build(line, baseline, eval) else {
                return Ok(Decision::Done(UpsertOutcome::Retained(existing.id)));
            };
            if fields.matches(&existing, line) {
                return Ok(Decision::Done(UpsertOutcome::Unchanged(existing.id)));
            }
            update_open_play(tx, existing.id, line, &fields)?;
            Ok(Decision::Done(UpsertOutcome::Updated(existing.id)))
        })?;

        match decision {
            Decision::Done(outcome) => {
                debug!(key = %key, ?outcome, "ledger upsert");
                Ok(outcome)
            }
            Decision::Rejected(state) => {
                warn!(key = %key, %state, "stale write rejected");
                Err(TrackerError::StaleWriteRejected { key, state })
            }
        }
    }

    /// OPEN records whose event has started move to LOCKED. Returns how many moved.
    pub fn lock_started(&self, now: DateTime<Utc>) -> Result<usize> {
        let locked = self.store.atomic(|tx| {
            Ok(tx.execute(
                "UPDATE plays SET state = 'LOCKED', locked_at = ?1
                 WHERE state = 'OPEN' AND event_start <= ?1",
                params![ts(now)],
            )?)
        })?;
        if locked > 0 {
            info!(locked, "plays locked at tip-off");
        }
        Ok(locked)
    }

    /// Grades a LOCKED record, or re-grades a GRADED one when `actual` differs from the stored
    /// value. Records whose event is not yet final are left alone.
    pub fn grade(
        &self,
        id: i64,
        actual: f64,
        now: DateTime<Utc>,
        finality: Duration,
        push_tolerance: f64,
    ) -> Result<GradeChange> {
        let change = self.store.atomic(|tx| {
            let play = load_by_id(tx, id)?
                .ok_or_else(|| TrackerError::CorruptRow(format!("play {id} not found")))?;
            if !play.state.can_transition_to(PlayState::Graded) {
                return Err(TrackerError::InvalidTransition {
                    id,
                    from: play.state,
                    to: PlayState::Graded,
                });
            }
            if !play.is_final_at(now, finality) {
                return Ok(GradeChange::NotFinal);
            }
            if play.state == PlayState::Graded && play.actual == Some(actual) {
                return Ok(GradeChange::Unchanged);
            }

            let outcome = GradeOutcome::grade(play.direction, play.line, actual, push_tolerance);
            tx.execute(
                "UPDATE plays SET state = 'GRADED', actual = ?2, outcome = ?3, was_correct = ?4,
                     graded_at = ?5
                 WHERE id = ?1",
                params![
                    id,
                    actual,
                    outcome.as_str(),
                    outcome.was_correct().map(bool_to_i64),
                    ts(now),
                ],
            )?;
            Ok(match play.state {
                PlayState::Graded => GradeChange::Regraded {
                    from: play.outcome,
                    to: outcome,
                },
                _ => GradeChange::Graded(outcome),
            })
        })?;
        match change {
            GradeChange::Graded(outcome) => info!(id, actual, %outcome, "play graded"),
            GradeChange::Regraded { from, to } => {
                info!(id, actual, ?from, %to, "play re-graded after stat correction")
            }
            _ => {}
        }
        Ok(change)
    }

    pub fn get(&self, key: &NaturalKey) -> Result<Option<Play>> {
        load_by_key(self.store.conn(), key)
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<Play>> {
        load_by_id(self.store.conn(), id)
    }

    pub fn by_state(&self, state: PlayState) -> Result<Vec<Play>> {
        self.query(
            "WHERE state = ?1 ORDER BY event_start, id",
            params![state.as_str()],
        )
    }

    /// LOCKED records whose event is final at `now`; GRADED ones too when `include_graded`.
    pub fn gradeable(
        &self,
        now: DateTime<Utc>,
        finality: Duration,
        include_graded: bool,
    ) -> Result<Vec<Play>> {
        let cutoff = ts(now - finality);
        if include_graded {
            self.query(
                "WHERE state IN ('LOCKED', 'GRADED') AND event_start <= ?1
                 ORDER BY event_start, id",
                params![cutoff],
            )
        } else {
            self.query(
                "WHERE state = 'LOCKED' AND event_start <= ?1 ORDER BY event_start, id",
                params![cutoff],
            )
        }
    }

    pub fn by_event_date_range(&self, window: &DateWindow) -> Result<Vec<Play>> {
        self.query(
            "WHERE event_date >= ?1 AND event_date <= ?2 ORDER BY event_date, event_start, id",
            params![date_str(window.start), date_str(window.end)],
        )
    }

    pub fn record_summary(&self, window: &DateWindow, stake: f64) -> Result<RecordSummary> {
        let mut summary = RecordSummary::default();
        for play in self.by_event_date_range(window)? {
            match play.outcome {
                Some(GradeOutcome::Win) => summary.wins += 1,
                Some(GradeOutcome::Loss) => summary.losses += 1,
                Some(GradeOutcome::Push) => summary.pushes += 1,
                None => summary.pending += 1,
            }
            if let Some(outcome) = play.outcome {
                summary.profit += profit_for(play.price, stake, outcome);
            }
        }
        let decided = summary.wins + summary.losses;
        if decided > 0 {
            summary.hit_rate = Some(summary.wins as f64 / decided as f64);
        }
        if stake > 0.0 {
            summary.units = summary.profit / stake;
        }
        Ok(summary)
    }

    fn query(&self, filter: &str, args: impl rusqlite::Params) -> Result<Vec<Play>> {
        let sql = format!("SELECT {PLAY_COLUMNS} FROM plays {filter}");
        let mut stmt = self.store.conn().prepare(&sql)?;
        let rows = stmt.query_map(args, play_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Quantitative fields derived from one observation and its evaluation.
struct PlayFields {
    season_avg: f64,
    recent_avg: f64,
    stddev: f64,
    games_played: u32,
    expected: f64,
    deviation: f64,
    score: f64,
    confidence: Confidence,
    confidence_pct: f64,
    direction: Direction,
    price: Option<i32>,
}

impl PlayFields {
    /// `None` for a no-play evaluation.
    fn build(line: &MarketLine, baseline: &Baseline, eval: &Evaluation) -> Option<Self> {
        let direction = eval.direction?;
        let score = eval.score?;
        Some(Self {
            season_avg: baseline.season_avg,
            recent_avg: baseline.recent_avg,
            stddev: baseline.stddev,
            games_played: baseline.games_played,
            expected: eval.expected,
            deviation: eval.deviation,
            score,
            confidence: eval.confidence,
            confidence_pct: eval.confidence_pct,
            direction,
            price: line.price_for(direction),
        })
    }

    fn matches(&self, play: &Play, line: &MarketLine) -> bool {
        play.line == line.line
            && play.bookmaker == line.bookmaker
            && play.event_start == line.event_start
            && play.season_avg == self.season_avg
            && play.recent_avg == self.recent_avg
            && play.stddev == self.stddev
            && play.games_played == self.games_played
            && play.expected == self.expected
            && play.deviation == self.deviation
            && play.score == self.score
            && play.confidence == self.confidence
            && play.direction == self.direction
            && play.price == self.price
    }
}

fn insert_play(conn: &Connection, line: &MarketLine, f: &PlayFields) -> Result<i64> {
    conn.execute(
        "INSERT INTO plays (
            player_id, player_name, stat, event_id, event_start, event_date, line,
            season_avg, recent_avg, stddev, games_played, expected, deviation, score,
            confidence, confidence_pct, direction, price, bookmaker, state,
            created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                   ?18, ?19, 'OPEN', ?20, ?20)",
        params![
            line.player_id,
            line.player_name,
            line.stat.as_str(),
            line.event_id,
            ts(line.event_start),
            date_str(line.event_date),
            line.line,
            f.season_avg,
            f.recent_avg,
            f.stddev,
            f.games_played,
            f.expected,
            f.deviation,
            f.score,
            f.confidence.as_str(),
            f.confidence_pct,
            f.direction.as_str(),
            f.price,
            line.bookmaker,
            ts(line.collected_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn update_open_play(conn: &Connection, id: i64, line: &MarketLine, f: &PlayFields) -> Result<()> {
    conn.execute(
        "UPDATE plays SET
            player_name = ?2, event_start = ?3, event_date = ?4, line = ?5, season_avg = ?6,
            recent_avg = ?7, stddev = ?8, games_played = ?9, expected = ?10, deviation = ?11,
            score = ?12, confidence = ?13, confidence_pct = ?14, direction = ?15, price = ?16,
            bookmaker = ?17, updated_at = ?18
         WHERE id = ?1 AND state = 'OPEN'",
        params![
            id,
            line.player_name,
            ts(line.event_start),
            date_str(line.event_date),
            line.line,
            f.season_avg,
            f.recent_avg,
            f.stddev,
            f.games_played,
            f.expected,
            f.deviation,
            f.score,
            f.confidence.as_str(),
            f.confidence_pct,
            f.direction.as_str(),
            f.price,
            line.bookmaker,
            ts(line.collected_at),
        ],
    )?;
    Ok(())
}

fn set_locked(conn: &Connection, id: i64, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE plays SET state = 'LOCKED', locked_at = ?2 WHERE id = ?1 AND state = 'OPEN'",
        params![id, ts(now)],
    )?;
    Ok(())
}

fn load_by_key(conn: &Connection, key: &NaturalKey) -> Result<Option<Play>> {
    let sql = format!(
        "SELECT {PLAY_COLUMNS} FROM plays WHERE player_id = ?1 AND stat = ?2 AND event_id = ?3"
    );
    Ok(conn
        .query_row(
            &sql,
            params![key.player_id, key.stat.as_str(), key.event_id],
            play_from_row,
        )
        .optional()?)
}

fn load_by_id(conn: &Connection, id: i64) -> Result<Option<Play>> {
    let sql = format!("SELECT {PLAY_COLUMNS} FROM plays WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], play_from_row).optional()?)
}

fn play_from_row(row: &Row<'_>) -> rusqlite::Result<Play> {
    Ok(Play {
        id: row.get(0)?,
        player_id: row.get(1)?,
        player_name: row.get(2)?,
        stat: text_col(row, 3, StatType::parse)?,
        event_id: row.get(4)?,
        event_start: ts_col(row, 5)?,
        event_date: date_col(row, 6)?,
        line: row.get(7)?,
        season_avg: row.get(8)?,
        recent_avg: row.get(9)?,
        stddev: row.get(10)?,
        games_played: row.get(11)?,
        expected: row.get(12)?,
        deviation: row.get(13)?,
        score: row.get(14)?,
        confidence: text_col(row, 15, Confidence::parse)?,
        confidence_pct: row.get(16)?,
        direction: text_col(row, 17, Direction::parse)?,
        price: row.get(18)?,
        bookmaker: row.get(19)?,
        state: text_col(row, 20, PlayState::parse)?,
        actual: row.get(21)?,
        outcome: row
            .get::<_, Option<String>>(22)?
            .map(|raw| {
                GradeOutcome::parse(&raw).ok_or_else(|| bad_text(22, &raw))
            })
            .transpose()?,
        was_correct: row.get::<_, Option<i64>>(23)?.map(|v| v != 0),
        created_at: ts_col(row, 24)?,
        updated_at: ts_col(row, 25)?,
        locked_at: opt_ts_col(row, 26)?,
        graded_at: opt_ts_col(row, 27)?,
    })
}

fn text_col<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| bad_text(idx, &raw))
}

fn bad_text(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unexpected value {raw:?}").into(),
    )
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};

    use super::*;
    use crate::config::BlendWeights;
    use crate::engine::evaluate;

    fn tip() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 16, 1, 0, 0).unwrap()
    }

    fn line(value: f64, collected_at: DateTime<Utc>) -> MarketLine {
        MarketLine {
            player_id: "1628369".into(),
            player_name: "Jayson Tatum".into(),
            stat: StatType::Points,
            event_id: "evt-1".into(),
            event_start: tip(),
            event_date: NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
            line: value,
            over_price: Some(-110),
            under_price: Some(-115),
            bookmaker: "draftkings".into(),
            is_latest: true,
            collected_at,
        }
    }

    fn baseline() -> Baseline {
        Baseline {
            season_avg: 27.5,
            recent_avg: 30.2,
            stddev: 2.3,
            games_played: 30,
            recent_games: 5,
        }
    }

    fn apply(ledger: &Ledger<'_>, l: &MarketLine, now: DateTime<Utc>) -> Result<UpsertOutcome> {
        let b = baseline();
        let e = evaluate(l.line, &b, b.stddev, BlendWeights::EVEN);
        ledger.record_evaluation(l, &b, &e, now)
    }

    #[test]
    fn second_observation_updates_in_place() {
        let store = Store::open_in_memory().unwrap();
        let ledger = Ledger::new(&store);
        let t1 = tip() - Duration::hours(8);
        let t2 = tip() - Duration::hours(2);

        let first = apply(&ledger, &line(25.5, t1), t1).unwrap();
        let UpsertOutcome::Created(id) = first else {
            panic!("expected create, got {first:?}");
        };
        assert_eq!(
            apply(&ledger, &line(25.0, t2), t2).unwrap(),
            UpsertOutcome::Updated(id)
        );

        let play = ledger.get(&line(25.0, t2).key()).unwrap().unwrap();
        assert_eq!(play.id, id);
        assert_eq!(play.line, 25.0);
        assert_eq!(play.created_at, t1);
        assert_eq!(play.updated_at, t2);
        assert_eq!(play.direction, Direction::Under);
        assert_eq!(play.price, Some(-115));
    }

    #[test]
    fn reapplying_and_older_observations_are_no_ops() {
        let store = Store::open_in_memory().unwrap();
        let ledger = Ledger::new(&store);
        let t1 = tip() - Duration::hours(8);
        let t2 = tip() - Duration::hours(2);

        apply(&ledger, &line(25.0, t2), t2).unwrap();
        let before = ledger.get(&line(25.0, t2).key()).unwrap().unwrap();
        assert!(matches!(
            apply(&ledger, &line(25.0, t2), t2).unwrap(),
            UpsertOutcome::Unchanged(_)
        ));
        assert!(matches!(
            apply(&ledger, &line(24.0, t1), t2).unwrap(),
            UpsertOutcome::Unchanged(_)
        ));
        assert_eq!(ledger.get(&before.key()).unwrap().unwrap(), before);
    }

    #[test]
    fn no_play_never_creates_and_keeps_open_record() {
        let store = Store::open_in_memory().unwrap();
        let ledger = Ledger::new(&store);
        let t1 = tip() - Duration::hours(8);
        let t2 = tip() - Duration::hours(2);

        assert_eq!(
            apply(&ledger, &line(28.9, t1), t1).unwrap(),
            UpsertOutcome::SkippedNoPlay
        );
        assert!(ledger.get(&line(28.9, t1).key()).unwrap().is_none());

        let UpsertOutcome::Created(id) = apply(&ledger, &line(25.5, t1), t1).unwrap() else {
            panic!("expected create");
        };
        assert_eq!(
            apply(&ledger, &line(28.9, t2), t2).unwrap(),
            UpsertOutcome::Retained(id)
        );
        let kept = ledger.get(&line(28.9, t2).key()).unwrap().unwrap();
        assert_eq!(kept.id, id);
        assert_eq!(kept.line, 25.5);
        assert_eq!(kept.updated_at, t1);
    }

    #[test]
    fn line_returning_after_no_play_updates_the_same_record() {
        let store = Store::open_in_memory().unwrap();
        let ledger = Ledger::new(&store);
        let t1 = tip() - Duration::hours(15);
        let t2 = tip() - Duration::hours(13);
        let t3 = tip() - Duration::hours(11);

        let UpsertOutcome::Created(id) = apply(&ledger, &line(25.5, t1), t1).unwrap() else {
            panic!("expected create");
        };
        assert_eq!(
            apply(&ledger, &line(28.9, t2), t2).unwrap(),
            UpsertOutcome::Retained(id)
        );
        assert_eq!(
            apply(&ledger, &line(25.0, t3), t3).unwrap(),
            UpsertOutcome::Updated(id)
        );

        let play = ledger.get(&line(25.0, t3).key()).unwrap().unwrap();
        assert_eq!(play.id, id);
        assert_eq!(play.created_at, t1);
        assert_eq!(play.updated_at, t3);
        assert_eq!(play.line, 25.0);
    }

    #[test]
    fn writes_after_tipoff_are_rejected_and_lock() {
        let store = Store::open_in_memory().unwrap();
        let ledger = Ledger::new(&store);
        let before = tip() - Duration::hours(3);
        let after = tip() + Duration::minutes(5);

        apply(&ledger, &line(25.5, before), before).unwrap();
        let err = apply(&ledger, &line(24.5, after), after).unwrap_err();
        assert!(matches!(
            err,
            TrackerError::StaleWriteRejected {
                state: PlayState::Locked,
                ..
            }
        ));
        let play = ledger.get(&line(25.5, before).key()).unwrap().unwrap();
        assert_eq!(play.state, PlayState::Locked);
        assert_eq!(play.line, 25.5);
        assert_eq!(play.locked_at, Some(after));
    }

    #[test]
    fn grading_waits_for_finality_and_regrades_only_on_change() {
        let store = Store::open_in_memory().unwrap();
        let ledger = Ledger::new(&store);
        let t1 = tip() - Duration::hours(3);
        let UpsertOutcome::Created(id) = apply(&ledger, &line(25.5, t1), t1).unwrap() else {
            panic!("expected create");
        };
        let finality = Duration::hours(4);

        let open = ledger.grade(id, 22.0, tip() + Duration::hours(5), finality, 0.0);
        assert!(matches!(
            open,
            Err(TrackerError::InvalidTransition {
                from: PlayState::Open,
                ..
            })
        ));

        assert_eq!(ledger.lock_started(tip()).unwrap(), 1);
        assert_eq!(
            ledger
                .grade(id, 22.0, tip() + Duration::hours(3), finality, 0.0)
                .unwrap(),
            GradeChange::NotFinal
        );

        let done = tip() + Duration::hours(5);
        assert_eq!(
            ledger.grade(id, 22.0, done, finality, 0.0).unwrap(),
            GradeChange::Graded(GradeOutcome::Win)
        );
        assert_eq!(
            ledger.grade(id, 22.0, done, finality, 0.0).unwrap(),
            GradeChange::Unchanged
        );
        assert_eq!(
            ledger.grade(id, 27.0, done, finality, 0.0).unwrap(),
            GradeChange::Regraded {
                from: Some(GradeOutcome::Win),
                to: GradeOutcome::Loss
            }
        );
        let play = ledger.get_by_id(id).unwrap().unwrap();
        assert_eq!(play.state, PlayState::Graded);
        assert_eq!(play.was_correct, Some(false));
        assert_eq!(play.actual, Some(27.0));
    }

    #[test]
    fn push_leaves_correctness_unknown() {
        let store = Store::open_in_memory().unwrap();
        let ledger = Ledger::new(&store);
        let t1 = tip() - Duration::hours(3);
        let UpsertOutcome::Created(id) = apply(&ledger, &line(25.5, t1), t1).unwrap() else {
            panic!("expected create");
        };
        ledger.lock_started(tip()).unwrap();
        ledger
            .grade(id, 25.5, tip() + Duration::hours(4), Duration::hours(4), 0.0)
            .unwrap();

        let play = ledger.get_by_id(id).unwrap().unwrap();
        assert_eq!(play.outcome, Some(GradeOutcome::Push));
        assert_eq!(play.was_correct, None);

        let day = DateWindow::new(play.event_date, play.event_date);
        let summary = ledger.record_summary(&day, 10.0).unwrap();
        assert_eq!(summary.pushes, 1);
        assert_eq!(summary.hit_rate, None);
        assert_eq!(summary.profit, 0.0);
    }
}
