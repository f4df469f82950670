use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::backup::Backup;
use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior, params};
use tracing::{debug, warn};

use crate::error::{Result, TrackerError};
use crate::model::ApiCallLogEntry;

const BUSY_TIMEOUT_SECS: u64 = 5;
const DATE_FMT: &str = "%Y-%m-%d";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS stat_cache (
    player_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    event_date TEXT NOT NULL,
    stats_json TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    is_final INTEGER NOT NULL,
    PRIMARY KEY (player_id, event_id)
);
CREATE INDEX IF NOT EXISTS idx_stat_cache_player_date ON stat_cache(player_id, event_date);

CREATE TABLE IF NOT EXISTS market_lines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    player_id TEXT NOT NULL,
    player_name TEXT NOT NULL,
    stat TEXT NOT NULL,
    event_id TEXT NOT NULL,
    event_start TEXT NOT NULL,
    event_date TEXT NOT NULL,
    line REAL NOT NULL,
    over_price INTEGER NULL,
    under_price INTEGER NULL,
    bookmaker TEXT NOT NULL,
    is_latest INTEGER NOT NULL,
    collected_at TEXT NOT NULL,
    UNIQUE (player_id, stat, event_id, bookmaker, collected_at)
);
CREATE INDEX IF NOT EXISTS idx_market_lines_latest ON market_lines(is_latest, event_date);
CREATE INDEX IF NOT EXISTS idx_market_lines_collected ON market_lines(collected_at);

CREATE TABLE IF NOT EXISTS plays (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    player_id TEXT NOT NULL,
    player_name TEXT NOT NULL,
    stat TEXT NOT NULL,
    event_id TEXT NOT NULL,
    event_start TEXT NOT NULL,
    event_date TEXT NOT NULL,
    line REAL NOT NULL,
    season_avg REAL NOT NULL,
    recent_avg REAL NOT NULL,
    stddev REAL NOT NULL,
    games_played INTEGER NOT NULL,
    expected REAL NOT NULL,
    deviation REAL NOT NULL,
    score REAL NOT NULL,
    confidence TEXT NOT NULL,
    confidence_pct REAL NOT NULL,
    direction TEXT NOT NULL,
    price INTEGER NULL,
    bookmaker TEXT NOT NULL,
    state TEXT NOT NULL,
    actual REAL NULL,
    outcome TEXT NULL,
    was_correct INTEGER NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    locked_at TEXT NULL,
    graded_at TEXT NULL,
    UNIQUE (player_id, stat, event_id)
);
CREATE INDEX IF NOT EXISTS idx_plays_state ON plays(state, event_start);
CREATE INDEX IF NOT EXISTS idx_plays_event_date ON plays(event_date);

CREATE TABLE IF NOT EXISTS api_call_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    player_id TEXT NULL,
    cache_hit INTEGER NOT NULL,
    called_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_api_call_log_called_at ON api_call_log(called_at);
"#;

/// Handle to the shared SQLite store. Every component borrows one explicitly.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite db {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))
            .context("set busy timeout")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enable wal")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))
            .context("set busy timeout")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("create sqlite schema")?;
        Ok(Self { conn })
    }

    /// Copies the whole store into memory. Dry runs work against the copy and drop it.
    pub fn snapshot_in_memory(&self) -> anyhow::Result<Self> {
        let mut mem = Connection::open_in_memory().context("open snapshot db")?;
        {
            let backup = Backup::new(&self.conn, &mut mem).context("start snapshot")?;
            backup
                .run_to_completion(128, Duration::ZERO, None)
                .context("copy snapshot")?;
        }
        Self::from_connection(mem)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Runs `f` inside one `BEGIN IMMEDIATE` transaction. Write-lock contention is retried
    /// once; a second rejection surfaces as `PersistenceConflict`.
    pub fn atomic<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        let mut last = None;
        for attempt in 0..2 {
            match self.try_atomic(&mut f) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_contention() => {
                    warn!(attempt, error = %err, "store contention");
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(TrackerError::PersistenceConflict(
            last.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    fn try_atomic<T, F>(&self, f: &mut F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn append_api_call(&self, entry: &ApiCallLogEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO api_call_log(provider, endpoint, player_id, cache_hit, called_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.provider,
                entry.endpoint,
                entry.player_id,
                bool_to_i64(entry.cache_hit),
                ts(entry.called_at),
            ],
        )?;
        debug!(
            provider = %entry.provider,
            cache_hit = entry.cache_hit,
            "api call logged"
        );
        Ok(())
    }

    pub fn api_calls_since(&self, since: DateTime<Utc>) -> Result<Vec<ApiCallLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT provider, endpoint, player_id, cache_hit, called_at
             FROM api_call_log
             WHERE called_at >= ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![ts(since)], |row| {
            Ok(ApiCallLogEntry {
                provider: row.get(0)?,
                endpoint: row.get(1)?,
                player_id: row.get(2)?,
                cache_hit: row.get::<_, i64>(3)? != 0,
                called_at: ts_col(row, 4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Fixed-width RFC 3339 so text comparison in SQL orders by time.
pub(crate) fn ts(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn date_str(date: NaiveDate) -> String {
    date.format(DATE_FMT).to_string()
}

pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub(crate) fn date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FMT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn bool_to_i64(v: bool) -> i64 {
    if v { 1 } else { 0 }
}
