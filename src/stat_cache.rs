use std::cell::Cell;
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use rusqlite::params;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::error::{FetchError, Result, TrackerError};
use crate::model::{ApiCallLogEntry, DateWindow, EventStatLine, StatRecord, StatType};
use crate::stats_fetch::StatsProvider;
use crate::store::{Store, bool_to_i64, date_col, date_str, ts, ts_col};

const ENDPOINT: &str = "player_event_log";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub hits: usize,
    pub fetches: usize,
    pub failures: usize,
}

/// TTL cache of per-player, per-event stat records in front of a `StatsProvider`.
///
/// Upstream fetches always cover the season to date (or the requested window, if wider), so
/// a fresh fetch for any window leaves the whole season cached at one `fetched_at`.
pub struct StatCache<'a, P: StatsProvider + ?Sized> {
    store: &'a Store,
    provider: &'a P,
    ttl: ChronoDuration,
    call_delay: Duration,
    max_attempts: u32,
    last_call: Cell<Option<Instant>>,
    counters: Cell<CacheCounters>,
}

impl<'a, P: StatsProvider + ?Sized> StatCache<'a, P> {
    pub fn new(store: &'a Store, provider: &'a P, cfg: &TrackerConfig) -> Self {
        Self {
            store,
            provider,
            ttl: cfg.cache_ttl(),
            call_delay: cfg.call_delay,
            max_attempts: cfg.max_attempts.max(1),
            last_call: Cell::new(None),
            counters: Cell::new(CacheCounters::default()),
        }
    }

    pub fn counters(&self) -> CacheCounters {
        self.counters.get()
    }

    pub fn get_or_fetch(
        &self,
        player_id: &str,
        window: &DateWindow,
        now: DateTime<Utc>,
    ) -> Result<Vec<StatRecord>> {
        self.get_or_fetch_with(player_id, window, now, false)
    }

    /// `force` skips the TTL check for this call only.
    pub fn get_or_fetch_with(
        &self,
        player_id: &str,
        window: &DateWindow,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<Vec<StatRecord>> {
        let cached = self.cached_records(player_id, window)?;
        if !force && let Some(freshest) = cached.iter().map(|r| r.fetched_at).max() {
            if now - freshest < self.ttl {
                self.log_call(player_id, now, true)?;
                self.bump(|c| c.hits += 1);
                debug!(player_id, records = cached.len(), "stat cache hit");
                return Ok(cached);
            }
        }

        self.refresh(player_id, window, now, false)?;
        self.cached_records(player_id, window)
    }

    /// Final value of `stat` for the player's event on `event_date`, or `None` while the
    /// upstream has no final row for it. A cached row that is not final is never trusted.
    ///
    /// `force` goes upstream even when a final row is cached and lets a corrected final row
    /// replace the stored values; without it final rows are returned as cached.
    pub fn actual_for_event(
        &self,
        player_id: &str,
        event_date: NaiveDate,
        stat: StatType,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<Option<f64>> {
        let window = DateWindow::new(event_date, event_date);
        if !force && let Some(record) = self.final_record(player_id, &window)? {
            self.log_call(player_id, now, true)?;
            self.bump(|c| c.hits += 1);
            return Ok(record.value(stat));
        }
        self.refresh(player_id, &window, now, force)?;
        Ok(self
            .final_record(player_id, &window)?
            .and_then(|record| record.value(stat)))
    }

    /// Cached rows for the player inside `window`, newest event first.
    pub fn cached_records(&self, player_id: &str, window: &DateWindow) -> Result<Vec<StatRecord>> {
        let mut stmt = self.store.conn().prepare_cached(
            "SELECT player_id, event_id, event_date, stats_json, fetched_at, is_final
             FROM stat_cache
             WHERE player_id = ?1 AND event_date >= ?2 AND event_date <= ?3
             ORDER BY event_date DESC, event_id DESC",
        )?;
        let rows = stmt.query_map(
            params![player_id, date_str(window.start), date_str(window.end)],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    date_col(row, 2)?,
                    row.get::<_, String>(3)?,
                    ts_col(row, 4)?,
                    row.get::<_, i64>(5)? != 0,
                ))
            },
        )?;

        let mut out = Vec::new();
        for row in rows {
            let (player_id, event_id, event_date, stats_json, fetched_at, is_final) = row?;
            let stats: BTreeMap<String, f64> = serde_json::from_str(&stats_json)?;
            out.push(StatRecord {
                player_id,
                event_id,
                event_date,
                stats,
                fetched_at,
                is_final,
            });
        }
        Ok(out)
    }

    /// One upstream fetch covering `window` and the season to date, written through to the cache.
    fn refresh(
        &self,
        player_id: &str,
        window: &DateWindow,
        now: DateTime<Utc>,
        accept_corrections: bool,
    ) -> Result<()> {
        let fetch_window = upstream_window(window, now.date_naive());
        let lines = self.fetch_with_retry(player_id, &fetch_window, now)?;
        let written = self.upsert_lines(player_id, &lines, now, accept_corrections)?;
        self.bump(|c| c.fetches += 1);
        info!(
            player_id,
            rows = lines.len(),
            written,
            accept_corrections,
            "stat cache refreshed"
        );
        Ok(())
    }

    fn final_record(&self, player_id: &str, window: &DateWindow) -> Result<Option<StatRecord>> {
        Ok(self
            .cached_records(player_id, window)?
            .into_iter()
            .find(|r| r.is_final))
    }

    fn fetch_with_retry(
        &self,
        player_id: &str,
        window: &DateWindow,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventStatLine>> {
        let mut attempts = 0;
        let mut last: Option<FetchError> = None;
        while attempts < self.max_attempts {
            attempts += 1;
            self.pace();
            self.log_call(player_id, now, false)?;
            match self.provider.fetch_player_event_log(player_id, window) {
                Ok(lines) => return Ok(lines),
                Err(err) => {
                    warn!(
                        player_id,
                        provider = self.provider.name(),
                        attempt = attempts,
                        error = %err,
                        "stats fetch failed"
                    );
                    let retryable = err.is_retryable();
                    last = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }
        self.bump(|c| c.failures += 1);
        Err(TrackerError::ProviderUnavailable {
            provider: self.provider.name().to_string(),
            attempts,
            last: last.unwrap_or_else(|| FetchError::Transport("no attempt made".to_string())),
        })
    }

    /// Final rows keep their values and only `fetched_at` moves, unless `accept_corrections`
    /// is set and the upstream row is itself final.
    fn upsert_lines(
        &self,
        player_id: &str,
        lines: &[EventStatLine],
        now: DateTime<Utc>,
        accept_corrections: bool,
    ) -> Result<usize> {
        if lines.is_empty() {
            return Ok(0);
        }
        self.store.atomic(|tx| {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO stat_cache (player_id, event_id, event_date, stats_json, fetched_at, is_final)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(player_id, event_id) DO UPDATE SET
                    event_date = CASE WHEN stat_cache.is_final = 1
                            AND NOT (?7 = 1 AND excluded.is_final = 1)
                        THEN stat_cache.event_date ELSE excluded.event_date END,
                    stats_json = CASE WHEN stat_cache.is_final = 1
                            AND NOT (?7 = 1 AND excluded.is_final = 1)
                        THEN stat_cache.stats_json ELSE excluded.stats_json END,
                    is_final = CASE WHEN stat_cache.is_final = 1
                        THEN 1 ELSE excluded.is_final END,
                    fetched_at = excluded.fetched_at
                "#,
            )?;
            let mut written = 0;
            for line in lines {
                let stats_json = serde_json::to_string(&line.stats)?;
                written += stmt.execute(params![
                    player_id,
                    line.event_id,
                    date_str(line.event_date),
                    stats_json,
                    ts(now),
                    bool_to_i64(line.is_final),
                    bool_to_i64(accept_corrections),
                ])?;
            }
            Ok(written)
        })
    }

    fn log_call(&self, player_id: &str, now: DateTime<Utc>, cache_hit: bool) -> Result<()> {
        self.store.append_api_call(&ApiCallLogEntry {
            provider: self.provider.name().to_string(),
            endpoint: ENDPOINT.to_string(),
            player_id: Some(player_id.to_string()),
            cache_hit,
            called_at: now,
        })
    }

    fn pace(&self) {
        if let Some(prev) = self.last_call.get() {
            let elapsed = prev.elapsed();
            if elapsed < self.call_delay {
                thread::sleep(self.call_delay - elapsed);
            }
        }
        self.last_call.set(Some(Instant::now()));
    }

    fn bump(&self, f: impl FnOnce(&mut CacheCounters)) {
        let mut c = self.counters.get();
        f(&mut c);
        self.counters.set(c);
    }
}

fn upstream_window(requested: &DateWindow, today: NaiveDate) -> DateWindow {
    let season = DateWindow::season_to_date(today);
    DateWindow::new(
        requested.start.min(season.start),
        requested.end.max(season.end),
    )
}
