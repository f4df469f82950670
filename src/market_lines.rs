use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use tracing::debug;

use crate::error::{Result, TrackerError};
use crate::model::{DateWindow, MarketLine, NaturalKey, StatType};
use crate::store::{Store, bool_to_i64, date_col, date_str, ts, ts_col};

const LINE_COLUMNS: &str = "player_id, player_name, stat, event_id, event_start, event_date, \
     line, over_price, under_price, bookmaker, is_latest, collected_at";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineWrite {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Appends observations to the line history. Re-recording the same observation is a no-op,
/// and `is_latest` always marks the newest observation per player/stat/event/bookmaker.
pub fn record_lines(store: &Store, lines: &[MarketLine]) -> Result<LineWrite> {
    let mut out = LineWrite::default();
    for line in lines {
        let inserted = store.atomic(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO market_lines (
                    player_id, player_name, stat, event_id, event_start, event_date,
                    line, over_price, under_price, bookmaker, is_latest, collected_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11)",
                params![
                    line.player_id,
                    line.player_name,
                    line.stat.as_str(),
                    line.event_id,
                    ts(line.event_start),
                    date_str(line.event_date),
                    line.line,
                    line.over_price,
                    line.under_price,
                    line.bookmaker,
                    ts(line.collected_at),
                ],
            )?;
            if inserted > 0 {
                tx.execute(
                    "UPDATE market_lines
                     SET is_latest = CASE WHEN collected_at = (
                         SELECT MAX(collected_at) FROM market_lines
                         WHERE player_id = ?1 AND stat = ?2 AND event_id = ?3 AND bookmaker = ?4
                     ) THEN 1 ELSE 0 END
                     WHERE player_id = ?1 AND stat = ?2 AND event_id = ?3 AND bookmaker = ?4",
                    params![
                        line.player_id,
                        line.stat.as_str(),
                        line.event_id,
                        line.bookmaker
                    ],
                )?;
            }
            Ok(inserted > 0)
        })?;
        if inserted {
            out.inserted += 1;
        } else {
            out.duplicates += 1;
        }
    }
    debug!(
        inserted = out.inserted,
        duplicates = out.duplicates,
        "line history recorded"
    );
    Ok(out)
}

/// Latest observation per bookmaker for events dated inside `window`, limited to the most
/// recent collection of each natural key so a book that pulled its line drops out.
pub fn latest_lines(store: &Store, window: &DateWindow) -> Result<Vec<MarketLine>> {
    let sql = format!(
        "SELECT {LINE_COLUMNS} FROM market_lines m
         WHERE m.is_latest = 1 AND m.event_date >= ?1 AND m.event_date <= ?2
           AND m.collected_at = (
               SELECT MAX(x.collected_at) FROM market_lines x
               WHERE x.player_id = m.player_id AND x.stat = m.stat AND x.event_id = m.event_id
           )
         ORDER BY m.player_id, m.stat, m.event_id, m.bookmaker"
    );
    let mut stmt = store.conn().prepare(&sql)?;
    let rows = stmt.query_map(
        params![date_str(window.start), date_str(window.end)],
        line_from_row,
    )?;
    collect_lines(rows)
}

/// Full observation history for one natural key, oldest first.
pub fn history(store: &Store, key: &NaturalKey) -> Result<Vec<MarketLine>> {
    let sql = format!(
        "SELECT {LINE_COLUMNS} FROM market_lines
         WHERE player_id = ?1 AND stat = ?2 AND event_id = ?3
         ORDER BY collected_at ASC, bookmaker ASC"
    );
    let mut stmt = store.conn().prepare(&sql)?;
    let rows = stmt.query_map(
        params![key.player_id, key.stat.as_str(), key.event_id],
        line_from_row,
    )?;
    collect_lines(rows)
}

/// Players with any line collected since `since`.
pub fn active_players(store: &Store, since: DateTime<Utc>) -> Result<Vec<String>> {
    let mut stmt = store.conn().prepare(
        "SELECT DISTINCT player_id FROM market_lines WHERE collected_at >= ?1 ORDER BY player_id",
    )?;
    let rows = stmt.query_map(params![ts(since)], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn line_from_row(row: &Row<'_>) -> rusqlite::Result<(MarketLine, String)> {
    let stat_raw: String = row.get(2)?;
    Ok((
        MarketLine {
            player_id: row.get(0)?,
            player_name: row.get(1)?,
            stat: StatType::Points,
            event_id: row.get(3)?,
            event_start: ts_col(row, 4)?,
            event_date: date_col(row, 5)?,
            line: row.get(6)?,
            over_price: row.get(7)?,
            under_price: row.get(8)?,
            bookmaker: row.get(9)?,
            is_latest: row.get::<_, i64>(10)? == bool_to_i64(true),
            collected_at: ts_col(row, 11)?,
        },
        stat_raw,
    ))
}

fn collect_lines(
    rows: impl Iterator<Item = rusqlite::Result<(MarketLine, String)>>,
) -> Result<Vec<MarketLine>> {
    let mut out = Vec::new();
    for row in rows {
        let (mut line, stat_raw) = row?;
        line.stat = StatType::parse(&stat_raw)
            .ok_or_else(|| TrackerError::CorruptRow(format!("unknown stat {stat_raw}")))?;
        out.push(line);
    }
    Ok(out)
}
