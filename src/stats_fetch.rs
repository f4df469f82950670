use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde_json::Value;

use crate::error::FetchError;
use crate::http_client::{http_client, send_for_text};
use crate::model::{DateWindow, EventStatLine};

const NBA_STATS_GAMELOG_URL: &str = "https://stats.nba.com/stats/playergamelog";
const TRACKED_COLUMNS: [&str; 8] = ["PTS", "REB", "AST", "FG3M", "STL", "BLK", "TOV", "MIN"];

/// Upstream source of per-event player stat lines.
pub trait StatsProvider {
    fn name(&self) -> &str;

    fn fetch_player_event_log(
        &self,
        player_id: &str,
        window: &DateWindow,
    ) -> Result<Vec<EventStatLine>, FetchError>;
}

#[derive(Debug, Clone, Default)]
pub struct NbaStatsClient;

impl NbaStatsClient {
    pub fn new() -> Self {
        Self
    }

    fn fetch_season(
        &self,
        player_id: &str,
        season: &str,
        window: &DateWindow,
    ) -> Result<Vec<EventStatLine>, FetchError> {
        let date_from = window.start.format("%m/%d/%Y").to_string();
        let date_to = window.end.format("%m/%d/%Y").to_string();
        let req = http_client()?
            .get(NBA_STATS_GAMELOG_URL)
            .query(&[
                ("PlayerID", player_id),
                ("Season", season),
                ("SeasonType", "Regular Season"),
                ("DateFrom", date_from.as_str()),
                ("DateTo", date_to.as_str()),
            ])
            .header("Accept", "application/json, text/plain, */*")
            .header("Referer", "https://stats.nba.com/")
            .header("Origin", "https://stats.nba.com")
            .header("x-nba-stats-origin", "stats")
            .header("x-nba-stats-token", "true");
        let body = send_for_text(req)?;
        parse_game_log_json(&body)
    }
}

impl StatsProvider for NbaStatsClient {
    fn name(&self) -> &str {
        "nba_stats"
    }

    fn fetch_player_event_log(
        &self,
        player_id: &str,
        window: &DateWindow,
    ) -> Result<Vec<EventStatLine>, FetchError> {
        let mut out = Vec::new();
        for season in seasons_in_window(window) {
            let mut rows = self.fetch_season(player_id, &season, window)?;
            out.append(&mut rows);
        }
        out.retain(|row| window.contains(row.event_date));
        Ok(out)
    }
}

/// Season labels ("2025-26") touched by a window.
pub fn seasons_in_window(window: &DateWindow) -> Vec<String> {
    let first = season_start_year(window.start);
    let last = season_start_year(window.end);
    (first..=last)
        .map(|y| format!("{}-{:02}", y, (y + 1) % 100))
        .collect()
}

fn season_start_year(date: NaiveDate) -> i32 {
    if date.month() >= 10 {
        date.year()
    } else {
        date.year() - 1
    }
}

/// Parses a `playergamelog` payload. Rows without an id or a readable date are dropped;
/// missing or null stat cells are simply absent from the row's map.
pub fn parse_game_log_json(raw: &str) -> Result<Vec<EventStatLine>, FetchError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let v: Value = serde_json::from_str(trimmed)?;
    let sets = v
        .get("resultSets")
        .and_then(|x| x.as_array())
        .ok_or_else(|| FetchError::Malformed("missing resultSets".to_string()))?;
    let Some(set) = sets
        .iter()
        .find(|s| s.get("name").and_then(|n| n.as_str()) == Some("PlayerGameLog"))
        .or_else(|| sets.first())
    else {
        return Ok(Vec::new());
    };

    let headers: Vec<String> = set
        .get("headers")
        .and_then(|h| h.as_array())
        .ok_or_else(|| FetchError::Malformed("missing headers".to_string()))?
        .iter()
        .map(|h| h.as_str().unwrap_or_default().to_ascii_uppercase())
        .collect();
    let col = |name: &str| headers.iter().position(|h| h == name);
    let game_id_idx =
        col("GAME_ID").ok_or_else(|| FetchError::Malformed("missing GAME_ID".to_string()))?;
    let date_idx =
        col("GAME_DATE").ok_or_else(|| FetchError::Malformed("missing GAME_DATE".to_string()))?;
    let wl_idx = col("WL");

    let rows = set
        .get("rowSet")
        .and_then(|r| r.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(cells) = row.as_array() else {
            continue;
        };
        let Some(event_id) = cells.get(game_id_idx).and_then(as_string_any) else {
            continue;
        };
        let Some(event_date) = cells
            .get(date_idx)
            .and_then(|v| v.as_str())
            .and_then(parse_game_date)
        else {
            continue;
        };
        let is_final = wl_idx
            .and_then(|i| cells.get(i))
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.trim().is_empty());

        let mut stats = BTreeMap::new();
        for name in TRACKED_COLUMNS {
            if let Some(value) = col(name)
                .and_then(|i| cells.get(i))
                .and_then(as_f64_any)
                .filter(|v| v.is_finite())
            {
                stats.insert(name.to_string(), value);
            }
        }

        out.push(EventStatLine {
            event_id,
            event_date,
            stats,
            is_final,
        });
    }
    Ok(out)
}

fn parse_game_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%b %d, %Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .or_else(|_| NaiveDate::parse_from_str(raw.get(..10).unwrap_or(raw), "%Y-%m-%d"))
        .ok()
}

fn as_string_any(v: &Value) -> Option<String> {
    if let Some(s) = v.as_str() {
        let s = s.trim();
        return (!s.is_empty()).then(|| s.to_string());
    }
    v.as_i64().map(|n| n.to_string())
}

fn as_f64_any(v: &Value) -> Option<f64> {
    if let Some(n) = v.as_f64() {
        return Some(n);
    }
    v.as_str()?.trim().parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seasons_span_october_boundary() {
        let w = DateWindow::new(
            NaiveDate::from_ymd_opt(2025, 9, 20).unwrap(),
            NaiveDate::from_ymd_opt(2025, 10, 30).unwrap(),
        );
        assert_eq!(seasons_in_window(&w), vec!["2024-25", "2025-26"]);
    }

    #[test]
    fn game_date_accepts_upper_case_month() {
        assert_eq!(
            parse_game_date("NOV 25, 2025"),
            NaiveDate::from_ymd_opt(2025, 11, 25)
        );
        assert_eq!(
            parse_game_date("2025-11-25T00:00:00"),
            NaiveDate::from_ymd_opt(2025, 11, 25)
        );
        assert_eq!(parse_game_date("yesterday"), None);
    }

    #[test]
    fn missing_headers_is_malformed() {
        let err = parse_game_log_json(r#"{"resultSets":[{"name":"PlayerGameLog"}]}"#)
            .expect_err("no headers");
        assert!(matches!(err, FetchError::Malformed(_)));
    }
}
