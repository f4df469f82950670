use chrono::{DateTime, NaiveDate, Utc};

use crate::config::RECENT_WINDOW;
use crate::error::{Result, TrackerError};
use crate::model::{DateWindow, StatRecord, StatType};
use crate::stat_cache::StatCache;
use crate::stats_fetch::StatsProvider;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub season_avg: f64,
    pub recent_avg: f64,
    /// Sample standard deviation over the season; 0.0 with fewer than two games.
    pub stddev: f64,
    pub games_played: u32,
    pub recent_games: u32,
}

/// Season and recent-form baseline for one player/stat as of `as_of`, read through the cache.
pub fn compute<P: StatsProvider + ?Sized>(
    cache: &StatCache<'_, P>,
    player_id: &str,
    stat: StatType,
    as_of: DateTime<Utc>,
) -> Result<Baseline> {
    let as_of_date = as_of.date_naive();
    let window = DateWindow::season_to_date(as_of_date);
    let records = cache.get_or_fetch(player_id, &window, as_of)?;
    baseline_from_records(&records, stat, as_of_date, RECENT_WINDOW).ok_or_else(|| {
        TrackerError::InsufficientData {
            player_id: player_id.to_string(),
            stat: stat.to_string(),
        }
    })
}

/// Only final records up to `as_of` count; rows missing the stat are skipped.
pub fn baseline_from_records(
    records: &[StatRecord],
    stat: StatType,
    as_of: NaiveDate,
    recent_window: usize,
) -> Option<Baseline> {
    let mut values: Vec<(NaiveDate, &str, f64)> = records
        .iter()
        .filter(|r| r.is_final && r.event_date <= as_of)
        .filter_map(|r| r.value(stat).map(|v| (r.event_date, r.event_id.as_str(), v)))
        .collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(a.1)));

    let season: Vec<f64> = values.iter().map(|(_, _, v)| *v).collect();
    let recent_n = recent_window.max(1).min(season.len());
    let recent = &season[..recent_n];

    Some(Baseline {
        season_avg: mean(&season),
        recent_avg: mean(recent),
        stddev: sample_stddev(&season),
        games_played: season.len() as u32,
        recent_games: recent_n as u32,
    })
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}
