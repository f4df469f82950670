use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Duration as ChronoDuration;

use crate::error::{Result, TrackerError};

/// Maximum age of a cached stat record before it must be refetched.
pub const CACHE_TTL_HOURS: i64 = 12;
/// Delay after scheduled start past which an event is treated as final.
pub const FINALITY_HOURS: i64 = 4;
/// Number of most recent events in the recent-form average.
pub const RECENT_WINDOW: usize = 5;
/// |score| at which a deviation becomes a medium-confidence play.
pub const MEDIUM_THRESHOLD: f64 = 0.5;
/// |score| at which a deviation becomes a high-confidence play.
pub const HIGH_THRESHOLD: f64 = 1.0;
/// Lookback for "active" players during the stats sync.
pub const ACTIVE_PLAYER_LOOKBACK_DAYS: i64 = 7;
/// American price assumed for plays recorded without one.
pub const STANDARD_PRICE: i32 = -110;

const MIN_CALL_DELAY_MS: u64 = 600;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_EVENT_UTC_OFFSET_HOURS: i32 = -6;
const DEFAULT_STAKE: f64 = 10.0;
const DB_DIR: &str = "props_tracker";
const DB_FILE: &str = "props.sqlite";

/// Season / recent-form blend used for the expected value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendWeights {
    pub season: f64,
    pub recent: f64,
}

impl BlendWeights {
    pub const EVEN: BlendWeights = BlendWeights {
        season: 0.5,
        recent: 0.5,
    };

    pub fn new(season: f64, recent: f64) -> Result<Self> {
        let valid = season.is_finite()
            && recent.is_finite()
            && (0.0..=1.0).contains(&season)
            && (0.0..=1.0).contains(&recent)
            && ((season + recent) - 1.0).abs() < 1e-9;
        if !valid {
            return Err(TrackerError::InvalidConfig(format!(
                "blend weights must be in [0, 1] and sum to 1.0 (got {season} + {recent})"
            )));
        }
        Ok(Self { season, recent })
    }
}

impl Default for BlendWeights {
    fn default() -> Self {
        Self::EVEN
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub db_path: Option<PathBuf>,
    pub player_map_path: Option<PathBuf>,
    pub odds_api_key: Option<String>,
    pub odds_regions: String,
    pub odds_bookmakers: Option<String>,
    pub weights: BlendWeights,
    pub call_delay: Duration,
    pub max_attempts: u32,
    pub run_deadline: Option<Duration>,
    pub event_utc_offset_hours: i32,
    pub push_tolerance: f64,
    pub sample_size_penalty: bool,
    /// Flat stake per play used for profit tracking.
    pub stake: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            player_map_path: None,
            odds_api_key: None,
            odds_regions: "us".to_string(),
            odds_bookmakers: None,
            weights: BlendWeights::EVEN,
            call_delay: Duration::from_millis(MIN_CALL_DELAY_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            run_deadline: None,
            event_utc_offset_hours: DEFAULT_EVENT_UTC_OFFSET_HOURS,
            push_tolerance: 0.0,
            sample_size_penalty: true,
            stake: DEFAULT_STAKE,
        }
    }
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let call_delay_ms = env::var("PROPS_CALL_DELAY_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(MIN_CALL_DELAY_MS)
            .max(MIN_CALL_DELAY_MS);
        let max_attempts = env::var("PROPS_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
            .clamp(1, 6);
        let run_deadline = env::var("PROPS_RUN_DEADLINE_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let event_utc_offset_hours = env::var("PROPS_EVENT_UTC_OFFSET_HOURS")
            .ok()
            .and_then(|v| v.trim().parse::<i32>().ok())
            .unwrap_or(DEFAULT_EVENT_UTC_OFFSET_HOURS)
            .clamp(-12, 14);
        let push_tolerance = env::var("PROPS_PUSH_TOLERANCE")
            .ok()
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(0.0);
        let stake = env::var("PROPS_STAKE")
            .ok()
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(DEFAULT_STAKE);

        Self {
            db_path: env_path("PROPS_DB_PATH"),
            player_map_path: env_path("PROPS_PLAYER_MAP"),
            odds_api_key: env::var("ODDS_API_KEY")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            odds_regions: env::var("ODDS_REGIONS")
                .map(|s| s.trim().to_ascii_lowercase())
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.odds_regions),
            odds_bookmakers: env::var("ODDS_BOOKMAKERS")
                .ok()
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty()),
            weights: defaults.weights,
            call_delay: Duration::from_millis(call_delay_ms),
            max_attempts,
            run_deadline,
            event_utc_offset_hours,
            push_tolerance,
            sample_size_penalty: env_bool("PROPS_SAMPLE_SIZE_PENALTY", true),
            stake,
        }
    }

    pub fn cache_ttl(&self) -> ChronoDuration {
        ChronoDuration::hours(CACHE_TTL_HOURS)
    }

    pub fn finality(&self) -> ChronoDuration {
        ChronoDuration::hours(FINALITY_HOURS)
    }

    pub fn resolved_db_path(&self) -> Option<PathBuf> {
        self.db_path.clone().or_else(default_db_path)
    }
}

pub fn default_db_path() -> Option<PathBuf> {
    if let Ok(base) = env::var("XDG_CACHE_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(DB_DIR).join(DB_FILE));
    }
    let home = env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".cache").join(DB_DIR).join(DB_FILE))
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| {
            let t = v.trim().to_ascii_lowercase();
            !(t.is_empty() || t == "0" || t == "false" || t == "off" || t == "no")
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_must_sum_to_one() {
        assert!(BlendWeights::new(0.7, 0.3).is_ok());
        assert!(BlendWeights::new(0.6, 0.6).is_err());
        assert!(BlendWeights::new(-0.5, 1.5).is_err());
        assert!(BlendWeights::new(f64::NAN, 1.0).is_err());
    }

    #[test]
    fn defaults_respect_minimum_delay() {
        let cfg = TrackerConfig::default();
        assert!(cfg.call_delay >= Duration::from_millis(600));
        assert_eq!(cfg.cache_ttl(), ChronoDuration::hours(12));
        assert_eq!(cfg.finality(), ChronoDuration::hours(4));
        assert_eq!(cfg.push_tolerance, 0.0);
        assert_eq!(cfg.stake, 10.0);
    }
}
