use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::TrackerConfig;
use crate::error::FetchError;
use crate::http_client::{http_client, send_for_text};
use crate::model::{MarketLine, StatType};
use crate::players::PlayerDirectory;

const ODDS_API_BASE: &str = "https://api.the-odds-api.com/v4/sports/basketball_nba";

/// Upstream source of posted player-prop lines.
pub trait LinesProvider {
    fn name(&self) -> &str;

    /// Lines for events whose local calendar date is `date`, stamped with `collected_at`.
    fn fetch_lines(
        &self,
        date: NaiveDate,
        collected_at: DateTime<Utc>,
    ) -> Result<Vec<MarketLine>, FetchError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct OddsEventRef {
    pub id: String,
    pub commence_time: DateTime<Utc>,
    #[serde(default)]
    pub home_team: String,
    #[serde(default)]
    pub away_team: String,
}

#[derive(Debug, Deserialize)]
struct EventOdds {
    #[serde(default)]
    bookmakers: Vec<Bookmaker>,
}

#[derive(Debug, Deserialize)]
struct Bookmaker {
    key: String,
    #[serde(default)]
    markets: Vec<Market>,
}

#[derive(Debug, Deserialize)]
struct Market {
    key: String,
    #[serde(default)]
    outcomes: Vec<Outcome>,
}

#[derive(Debug, Deserialize)]
struct Outcome {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    point: Option<f64>,
}

pub struct OddsApiClient {
    api_key: String,
    regions: String,
    bookmakers: Option<String>,
    directory: PlayerDirectory,
    offset: FixedOffset,
    call_delay: Duration,
}

impl OddsApiClient {
    pub fn new(cfg: &TrackerConfig, directory: PlayerDirectory) -> Option<Self> {
        let api_key = cfg.odds_api_key.clone()?;
        Some(Self {
            api_key,
            regions: cfg.odds_regions.clone(),
            bookmakers: cfg.odds_bookmakers.clone(),
            directory,
            offset: utc_offset(cfg.event_utc_offset_hours),
            call_delay: cfg.call_delay,
        })
    }

    fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<String, FetchError> {
        let req = http_client()?
            .get(url)
            .query(&[("apiKey", self.api_key.as_str())])
            .query(query);
        send_for_text(req)
    }
}

impl LinesProvider for OddsApiClient {
    fn name(&self) -> &str {
        "the_odds_api"
    }

    fn fetch_lines(
        &self,
        date: NaiveDate,
        collected_at: DateTime<Utc>,
    ) -> Result<Vec<MarketLine>, FetchError> {
        let body = self.get(
            &format!("{ODDS_API_BASE}/events"),
            &[("dateFormat", "iso")],
        )?;
        let events: Vec<OddsEventRef> = serde_json::from_str(body.trim())?;
        let events: Vec<OddsEventRef> = events
            .into_iter()
            .filter(|e| local_date(e.commence_time, self.offset) == date)
            .collect();
        debug!(%date, events = events.len(), "odds events for date");

        let markets = StatType::ALL
            .iter()
            .map(|s| s.market_key())
            .collect::<Vec<_>>()
            .join(",");
        let mut out = Vec::new();
        for (idx, event) in events.iter().enumerate() {
            if idx > 0 {
                thread::sleep(self.call_delay);
            }
            let mut query = vec![
                ("regions", self.regions.as_str()),
                ("markets", markets.as_str()),
                ("oddsFormat", "american"),
            ];
            if let Some(books) = self.bookmakers.as_deref() {
                query.push(("bookmakers", books));
            }
            let body = self.get(&format!("{ODDS_API_BASE}/events/{}/odds", event.id), &query)?;
            let (mut lines, unresolved) = parse_event_props_json(
                &body,
                event,
                &self.directory,
                self.offset,
                collected_at,
            )?;
            for name in unresolved {
                warn!(player = %name, event_id = %event.id, "unresolved player name");
            }
            out.append(&mut lines);
        }
        Ok(out)
    }
}

pub fn utc_offset(hours: i32) -> FixedOffset {
    FixedOffset::east_opt(hours.clamp(-12, 14) * 3600).unwrap_or_else(|| Utc.fix())
}

pub fn local_date(time: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    time.with_timezone(&offset).date_naive()
}

/// Pairs Over/Under outcomes per bookmaker/market/player into lines. Returns the lines and
/// the names the directory could not resolve.
pub fn parse_event_props_json(
    raw: &str,
    event: &OddsEventRef,
    directory: &PlayerDirectory,
    offset: FixedOffset,
    collected_at: DateTime<Utc>,
) -> Result<(Vec<MarketLine>, Vec<String>), FetchError> {
    let odds: EventOdds = serde_json::from_str(raw.trim())?;
    let event_date = local_date(event.commence_time, offset);

    let mut lines = Vec::new();
    let mut unresolved = Vec::new();
    for book in &odds.bookmakers {
        for market in &book.markets {
            let Some(stat) = StatType::parse(&market.key) else {
                continue;
            };
            // player -> (point, over price, under price)
            let mut sides: BTreeMap<String, (Option<f64>, Option<i32>, Option<i32>)> =
                BTreeMap::new();
            for outcome in &market.outcomes {
                let Some(player) = outcome.description.as_deref().map(str::trim) else {
                    continue;
                };
                if player.is_empty() {
                    continue;
                }
                let entry = sides.entry(player.to_string()).or_default();
                let price = outcome.price.filter(|p| p.is_finite()).map(|p| p.round() as i32);
                if outcome.name.eq_ignore_ascii_case("over") {
                    entry.0 = entry.0.or(outcome.point);
                    entry.1 = price;
                } else if outcome.name.eq_ignore_ascii_case("under") {
                    entry.0 = entry.0.or(outcome.point);
                    entry.2 = price;
                }
            }

            for (player, (point, over_price, under_price)) in sides {
                let Some(line) = point.filter(|p| p.is_finite()) else {
                    continue;
                };
                let Some((player_id, canonical)) = directory.resolve(&player) else {
                    if !unresolved.contains(&player) {
                        unresolved.push(player);
                    }
                    continue;
                };
                lines.push(MarketLine {
                    player_id: player_id.to_string(),
                    player_name: canonical.to_string(),
                    stat,
                    event_id: event.id.clone(),
                    event_start: event.commence_time,
                    event_date,
                    line,
                    over_price,
                    under_price,
                    bookmaker: book.key.clone(),
                    is_latest: true,
                    collected_at,
                });
            }
        }
    }
    Ok((lines, unresolved))
}
