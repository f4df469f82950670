use std::collections::{BTreeMap, HashMap, HashSet};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::baseline::{self, Baseline};
use crate::config::{ACTIVE_PLAYER_LOOKBACK_DAYS, TrackerConfig};
use crate::engine::{self, Evaluation};
use crate::error::{FetchError, TrackerError};
use crate::grading::{GradingOrchestrator, GradingReport};
use crate::ledger::{Ledger, UpsertOutcome};
use crate::lines_fetch::{LinesProvider, local_date, utc_offset};
use crate::market_lines;
use crate::model::{ApiCallLogEntry, DateWindow, MarketLine, NaturalKey, StatType};
use crate::stat_cache::{CacheCounters, StatCache};
use crate::stats_fetch::StatsProvider;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Ignore the cache TTL (and revisit graded plays) for this invocation.
    pub force: bool,
    /// Work against an in-memory copy of the store and discard it.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub fetched: usize,
    pub lines_recorded: usize,
    pub lines_duplicate: usize,
    pub cache_hits: usize,
    pub created: usize,
    pub upserted: usize,
    pub unchanged: usize,
    pub locked: usize,
    pub graded: usize,
    pub regraded: usize,
    pub pushes: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rejected: usize,
    pub retained: usize,
    pub aborted: bool,
    pub dry_run: bool,
}

impl RunSummary {
    pub fn merge(&mut self, other: &RunSummary) {
        self.fetched += other.fetched;
        self.lines_recorded += other.lines_recorded;
        self.lines_duplicate += other.lines_duplicate;
        self.cache_hits += other.cache_hits;
        self.created += other.created;
        self.upserted += other.upserted;
        self.unchanged += other.unchanged;
        self.locked += other.locked;
        self.graded += other.graded;
        self.regraded += other.regraded;
        self.pushes += other.pushes;
        self.deferred += other.deferred;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.rejected += other.rejected;
        self.retained += other.retained;
        self.aborted |= other.aborted;
        self.dry_run |= other.dry_run;
    }

    fn absorb_cache(&mut self, counters: CacheCounters) {
        self.fetched += counters.fetches;
        self.cache_hits += counters.hits;
    }

    fn absorb_grading(&mut self, report: &GradingReport) {
        self.locked += report.locked;
        self.graded += report.graded;
        self.regraded += report.regraded;
        self.pushes += report.pushes;
        self.unchanged += report.unchanged;
        self.deferred += report.deferred;
        self.failed += report.failed;
        self.aborted |= report.aborted;
    }
}

struct Deadline(Option<Instant>);

impl Deadline {
    fn start(cfg: &TrackerConfig) -> Self {
        Self(cfg.run_deadline.map(|d| Instant::now() + d))
    }

    fn expired(&self) -> bool {
        self.0.is_some_and(|d| Instant::now() >= d)
    }
}

/// Fetches today's posted lines (local calendar) and appends them to the line history.
pub fn ingest_lines(
    store: &Store,
    provider: &dyn LinesProvider,
    cfg: &TrackerConfig,
    as_of: DateTime<Utc>,
    opts: RunOptions,
) -> Result<RunSummary> {
    with_target(store, opts, |target| {
        let date = local_date(as_of, utc_offset(cfg.event_utc_offset_hours));
        let mut summary = RunSummary::default();

        let lines = match fetch_lines_with_retry(target, provider, cfg, as_of) {
            Ok(lines) => lines,
            Err(err) => {
                warn!(provider = provider.name(), %date, error = %err, "line ingest failed");
                summary.failed += 1;
                return Ok(summary);
            }
        };
        summary.fetched = 1;

        let written = market_lines::record_lines(target, &lines)?;
        summary.lines_recorded = written.inserted;
        summary.lines_duplicate = written.duplicates;
        info!(
            %date,
            lines = lines.len(),
            inserted = written.inserted,
            duplicates = written.duplicates,
            "lines ingested"
        );
        Ok(summary)
    })
}

/// Evaluates the latest lines for today and tomorrow and writes plays through the ledger.
pub fn evaluate_plays<P: StatsProvider + ?Sized>(
    store: &Store,
    stats: &P,
    cfg: &TrackerConfig,
    as_of: DateTime<Utc>,
    opts: RunOptions,
) -> Result<RunSummary> {
    with_target(store, opts, |target| {
        let deadline = Deadline::start(cfg);
        let cache = StatCache::new(target, stats, cfg);
        let ledger = Ledger::new(target);
        let mut summary = RunSummary {
            locked: ledger.lock_started(as_of)?,
            ..RunSummary::default()
        };

        let today = local_date(as_of, utc_offset(cfg.event_utc_offset_hours));
        let window = DateWindow::new(today, today + Duration::days(1));
        let lines = market_lines::latest_lines(target, &window)?;

        let mut by_key: BTreeMap<NaturalKey, Vec<MarketLine>> = BTreeMap::new();
        for line in lines {
            by_key.entry(line.key()).or_default().push(line);
        }

        let mut baselines: HashMap<(String, StatType), Option<Baseline>> = HashMap::new();
        let mut refreshed: HashSet<String> = HashSet::new();
        let mut unavailable: HashSet<String> = HashSet::new();
        for (key, candidates) in &by_key {
            if deadline.expired() {
                warn!(key = %key, "run deadline reached, evaluation stopped");
                summary.aborted = true;
                break;
            }
            if unavailable.contains(&key.player_id) {
                summary.failed += 1;
                continue;
            }
            if opts.force && refreshed.insert(key.player_id.clone()) {
                let season = DateWindow::season_to_date(as_of.date_naive());
                if let Err(err) = cache.get_or_fetch_with(&key.player_id, &season, as_of, true) {
                    warn!(player_id = %key.player_id, error = %err, "forced refresh failed");
                }
            }

            let baseline = match baselines.get(&(key.player_id.clone(), key.stat)) {
                Some(found) => *found,
                None => {
                    let computed = match baseline::compute(&cache, &key.player_id, key.stat, as_of)
                    {
                        Ok(b) => Some(b),
                        Err(TrackerError::InsufficientData { .. }) => None,
                        Err(err) => {
                            warn!(key = %key, error = %err, "baseline unavailable");
                            unavailable.insert(key.player_id.clone());
                            summary.failed += 1;
                            continue;
                        }
                    };
                    baselines.insert((key.player_id.clone(), key.stat), computed);
                    computed
                }
            };
            let Some(baseline) = baseline else {
                summary.skipped += 1;
                continue;
            };

            let Some((line, eval)) = strongest_signal(candidates, &baseline, cfg) else {
                continue;
            };
            match ledger.record_evaluation(line, &baseline, &eval, as_of) {
                Ok(UpsertOutcome::Created(_)) => summary.created += 1,
                Ok(UpsertOutcome::Updated(_)) => summary.upserted += 1,
                Ok(UpsertOutcome::Unchanged(_)) => summary.unchanged += 1,
                Ok(UpsertOutcome::Retained(_)) => summary.retained += 1,
                Ok(UpsertOutcome::SkippedNoPlay | UpsertOutcome::SkippedStarted) => {
                    summary.skipped += 1
                }
                Err(TrackerError::StaleWriteRejected { .. }) => summary.rejected += 1,
                Err(TrackerError::PersistenceConflict(msg)) => {
                    warn!(key = %key, %msg, "upsert deferred on store contention");
                    summary.deferred += 1;
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "upsert failed");
                    summary.failed += 1;
                }
            }
        }

        summary.absorb_cache(cache.counters());
        info!(
            keys = by_key.len(),
            created = summary.created,
            upserted = summary.upserted,
            retained = summary.retained,
            rejected = summary.rejected,
            skipped = summary.skipped,
            "evaluation finished"
        );
        Ok(summary)
    })
}

/// Refreshes stats for players with recent lines, then grades final plays.
pub fn sync_and_grade<P: StatsProvider + ?Sized>(
    store: &Store,
    stats: &P,
    cfg: &TrackerConfig,
    as_of: DateTime<Utc>,
    opts: RunOptions,
) -> Result<RunSummary> {
    with_target(store, opts, |target| {
        let deadline = Deadline::start(cfg);
        let cache = StatCache::new(target, stats, cfg);
        let mut summary = RunSummary::default();

        let since = as_of - Duration::days(ACTIVE_PLAYER_LOOKBACK_DAYS);
        let season = DateWindow::season_to_date(as_of.date_naive());
        let players = market_lines::active_players(target, since)?;
        for player_id in &players {
            if deadline.expired() {
                warn!(player_id = %player_id, "run deadline reached, stats sync stopped");
                summary.aborted = true;
                break;
            }
            if let Err(err) = cache.get_or_fetch_with(player_id, &season, as_of, opts.force) {
                warn!(player_id = %player_id, error = %err, "stats sync failed");
                summary.failed += 1;
            }
        }
        info!(players = players.len(), "stats sync finished");

        if !summary.aborted {
            let report = GradingOrchestrator::new(
                Ledger::new(target),
                &cache,
                cfg.finality(),
                cfg.push_tolerance,
            )
            .with_deadline(deadline.0)
            .run(as_of, opts.force)?;
            summary.absorb_grading(&report);
        }
        summary.absorb_cache(cache.counters());
        Ok(summary)
    })
}

/// Ingest, evaluate, then sync and grade against one store (or one dry-run copy). Without a
/// lines provider the ingest step is skipped and evaluation uses the stored history.
pub fn run_all<P: StatsProvider + ?Sized>(
    store: &Store,
    lines: Option<&dyn LinesProvider>,
    stats: &P,
    cfg: &TrackerConfig,
    as_of: DateTime<Utc>,
    opts: RunOptions,
) -> Result<RunSummary> {
    with_target(store, opts, |target| {
        let inner = RunOptions {
            dry_run: false,
            ..opts
        };
        let mut summary = match lines {
            Some(provider) => ingest_lines(target, provider, cfg, as_of, inner)?,
            None => {
                warn!("no lines provider configured, ingest skipped");
                RunSummary::default()
            }
        };
        summary.merge(&evaluate_plays(target, stats, cfg, as_of, inner)?);
        summary.merge(&sync_and_grade(target, stats, cfg, as_of, inner)?);
        Ok(summary)
    })
}

fn with_target<F>(store: &Store, opts: RunOptions, f: F) -> Result<RunSummary>
where
    F: FnOnce(&Store) -> Result<RunSummary>,
{
    if !opts.dry_run {
        return f(store);
    }
    let snapshot = store
        .snapshot_in_memory()
        .context("snapshot store for dry run")?;
    let mut summary = f(&snapshot)?;
    summary.dry_run = true;
    Ok(summary)
}

/// Keeps the bookmaker line with the largest |score|. When none is a play, the most recently
/// collected observation is returned so the ledger sees the no-play.
fn strongest_signal<'l>(
    candidates: &'l [MarketLine],
    baseline: &Baseline,
    cfg: &TrackerConfig,
) -> Option<(&'l MarketLine, Evaluation)> {
    let mut best: Option<(&MarketLine, Evaluation)> = None;
    let mut newest: Option<(&MarketLine, Evaluation)> = None;
    for line in candidates {
        let mut eval = engine::evaluate(line.line, baseline, baseline.stddev, cfg.weights);
        if cfg.sample_size_penalty {
            eval = engine::apply_sample_size_penalty(eval, baseline.games_played);
        }
        if eval.is_play() && best.is_none_or(|(_, b)| eval.abs_score() > b.abs_score()) {
            best = Some((line, eval));
        }
        if newest.is_none_or(|(l, _)| line.collected_at > l.collected_at) {
            newest = Some((line, eval));
        }
    }
    best.or(newest)
}

fn fetch_lines_with_retry(
    store: &Store,
    provider: &dyn LinesProvider,
    cfg: &TrackerConfig,
    as_of: DateTime<Utc>,
) -> std::result::Result<Vec<MarketLine>, TrackerError> {
    let date = local_date(as_of, utc_offset(cfg.event_utc_offset_hours));
    let attempts_max = cfg.max_attempts.max(1);
    let mut attempts = 0;
    let mut last: Option<FetchError> = None;
    while attempts < attempts_max {
        if attempts > 0 {
            thread::sleep(cfg.call_delay);
        }
        attempts += 1;
        store.append_api_call(&ApiCallLogEntry {
            provider: provider.name().to_string(),
            endpoint: "player_props".to_string(),
            player_id: None,
            cache_hit: false,
            called_at: as_of,
        })?;
        match provider.fetch_lines(date, as_of) {
            Ok(lines) => return Ok(lines),
            Err(err) => {
                warn!(provider = provider.name(), attempt = attempts, error = %err, "lines fetch failed");
                let retryable = err.is_retryable();
                last = Some(err);
                if !retryable {
                    break;
                }
            }
        }
    }
    Err(TrackerError::ProviderUnavailable {
        provider: provider.name().to_string(),
        attempts,
        last: last.unwrap_or_else(|| FetchError::Transport("no attempt made".to_string())),
    })
}
