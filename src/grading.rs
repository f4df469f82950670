use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, TrackerError};
use crate::ledger::{GradeChange, Ledger};
use crate::model::{GradeOutcome, Play};
use crate::stat_cache::StatCache;
use crate::stats_fetch::StatsProvider;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GradingReport {
    pub locked: usize,
    pub graded: usize,
    pub regraded: usize,
    pub pushes: usize,
    pub unchanged: usize,
    /// Final row not yet available, or the store was busy.
    pub deferred: usize,
    pub failed: usize,
    pub aborted: bool,
}

/// Locks started plays and grades the final ones against actuals read through the stat cache.
pub struct GradingOrchestrator<'a, P: StatsProvider + ?Sized> {
    ledger: Ledger<'a>,
    cache: &'a StatCache<'a, P>,
    finality: Duration,
    push_tolerance: f64,
    deadline: Option<Instant>,
}

impl<'a, P: StatsProvider + ?Sized> GradingOrchestrator<'a, P> {
    pub fn new(
        ledger: Ledger<'a>,
        cache: &'a StatCache<'a, P>,
        finality: Duration,
        push_tolerance: f64,
    ) -> Self {
        Self {
            ledger,
            cache,
            finality,
            push_tolerance,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// `force` also revisits GRADED plays. Each player's final rows are refetched once per run
    /// so upstream corrections reach the cache; a play changes only if its actual value moved.
    pub fn run(&self, as_of: DateTime<Utc>, force: bool) -> Result<GradingReport> {
        let mut report = GradingReport {
            locked: self.ledger.lock_started(as_of)?,
            ..GradingReport::default()
        };

        let candidates = self.ledger.gradeable(as_of, self.finality, force)?;
        debug!(candidates = candidates.len(), force, "grading candidates");
        let mut corrected: HashSet<String> = HashSet::new();
        for play in &candidates {
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(remaining = candidates.len(), "run deadline reached, grading stopped");
                report.aborted = true;
                break;
            }
            let refetch = force && corrected.insert(play.player_id.clone());
            self.grade_one(play, as_of, refetch, &mut report);
        }

        info!(
            locked = report.locked,
            graded = report.graded,
            regraded = report.regraded,
            pushes = report.pushes,
            deferred = report.deferred,
            failed = report.failed,
            "grading run finished"
        );
        Ok(report)
    }

    fn grade_one(
        &self,
        play: &Play,
        as_of: DateTime<Utc>,
        refetch: bool,
        report: &mut GradingReport,
    ) {
        let actual =
            match self
                .cache
                .actual_for_event(&play.player_id, play.event_date, play.stat, as_of, refetch)
            {
                Ok(Some(value)) => value,
                Ok(None) => {
                    debug!(id = play.id, key = %play.key(), "no final stat yet, deferred");
                    report.deferred += 1;
                    return;
                }
                Err(err) => {
                    warn!(id = play.id, key = %play.key(), error = %err, "actual lookup failed");
                    report.failed += 1;
                    return;
                }
            };

        match self
            .ledger
            .grade(play.id, actual, as_of, self.finality, self.push_tolerance)
        {
            Ok(GradeChange::Graded(outcome)) => {
                report.graded += 1;
                if outcome == GradeOutcome::Push {
                    report.pushes += 1;
                }
            }
            Ok(GradeChange::Regraded { to, .. }) => {
                report.regraded += 1;
                if to == GradeOutcome::Push {
                    report.pushes += 1;
                }
            }
            Ok(GradeChange::Unchanged) => report.unchanged += 1,
            Ok(GradeChange::NotFinal) => report.deferred += 1,
            Err(TrackerError::PersistenceConflict(msg)) => {
                warn!(id = play.id, %msg, "grade deferred on store contention");
                report.deferred += 1;
            }
            Err(err) => {
                warn!(id = play.id, error = %err, "grade failed");
                report.failed += 1;
            }
        }
    }
}
