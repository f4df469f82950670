use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use props_tracker::config::TrackerConfig;
use props_tracker::ledger::Ledger;
use props_tracker::lines_fetch::{LinesProvider, OddsApiClient, local_date, utc_offset};
use props_tracker::model::DateWindow;
use props_tracker::players::PlayerDirectory;
use props_tracker::stats_fetch::NbaStatsClient;
use props_tracker::store::Store;
use props_tracker::tasks::{self, RunOptions, RunSummary};

/// Player-prop recommendation tracker
#[derive(Parser, Debug)]
#[command(name = "props_tracker")]
#[command(about = "Ingest prop lines, record recommendations and grade them once games are final")]
struct Cli {
    /// SQLite store path (defaults to PROPS_DB_PATH, then the user cache dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Evaluation instant, RFC 3339 (defaults to now)
    #[arg(long, global = true)]
    as_of: Option<DateTime<Utc>>,

    /// Ignore the stat cache TTL and revisit graded plays
    #[arg(long, global = true)]
    force: bool,

    /// Run against an in-memory copy of the store; nothing is persisted
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch today's posted player-prop lines into the line history
    IngestLines,
    /// Evaluate the latest lines and update the recommendation ledger
    Evaluate,
    /// Refresh stats for recently active players and grade final plays
    SyncGrade,
    /// Ingest, evaluate, then sync and grade
    All,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("props_tracker=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = TrackerConfig::from_env();
    let db_path = cli
        .db
        .clone()
        .or_else(|| cfg.resolved_db_path())
        .context("unable to resolve sqlite path")?;
    let store = Store::open(&db_path)?;
    let as_of = cli.as_of.unwrap_or_else(Utc::now);
    let opts = RunOptions {
        force: cli.force,
        dry_run: cli.dry_run,
    };
    let stats = NbaStatsClient::new();

    let summary = match cli.command {
        Commands::IngestLines => {
            let lines = lines_client(&cfg)?.context("ODDS_API_KEY is not set")?;
            tasks::ingest_lines(&store, &lines, &cfg, as_of, opts)?
        }
        Commands::Evaluate => tasks::evaluate_plays(&store, &stats, &cfg, as_of, opts)?,
        Commands::SyncGrade => tasks::sync_and_grade(&store, &stats, &cfg, as_of, opts)?,
        Commands::All => {
            let lines = lines_client(&cfg)?;
            let lines = lines.as_ref().map(|c| c as &dyn LinesProvider);
            tasks::run_all(&store, lines, &stats, &cfg, as_of, opts)?
        }
    };

    println!("props_tracker run complete");
    println!("DB: {}", db_path.display());
    println!("As of: {}", as_of.to_rfc3339());
    print_summary(&summary);

    let today = local_date(as_of, utc_offset(cfg.event_utc_offset_hours));
    let record =
        Ledger::new(&store).record_summary(&DateWindow::season_to_date(today), cfg.stake)?;
    println!(
        "Season record: {}-{}-{} ({} pending)",
        record.wins, record.losses, record.pushes, record.pending
    );
    if let Some(rate) = record.hit_rate {
        println!("Hit rate: {:.1}%", rate * 100.0);
    }
    println!(
        "Profit: {:+.2} on a {:.2} flat stake ({:+.2} units)",
        record.profit, cfg.stake, record.units
    );
    Ok(())
}

fn lines_client(cfg: &TrackerConfig) -> Result<Option<OddsApiClient>> {
    let directory = match cfg.player_map_path.as_deref() {
        Some(path) => PlayerDirectory::load(path)?,
        None => {
            warn!("PROPS_PLAYER_MAP is not set, no sportsbook names will resolve");
            PlayerDirectory::default()
        }
    };
    Ok(OddsApiClient::new(cfg, directory))
}

fn print_summary(s: &RunSummary) {
    if s.dry_run {
        println!("Dry run: nothing persisted");
    }
    println!("Upstream fetches: {} (cache hits: {})", s.fetched, s.cache_hits);
    println!(
        "Lines: {} recorded, {} already known",
        s.lines_recorded, s.lines_duplicate
    );
    println!(
        "Plays: created {}, updated {}, unchanged {}, kept on no-play {}",
        s.created, s.upserted, s.unchanged, s.retained
    );
    println!(
        "Lifecycle: locked {}, graded {} ({} pushes), re-graded {}",
        s.locked, s.graded, s.pushes, s.regraded
    );
    println!(
        "Deferred {}, skipped {}, rejected {}, failed {}",
        s.deferred, s.skipped, s.rejected, s.failed
    );
    if s.aborted {
        println!("Run deadline reached before all units finished");
    }
}
