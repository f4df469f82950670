mod common;

use common::{
    EVENT, ScriptedStats, TATUM, at, day, game, points_line, rising_season, test_config, tip,
};
use props_tracker::ledger::Ledger;
use props_tracker::market_lines;
use props_tracker::model::{Confidence, DateWindow, Direction, NaturalKey, PlayState, StatType};
use props_tracker::store::Store;
use props_tracker::tasks::{self, RunOptions};

fn key(player_id: &str) -> NaturalKey {
    NaturalKey {
        player_id: player_id.to_string(),
        stat: StatType::Points,
        event_id: EVENT.to_string(),
    }
}

#[test]
fn strongest_bookmaker_signal_wins() {
    let store = Store::open_in_memory().expect("store");
    let stats = ScriptedStats::new();
    stats.set_log(TATUM, rising_season());
    let collected = at(15, 15, 0);
    market_lines::record_lines(
        &store,
        &[
            points_line(TATUM, 25.5, "draftkings", collected),
            points_line(TATUM, 24.5, "fanduel", collected),
        ],
    )
    .expect("lines");

    let summary = tasks::evaluate_plays(
        &store,
        &stats,
        &test_config(),
        at(15, 16, 0),
        RunOptions::default(),
    )
    .expect("evaluate");
    assert_eq!(summary.created, 1);
    assert_eq!(summary.fetched, 1);

    let play = Ledger::new(&store)
        .get(&key(TATUM))
        .expect("query")
        .expect("play");
    assert_eq!(play.bookmaker, "fanduel");
    assert_eq!(play.line, 24.5);
    assert_eq!(play.confidence, Confidence::High);
    assert_eq!(play.direction, Direction::Under);
    assert!((play.expected - 31.5).abs() < 1e-9);
    assert_eq!(play.games_played, 10);
}

#[test]
fn pulled_bookmaker_line_drops_out_of_the_board() {
    let store = Store::open_in_memory().expect("store");
    let stats = ScriptedStats::new();
    stats.set_log(TATUM, rising_season());
    market_lines::record_lines(
        &store,
        &[
            points_line(TATUM, 23.5, "draftkings", at(15, 14, 0)),
            points_line(TATUM, 25.5, "fanduel", at(15, 14, 0)),
        ],
    )
    .expect("first board");
    // draftkings pulled its line before the next collection
    market_lines::record_lines(&store, &[points_line(TATUM, 25.0, "fanduel", at(15, 15, 0))])
        .expect("second board");

    let latest =
        market_lines::latest_lines(&store, &DateWindow::new(day(15), day(15))).expect("latest");
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].bookmaker, "fanduel");

    tasks::evaluate_plays(
        &store,
        &stats,
        &test_config(),
        at(15, 16, 0),
        RunOptions::default(),
    )
    .expect("evaluate");
    let play = Ledger::new(&store)
        .get(&key(TATUM))
        .expect("query")
        .expect("play");
    assert_eq!(play.bookmaker, "fanduel");
    assert_eq!(play.line, 25.0);
}

#[test]
fn rerunning_the_batch_is_idempotent() {
    let store = Store::open_in_memory().expect("store");
    let stats = ScriptedStats::new();
    stats.set_log(TATUM, rising_season());
    let cfg = test_config();
    market_lines::record_lines(&store, &[points_line(TATUM, 25.5, "draftkings", at(15, 15, 0))])
        .expect("lines");

    let first = tasks::evaluate_plays(&store, &stats, &cfg, at(15, 16, 0), RunOptions::default())
        .expect("first run");
    let before = Ledger::new(&store).get(&key(TATUM)).expect("query");
    let second = tasks::evaluate_plays(&store, &stats, &cfg, at(15, 17, 0), RunOptions::default())
        .expect("second run");
    let after = Ledger::new(&store).get(&key(TATUM)).expect("query");

    assert_eq!(first.created, 1);
    assert_eq!(second.created, 0);
    assert_eq!(second.unchanged, 1);
    assert_eq!(second.fetched, 0);
    assert_eq!(second.cache_hits, 1);
    assert_eq!(before, after);
    assert_eq!(stats.calls(), 1);
}

#[test]
fn thin_or_flat_histories_are_skipped() {
    let store = Store::open_in_memory().expect("store");
    let stats = ScriptedStats::new();
    stats.set_log(
        "flat",
        (1..=6u32)
            .map(|d| game(&format!("f{d}"), day(d), 20.0, true))
            .collect(),
    );
    // "rookie" has no games at all
    market_lines::record_lines(
        &store,
        &[
            points_line("flat", 12.5, "draftkings", at(15, 15, 0)),
            points_line("rookie", 8.5, "draftkings", at(15, 15, 0)),
        ],
    )
    .expect("lines");

    let summary = tasks::evaluate_plays(
        &store,
        &stats,
        &test_config(),
        at(15, 16, 0),
        RunOptions::default(),
    )
    .expect("evaluate");
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.created, 0);
    assert_eq!(summary.failed, 0);
    assert!(Ledger::new(&store).get(&key("flat")).expect("query").is_none());
}

#[test]
fn provider_outage_fails_only_that_player() {
    let store = Store::open_in_memory().expect("store");
    let stats = ScriptedStats::new();
    stats.set_log(TATUM, rising_season());
    stats.take_down("down");
    market_lines::record_lines(
        &store,
        &[
            points_line("down", 20.5, "draftkings", at(15, 15, 0)),
            points_line(TATUM, 25.5, "draftkings", at(15, 15, 0)),
        ],
    )
    .expect("lines");

    let summary = tasks::evaluate_plays(
        &store,
        &stats,
        &test_config(),
        at(15, 16, 0),
        RunOptions::default(),
    )
    .expect("batch survives");
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.created, 1);
    assert!(Ledger::new(&store).get(&key(TATUM)).expect("query").is_some());
}

#[test]
fn line_moving_to_fair_keeps_open_play() {
    let store = Store::open_in_memory().expect("store");
    let stats = ScriptedStats::new();
    stats.set_log(TATUM, rising_season());
    let cfg = test_config();

    market_lines::record_lines(&store, &[points_line(TATUM, 25.5, "draftkings", at(15, 15, 0))])
        .expect("lines");
    tasks::evaluate_plays(&store, &stats, &cfg, at(15, 16, 0), RunOptions::default())
        .expect("first run");
    market_lines::record_lines(&store, &[points_line(TATUM, 31.0, "draftkings", at(15, 18, 0))])
        .expect("moved line");
    let summary = tasks::evaluate_plays(&store, &stats, &cfg, at(15, 19, 0), RunOptions::default())
        .expect("second run");

    assert_eq!(summary.retained, 1);
    let kept = Ledger::new(&store)
        .get(&key(TATUM))
        .expect("query")
        .expect("record survives a no-play");
    assert_eq!(kept.line, 25.5);
    assert_eq!(kept.created_at, at(15, 15, 0));
    let history = market_lines::history(&store, &key(TATUM)).expect("history");
    assert_eq!(history.len(), 2);
    assert!(!history[0].is_latest);
    assert!(history[1].is_latest);
}

#[test]
fn evaluation_after_tipoff_locks_and_rejects() {
    let store = Store::open_in_memory().expect("store");
    let stats = ScriptedStats::new();
    stats.set_log(TATUM, rising_season());
    let cfg = test_config();

    market_lines::record_lines(&store, &[points_line(TATUM, 25.5, "draftkings", at(15, 15, 0))])
        .expect("lines");
    tasks::evaluate_plays(&store, &stats, &cfg, at(15, 16, 0), RunOptions::default())
        .expect("pre-game run");
    market_lines::record_lines(&store, &[points_line(TATUM, 22.5, "draftkings", tip())])
        .expect("in-game line");

    let summary = tasks::evaluate_plays(
        &store,
        &stats,
        &cfg,
        tip() + chrono::Duration::minutes(10),
        RunOptions::default(),
    )
    .expect("in-game run");
    assert_eq!(summary.locked, 1);
    assert_eq!(summary.rejected, 1);

    let play = Ledger::new(&store)
        .get(&key(TATUM))
        .expect("query")
        .expect("play");
    assert_eq!(play.state, PlayState::Locked);
    assert_eq!(play.line, 25.5);
}

#[test]
fn dry_run_leaves_the_store_untouched() {
    let store = Store::open_in_memory().expect("store");
    let stats = ScriptedStats::new();
    stats.set_log(TATUM, rising_season());
    market_lines::record_lines(&store, &[points_line(TATUM, 25.5, "draftkings", at(15, 15, 0))])
        .expect("lines");

    let summary = tasks::evaluate_plays(
        &store,
        &stats,
        &test_config(),
        at(15, 16, 0),
        RunOptions {
            force: false,
            dry_run: true,
        },
    )
    .expect("dry run");
    assert!(summary.dry_run);
    assert_eq!(summary.created, 1);

    let plays = Ledger::new(&store)
        .by_event_date_range(&DateWindow::new(day(1), day(31)))
        .expect("range");
    assert!(plays.is_empty());
    assert!(store.api_calls_since(at(1, 0, 0)).expect("log").is_empty());
}
