use std::fs;
use std::path::PathBuf;

use chrono::{NaiveDate, TimeZone, Utc};

use props_tracker::error::FetchError;
use props_tracker::lines_fetch::{OddsEventRef, parse_event_props_json, utc_offset};
use props_tracker::model::StatType;
use props_tracker::players::PlayerDirectory;
use props_tracker::stats_fetch::parse_game_log_json;

fn read_fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    fs::read_to_string(path).expect("fixture file should be readable")
}

#[test]
fn parses_game_log_fixture() {
    let raw = read_fixture("nba_gamelog.json");
    let rows = parse_game_log_json(&raw).expect("fixture should parse");
    // the row without a game id is dropped
    assert_eq!(rows.len(), 3);

    let live = &rows[0];
    assert_eq!(live.event_id, "0022500620");
    assert!(!live.is_final);
    assert!(!live.stats.contains_key("AST"));
    assert_eq!(live.stats.get("PTS"), Some(&12.0));

    let done = &rows[1];
    assert!(done.is_final);
    assert_eq!(done.event_date, NaiveDate::from_ymd_opt(2026, 1, 14).unwrap());
    assert_eq!(done.stats.get("PTS"), Some(&31.0));
    assert_eq!(done.stats.get("FG3M"), Some(&4.0));
    assert_eq!(done.stats.get("REB"), Some(&8.0));
}

#[test]
fn game_log_null_is_empty() {
    assert!(parse_game_log_json("null").expect("null should parse").is_empty());
    assert!(parse_game_log_json("  ").expect("blank should parse").is_empty());
}

#[test]
fn game_log_without_result_sets_is_malformed() {
    let err = parse_game_log_json(r#"{"message":"throttled"}"#).expect_err("no resultSets");
    assert!(matches!(err, FetchError::Malformed(_)));
    let err = parse_game_log_json("<html>").expect_err("not json");
    assert!(matches!(err, FetchError::Malformed(_)));
}

#[test]
fn parses_event_props_fixture() {
    let raw = read_fixture("odds_event_props.json");
    let event: OddsEventRef = serde_json::from_str(&raw).expect("event header should parse");
    let directory = PlayerDirectory::from_json(&read_fixture("player_map.json"))
        .expect("player map should parse");
    let collected_at = Utc.with_ymd_and_hms(2026, 1, 15, 15, 0, 0).unwrap();

    let (lines, unresolved) =
        parse_event_props_json(&raw, &event, &directory, utc_offset(-6), collected_at)
            .expect("fixture should parse");

    assert_eq!(unresolved, vec!["Unknown Rookie".to_string()]);
    assert_eq!(lines.len(), 3);

    let points = lines
        .iter()
        .find(|l| l.player_id == "1628369" && l.stat == StatType::Points)
        .expect("tatum points line");
    assert_eq!(points.line, 27.5);
    assert_eq!(points.over_price, Some(-115));
    assert_eq!(points.under_price, Some(-105));
    assert_eq!(points.bookmaker, "draftkings");
    assert_eq!(points.event_id, "5f1c7e0d2b9a");
    assert_eq!(points.event_date, NaiveDate::from_ymd_opt(2026, 1, 15).unwrap());
    assert_eq!(points.collected_at, collected_at);

    assert!(
        lines
            .iter()
            .any(|l| l.player_id == "1628369" && l.stat == StatType::Rebounds && l.line == 8.5)
    );
    let lebron = lines
        .iter()
        .find(|l| l.player_id == "2544")
        .expect("alias-free canonical name should resolve");
    assert_eq!(lebron.player_name, "LeBron James");
    assert_eq!(lebron.bookmaker, "fanduel");
    // blocks market is not tracked; tatum's fanduel outcome has no point
    assert!(lines.iter().all(|l| l.stat != StatType::Threes));
}

#[test]
fn event_props_garbage_is_malformed() {
    let event: OddsEventRef = serde_json::from_str(
        r#"{"id":"x","commence_time":"2026-01-16T00:30:00Z"}"#,
    )
    .expect("minimal event should parse");
    let err = parse_event_props_json(
        "{not json",
        &event,
        &PlayerDirectory::default(),
        utc_offset(-6),
        Utc::now(),
    )
    .expect_err("garbage");
    assert!(matches!(err, FetchError::Malformed(_)));
}
