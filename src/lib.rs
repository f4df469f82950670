pub mod baseline;
pub mod config;
pub mod engine;
pub mod error;
pub mod grading;
pub mod http_client;
pub mod ledger;
pub mod lines_fetch;
pub mod market_lines;
pub mod model;
pub mod players;
pub mod stat_cache;
pub mod stats_fetch;
pub mod store;
pub mod tasks;
