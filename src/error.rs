use thiserror::Error;

use crate::model::{NaturalKey, PlayState};

/// Upstream fetch failure for a single provider call.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Client errors other than 429 will not improve on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http { status, .. } => *status >= 500,
            _ => true,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else if err.is_decode() {
            FetchError::Malformed(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Malformed(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("provider {provider} unavailable after {attempts} attempts: {last}")]
    ProviderUnavailable {
        provider: String,
        attempts: u32,
        last: FetchError,
    },

    #[error("insufficient data for {player_id} {stat}")]
    InsufficientData { player_id: String, stat: String },

    #[error("stale write rejected for {key}: record is {state}")]
    StaleWriteRejected { key: NaturalKey, state: PlayState },

    #[error("invalid transition for play {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: PlayState,
        to: PlayState,
    },

    #[error("store rejected transaction twice: {0}")]
    PersistenceConflict(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("corrupt row: {0}")]
    CorruptRow(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrackerError {
    /// Busy/locked errors from SQLite mean another process holds the write lock.
    pub fn is_contention(&self) -> bool {
        match self {
            TrackerError::Store(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;
