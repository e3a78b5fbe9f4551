//! Error taxonomy. Each boundary owns its enum; only `TickError` can abort
//! an ingestion tick.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failures from the upstream mention feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Upstream refused for quota reasons despite local bookkeeping.
    #[error("feed rate limited (reset at {reset_at:?})")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    #[error("transient feed error: {0}")]
    Transient(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScoringError {
    #[error("scorer unavailable: {0}")]
    Unavailable(String),

    #[error("scorer timed out")]
    Timeout,

    #[error("input cannot be scored: {0}")]
    InvalidInput(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(tokio_rusqlite::Error::from(e))
    }
}

#[derive(Debug, Error)]
pub enum AnchorError {
    #[error("anchoring is not configured")]
    Disabled,

    #[error("signal {0} not found")]
    NotFound(crate::model::SignalId),

    #[error("anchor rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum TrendError {
    #[error("trend aggregate lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fatal outcome of one scheduler tick.
#[derive(Debug, Error)]
pub enum TickError {
    /// Durability failed; all unpersisted work is redriven next tick.
    #[error("persistence failed, batch will be redriven: {0}")]
    Persistence(#[source] StoreError),
}

/// Umbrella error for callers that mix components.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Scoring(#[from] ScoringError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Anchor(#[from] AnchorError),
    #[error(transparent)]
    Trend(#[from] TrendError),
    #[error(transparent)]
    Tick(#[from] TickError),
    #[error("invalid asset tag {0:?}")]
    InvalidAsset(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
