use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure to obtain a store handle.
///
/// `Clone` because every caller waiting on the same connection attempt
/// receives its own copy of the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("store address is not configured")]
    MissingAddress,

    #[error("malformed store address: {0}")]
    MalformedAddress(String),

    #[error("store unreachable: {0}")]
    Unreachable(String),
}

/// Errors raised by [`crate::store::ContentStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The store keeps four-digit years only.
    #[error("timestamp {0} is outside the storable range (years 0000-9999)")]
    TimestampOutOfRange(DateTime<Utc>),

    /// A thread panicked while holding the connection lock.
    #[error("store connection lock poisoned")]
    Poisoned,

    /// The blocking task running the statement was cancelled or panicked.
    #[error("store task failed: {0}")]
    Task(String),
}

/// Errors surfaced by a scheduled publication run.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Reading content items failed.
    #[error("query failed: {0}")]
    Query(#[source] StoreError),

    /// The predicate-scoped publish update failed; nothing was changed.
    #[error("update failed: {0}")]
    Update(#[source] StoreError),
}

impl PublishError {
    /// Short error code string used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            PublishError::Connection(_) => "CONNECTION_ERROR",
            PublishError::Query(_) => "QUERY_ERROR",
            PublishError::Update(_) => "UPDATE_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
