//! Structured error types for banter-db.
//!
//! Uses `thiserror` so library consumers get composable, matchable errors.
//! Binary crates can still wrap these in `anyhow` for convenience.

use thiserror::Error;

use crate::pool::PoolKind;

/// Main error type for banter-db operations
#[derive(Error, Debug)]
pub enum DbError {
    /// Timed out waiting for a connection from a pool
    #[error("connection pool exhausted ({pool}): no connection within {waited_ms}ms")]
    PoolExhausted { pool: PoolKind, waited_ms: u64 },

    /// The replication status poll against the primary failed
    #[error("replication status unavailable: {reason}")]
    ReplicationStatusUnavailable { reason: String },

    /// A pagination cursor could not be decoded
    #[error("invalid pagination cursor: {reason}")]
    CursorDecode { reason: String },

    /// A batched aggregate query failed; no partial results exist
    #[error("aggregate batch query failed: {source}")]
    AggregateBatch { source: sqlx::Error },

    /// Underlying database error from a routed operation
    #[error("database error: {0}")]
    Query(#[from] sqlx::Error),

    /// Configuration error
    #[error("configuration error: {reason}")]
    Config { reason: String },
}

/// Result type alias for banter-db operations
pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Create a pool exhaustion error
    pub fn pool_exhausted(pool: PoolKind, waited_ms: u64) -> Self {
        Self::PoolExhausted { pool, waited_ms }
    }

    /// Create a replication status error
    pub fn replication_status(reason: impl Into<String>) -> Self {
        Self::ReplicationStatusUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a cursor decode error
    pub fn cursor_decode(reason: impl Into<String>) -> Self {
        Self::CursorDecode {
            reason: reason.into(),
        }
    }

    /// Create an aggregate batch error
    pub fn aggregate_batch(source: sqlx::Error) -> Self {
        Self::AggregateBatch { source }
    }

    /// Create a config error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}
