//! Connection pool management - primary plus optional read-only replica
//!
//! Two independent sqlx pools with explicit connection limits and a bounded
//! acquire wait. The replica pool forces `default_transaction_read_only=on`
//! on every session, so the replica handle cannot execute writes even if a
//! mutation is smuggled into a read closure.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::info;

use crate::config::DbConfig;
use crate::error::{DbError, Result};

/// Which pool an operation was using
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Primary,
    Replica,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolKind::Primary => "primary",
            PoolKind::Replica => "replica",
        })
    }
}

/// Owns the primary pool and, when configured, the replica pool.
///
/// `replica()` returns `None` when replicas are disabled or unconfigured;
/// callers treat that as "route to primary". No retries happen here:
/// waiting longer than the acquire timeout surfaces as `PoolExhausted`.
/// Crate-internal: the only persistence surface callers get is the `Db`
/// facade, which never hands out a raw pool.
#[derive(Debug, Clone)]
pub(crate) struct PoolManager {
    primary: PgPool,
    replica: Option<PgPool>,
    acquire_timeout: Duration,
}

impl PoolManager {
    /// Connect both pools eagerly.
    ///
    /// Fails fast if the primary is unreachable at startup; a missing
    /// replica is not an error, it just disables replica routing.
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let primary = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.primary_url)
            .await?;
        info!(pool_size = config.pool_size, "connected primary pool");

        let replica = match replica_url(config) {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.replica_pool_size)
                    .acquire_timeout(config.acquire_timeout)
                    .connect_with(replica_connect_options(url)?)
                    .await?;
                info!(
                    pool_size = config.replica_pool_size,
                    "connected read-only replica pool"
                );
                Some(pool)
            }
            None => None,
        };

        Ok(Self {
            primary,
            replica,
            acquire_timeout: config.acquire_timeout,
        })
    }

    /// Build both pools without touching the network.
    ///
    /// Connections open on first use. Used by tests and by services that
    /// must come up before the database does.
    pub fn connect_lazy(config: &DbConfig) -> Result<Self> {
        let primary = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy(&config.primary_url)?;

        let replica = match replica_url(config) {
            Some(url) => Some(
                PgPoolOptions::new()
                    .max_connections(config.replica_pool_size)
                    .acquire_timeout(config.acquire_timeout)
                    .connect_lazy_with(replica_connect_options(url)?),
            ),
            None => None,
        };

        Ok(Self {
            primary,
            replica,
            acquire_timeout: config.acquire_timeout,
        })
    }

    /// The read-write primary pool
    pub fn primary(&self) -> &PgPool {
        &self.primary
    }

    /// The read-only replica pool, if replica routing is enabled
    pub fn replica(&self) -> Option<&PgPool> {
        self.replica.as_ref()
    }

    /// Whether a replica pool exists at all
    pub fn replica_enabled(&self) -> bool {
        self.replica.is_some()
    }

    /// Current size/idle gauges for both pools
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            primary_size: self.primary.size(),
            primary_idle: self.primary.num_idle(),
            replica_size: self.replica.as_ref().map(|p| p.size()),
            replica_idle: self.replica.as_ref().map(|p| p.num_idle()),
        }
    }

    /// Close both pools, waiting for checked-out connections to return
    pub async fn close(&self) {
        self.primary.close().await;
        if let Some(replica) = &self.replica {
            replica.close().await;
        }
    }

    /// Attach pool context to an operation error.
    ///
    /// An acquire timeout becomes the typed exhaustion error; everything
    /// else passes through as a query error.
    pub(crate) fn map_pool_error(&self, kind: PoolKind, err: sqlx::Error) -> DbError {
        match err {
            sqlx::Error::PoolTimedOut => {
                DbError::pool_exhausted(kind, self.acquire_timeout.as_millis() as u64)
            }
            other => DbError::Query(other),
        }
    }
}

/// Size and idle-count gauges for the operator status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub primary_size: u32,
    pub primary_idle: usize,
    pub replica_size: Option<u32>,
    pub replica_idle: Option<usize>,
}

fn replica_url(config: &DbConfig) -> Option<&str> {
    if !config.enable_read_replicas {
        return None;
    }
    config.replica_url.as_deref()
}

/// Parse a replica URL and force read-only sessions on it
fn replica_connect_options(url: &str) -> Result<PgConnectOptions> {
    let options: PgConnectOptions = url.parse()?;
    Ok(options.options([("default_transaction_read_only", "on")]))
}
