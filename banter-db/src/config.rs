//! Database layer configuration - environment loading and validation
//!
//! Configuration is loaded from environment variables:
//! - `DATABASE_URL`: primary connection target (required)
//! - `DATABASE_REPLICA_URL`: replica connection target (optional)
//! - `DB_POOL_SIZE` / `DB_REPLICA_POOL_SIZE`: pool sizes (default 50 / 30)
//! - `ENABLE_READ_REPLICAS`: opt into replica routing (default false)
//! - `DB_POOL_ACQUIRE_TIMEOUT_MS`: bounded wait for a connection (default 5000)
//! - `DB_LAG_POLL_INTERVAL_MS`: replication poll cadence (default 10000)
//! - `DB_LAG_WARN_SECS` / `DB_LAG_CRITICAL_SECS`: lag thresholds (default 5 / 10)
//! - `DB_LAG_POLL_FAILURE_THRESHOLD`: polls before unhealthy (default 3)
//! - `DB_BREAKER_FAILURE_THRESHOLD` / `DB_BREAKER_SUCCESS_THRESHOLD`: default 3 / 5
//! - `DB_BREAKER_OPEN_MS` / `DB_BREAKER_HALF_OPEN_TIMEOUT_MS`: default 30000 / 10000
//! - `DB_REPLICA_ENDPOINTS`: comma-separated endpoint names eligible for replica reads

use std::str::FromStr;
use std::time::Duration;

use crate::error::{DbError, Result};

/// Database layer configuration
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Primary (read-write) connection target
    pub primary_url: String,
    /// Replica (read-only) connection target, if any
    pub replica_url: Option<String>,
    /// Primary pool size
    pub pool_size: u32,
    /// Replica pool size
    pub replica_pool_size: u32,
    /// Master switch for replica routing
    pub enable_read_replicas: bool,
    /// Bounded wait for a pooled connection before `PoolExhausted`
    pub acquire_timeout: Duration,
    /// Cadence of the replication status poll
    pub lag_poll_interval: Duration,
    /// Lag below this is acceptable for replica reads
    pub lag_warn: Duration,
    /// Lag above this trips the circuit breaker
    pub lag_critical: Duration,
    /// Consecutive poll failures before the replica is unhealthy
    pub lag_poll_failure_threshold: u32,
    /// Consecutive replica failures before the breaker opens
    pub breaker_failure_threshold: u32,
    /// Consecutive half-open successes before the breaker closes
    pub breaker_success_threshold: u32,
    /// How long the breaker stays open before probing
    pub breaker_open_duration: Duration,
    /// After this long an unresolved half-open probe slot is reclaimed
    pub breaker_half_open_timeout: Duration,
    /// Endpoint names eligible for replica routing
    pub replica_endpoints: Vec<String>,
}

impl DbConfig {
    /// Load config from environment variables.
    ///
    /// Absent variables fall back to defaults; present-but-malformed values
    /// are a hard `Config` error so a typo cannot silently change routing
    /// behavior. The result is validated before being returned.
    pub fn from_env() -> Result<Self> {
        let primary_url = std::env::var("DATABASE_URL")
            .map_err(|_| DbError::config("DATABASE_URL is not set"))?;
        let replica_url = std::env::var("DATABASE_REPLICA_URL").ok();

        let config = Self {
            primary_url,
            replica_url,
            pool_size: env_parse("DB_POOL_SIZE", 50)?,
            replica_pool_size: env_parse("DB_REPLICA_POOL_SIZE", 30)?,
            enable_read_replicas: env_bool("ENABLE_READ_REPLICAS", false)?,
            acquire_timeout: env_millis("DB_POOL_ACQUIRE_TIMEOUT_MS", 5_000)?,
            lag_poll_interval: env_millis("DB_LAG_POLL_INTERVAL_MS", 10_000)?,
            lag_warn: env_secs("DB_LAG_WARN_SECS", 5)?,
            lag_critical: env_secs("DB_LAG_CRITICAL_SECS", 10)?,
            lag_poll_failure_threshold: env_parse("DB_LAG_POLL_FAILURE_THRESHOLD", 3)?,
            breaker_failure_threshold: env_parse("DB_BREAKER_FAILURE_THRESHOLD", 3)?,
            breaker_success_threshold: env_parse("DB_BREAKER_SUCCESS_THRESHOLD", 5)?,
            breaker_open_duration: env_millis("DB_BREAKER_OPEN_MS", 30_000)?,
            breaker_half_open_timeout: env_millis("DB_BREAKER_HALF_OPEN_TIMEOUT_MS", 10_000)?,
            replica_endpoints: env_list("DB_REPLICA_ENDPOINTS"),
        };
        config.validate()?;
        Ok(config)
    }

    /// Create config with explicit connection targets (for testing)
    pub fn with_urls(primary_url: impl Into<String>, replica_url: Option<String>) -> Self {
        Self {
            primary_url: primary_url.into(),
            replica_url,
            ..Self::default()
        }
    }

    /// Check internal consistency.
    ///
    /// Called by `from_env` and again by `Db::connect`, so hand-built
    /// configs get the same checks as environment-loaded ones.
    pub fn validate(&self) -> Result<()> {
        if self.primary_url.is_empty() {
            return Err(DbError::config("primary connection URL is empty"));
        }
        if self.pool_size == 0 {
            return Err(DbError::config("DB_POOL_SIZE must be at least 1"));
        }
        if self.replica_pool_size == 0 {
            return Err(DbError::config("DB_REPLICA_POOL_SIZE must be at least 1"));
        }
        if self.enable_read_replicas && self.replica_url.is_none() {
            return Err(DbError::config(
                "ENABLE_READ_REPLICAS is set but DATABASE_REPLICA_URL is not",
            ));
        }
        if self.acquire_timeout.is_zero() {
            return Err(DbError::config("DB_POOL_ACQUIRE_TIMEOUT_MS must be positive"));
        }
        if self.lag_poll_interval.is_zero() {
            return Err(DbError::config("DB_LAG_POLL_INTERVAL_MS must be positive"));
        }
        if self.lag_warn >= self.lag_critical {
            return Err(DbError::config(
                "DB_LAG_WARN_SECS must be less than DB_LAG_CRITICAL_SECS",
            ));
        }
        if self.lag_poll_failure_threshold == 0 {
            return Err(DbError::config(
                "DB_LAG_POLL_FAILURE_THRESHOLD must be at least 1",
            ));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(DbError::config(
                "DB_BREAKER_FAILURE_THRESHOLD must be at least 1",
            ));
        }
        if self.breaker_success_threshold == 0 {
            return Err(DbError::config(
                "DB_BREAKER_SUCCESS_THRESHOLD must be at least 1",
            ));
        }
        if self.breaker_open_duration.is_zero() {
            return Err(DbError::config("DB_BREAKER_OPEN_MS must be positive"));
        }
        if self.breaker_half_open_timeout.is_zero() {
            return Err(DbError::config(
                "DB_BREAKER_HALF_OPEN_TIMEOUT_MS must be positive",
            ));
        }
        Ok(())
    }
}

impl Default for DbConfig {
    /// Documented defaults with a local development primary.
    fn default() -> Self {
        Self {
            primary_url: "postgres://localhost:5432/banter".to_string(),
            replica_url: None,
            pool_size: 50,
            replica_pool_size: 30,
            enable_read_replicas: false,
            acquire_timeout: Duration::from_millis(5_000),
            lag_poll_interval: Duration::from_millis(10_000),
            lag_warn: Duration::from_secs(5),
            lag_critical: Duration::from_secs(10),
            lag_poll_failure_threshold: 3,
            breaker_failure_threshold: 3,
            breaker_success_threshold: 5,
            breaker_open_duration: Duration::from_millis(30_000),
            breaker_half_open_timeout: Duration::from_millis(10_000),
            replica_endpoints: Vec::new(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| DbError::config(format!("{key} is not a valid number: '{raw}'"))),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_millis(env_parse(key, default)?))
}

fn env_secs(key: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default)?))
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(DbError::config(format!(
                "{key} is not a valid boolean: '{raw}'"
            ))),
        },
        Err(_) => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}
