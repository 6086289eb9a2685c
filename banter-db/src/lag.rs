//! Replication lag monitoring
//!
//! A background task polls the primary's `pg_stat_replication` view on a
//! fixed interval and publishes the latest measurement through a watch
//! channel. Request handling never waits on a poll; it reads whatever
//! sample is cached. Poll failures are logged and counted, never surfaced
//! to callers - three in a row (configurable) mark the replica unreachable
//! regardless of the last known lag.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::DbConfig;
use crate::error::{DbError, Result};
use crate::metrics::MetricsSink;

/// Replica usability derived from the latest poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaHealth {
    /// No poll has completed yet
    Unknown,
    /// Lag below the warning threshold
    Healthy,
    /// Lag between the warning and critical thresholds
    Degraded,
    /// Lag above the critical threshold
    Critical,
    /// Too many consecutive poll failures
    Unreachable,
}

impl ReplicaHealth {
    /// Whether replica reads are currently allowed
    pub fn is_acceptable(&self) -> bool {
        matches!(self, ReplicaHealth::Healthy)
    }

    /// Whether this state trips the circuit breaker
    pub fn is_critical(&self) -> bool {
        matches!(self, ReplicaHealth::Critical | ReplicaHealth::Unreachable)
    }
}

/// Latest replication measurement.
///
/// After a failed poll the lag fields carry the last known measurement and
/// `poll_failure_streak` says how stale they are.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LagSample {
    /// When this sample was published
    pub observed_at: DateTime<Utc>,
    /// Time lag of the worst streaming replica, seconds
    pub lag_seconds: Option<f64>,
    /// WAL-byte lag of the worst streaming replica
    pub lag_bytes: Option<i64>,
    /// Consecutive failed polls ending at this sample
    pub poll_failure_streak: u32,
    pub health: ReplicaHealth,
}

impl LagSample {
    /// The sample published before the first poll completes
    pub fn pending() -> Self {
        Self {
            observed_at: Utc::now(),
            lag_seconds: None,
            lag_bytes: None,
            poll_failure_streak: 0,
            health: ReplicaHealth::Unknown,
        }
    }
}

/// One successful replication-status measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LagReading {
    pub lag_seconds: f64,
    pub lag_bytes: i64,
}

/// Source of replication-status measurements.
///
/// The production implementation queries PostgreSQL; tests inject fakes.
#[async_trait]
pub trait LagProbe: Send + Sync {
    async fn sample(&self) -> Result<LagReading>;
}

/// Probe backed by the primary's `pg_stat_replication` view.
///
/// `replay_lag` is the time distance, `pg_wal_lsn_diff` against
/// `replay_lsn` the byte distance. With several streaming replicas the
/// worst-lagging row wins: routing has to be safe for the slowest replica
/// behind the load balancer. A NULL `replay_lag` means the replica is fully
/// caught up and reads as zero.
#[derive(Debug, Clone)]
pub struct PgLagProbe {
    pool: PgPool,
}

impl PgLagProbe {
    /// `pool` must point at the primary; replicas do not carry the view.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LagProbe for PgLagProbe {
    async fn sample(&self) -> Result<LagReading> {
        let row: Option<(f64, i64)> = sqlx::query_as(
            "SELECT COALESCE(EXTRACT(EPOCH FROM replay_lag), 0)::float8 AS lag_seconds, \
                    COALESCE(pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn), 0)::bigint AS lag_bytes \
             FROM pg_stat_replication \
             WHERE state = 'streaming' \
             ORDER BY lag_seconds DESC \
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DbError::replication_status(e.to_string()))?;

        match row {
            Some((lag_seconds, lag_bytes)) => Ok(LagReading {
                lag_seconds,
                lag_bytes,
            }),
            None => Err(DbError::replication_status(
                "no streaming replicas in pg_stat_replication",
            )),
        }
    }
}

/// Repeating poll task feeding the breaker and the metrics sink
pub struct LagMonitor {
    probe: Arc<dyn LagProbe>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<dyn MetricsSink>,
    poll_interval: Duration,
    warn_secs: f64,
    critical_secs: f64,
    failure_threshold: u32,
}

impl LagMonitor {
    pub fn new(
        probe: Arc<dyn LagProbe>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<dyn MetricsSink>,
        config: &DbConfig,
    ) -> Self {
        Self {
            probe,
            breaker,
            metrics,
            poll_interval: config.lag_poll_interval,
            warn_secs: config.lag_warn.as_secs_f64(),
            critical_secs: config.lag_critical.as_secs_f64(),
            failure_threshold: config.lag_poll_failure_threshold,
        }
    }

    /// Spawn the poll loop. The first poll runs immediately, so a fresh
    /// process has a real sample as soon as the probe answers once.
    pub fn start(self) -> LagMonitorHandle {
        let (sample_tx, sample_rx) = watch::channel(LagSample::pending());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let poll_deadline = poll_deadline(self.poll_interval);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            // A slow poll must not cause a burst of catch-up polls.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = self.poll_interval.as_millis() as u64,
                "lag monitor started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let previous = sample_tx.borrow().clone();
                        let sample = self.poll_once(&previous, poll_deadline).await;
                        self.breaker.note_replica_health(sample.health);
                        sample_tx.send_replace(sample);
                    }
                    _ = shutdown_rx.changed() => {
                        info!("lag monitor stopped");
                        break;
                    }
                }
            }
        });

        LagMonitorHandle {
            sample_rx,
            shutdown_tx,
            task,
        }
    }

    /// Run one poll and fold the outcome into the previous sample
    async fn poll_once(&self, previous: &LagSample, deadline: Duration) -> LagSample {
        let outcome = match tokio::time::timeout(deadline, self.probe.sample()).await {
            Ok(Ok(reading)) => Some(reading),
            Ok(Err(e)) => {
                warn!(error = %e, "replication status poll failed");
                None
            }
            Err(_) => {
                warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    "replication status poll timed out"
                );
                None
            }
        };

        let sample = match outcome {
            Some(reading) => {
                let health =
                    derive_health(reading.lag_seconds, self.warn_secs, self.critical_secs);
                debug!(
                    lag_seconds = reading.lag_seconds,
                    lag_bytes = reading.lag_bytes,
                    health = ?health,
                    "replication lag sampled"
                );
                self.metrics.record_lag_seconds(reading.lag_seconds);
                self.metrics.record_lag_bytes(reading.lag_bytes);
                LagSample {
                    observed_at: Utc::now(),
                    lag_seconds: Some(reading.lag_seconds),
                    lag_bytes: Some(reading.lag_bytes),
                    poll_failure_streak: 0,
                    health,
                }
            }
            None => {
                let streak = previous.poll_failure_streak.saturating_add(1);
                // Below the threshold the last known health stands; one
                // transient failure must not flip routing.
                let health = if streak >= self.failure_threshold {
                    ReplicaHealth::Unreachable
                } else {
                    previous.health
                };
                LagSample {
                    observed_at: Utc::now(),
                    lag_seconds: previous.lag_seconds,
                    lag_bytes: previous.lag_bytes,
                    poll_failure_streak: streak,
                    health,
                }
            }
        };

        self.metrics.record_replica_health(sample.health.is_acceptable());
        sample
    }
}

/// Running monitor: read the latest sample, or stop the loop
pub struct LagMonitorHandle {
    sample_rx: watch::Receiver<LagSample>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LagMonitorHandle {
    /// The most recent sample; never blocks
    pub fn latest(&self) -> LagSample {
        self.sample_rx.borrow().clone()
    }

    /// A receiver for callers that want to await changes
    pub fn subscribe(&self) -> watch::Receiver<LagSample> {
        self.sample_rx.clone()
    }

    /// Stop the loop after any in-flight poll completes
    pub async fn stop(self) {
        self.shutdown_tx.send_replace(true);
        if let Err(e) = self.task.await {
            debug!(error = %e, "lag monitor task ended abnormally");
        }
    }
}

fn derive_health(lag_seconds: f64, warn_secs: f64, critical_secs: f64) -> ReplicaHealth {
    if lag_seconds > critical_secs {
        ReplicaHealth::Critical
    } else if lag_seconds < warn_secs {
        ReplicaHealth::Healthy
    } else {
        ReplicaHealth::Degraded
    }
}

/// A wedged primary counts as a failed poll instead of stalling the loop
fn poll_deadline(interval: Duration) -> Duration {
    (interval / 2).min(Duration::from_secs(5))
}
