//! Observability hooks for routing decisions and replica health
//!
//! The library reports four measurements through the `MetricsSink` trait:
//! lag seconds (gauge), lag bytes (gauge), replica health (gauge), and the
//! routing-decision counter labeled by {target, endpoint}. `RoutingMetrics`
//! is the in-process default sink; production deployments can forward the
//! same calls into their metrics pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::policy::Endpoint;

/// Which physical target served (or will serve) a routed call.
///
/// `Fallback` covers reads that were eligible for the replica but were
/// forced to primary by breaker or lag state, including the retry after a
/// failed replica attempt. `Primary` covers writes and reads that were never
/// replica-eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteTarget {
    Replica,
    Primary,
    Fallback,
}

impl RouteTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteTarget::Replica => "replica",
            RouteTarget::Primary => "primary",
            RouteTarget::Fallback => "fallback",
        }
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for the layer's measurements.
///
/// Implementations must be cheap; these are called on the read hot path
/// and from the lag monitor loop.
pub trait MetricsSink: Send + Sync {
    /// Latest observed replication lag in seconds
    fn record_lag_seconds(&self, seconds: f64);
    /// Latest observed replication lag in WAL bytes
    fn record_lag_bytes(&self, bytes: i64);
    /// Whether the replica is currently acceptable for reads
    fn record_replica_health(&self, healthy: bool);
    /// One routed call and where it went
    fn record_routing_decision(&self, endpoint: &Endpoint, target: RouteTarget);
}

/// In-process metrics sink
///
/// # Thread Safety
///
/// Totals and gauges use atomic operations with Relaxed ordering;
/// exactness under concurrent increments matters, cross-metric ordering
/// does not. The per-endpoint breakdown lives behind a `Mutex` taken once
/// per routed call.
#[derive(Debug, Default)]
pub struct RoutingMetrics {
    routed_replica: AtomicU64,
    routed_primary: AtomicU64,
    routed_fallback: AtomicU64,
    /// Routing decisions keyed by endpoint name
    by_endpoint: Mutex<BTreeMap<String, EndpointRouteCounts>>,
    /// f64 bits of the latest lag-seconds gauge
    lag_seconds_bits: AtomicU64,
    lag_bytes: AtomicI64,
    /// Number of lag samples recorded; 0 means the gauges are unset
    lag_samples: AtomicU64,
    /// 1 while the replica is acceptable for reads
    replica_healthy: AtomicU64,
}

impl RoutingMetrics {
    /// Create a sink with all values at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all values as a point-in-time snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            routed_replica: self.routed_replica.load(Ordering::Relaxed),
            routed_primary: self.routed_primary.load(Ordering::Relaxed),
            routed_fallback: self.routed_fallback.load(Ordering::Relaxed),
            by_endpoint: self
                .by_endpoint
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            lag_seconds: f64::from_bits(self.lag_seconds_bits.load(Ordering::Relaxed)),
            lag_bytes: self.lag_bytes.load(Ordering::Relaxed),
            lag_samples: self.lag_samples.load(Ordering::Relaxed),
            replica_healthy: self.replica_healthy.load(Ordering::Relaxed) == 1,
        }
    }
}

impl MetricsSink for RoutingMetrics {
    fn record_lag_seconds(&self, seconds: f64) {
        self.lag_seconds_bits
            .store(seconds.to_bits(), Ordering::Relaxed);
        self.lag_samples.fetch_add(1, Ordering::Relaxed);
    }

    fn record_lag_bytes(&self, bytes: i64) {
        self.lag_bytes.store(bytes, Ordering::Relaxed);
    }

    fn record_replica_health(&self, healthy: bool) {
        self.replica_healthy
            .store(u64::from(healthy), Ordering::Relaxed);
    }

    fn record_routing_decision(&self, endpoint: &Endpoint, target: RouteTarget) {
        let total = match target {
            RouteTarget::Replica => &self.routed_replica,
            RouteTarget::Primary => &self.routed_primary,
            RouteTarget::Fallback => &self.routed_fallback,
        };
        total.fetch_add(1, Ordering::Relaxed);

        let mut by_endpoint = self
            .by_endpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let counts = by_endpoint.entry(endpoint.as_str().to_owned()).or_default();
        match target {
            RouteTarget::Replica => counts.replica += 1,
            RouteTarget::Primary => counts.primary += 1,
            RouteTarget::Fallback => counts.fallback += 1,
        }
    }
}

/// A point-in-time snapshot of the default sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub routed_replica: u64,
    pub routed_primary: u64,
    pub routed_fallback: u64,
    /// Routing decisions broken down by endpoint name
    pub by_endpoint: BTreeMap<String, EndpointRouteCounts>,
    /// Latest lag gauge; meaningless while `lag_samples` is 0
    pub lag_seconds: f64,
    pub lag_bytes: i64,
    pub lag_samples: u64,
    pub replica_healthy: bool,
}

/// Per-endpoint slice of the routing-decision counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EndpointRouteCounts {
    pub replica: u64,
    pub primary: u64,
    pub fallback: u64,
}
