//! Read/write routing facade
//!
//! `Db` is the single persistence entry point for business logic. Reads go
//! to the replica only when the endpoint policy allows it, the latest lag
//! sample is acceptable, and the circuit breaker admits the attempt; a
//! failed replica read is retried exactly once against primary before any
//! error surfaces. Writes and transactions always use primary. Every routed
//! call increments the routing-decision counter labeled {target, endpoint}.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::breaker::{BreakerSnapshot, CircuitBreaker, ReplicaAdmission};
use crate::config::DbConfig;
use crate::error::Result;
use crate::lag::{LagMonitor, LagMonitorHandle, LagProbe, LagSample, PgLagProbe};
use crate::metrics::{MetricsSink, MetricsSnapshot, RouteTarget, RoutingMetrics};
use crate::policy::{Endpoint, RoutingPolicy};
use crate::pool::{PoolKind, PoolManager, PoolStatus};

/// Per-read routing options
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Force primary so the read reflects the caller's own recent write
    pub require_strong_consistency: bool,
}

impl ReadOptions {
    /// Options for a read-after-write call site
    pub fn strong() -> Self {
        Self {
            require_strong_consistency: true,
        }
    }
}

/// Where a read was routed and which label to count
enum Route {
    /// Replica attempt admitted (normal or canary)
    Replica,
    /// Primary, counted as `Primary` (never eligible) or `Fallback`
    /// (eligible but forced over by breaker or lag)
    Primary(RouteTarget),
}

/// Builder for [`Db`], mirroring the pool-options idiom.
///
/// The metrics sink and the lag probe are injectable so tests can drive
/// routing without a PostgreSQL server behind it.
pub struct DbOptions {
    config: DbConfig,
    metrics: Option<Arc<dyn MetricsSink>>,
    probe: Option<Arc<dyn LagProbe>>,
}

impl DbOptions {
    pub fn new(config: DbConfig) -> Self {
        Self {
            config,
            metrics: None,
            probe: None,
        }
    }

    /// Forward measurements to an external sink instead of the in-process
    /// default. `Db::status` then reports no metrics snapshot.
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Replace the `pg_stat_replication` probe (tests, exotic topologies)
    pub fn lag_probe(mut self, probe: Arc<dyn LagProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Connect pools eagerly and start the lag monitor
    pub async fn connect(self) -> Result<Db> {
        self.config.validate()?;
        let pools = PoolManager::connect(&self.config).await?;
        self.assemble(pools)
    }

    /// Build with lazy pools; connections open on first use
    pub fn connect_lazy(self) -> Result<Db> {
        self.config.validate()?;
        let pools = PoolManager::connect_lazy(&self.config)?;
        self.assemble(pools)
    }

    fn assemble(self, pools: PoolManager) -> Result<Db> {
        let policy = RoutingPolicy::from_names(&self.config.replica_endpoints)?;
        let breaker = Arc::new(CircuitBreaker::new(&self.config));

        let (metrics, routing_metrics) = match self.metrics {
            Some(sink) => (sink, None),
            None => {
                let default = Arc::new(RoutingMetrics::new());
                (
                    Arc::clone(&default) as Arc<dyn MetricsSink>,
                    Some(default),
                )
            }
        };

        // The monitor only exists alongside a replica pool; without one
        // there is no lag to watch and reads stay on primary.
        let monitor = if pools.replica_enabled() {
            let probe = match self.probe {
                Some(probe) => probe,
                None => Arc::new(PgLagProbe::new(pools.primary().clone())),
            };
            Some(
                LagMonitor::new(
                    probe,
                    Arc::clone(&breaker),
                    Arc::clone(&metrics),
                    &self.config,
                )
                .start(),
            )
        } else {
            None
        };

        Ok(Db {
            pools,
            policy,
            breaker,
            monitor,
            metrics,
            routing_metrics,
        })
    }
}

/// Operator-facing snapshot of the whole layer
#[derive(Debug, Clone, Serialize)]
pub struct DbStatus {
    /// Latest lag sample; `None` while replica routing is disabled
    pub lag: Option<LagSample>,
    pub breaker: BreakerSnapshot,
    pub pools: PoolStatus,
    /// Endpoints currently eligible for replica reads, sorted
    pub replica_endpoints: Vec<String>,
    /// Present when the in-process default sink is active
    pub metrics: Option<MetricsSnapshot>,
}

/// The routing facade owning pools, policy, breaker, and monitor.
///
/// Dropping a `Db` stops the lag monitor on its next loop iteration; call
/// [`Db::close`] to also drain the pools.
pub struct Db {
    pools: PoolManager,
    policy: RoutingPolicy,
    breaker: Arc<CircuitBreaker>,
    monitor: Option<LagMonitorHandle>,
    metrics: Arc<dyn MetricsSink>,
    routing_metrics: Option<Arc<RoutingMetrics>>,
}

impl Db {
    /// Connect with defaults; see [`DbOptions`] for injection points
    pub async fn connect(config: DbConfig) -> Result<Self> {
        DbOptions::new(config).connect().await
    }

    /// Start configuring a `Db`
    pub fn options(config: DbConfig) -> DbOptions {
        DbOptions::new(config)
    }

    /// Route a read.
    ///
    /// The query closure receives the pool chosen by the router and may be
    /// invoked twice: once against the replica and, if that attempt fails,
    /// once against primary. Only the primary error ever reaches the
    /// caller.
    pub async fn read<T, F, Fut>(
        &self,
        endpoint: &Endpoint,
        options: ReadOptions,
        query: F,
    ) -> Result<T>
    where
        F: Fn(PgPool) -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match self.decide(endpoint, options) {
            Route::Replica => {
                self.metrics
                    .record_routing_decision(endpoint, RouteTarget::Replica);
                debug!(endpoint = %endpoint, target = "replica", "routing read");

                let replica = match self.pools.replica() {
                    Some(pool) => pool.clone(),
                    // Disabled between decision and dispatch; primary it is.
                    None => return self.read_primary(endpoint, RouteTarget::Fallback, &query).await,
                };
                match query(replica).await {
                    Ok(value) => {
                        self.breaker.record_success();
                        Ok(value)
                    }
                    Err(e) => {
                        self.breaker.record_failure();
                        warn!(
                            endpoint = %endpoint,
                            error = %e,
                            "replica read failed, retrying on primary"
                        );
                        self.read_primary(endpoint, RouteTarget::Fallback, &query).await
                    }
                }
            }
            Route::Primary(label) => {
                debug!(endpoint = %endpoint, target = %label, "routing read");
                self.read_primary(endpoint, label, &query).await
            }
        }
    }

    /// Route a write; always primary, no fallback target exists
    pub async fn write<T, F, Fut>(&self, endpoint: &Endpoint, mutation: F) -> Result<T>
    where
        F: FnOnce(PgPool) -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        self.metrics
            .record_routing_decision(endpoint, RouteTarget::Primary);
        debug!(endpoint = %endpoint, target = "primary", "routing write");
        mutation(self.pools.primary().clone())
            .await
            .map_err(|e| self.pools.map_pool_error(PoolKind::Primary, e))
    }

    /// Open a transaction on primary
    pub async fn transaction(&self, endpoint: &Endpoint) -> Result<Transaction<'static, Postgres>> {
        self.metrics
            .record_routing_decision(endpoint, RouteTarget::Primary);
        debug!(endpoint = %endpoint, target = "primary", "opening transaction");
        self.pools
            .primary()
            .begin()
            .await
            .map_err(|e| self.pools.map_pool_error(PoolKind::Primary, e))
    }

    /// The replica-eligibility policy, runtime-mutable
    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    /// The circuit breaker, for operator overrides and inspection
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Latest lag sample; `None` while replica routing is disabled
    pub fn lag(&self) -> Option<LagSample> {
        self.monitor.as_ref().map(|m| m.latest())
    }

    /// Await lag updates; `None` while replica routing is disabled
    pub fn subscribe_lag(&self) -> Option<watch::Receiver<LagSample>> {
        self.monitor.as_ref().map(|m| m.subscribe())
    }

    /// Read-only snapshot for the operator status surface
    pub fn status(&self) -> DbStatus {
        let mut replica_endpoints: Vec<String> = self
            .policy
            .current()
            .iter()
            .map(|e| e.as_str().to_owned())
            .collect();
        replica_endpoints.sort();

        DbStatus {
            lag: self.lag(),
            breaker: self.breaker.snapshot(),
            pools: self.pools.status(),
            replica_endpoints,
            metrics: self.routing_metrics.as_ref().map(|m| m.snapshot()),
        }
    }

    /// Stop the monitor and drain both pools
    pub async fn close(self) {
        if let Some(monitor) = self.monitor {
            monitor.stop().await;
        }
        self.pools.close().await;
    }

    async fn read_primary<T, F, Fut>(
        &self,
        endpoint: &Endpoint,
        label: RouteTarget,
        query: &F,
    ) -> Result<T>
    where
        F: Fn(PgPool) -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        self.metrics.record_routing_decision(endpoint, label);
        query(self.pools.primary().clone())
            .await
            .map_err(|e| self.pools.map_pool_error(PoolKind::Primary, e))
    }

    /// The routing gate, cheapest checks first. The breaker comes last so
    /// a half-open canary slot is only claimed by calls that would really
    /// hit the replica.
    fn decide(&self, endpoint: &Endpoint, options: ReadOptions) -> Route {
        if options.require_strong_consistency {
            return Route::Primary(RouteTarget::Primary);
        }
        if !self.pools.replica_enabled() {
            return Route::Primary(RouteTarget::Primary);
        }
        if !self.policy.allows(endpoint) {
            return Route::Primary(RouteTarget::Primary);
        }

        let lag_acceptable = self
            .monitor
            .as_ref()
            .map(|m| m.latest().health.is_acceptable())
            .unwrap_or(false);
        if !lag_acceptable {
            return Route::Primary(RouteTarget::Fallback);
        }

        match self.breaker.admit_replica() {
            ReplicaAdmission::Allow | ReplicaAdmission::Canary => Route::Replica,
            ReplicaAdmission::Deny => Route::Primary(RouteTarget::Fallback),
        }
    }
}
