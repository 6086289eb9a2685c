//! Multi-phase routing scenarios through the public API.
//!
//! The database never gets touched: queries are stubbed by closures and
//! replication lag comes from an adjustable fake probe, so each test can
//! walk a full outage-and-recovery lifecycle on a paused clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use banter_db::{
    CircuitState, Db, DbConfig, DbError, Endpoint, ForcedState, LagProbe, LagReading,
    MetricsSink, ReadOptions, ReplicaHealth, RoutingMetrics,
};

/// Probe whose reading the test adjusts mid-flight; `None` means the
/// replication status query itself fails.
struct LagDial {
    lag_secs: Mutex<Option<f64>>,
}

impl LagDial {
    fn new(initial: f64) -> Arc<Self> {
        Arc::new(Self {
            lag_secs: Mutex::new(Some(initial)),
        })
    }

    fn set(&self, secs: f64) {
        *self.lag_secs.lock().unwrap() = Some(secs);
    }
}

#[async_trait]
impl LagProbe for LagDial {
    async fn sample(&self) -> banter_db::Result<LagReading> {
        match *self.lag_secs.lock().unwrap() {
            Some(lag_seconds) => Ok(LagReading {
                lag_seconds,
                lag_bytes: (lag_seconds * 1_048_576.0) as i64,
            }),
            None => Err(DbError::replication_status("probe offline")),
        }
    }
}

fn history() -> Endpoint {
    Endpoint::new("message.history").unwrap()
}

/// Replica-enabled Db on lazy pools; waits for the first lag sample so the
/// first routing decision is already deterministic.
async fn dialed_db(initial_lag: f64) -> (Db, Arc<LagDial>, Arc<RoutingMetrics>) {
    let dial = LagDial::new(initial_lag);
    let metrics = Arc::new(RoutingMetrics::new());

    let mut config = DbConfig::with_urls(
        "postgres://primary.test:5432/banter",
        Some("postgres://replica.test:5432/banter".to_string()),
    );
    config.enable_read_replicas = true;
    config.replica_endpoints = vec![
        "message.history".to_string(),
        "conversation.list".to_string(),
    ];

    let db = Db::options(config)
        .metrics_sink(Arc::clone(&metrics) as Arc<dyn MetricsSink>)
        .lag_probe(Arc::clone(&dial) as Arc<dyn LagProbe>)
        .connect_lazy()
        .unwrap();

    let mut rx = db.subscribe_lag().unwrap();
    rx.changed().await.unwrap();
    (db, dial, metrics)
}

/// Block until the monitor publishes a sample with the expected health
async fn wait_for_health(db: &Db, expected: ReplicaHealth) {
    let mut rx = db.subscribe_lag().unwrap();
    loop {
        if rx.borrow_and_update().health == expected {
            return;
        }
        rx.changed().await.unwrap();
    }
}

async fn read_ok(db: &Db, endpoint: &Endpoint) {
    let value = db
        .read(endpoint, ReadOptions::default(), |_pool| async {
            Ok::<_, sqlx::Error>(1u8)
        })
        .await
        .unwrap();
    assert_eq!(value, 1);
}

async fn read_failing(db: &Db, endpoint: &Endpoint) {
    db.read(endpoint, ReadOptions::default(), |_pool| async {
        Err::<u8, _>(sqlx::Error::PoolClosed)
    })
    .await
    .unwrap_err();
}

#[tokio::test(start_paused = true)]
async fn lag_degradation_reroutes_and_recovery_restores_replica_reads() {
    let (db, dial, metrics) = dialed_db(1.0).await;

    read_ok(&db, &history()).await;
    assert_eq!(metrics.snapshot().routed_replica, 1);

    // Lag climbs past the warning threshold: reads shift to primary as
    // fallback, but nothing trips.
    dial.set(7.0);
    wait_for_health(&db, ReplicaHealth::Degraded).await;
    read_ok(&db, &history()).await;
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.routed_fallback, 1);
    assert_eq!(db.breaker().state(), CircuitState::Closed);

    // Lag drains: replica reads resume with no operator involvement.
    dial.set(0.5);
    wait_for_health(&db, ReplicaHealth::Healthy).await;
    read_ok(&db, &history()).await;
    assert_eq!(metrics.snapshot().routed_replica, 2);
}

#[tokio::test(start_paused = true)]
async fn replica_failures_open_the_breaker_and_canary_probes_close_it() {
    let (db, _dial, metrics) = dialed_db(1.0).await;
    let endpoint = history();

    // Three straight replica errors. Each one falls back to primary, which
    // fails too since the closure fails everywhere; the router only counts
    // the replica attempt against the breaker.
    for _ in 0..3 {
        read_failing(&db, &endpoint).await;
    }
    assert_eq!(db.breaker().state(), CircuitState::Open);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.routed_replica, 3);
    assert_eq!(snapshot.routed_fallback, 3);

    // While open, a read goes straight to primary: the closure runs exactly
    // once, with no replica attempt to retry from.
    let calls = AtomicU32::new(0);
    db.read(&endpoint, ReadOptions::default(), |_pool| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, sqlx::Error>(()) }
    })
    .await
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.snapshot().routed_fallback, 4);

    // After the open window one canary read is admitted; four more
    // successes behind it close the circuit for good.
    tokio::time::advance(Duration::from_secs(31)).await;
    for expected_replica in 4..=8 {
        read_ok(&db, &endpoint).await;
        assert_eq!(metrics.snapshot().routed_replica, expected_replica);
    }
    assert_eq!(db.breaker().state(), CircuitState::Closed);

    read_ok(&db, &endpoint).await;
    assert_eq!(metrics.snapshot().routed_replica, 9);
}

#[tokio::test(start_paused = true)]
async fn failed_canary_reopens_the_circuit() {
    let (db, _dial, _metrics) = dialed_db(1.0).await;
    let endpoint = history();

    for _ in 0..3 {
        read_failing(&db, &endpoint).await;
    }
    assert_eq!(db.breaker().state(), CircuitState::Open);

    // The canary probe itself fails: straight back to open, and the next
    // read is denied without touching the replica.
    tokio::time::advance(Duration::from_secs(31)).await;
    read_failing(&db, &endpoint).await;
    assert_eq!(db.breaker().state(), CircuitState::Open);

    let calls = AtomicU32::new(0);
    db.read(&endpoint, ReadOptions::default(), |_pool| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, sqlx::Error>(()) }
    })
    .await
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Second recovery attempt succeeds.
    tokio::time::advance(Duration::from_secs(31)).await;
    for _ in 0..5 {
        read_ok(&db, &endpoint).await;
    }
    assert_eq!(db.breaker().state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn critical_lag_trips_and_recovery_still_goes_through_the_canary() {
    let (db, dial, metrics) = dialed_db(1.0).await;
    let endpoint = history();
    read_ok(&db, &endpoint).await;

    // Replication falls badly behind: the monitor trips the breaker
    // without a single failed query.
    dial.set(15.0);
    wait_for_health(&db, ReplicaHealth::Critical).await;
    assert_eq!(db.breaker().state(), CircuitState::Open);

    let status = db.status();
    assert_eq!(status.breaker.state, CircuitState::Open);
    assert_eq!(
        status.lag.as_ref().map(|sample| sample.health),
        Some(ReplicaHealth::Critical)
    );

    read_ok(&db, &endpoint).await;
    assert_eq!(metrics.snapshot().routed_fallback, 1);

    // Lag drains before the open window ends. Health alone does not close
    // the circuit: reads keep falling back until a canary proves the
    // replica out.
    dial.set(1.0);
    wait_for_health(&db, ReplicaHealth::Healthy).await;
    assert_eq!(db.breaker().state(), CircuitState::Open);
    read_ok(&db, &endpoint).await;
    assert_eq!(metrics.snapshot().routed_fallback, 2);

    tokio::time::advance(Duration::from_secs(31)).await;
    for _ in 0..5 {
        read_ok(&db, &endpoint).await;
    }
    assert_eq!(db.breaker().state(), CircuitState::Closed);
    assert_eq!(metrics.snapshot().routed_replica, 6);
}

#[tokio::test(start_paused = true)]
async fn consistency_and_policy_gates_hold_while_replica_is_healthy() {
    let (db, _dial, metrics) = dialed_db(1.0).await;

    // Strong consistency pins the read to primary and is not a fallback.
    db.read(&history(), ReadOptions::strong(), |_pool| async {
        Ok::<_, sqlx::Error>(())
    })
    .await
    .unwrap();

    // Endpoints outside the policy never see the replica.
    let reports = Endpoint::new("reports.weekly").unwrap();
    read_ok(&db, &reports).await;

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.routed_primary, 2);
    assert_eq!(snapshot.routed_replica, 0);
    assert_eq!(snapshot.routed_fallback, 0);

    // Policy is runtime-mutable: listing the endpoint flips its routing.
    db.policy().insert(reports.clone());
    read_ok(&db, &reports).await;
    assert_eq!(metrics.snapshot().routed_replica, 1);

    db.policy().remove(&reports);
    read_ok(&db, &reports).await;
    assert_eq!(metrics.snapshot().routed_primary, 3);
}

#[tokio::test(start_paused = true)]
async fn routing_counters_split_by_endpoint() {
    let (db, dial, metrics) = dialed_db(1.0).await;
    let history = history();
    let list = Endpoint::new("conversation.list").unwrap();
    let reports = Endpoint::new("reports.weekly").unwrap();

    read_ok(&db, &history).await;
    read_ok(&db, &history).await;
    read_ok(&db, &list).await;
    // Unlisted endpoint, never replica-eligible.
    read_ok(&db, &reports).await;

    // Lag spike: the next history read becomes a fallback.
    dial.set(7.0);
    wait_for_health(&db, ReplicaHealth::Degraded).await;
    read_ok(&db, &history).await;

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.by_endpoint["message.history"].replica, 2);
    assert_eq!(snapshot.by_endpoint["message.history"].fallback, 1);
    assert_eq!(snapshot.by_endpoint["message.history"].primary, 0);
    assert_eq!(snapshot.by_endpoint["conversation.list"].replica, 1);
    assert_eq!(snapshot.by_endpoint["reports.weekly"].primary, 1);
    // Totals are the sum of the per-endpoint slices.
    assert_eq!(snapshot.routed_replica, 3);
    assert_eq!(snapshot.routed_primary, 1);
    assert_eq!(snapshot.routed_fallback, 1);
}

#[tokio::test(start_paused = true)]
async fn operator_overrides_compose_with_the_lag_gate() {
    let (db, dial, metrics) = dialed_db(1.0).await;
    let endpoint = history();

    // Force-open drains the replica despite perfect health.
    db.breaker().force_open();
    assert_eq!(db.status().breaker.forced, Some(ForcedState::Open));
    read_ok(&db, &endpoint).await;
    assert_eq!(metrics.snapshot().routed_fallback, 1);

    db.breaker().clear_override();
    read_ok(&db, &endpoint).await;
    assert_eq!(metrics.snapshot().routed_replica, 1);

    // Force-closed overrides the breaker, not the lag gate: with critical
    // lag the read still falls back.
    dial.set(20.0);
    wait_for_health(&db, ReplicaHealth::Critical).await;
    db.breaker().force_closed();
    read_ok(&db, &endpoint).await;
    assert_eq!(metrics.snapshot().routed_fallback, 2);

    // Once lag drains, the forced-closed breaker admits reads immediately,
    // canary dance skipped.
    dial.set(1.0);
    wait_for_health(&db, ReplicaHealth::Healthy).await;
    read_ok(&db, &endpoint).await;
    assert_eq!(metrics.snapshot().routed_replica, 2);
}

#[tokio::test(start_paused = true)]
async fn replicas_disabled_means_primary_only_and_no_monitor() {
    let db = Db::options(DbConfig::with_urls(
        "postgres://primary.test:5432/banter",
        None,
    ))
    .connect_lazy()
    .unwrap();

    assert!(db.lag().is_none());
    assert!(db.subscribe_lag().is_none());

    read_ok(&db, &history()).await;
    db.read(&history(), ReadOptions::strong(), |_pool| async {
        Ok::<_, sqlx::Error>(())
    })
    .await
    .unwrap();

    // No sink was injected, so the built-in one reports through status().
    let status = db.status();
    assert!(status.lag.is_none());
    let metrics = status.metrics.expect("default sink should report");
    assert_eq!(metrics.routed_primary, 2);
    assert_eq!(metrics.routed_replica, 0);
    assert_eq!(metrics.by_endpoint["message.history"].primary, 2);

    db.close().await;
}
