//! Circuit breaker gating replica reads
//!
//! Closed: replica reads proceed. Open: everything goes to primary.
//! HalfOpen: a single canary read probes the replica; its outcome decides
//! recovery. Trips on consecutive replica failures or on a critical lag
//! signal from the monitor. Reopening after `breaker_open_duration` is
//! time-based: the first routing decision past the deadline performs the
//! Open -> HalfOpen transition itself, no background task involved.
//!
//! All state lives in atomics with compare-and-set transitions so
//! concurrent outcome recording cannot lose updates.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::DbConfig;
use crate::lag::ReplicaHealth;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

const FORCE_NONE: u8 = 0;
const FORCE_OPEN: u8 = 1;
const FORCE_CLOSED: u8 = 2;

/// No canary in flight
const CANARY_FREE: u64 = u64::MAX;

/// Breaker position as seen by routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Operator override, when one is set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedState {
    Open,
    Closed,
}

/// What a read attempt may do with the replica right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplicaAdmission {
    /// Breaker closed, go ahead
    Allow,
    /// Half-open and this caller holds the single probe slot
    Canary,
    /// Route to primary
    Deny,
}

/// Point-in-time view for the operator status surface
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub forced: Option<ForcedState>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Milliseconds since the last state transition
    pub in_state_ms: u64,
}

/// Replica circuit breaker.
///
/// `record_success`/`record_failure` are fed only replica-routed outcomes;
/// primary traffic never moves the breaker. Time is measured against a
/// `tokio::time::Instant` base so the open-duration behavior is exact under
/// a paused test clock.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    forced: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    /// Milliseconds since `started` when the breaker last opened
    opened_at_ms: AtomicU64,
    /// Milliseconds since `started` of the last transition
    last_transition_ms: AtomicU64,
    /// Claim time of the in-flight canary, or `CANARY_FREE`
    canary_claimed_ms: AtomicU64,
    failure_threshold: u32,
    success_threshold: u32,
    open_duration_ms: u64,
    half_open_timeout_ms: u64,
    started: Instant,
}

impl CircuitBreaker {
    pub fn new(config: &DbConfig) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            forced: AtomicU8::new(FORCE_NONE),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            last_transition_ms: AtomicU64::new(0),
            canary_claimed_ms: AtomicU64::new(CANARY_FREE),
            failure_threshold: config.breaker_failure_threshold,
            success_threshold: config.breaker_success_threshold,
            open_duration_ms: config.breaker_open_duration.as_millis() as u64,
            half_open_timeout_ms: config.breaker_half_open_timeout.as_millis() as u64,
            started: Instant::now(),
        }
    }

    /// Effective state: the operator override wins when set
    pub fn state(&self) -> CircuitState {
        match self.forced() {
            Some(ForcedState::Open) => CircuitState::Open,
            Some(ForcedState::Closed) => CircuitState::Closed,
            None => decode_state(self.state.load(Ordering::SeqCst)),
        }
    }

    /// The operator override, if one is set
    pub fn forced(&self) -> Option<ForcedState> {
        match self.forced.load(Ordering::SeqCst) {
            FORCE_OPEN => Some(ForcedState::Open),
            FORCE_CLOSED => Some(ForcedState::Closed),
            _ => None,
        }
    }

    /// Force the breaker open: all reads go to primary until cleared
    pub fn force_open(&self) {
        self.forced.store(FORCE_OPEN, Ordering::SeqCst);
        warn!("replica circuit forced open by operator");
    }

    /// Force the breaker closed: replica routing proceeds until cleared
    pub fn force_closed(&self) {
        self.forced.store(FORCE_CLOSED, Ordering::SeqCst);
        warn!("replica circuit forced closed by operator");
    }

    /// Drop the operator override and resume normal transitions
    pub fn clear_override(&self) {
        self.forced.store(FORCE_NONE, Ordering::SeqCst);
        info!("replica circuit override cleared");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state(),
            forced: self.forced(),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            consecutive_successes: self.consecutive_successes.load(Ordering::SeqCst),
            in_state_ms: self
                .now_ms()
                .saturating_sub(self.last_transition_ms.load(Ordering::SeqCst)),
        }
    }

    /// Decide whether a replica attempt may proceed right now.
    ///
    /// Performs the time-based Open -> HalfOpen transition when the open
    /// deadline has passed, then applies half-open canary admission. Callers
    /// must only invoke this once the lag and policy gates have already
    /// passed, so a denied canary slot is never burned on a call that would
    /// have gone to primary anyway.
    pub(crate) fn admit_replica(&self) -> ReplicaAdmission {
        match self.forced() {
            Some(ForcedState::Open) => return ReplicaAdmission::Deny,
            Some(ForcedState::Closed) => return ReplicaAdmission::Allow,
            None => {}
        }

        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED => ReplicaAdmission::Allow,
            STATE_OPEN => {
                let opened = self.opened_at_ms.load(Ordering::SeqCst);
                if self.now_ms().saturating_sub(opened) < self.open_duration_ms {
                    return ReplicaAdmission::Deny;
                }
                if self
                    .state
                    .compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    self.consecutive_successes.store(0, Ordering::SeqCst);
                    self.canary_claimed_ms.store(CANARY_FREE, Ordering::SeqCst);
                    self.mark_transition();
                    info!("replica circuit half-open, probing for recovery");
                }
                // Lost CAS means another caller just did the transition;
                // either way we are now competing for the canary slot.
                self.try_claim_canary()
            }
            _ => self.try_claim_canary(),
        }
    }

    /// Record a successful replica attempt
    pub(crate) fn record_success(&self) {
        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            STATE_HALF_OPEN => {
                self.canary_claimed_ms.store(CANARY_FREE, Ordering::SeqCst);
                let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.success_threshold
                    && self
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    self.mark_transition();
                    info!(successes, "replica circuit closed after recovery");
                }
            }
            // Late result from an attempt admitted before a trip; the open
            // deadline, not a stray success, decides when to probe again.
            _ => {}
        }
    }

    /// Record a failed replica attempt
    pub(crate) fn record_failure(&self) {
        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.failure_threshold {
                    self.trip_open("consecutive replica failures");
                }
            }
            STATE_HALF_OPEN => {
                self.canary_claimed_ms.store(CANARY_FREE, Ordering::SeqCst);
                self.trip_open("canary probe failed");
            }
            _ => {}
        }
    }

    /// Monitor hook: a critical or unreachable replica trips the breaker
    pub(crate) fn note_replica_health(&self, health: ReplicaHealth) {
        if health.is_critical() {
            self.trip_open("replication lag critical");
        }
    }

    fn trip_open(&self, reason: &str) {
        // Written before the state flips so no reader of Open sees a stale
        // deadline.
        self.opened_at_ms.store(self.now_ms(), Ordering::SeqCst);

        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current == STATE_OPEN {
                return;
            }
            match self.state.compare_exchange(
                current,
                STATE_OPEN,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.consecutive_successes.store(0, Ordering::SeqCst);
        self.canary_claimed_ms.store(CANARY_FREE, Ordering::SeqCst);
        self.mark_transition();
        warn!(
            reason,
            open_ms = self.open_duration_ms,
            "replica circuit opened"
        );
    }

    fn try_claim_canary(&self) -> ReplicaAdmission {
        let now = self.now_ms();
        let claimed = self.canary_claimed_ms.load(Ordering::SeqCst);
        let free = claimed == CANARY_FREE;
        // A probe that never reported back within the half-open timeout is
        // treated as abandoned and its slot reclaimed.
        let stale = !free && now.saturating_sub(claimed) >= self.half_open_timeout_ms;
        if (free || stale)
            && self
                .canary_claimed_ms
                .compare_exchange(claimed, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return ReplicaAdmission::Canary;
        }
        ReplicaAdmission::Deny
    }

    fn mark_transition(&self) {
        self.last_transition_ms
            .store(self.now_ms(), Ordering::SeqCst);
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

fn decode_state(raw: u8) -> CircuitState {
    match raw {
        STATE_OPEN => CircuitState::Open,
        STATE_HALF_OPEN => CircuitState::HalfOpen,
        _ => CircuitState::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(&DbConfig::default())
    }

    /// Drive the breaker open via its failure threshold
    fn trip(breaker: &CircuitBreaker) {
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn starts_closed_and_admits() {
        let breaker = breaker();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Allow);
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = breaker();

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Deny);
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        let breaker = breaker();

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_open_until_the_deadline() {
        let breaker = breaker();
        trip(&breaker);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Deny);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn first_decision_after_deadline_goes_half_open() {
        let breaker = breaker();
        trip(&breaker);

        tokio::time::advance(Duration::from_secs(30)).await;
        // The decision itself performs the transition and claims the probe.
        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Canary);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Only one canary at a time.
        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Deny);
    }

    #[tokio::test(start_paused = true)]
    async fn five_canary_successes_close_the_circuit() {
        let breaker = breaker();
        trip(&breaker);
        tokio::time::advance(Duration::from_secs(30)).await;

        for _ in 0..5 {
            assert_eq!(breaker.admit_replica(), ReplicaAdmission::Canary);
            breaker.record_success();
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Allow);
    }

    #[tokio::test(start_paused = true)]
    async fn one_canary_failure_reopens() {
        let breaker = breaker();
        trip(&breaker);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Canary);
        breaker.record_success();
        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Canary);
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Deny);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_canary_slot_is_reclaimed() {
        let breaker = breaker();
        trip(&breaker);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Canary);
        // The probe never reports back.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Canary);
    }

    #[tokio::test]
    async fn critical_lag_trips_from_closed_and_half_open() {
        let breaker = breaker();

        breaker.note_replica_health(ReplicaHealth::Healthy);
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.note_replica_health(ReplicaHealth::Degraded);
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.note_replica_health(ReplicaHealth::Critical);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_replica_reopens_a_probing_circuit() {
        let breaker = breaker();
        trip(&breaker);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Canary);

        breaker.note_replica_health(ReplicaHealth::Unreachable);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Deny);
    }

    #[tokio::test]
    async fn operator_overrides_win_until_cleared() {
        let breaker = breaker();

        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Deny);

        breaker.clear_override();
        assert_eq!(breaker.state(), CircuitState::Closed);

        trip(&breaker);
        breaker.force_closed();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Allow);

        breaker.clear_override();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn concurrent_failures_trip_exactly_once() {
        let breaker = std::sync::Arc::new(breaker());
        let mut handles = vec![];

        for _ in 0..10 {
            let breaker = std::sync::Arc::clone(&breaker);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    breaker.record_failure();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // However the failures interleave, the breaker lands open and no
        // update is lost to a torn transition.
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.admit_replica(), ReplicaAdmission::Deny);
    }

    #[tokio::test]
    async fn snapshot_reports_streaks() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 2);
        assert_eq!(snapshot.forced, None);
    }

    proptest! {
        /// Property: for any outcome sequence fed in while Closed, the
        /// breaker opens exactly when a run of `threshold` consecutive
        /// failures completes, never earlier, and stays open for the rest
        /// of the sequence (reopening is time-based and no deadline passes
        /// here).
        #[test]
        fn prop_opens_exactly_on_a_threshold_failure_run(
            threshold in 1u32..=5,
            outcomes in prop::collection::vec(any::<bool>(), 0..200),
        ) {
            let config = DbConfig {
                breaker_failure_threshold: threshold,
                ..DbConfig::default()
            };
            let breaker = CircuitBreaker::new(&config);

            let mut streak = 0u32;
            let mut open = false;
            for &failed in &outcomes {
                if failed {
                    breaker.record_failure();
                } else {
                    breaker.record_success();
                }
                if !open {
                    if failed {
                        streak += 1;
                        open = streak >= threshold;
                    } else {
                        streak = 0;
                    }
                }

                if open {
                    prop_assert_eq!(breaker.state(), CircuitState::Open);
                } else {
                    prop_assert_eq!(breaker.state(), CircuitState::Closed);
                    prop_assert_eq!(breaker.snapshot().consecutive_failures, streak);
                }
            }
        }
    }
}
