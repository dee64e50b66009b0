//! Global circuit breaker for one logical client
//!
//! State machine:
//! - `Closed`: hard failures accumulate; reaching the threshold opens the circuit
//! - `Open`: every call is rejected until the open duration elapses
//! - `HalfOpen`: exactly one trial runs; its verdict closes or reopens the circuit

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Epoch of the trial currently in flight, if any
    trial: Option<u64>,
    next_trial_epoch: u64,
}

/// Result of asking the breaker whether a call may proceed
#[must_use]
pub enum Admission<'a> {
    Proceed,
    /// The caller is the single half-open trial
    Trial(TrialGuard<'a>),
    Rejected,
}

/// Holds the half-open trial slot; releases it on drop if no verdict was recorded
pub struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.breaker.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial == Some(self.epoch) {
            debug!(epoch = self.epoch, "Trial ended without a verdict, releasing slot");
            inner.trial = None;
        }
    }
}

pub struct CircuitBreaker {
    inner: Mutex<BreakerState>,
    threshold: u32,
    open_duration: Duration,
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_duration: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial: None,
                next_trial_epoch: 0,
            }),
            threshold: threshold.max(1),
            open_duration,
            trips: AtomicU64::new(0),
        }
    }

    /// Threshold follows the egress mode: a pool tolerates more failures
    pub fn from_config(config: &BreakerConfig, pool_active: bool) -> Self {
        Self::new(config.threshold(pool_active), config.open_duration)
    }

    pub fn admit(&self) -> Admission<'_> {
        self.admit_at(Instant::now())
    }

    pub fn admit_at(&self, now: Instant) -> Admission<'_> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Proceed,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed < self.open_duration {
                    return Admission::Rejected;
                }
                info!("Circuit breaker half-open, admitting trial");
                inner.state = CircuitState::HalfOpen;
                Admission::Trial(self.claim_trial(&mut inner))
            }
            CircuitState::HalfOpen => {
                if inner.trial.is_some() {
                    Admission::Rejected
                } else {
                    Admission::Trial(self.claim_trial(&mut inner))
                }
            }
        }
    }

    fn claim_trial(&self, inner: &mut BreakerState) -> TrialGuard<'_> {
        let epoch = inner.next_trial_epoch;
        inner.next_trial_epoch = inner.next_trial_epoch.wrapping_add(1);
        inner.trial = Some(epoch);
        TrialGuard {
            breaker: self,
            epoch,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                info!("Circuit breaker closing, trial succeeded");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.trial = None;
            }
            CircuitState::Open => {
                debug!("Success recorded while circuit is open, ignoring");
            }
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        threshold = self.threshold,
                        "Circuit breaker opening, too many failures"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    self.trips.fetch_add(1, Ordering::Relaxed);
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit breaker reopening, trial failed");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial = None;
                self.trips.fetch_add(1, Ordering::Relaxed);
            }
            CircuitState::Open => {
                debug!("Failure recorded while circuit is open, ignoring");
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Number of transitions into `Open`
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(5, Duration::from_secs(60))
    }

    fn trip(b: &CircuitBreaker, now: Instant) {
        for _ in 0..b.threshold() {
            b.record_failure_at(now);
        }
    }

    #[test]
    fn test_opens_at_threshold() {
        let b = breaker();
        let now = Instant::now();

        for _ in 0..4 {
            b.record_failure_at(now);
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(matches!(b.admit_at(now), Admission::Proceed));

        b.record_failure_at(now);
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.trips(), 1);
        assert!(matches!(b.admit_at(now), Admission::Rejected));
    }

    #[test]
    fn test_success_resets_closed_counter() {
        let b = breaker();
        let now = Instant::now();

        for _ in 0..4 {
            b.record_failure_at(now);
        }
        b.record_success();
        assert_eq!(b.consecutive_failures(), 0);

        for _ in 0..4 {
            b.record_failure_at(now);
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_single_half_open_trial() {
        let b = breaker();
        let start = Instant::now();
        trip(&b, start);

        let later = start + Duration::from_secs(61);
        let first = b.admit_at(later);
        assert!(matches!(first, Admission::Trial(_)));
        assert_eq!(b.state(), CircuitState::HalfOpen);

        // Concurrent callers are rejected while the trial is in flight
        assert!(matches!(b.admit_at(later), Admission::Rejected));
        assert!(matches!(b.admit_at(later), Admission::Rejected));
        drop(first);
    }

    #[test]
    fn test_trial_success_closes() {
        let b = breaker();
        let start = Instant::now();
        trip(&b, start);

        let later = start + Duration::from_secs(60);
        let admission = b.admit_at(later);
        assert!(matches!(admission, Admission::Trial(_)));
        b.record_success();
        drop(admission);

        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.consecutive_failures(), 0);
        assert!(matches!(b.admit_at(later), Admission::Proceed));
    }

    #[test]
    fn test_trial_failure_reopens_with_new_timestamp() {
        let b = breaker();
        let start = Instant::now();
        trip(&b, start);

        let later = start + Duration::from_secs(61);
        let admission = b.admit_at(later);
        b.record_failure_at(later);
        drop(admission);

        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.trips(), 2);
        assert_eq!(b.consecutive_failures(), 5);

        // Measured from the reopen, not the first trip
        let before_window = later + Duration::from_secs(30);
        assert!(matches!(b.admit_at(before_window), Admission::Rejected));
        let after_window = later + Duration::from_secs(61);
        assert!(matches!(b.admit_at(after_window), Admission::Trial(_)));
    }

    #[test]
    fn test_trial_without_verdict_releases_slot() {
        let b = breaker();
        let start = Instant::now();
        trip(&b, start);

        let later = start + Duration::from_secs(61);
        {
            let admission = b.admit_at(later);
            assert!(matches!(admission, Admission::Trial(_)));
        }

        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(matches!(b.admit_at(later), Admission::Trial(_)));
    }

    #[test]
    fn test_stale_trial_guard_does_not_release_newer_trial() {
        let b = breaker();
        let start = Instant::now();
        trip(&b, start);

        let t1 = start + Duration::from_secs(61);
        let stale = b.admit_at(t1);
        b.record_failure_at(t1);

        let t2 = t1 + Duration::from_secs(61);
        let fresh = b.admit_at(t2);
        assert!(matches!(fresh, Admission::Trial(_)));

        drop(stale);
        assert!(matches!(b.admit_at(t2), Admission::Rejected));
        drop(fresh);
    }

    #[test]
    fn test_open_ignores_late_verdicts() {
        let b = breaker();
        let now = Instant::now();
        trip(&b, now);

        b.record_success();
        b.record_failure_at(now);
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.trips(), 1);
    }
}
