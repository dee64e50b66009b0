use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::{Outcome, OutcomeKind};

/// Run-wide counters shared by every request
#[derive(Debug, Default)]
pub struct RunStats {
    attempts: AtomicU64,
    rate_limited: AtomicU64,
    forbidden: AtomicU64,
    transport_errors: AtomicU64,
    success: AtomicU64,
    bad_request: AtomicU64,
    schema_drift: AtomicU64,
    exhausted: AtomicU64,
    circuit_open: AtomicU64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forbidden(&self) {
        self.forbidden.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &Outcome) {
        self.counter(outcome.kind()).fetch_add(1, Ordering::Relaxed);
    }

    fn counter(&self, kind: OutcomeKind) -> &AtomicU64 {
        match kind {
            OutcomeKind::Success => &self.success,
            OutcomeKind::BadRequest => &self.bad_request,
            OutcomeKind::SchemaDrift => &self.schema_drift,
            OutcomeKind::Exhausted => &self.exhausted,
            OutcomeKind::CircuitOpen => &self.circuit_open,
        }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn rate_limited(&self) -> u64 {
        self.rate_limited.load(Ordering::Relaxed)
    }

    pub fn forbidden(&self) -> u64 {
        self.forbidden.load(Ordering::Relaxed)
    }

    pub fn transport_errors(&self) -> u64 {
        self.transport_errors.load(Ordering::Relaxed)
    }

    pub fn outcome_count(&self, kind: OutcomeKind) -> u64 {
        self.counter(kind).load(Ordering::Relaxed)
    }

    pub fn outcome_counts(&self) -> BTreeMap<String, u64> {
        [
            OutcomeKind::Success,
            OutcomeKind::BadRequest,
            OutcomeKind::SchemaDrift,
            OutcomeKind::Exhausted,
            OutcomeKind::CircuitOpen,
        ]
        .into_iter()
        .map(|kind| (kind.as_str().to_string(), self.outcome_count(kind)))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_counts() {
        let stats = RunStats::new();
        stats.record_outcome(&Outcome::BadRequest);
        stats.record_outcome(&Outcome::CircuitOpen);
        stats.record_outcome(&Outcome::CircuitOpen);

        let counts = stats.outcome_counts();
        assert_eq!(counts["circuit_open"], 2);
        assert_eq!(counts["bad_request"], 1);
        assert_eq!(counts["success"], 0);
        assert_eq!(counts.len(), 5);
    }
}
