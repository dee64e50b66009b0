use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{ApiAlert, OutcomeKind, PoolStats};
use crate::engine::breaker::CircuitState;

/// End-of-run report, always emitted
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: uuid::Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub targets: usize,
    pub outcomes: BTreeMap<String, u64>,
    pub attempts: u64,
    pub identity_rotations: u64,
    pub breaker_state: CircuitState,
    pub breaker_trips: u64,
    pub cancelled: bool,
    pub proxies: PoolStats,
    pub alerts: Vec<ApiAlert>,
}

impl RunSummary {
    pub fn count(&self, kind: OutcomeKind) -> u64 {
        self.outcomes.get(kind.as_str()).copied().unwrap_or(0)
    }

    /// Total logical requests that produced an outcome
    pub fn completed(&self) -> u64 {
        self.outcomes.values().sum()
    }
}
