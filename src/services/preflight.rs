//! Canary request run before the harvest starts

use serde_json::Value;
use tracing::{error, info};

use super::harvest::Harvester;
use crate::error::{HarvestError, Result};
use crate::models::Outcome;

/// Harvest `target` once; anything short of a valid success aborts the run
pub async fn run_preflight(harvester: &Harvester, target: &str) -> Result<Value> {
    info!(target, "Running preflight check");
    let result = harvester.harvest_one(target.to_string()).await;

    let kind = result.outcome.kind();
    let reason = match result.outcome {
        Outcome::Success { data, warnings } => {
            info!(warnings = warnings.len(), "Preflight check passed");
            return Ok(data);
        }
        Outcome::SchemaDrift { reason } => format!("response shape changed: {}", reason),
        Outcome::Exhausted { attempts, last_failure } => {
            format!("gave up after {} attempts ({})", attempts, last_failure)
        }
        Outcome::BadRequest => "upstream rejected the canary target (400)".to_string(),
        Outcome::CircuitOpen => "circuit breaker is open".to_string(),
    };

    error!(target, outcome = %kind, "Preflight check failed");
    Err(HarvestError::PreflightFailed(reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::harvest::test_support;

    #[tokio::test(start_paused = true)]
    async fn test_valid_canary_passes() {
        let harvester = test_support::harvester().await;
        let data = run_preflight(&harvester, "abc").await.unwrap();
        assert_eq!(data["result"]["wallet"], "abc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drifted_canary_aborts() {
        let harvester = test_support::harvester().await;
        let err = run_preflight(&harvester, "drift").await.unwrap_err();
        assert!(matches!(err, HarvestError::PreflightFailed(_)));
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_canary_aborts() {
        let harvester = test_support::harvester().await;
        let err = run_preflight(&harvester, "bad").await.unwrap_err();
        assert!(err.to_string().contains("400"));
    }
}
