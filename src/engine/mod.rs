//! Resilient request-execution engine
//!
//! Components, leaves first:
//! - [`CircuitBreaker`]: global fuse over the client
//! - [`RetryOrchestrator`]: attempt loop over pool, breaker and backoff
//! - [`IdentityManager`]: session and fingerprint rotation
//! - [`ConcurrencyScheduler`]: paced, bounded batch runner

pub mod alerts;
pub mod backoff;
pub mod breaker;
pub mod identity;
pub mod orchestrator;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod transport;
pub mod validator;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::info;
use uuid::Uuid;

pub use alerts::{AlertLog, AlertSink};
pub use backoff::{BackoffPolicy, JitterWindow};
pub use breaker::{CircuitBreaker, CircuitState};
pub use identity::IdentityManager;
pub use orchestrator::RetryOrchestrator;
pub use scheduler::{BatchProgress, ConcurrencyScheduler};
pub use session::HttpSessionFactory;
pub use stats::RunStats;
pub use transport::{ApiRequest, ApiResponse, HttpMethod, SessionFactory, Transport, TransportError};
pub use validator::{RequiredFieldsValidator, ValidationResult, Validator};

use crate::config::Config;
use crate::error::Result;
use crate::models::{default_identities, Outcome, RunSummary};
use crate::proxy::ProxyPool;

/// Everything one run shares, built once and passed around by reference
pub struct Engine {
    pub pool: Arc<ProxyPool>,
    pub breaker: Arc<CircuitBreaker>,
    pub identity: Arc<IdentityManager>,
    pub alerts: Arc<AlertLog>,
    pub stats: Arc<RunStats>,
    pub orchestrator: RetryOrchestrator,
    pub scheduler: ConcurrencyScheduler,
    max_attempts: u32,
    run_id: Uuid,
    started_at: DateTime<Utc>,
}

impl Engine {
    pub async fn build(
        config: &Config,
        pool: ProxyPool,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self> {
        let pool = Arc::new(pool);
        let pool_active = pool.is_active();

        let breaker = Arc::new(CircuitBreaker::from_config(&config.breaker, pool_active));
        let identity = Arc::new(
            IdentityManager::from_config(factory, default_identities(), &config.identity).await?,
        );
        let alerts = Arc::new(AlertLog::new());
        let stats = Arc::new(RunStats::new());
        let global = Arc::new(Semaphore::new(config.scheduler.max_global_requests));

        let orchestrator = RetryOrchestrator::new(
            pool.clone(),
            breaker.clone(),
            identity.clone(),
            BackoffPolicy::from_config(&config.retry, pool_active),
            global,
            alerts.clone(),
            stats.clone(),
        )
        .with_request_timeout(config.retry.request_timeout)
        .with_rotate_on_forbidden(config.identity.rotate_on_forbidden);

        let scheduler = ConcurrencyScheduler::from_config(identity.clone(), &config.scheduler);

        info!(
            proxies = pool.len(),
            pool_active,
            breaker_threshold = breaker.threshold(),
            max_attempts = config.retry.max_attempts,
            max_global_requests = config.scheduler.max_global_requests,
            "Engine initialized"
        );

        Ok(Self {
            pool,
            breaker,
            identity,
            alerts,
            stats,
            orchestrator,
            scheduler,
            max_attempts: config.retry.max_attempts,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        })
    }

    /// Execute with the configured attempt budget
    pub async fn execute(&self, request: &ApiRequest, validator: Option<&dyn Validator>) -> Outcome {
        self.orchestrator
            .execute(request, self.max_attempts, validator)
            .await
    }

    pub fn summary(&self, targets: usize, cancelled: bool) -> RunSummary {
        let finished_at = Utc::now();
        let duration_secs = (finished_at - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at,
            duration_secs,
            targets,
            outcomes: self.stats.outcome_counts(),
            attempts: self.stats.attempts(),
            identity_rotations: self.identity.rotations(),
            breaker_state: self.breaker.state(),
            breaker_trips: self.breaker.trips(),
            cancelled,
            proxies: self.pool.stats(),
            alerts: self.alerts.snapshot(),
        }
    }
}
