//! Per-request attempt loop
//!
//! Each attempt passes the breaker gate, takes a global slot, picks a fresh
//! proxy, waits a jittered delay and issues the request with a timeout. The
//! response is classified into an [`AttemptOutcome`] which decides between
//! retrying and returning an [`Outcome`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::alerts::AlertSink;
use super::backoff::BackoffPolicy;
use super::breaker::{Admission, CircuitBreaker, TrialGuard};
use super::identity::IdentityManager;
use super::stats::RunStats;
use super::transport::{ApiRequest, ApiResponse, TransportError};
use super::validator::{ValidationResult, Validator};
use crate::models::{ApiAlert, FailureReason, Outcome};
use crate::proxy::ProxyPool;

/// Classified result of a single attempt
#[derive(Debug)]
enum AttemptOutcome {
    RateLimited,
    Forbidden,
    BadRequest,
    HttpError(u16),
    Accepted { data: Value, warnings: Vec<String> },
    Drift(ValidationResult),
    Transport(TransportError),
}

pub struct RetryOrchestrator {
    pool: Arc<ProxyPool>,
    breaker: Arc<CircuitBreaker>,
    identity: Arc<IdentityManager>,
    backoff: BackoffPolicy,
    global: Arc<Semaphore>,
    alerts: Arc<dyn AlertSink>,
    stats: Arc<RunStats>,
    request_timeout: Duration,
    rotate_on_forbidden: bool,
}

impl RetryOrchestrator {
    pub fn new(
        pool: Arc<ProxyPool>,
        breaker: Arc<CircuitBreaker>,
        identity: Arc<IdentityManager>,
        backoff: BackoffPolicy,
        global: Arc<Semaphore>,
        alerts: Arc<dyn AlertSink>,
        stats: Arc<RunStats>,
    ) -> Self {
        Self {
            pool,
            breaker,
            identity,
            backoff,
            global,
            alerts,
            stats,
            request_timeout: Duration::from_secs(30),
            rotate_on_forbidden: true,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_rotate_on_forbidden(mut self, rotate: bool) -> Self {
        self.rotate_on_forbidden = rotate;
        self
    }

    /// Run `request` for at most `max_attempts` attempts
    pub async fn execute(
        &self,
        request: &ApiRequest,
        max_attempts: u32,
        validator: Option<&dyn Validator>,
    ) -> Outcome {
        let outcome = self.run(request, max_attempts.max(1), validator).await;
        self.stats.record_outcome(&outcome);
        outcome
    }

    async fn run(
        &self,
        request: &ApiRequest,
        max_attempts: u32,
        validator: Option<&dyn Validator>,
    ) -> Outcome {
        let mut trial: Option<TrialGuard<'_>> = None;
        let mut last_failure = FailureReason::Transport("no attempt made".into());

        for attempt in 0..max_attempts {
            if trial.is_some() {
                // Our own trial verdict may have reopened the circuit
                if self.breaker.is_open() {
                    return Outcome::CircuitOpen;
                }
            } else {
                match self.breaker.admit() {
                    Admission::Proceed => {}
                    Admission::Trial(guard) => {
                        info!(endpoint = %request.endpoint, "Executing half-open trial");
                        trial = Some(guard);
                    }
                    Admission::Rejected => {
                        debug!(endpoint = %request.endpoint, "Circuit open, rejecting request");
                        return Outcome::CircuitOpen;
                    }
                }
            }

            let session = self.identity.current();
            let (result, egress) = {
                let Ok(_permit) = self.global.acquire().await else {
                    return Outcome::Exhausted {
                        attempts: attempt,
                        last_failure: FailureReason::Transport("concurrency gate closed".into()),
                    };
                };

                let egress = self.pool.get_proxy();
                sleep(self.backoff.request_delay()).await;
                self.stats.record_attempt();

                let sent = timeout(
                    self.request_timeout,
                    session.transport.send(request, egress.as_ref()),
                )
                .await;
                (classify(sent, validator), egress)
                // Slot is released here, before any backoff
            };

            let proxy_label = egress.as_ref().map(|e| e.masked.as_str()).unwrap_or("direct");
            let wait = match result {
                AttemptOutcome::Accepted { data, warnings } => {
                    if let Some(egress) = &egress {
                        self.pool.report_success(egress.id);
                    }
                    self.breaker.record_success();
                    return Outcome::Success { data, warnings };
                }
                AttemptOutcome::BadRequest => {
                    debug!(endpoint = %request.endpoint, "400 Bad Request, not retrying");
                    return Outcome::BadRequest;
                }
                AttemptOutcome::Drift(result) => {
                    let api = validator
                        .map(|v| v.api_name())
                        .unwrap_or(request.endpoint.as_str());
                    let reason = result
                        .error
                        .clone()
                        .unwrap_or_else(|| "response failed validation".into());
                    self.alerts.alert(
                        ApiAlert::new(api, reason.clone()).with_shape(result.expected, result.got),
                    );
                    return Outcome::SchemaDrift { reason };
                }
                AttemptOutcome::RateLimited => {
                    if let Some(egress) = &egress {
                        self.pool.report_failure(egress.id, true);
                    }
                    self.stats.record_rate_limited();
                    last_failure = FailureReason::RateLimited;
                    let wait = self.backoff.rate_limited(attempt);
                    warn!(
                        endpoint = %request.endpoint,
                        proxy = proxy_label,
                        attempt = attempt + 1,
                        wait_secs = wait.as_secs_f64(),
                        "429 rate limited"
                    );
                    wait
                }
                AttemptOutcome::Forbidden => {
                    if let Some(egress) = &egress {
                        self.pool.report_failure(egress.id, false);
                    }
                    self.breaker.record_failure();
                    self.stats.record_forbidden();
                    last_failure = FailureReason::Forbidden;
                    let wait = self.backoff.forbidden(attempt);
                    warn!(
                        endpoint = %request.endpoint,
                        proxy = proxy_label,
                        attempt = attempt + 1,
                        wait_secs = wait.as_secs_f64(),
                        "403 forbidden"
                    );
                    if self.rotate_on_forbidden {
                        if let Err(e) = self.identity.rotate_from(session.generation).await {
                            warn!(error = %e, "Identity rotation after 403 failed");
                        }
                    }
                    wait
                }
                AttemptOutcome::HttpError(status) => {
                    if let Some(egress) = &egress {
                        self.pool.report_failure(egress.id, false);
                    }
                    last_failure = FailureReason::HttpStatus(status);
                    warn!(
                        endpoint = %request.endpoint,
                        proxy = proxy_label,
                        attempt = attempt + 1,
                        status,
                        "Unexpected HTTP status"
                    );
                    self.backoff.error()
                }
                AttemptOutcome::Transport(e) => {
                    if let Some(egress) = &egress {
                        self.pool.report_failure(egress.id, false);
                    }
                    self.stats.record_transport_error();
                    warn!(
                        endpoint = %request.endpoint,
                        proxy = proxy_label,
                        attempt = attempt + 1,
                        error = %e,
                        "Request failed"
                    );
                    last_failure = match e {
                        TransportError::Timeout => FailureReason::Timeout,
                        other => FailureReason::Transport(other.to_string()),
                    };
                    self.backoff.error()
                }
            };

            if attempt + 1 < max_attempts {
                sleep(wait).await;
            }
        }

        self.breaker.record_failure();
        warn!(
            endpoint = %request.endpoint,
            attempts = max_attempts,
            last_failure = %last_failure,
            "Retries exhausted"
        );
        Outcome::Exhausted {
            attempts: max_attempts,
            last_failure,
        }
    }
}

fn classify(
    sent: std::result::Result<std::result::Result<ApiResponse, TransportError>, tokio::time::error::Elapsed>,
    validator: Option<&dyn Validator>,
) -> AttemptOutcome {
    let response = match sent {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return AttemptOutcome::Transport(e),
        Err(_) => return AttemptOutcome::Transport(TransportError::Timeout),
    };

    match response.status {
        429 => AttemptOutcome::RateLimited,
        403 => AttemptOutcome::Forbidden,
        400 => AttemptOutcome::BadRequest,
        _ if !response.is_success() => AttemptOutcome::HttpError(response.status),
        _ => {
            let body: Value = match serde_json::from_slice(&response.body) {
                Ok(body) => body,
                Err(e) => return AttemptOutcome::Transport(TransportError::Decode(e.to_string())),
            };
            let Some(validator) = validator else {
                return AttemptOutcome::Accepted {
                    data: body,
                    warnings: Vec::new(),
                };
            };

            let result = validator.validate(&body);
            if result.valid {
                AttemptOutcome::Accepted {
                    data: result.data.unwrap_or(body),
                    warnings: result.warnings,
                }
            } else {
                AttemptOutcome::Drift(result)
            }
        }
    }
}
