//! Proxy warmup
//!
//! Checks every proxy once, in parallel, before the run starts. A failed
//! check counts as a hard failure in the pool's health records.

use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::time::{timeout, Instant};
use tracing::{info, instrument, warn};

use super::pool::{Egress, ProxyPool};
use crate::engine::transport::{ApiRequest, Transport};
use crate::error::{HarvestError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub proxy: String,
    pub healthy: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmupReport {
    pub total: usize,
    pub healthy: usize,
    pub results: Vec<CheckResult>,
}

impl WarmupReport {
    pub fn healthy_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.healthy as f64 / self.total as f64
        }
    }
}

/// Check every proxy against `url` with at most `workers` checks in flight
///
/// Fails with [`HarvestError::NoHealthyProxies`] when nothing answered and the
/// pool is mandatory.
#[instrument(skip(pool, transport))]
pub async fn warmup_proxies(
    pool: &ProxyPool,
    transport: &dyn Transport,
    url: &str,
    check_timeout: Duration,
    workers: usize,
    required: bool,
) -> Result<WarmupReport> {
    let egresses = pool.egresses();
    if egresses.is_empty() {
        return Ok(WarmupReport {
            total: 0,
            healthy: 0,
            results: Vec::new(),
        });
    }

    info!("Warming up {} proxies", egresses.len());
    let request = ApiRequest::get("proxy_warmup", url);

    let results = futures::stream::iter(egresses)
        .map(|egress| {
            let request = &request;
            async move {
                let result = check_proxy(transport, request, &egress, check_timeout).await;
                if result.healthy {
                    pool.report_success(egress.id);
                } else {
                    pool.report_failure(egress.id, false);
                }
                result
            }
        })
        .buffer_unordered(workers.max(1))
        .collect::<Vec<CheckResult>>()
        .await;

    let total = results.len();
    let healthy = results.iter().filter(|r| r.healthy).count();
    let report = WarmupReport {
        total,
        healthy,
        results,
    };

    info!(
        "Proxy warmup complete: {}/{} healthy",
        report.healthy, report.total
    );

    if report.healthy == 0 {
        if required {
            return Err(HarvestError::NoHealthyProxies { total });
        }
        warn!("No proxy passed warmup, the pool will force-reuse proxies");
    } else if report.healthy_ratio() < 0.5 {
        warn!(
            healthy = report.healthy,
            total = report.total,
            "Fewer than half of the proxies passed warmup"
        );
    }

    Ok(report)
}

async fn check_proxy(
    transport: &dyn Transport,
    request: &ApiRequest,
    egress: &Egress,
    check_timeout: Duration,
) -> CheckResult {
    let start = Instant::now();
    let outcome = timeout(check_timeout, transport.send(request, Some(egress))).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    let error = match outcome {
        // Redirects count as reachable
        Ok(Ok(response)) if (200..400).contains(&response.status) => None,
        Ok(Ok(response)) => Some(format!("HTTP {}", response.status)),
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some("timeout".to_string()),
    };

    match &error {
        None => info!(proxy = %egress.masked, latency_ms, "Proxy healthy"),
        Some(e) => warn!(proxy = %egress.masked, error = %e, "Proxy failed warmup"),
    }

    CheckResult {
        proxy: egress.masked.clone(),
        healthy: error.is_none(),
        latency_ms,
        error,
    }
}
