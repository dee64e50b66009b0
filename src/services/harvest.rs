//! Target harvesting
//!
//! Turns a list of targets into requests and runs them through the engine's
//! scheduler and orchestrator. After every batch the outcomes are split
//! between the result store and the failed ledger.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::fs;
use tokio::sync::watch;
use tracing::{info, warn};

use super::failed_targets::FailedTargets;
use super::store::{PersistenceStore, StoreItem};
use crate::config::HarvestConfig;
use crate::engine::{ApiRequest, Engine, Validator};
use crate::error::{HarvestError, Result};
use crate::models::Outcome;

const PLACEHOLDER: &str = "{target}";

/// Trimmed, de-duplicated targets in file order; blanks and `#` lines skipped
pub fn parse_targets(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect()
}

pub async fn load_targets(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        HarvestError::InvalidConfig(format!("cannot read targets file {}: {}", path.display(), e))
    })?;
    Ok(parse_targets(&content))
}

/// Builds one request per target from the configured templates
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    endpoint: String,
    url: String,
    body: Option<String>,
}

impl RequestTemplate {
    pub fn new(endpoint: impl Into<String>, url: impl Into<String>, body: Option<String>) -> Result<Self> {
        let url = url.into();
        if !url.contains(PLACEHOLDER) {
            return Err(HarvestError::InvalidConfig(format!(
                "HARVEST_URL_TEMPLATE must contain {}",
                PLACEHOLDER
            )));
        }
        url::Url::parse(&url.replace(PLACEHOLDER, "x")).map_err(|e| {
            HarvestError::InvalidConfig(format!("HARVEST_URL_TEMPLATE is not a URL: {}", e))
        })?;

        if let Some(body) = &body {
            let sample = body.replace(PLACEHOLDER, "x");
            serde_json::from_str::<Value>(&sample).map_err(|e| {
                HarvestError::InvalidConfig(format!("HARVEST_BODY_TEMPLATE is not JSON: {}", e))
            })?;
        }

        Ok(Self {
            endpoint: endpoint.into(),
            url,
            body,
        })
    }

    pub fn from_config(config: &HarvestConfig) -> Result<Self> {
        Self::new(&config.family, &config.url_template, config.body_template.clone())
    }

    /// Scheme, host and port of the URL template
    pub fn origin(&self) -> Option<String> {
        let parsed = url::Url::parse(&self.url.replace(PLACEHOLDER, "x")).ok()?;
        Some(parsed.origin().ascii_serialization())
    }

    pub fn build(&self, target: &str) -> Result<ApiRequest> {
        let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
        let url = self.url.replace(PLACEHOLDER, &encoded);

        match &self.body {
            None => Ok(ApiRequest::get(&self.endpoint, url)),
            Some(template) => {
                // Substituted inside JSON strings, so escape like one
                let quoted = serde_json::to_string(target)?;
                let escaped = &quoted[1..quoted.len() - 1];
                let body: Value = serde_json::from_str(&template.replace(PLACEHOLDER, escaped))?;
                Ok(ApiRequest::post(&self.endpoint, url, body))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TargetResult {
    pub target: String,
    pub outcome: Outcome,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PersistReport {
    pub stored: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HarvestReport {
    pub batches: usize,
    pub processed: usize,
    pub cancelled: bool,
    pub stored: usize,
    pub failed: usize,
}

pub struct Harvester {
    engine: Arc<Engine>,
    template: RequestTemplate,
    validator: Arc<dyn Validator>,
    family: String,
}

impl Harvester {
    pub fn new(
        engine: Arc<Engine>,
        template: RequestTemplate,
        validator: Arc<dyn Validator>,
        family: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            template,
            validator,
            family: family.into(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Execute one target to a final outcome
    pub async fn harvest_one(&self, target: String) -> TargetResult {
        let outcome = match self.template.build(&target) {
            Ok(request) => self.engine.execute(&request, Some(self.validator.as_ref())).await,
            Err(e) => {
                warn!(target = %target, error = %e, "Cannot build request for target");
                Outcome::BadRequest
            }
        };
        TargetResult { target, outcome }
    }

    /// Harvest every target, persisting each batch as soon as it completes
    pub async fn run(
        &self,
        targets: Vec<String>,
        cancel: watch::Receiver<bool>,
        store: &dyn PersistenceStore,
        ledger: &FailedTargets,
    ) -> Result<HarvestReport> {
        info!(targets = targets.len(), family = %self.family, "Starting harvest");
        let stored = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        let progress = self
            .engine
            .scheduler
            .run(
                &self.family,
                targets,
                cancel,
                |target| self.harvest_one(target),
                |batch| {
                    let (stored, failed) = (&stored, &failed);
                    async move {
                        let persisted = self.persist(&batch, store, ledger).await?;
                        stored.fetch_add(persisted.stored, Ordering::Relaxed);
                        failed.fetch_add(persisted.failed, Ordering::Relaxed);
                        Ok::<(), HarvestError>(())
                    }
                },
            )
            .await?;

        Ok(HarvestReport {
            batches: progress.batches,
            processed: progress.processed,
            cancelled: progress.cancelled,
            stored: stored.into_inner(),
            failed: failed.into_inner(),
        })
    }

    /// Store successes, ledger terminal failures, clear recovered targets
    pub async fn persist(
        &self,
        results: &[TargetResult],
        store: &dyn PersistenceStore,
        ledger: &FailedTargets,
    ) -> Result<PersistReport> {
        let mut items = Vec::new();
        let mut failures = Vec::new();
        let mut resolved = Vec::new();

        for result in results {
            match &result.outcome {
                Outcome::Success { data, .. } => {
                    items.push(StoreItem {
                        key: result.target.clone(),
                        api: self.validator.api_name().to_string(),
                        data: data.clone(),
                    });
                    resolved.push(result.target.clone());
                }
                outcome => {
                    if let Some(reason) = outcome.ledger_reason() {
                        failures.push((result.target.clone(), reason.to_string()));
                    }
                }
            }
        }

        let stored = store.record_batch(items).await?;
        ledger.merge(&failures, &resolved).await?;

        Ok(PersistReport {
            stored,
            failed: failures.len(),
        })
    }
}
