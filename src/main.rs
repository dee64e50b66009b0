//! Harvest - Entry Point
//!
//! Warms up the proxy pool, runs the preflight canary, harvests every target
//! in paced batches and prints a session summary. The first Ctrl+C or
//! SIGTERM stops after the current batch; the second exits immediately.

use std::process;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use harvest::config::LogConfig;
use harvest::engine::{HttpSessionFactory, RequiredFieldsValidator};
use harvest::models::RunSummary;
use harvest::proxy::ProxyPool;
use harvest::services::{run_session, Harvester, RequestTemplate, RunProgress};
use harvest::{Config, Engine, HarvestError};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(&LogConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            });
            error!("Configuration error: {}", e);
            process::exit(e.exit_code());
        }
    };
    init_tracing(&config.log);

    info!("Starting harvest");

    let harvester = match start(&config).await {
        Ok(harvester) => harvester,
        Err(e) => abort(e),
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let signals = tokio::spawn(watch_interrupts(cancel_tx));

    let mut progress = RunProgress::default();
    let result = run_session(&config, &harvester, cancel_rx, &mut progress).await;
    signals.abort();
    log_summary(&harvester.engine().summary(progress.targets, progress.cancelled));

    match result {
        Ok(()) if progress.cancelled => {
            warn!("Run was interrupted before every target completed");
        }
        Ok(()) => {}
        Err(e) => abort(e.into()),
    }
}

fn abort(e: anyhow::Error) -> ! {
    let code = e.downcast_ref::<HarvestError>().map(HarvestError::exit_code).unwrap_or(1);
    error!("Harvest aborted: {:#}", e);
    process::exit(code);
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("harvest={},warn", log.level)));
    let registry = tracing_subscriber::registry().with(filter);

    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Build the pool, sessions and engine
async fn start(config: &Config) -> anyhow::Result<Harvester> {
    let pool = ProxyPool::from_config(&config.pool);
    if config.pool.enabled && config.pool.required && pool.is_empty() {
        return Err(HarvestError::NoProxiesAvailable)
            .context("RESIDENTIAL_PROXIES yielded no usable proxy");
    }
    if pool.is_active() {
        info!("Loaded {} proxies", pool.len());
    } else {
        warn!("Running without proxies, every request leaves from this host");
    }

    let template = RequestTemplate::from_config(&config.harvest)?;
    let validator = RequiredFieldsValidator::from_specs(
        config.harvest.api_name.clone(),
        &config.harvest.required_fields,
    )?;

    let mut factory = HttpSessionFactory::new(config.retry.request_timeout);
    if let Some(origin) = template.origin() {
        factory = factory.with_origin(origin);
    }

    let engine = Arc::new(
        Engine::build(config, pool, Arc::new(factory))
            .await
            .context("failed to start the engine")?,
    );
    Ok(Harvester::new(
        engine,
        template,
        Arc::new(validator),
        config.harvest.family.clone(),
    ))
}

/// First interrupt requests a stop after the current batch, second exits
async fn watch_interrupts(cancel: watch::Sender<bool>) {
    if shutdown_signal().await.is_err() {
        return;
    }
    warn!("Interrupt received, stopping after the current batch (Ctrl+C again to exit now)");
    let _ = cancel.send(true);

    if shutdown_signal().await.is_ok() {
        warn!("Second interrupt, exiting immediately");
        process::exit(130);
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = signal::ctrl_c() => result,
        _ = terminate => Ok(()),
    }
}

fn log_summary(summary: &RunSummary) {
    info!(
        run_id = %summary.run_id,
        duration_secs = summary.duration_secs,
        targets = summary.targets,
        completed = summary.completed(),
        attempts = summary.attempts,
        identity_rotations = summary.identity_rotations,
        breaker_trips = summary.breaker_trips,
        alerts = summary.alerts.len(),
        "Session summary"
    );

    for (outcome, count) in &summary.outcomes {
        info!(outcome = %outcome, count, "Outcome count");
    }

    if summary.proxies.enabled {
        for proxy in &summary.proxies.proxies {
            info!(
                proxy = %proxy.proxy,
                success = proxy.success,
                failures = proxy.failures,
                success_rate = %format!("{:.1}%", proxy.success_rate() * 100.0),
                health = ?proxy.health,
                "Proxy stats"
            );
        }
    }

    for alert in &summary.alerts {
        warn!(api = %alert.api, message = %alert.message, "Schema alert during run");
    }

    match serde_json::to_string(summary) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize summary: {}", e),
    }
}
