//! One harvester session: warmup, preflight, target loading and the
//! batched harvest

use tokio::sync::watch;
use tracing::{info, warn};

use super::failed_targets::FailedTargets;
use super::harvest::{load_targets, Harvester};
use super::preflight::run_preflight;
use super::store::JsonlStore;
use crate::config::Config;
use crate::error::Result;
use crate::proxy::warmup_proxies;

/// What the session summary needs, kept up to date even when the run fails
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunProgress {
    pub targets: usize,
    pub processed: usize,
    pub cancelled: bool,
}

pub async fn run_session(
    config: &Config,
    harvester: &Harvester,
    cancel: watch::Receiver<bool>,
    progress: &mut RunProgress,
) -> Result<()> {
    let engine = harvester.engine();

    if let Some(url) = &config.harvest.proxy_warmup_url {
        let session = engine.identity.current();
        warmup_proxies(
            &engine.pool,
            session.transport.as_ref(),
            url,
            config.retry.request_timeout,
            config.harvest.proxy_warmup_workers,
            config.pool.required,
        )
        .await?;
    }

    if let Some(target) = &config.harvest.preflight_target {
        run_preflight(harvester, target).await?;
    }

    let ledger = FailedTargets::new(&config.harvest.failed_file);
    let targets = if config.harvest.retry_failed {
        let entries = ledger.load().await?;
        info!(
            "Retrying {} failed targets from {}",
            entries.len(),
            ledger.path().display()
        );
        entries.targets()
    } else {
        load_targets(&config.harvest.targets_file).await?
    };
    progress.targets = targets.len();

    if targets.is_empty() {
        warn!("No targets to harvest");
        return Ok(());
    }

    let store = JsonlStore::open(&config.harvest.output_file).await?;
    let report = harvester.run(targets, cancel, &store, &ledger).await?;

    progress.processed = report.processed;
    progress.cancelled = report.cancelled;
    info!(
        processed = report.processed,
        stored = report.stored,
        failed = report.failed,
        output = %store.path().display(),
        "Results persisted"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarvestError;
    use crate::models::OutcomeKind;
    use crate::services::harvest::test_support;
    use tokio::fs;

    #[tokio::test(start_paused = true)]
    async fn test_failed_preflight_still_leaves_summary_data() {
        let config = test_support::config_with(&[("HARVEST_PREFLIGHT_TARGET", "drift")]);
        let harvester = test_support::harvester_from(&config, None).await;
        let (_tx, rx) = watch::channel(false);
        let mut progress = RunProgress::default();

        let err = run_session(&config, &harvester, rx, &mut progress).await.unwrap_err();
        assert!(matches!(err, HarvestError::PreflightFailed(_)));

        let summary = harvester.engine().summary(progress.targets, progress.cancelled);
        assert_eq!(summary.count(OutcomeKind::SchemaDrift), 1);
        assert_eq!(summary.alerts.len(), 1);
        assert_eq!(summary.targets, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_harvests_the_targets_file() {
        let dir = std::env::temp_dir();
        let id = uuid::Uuid::new_v4();
        let targets = dir.join(format!("harvest-targets-{}.txt", id));
        let output = dir.join(format!("harvest-out-{}.jsonl", id));
        let failed = dir.join(format!("harvest-failed-{}.txt", id));
        fs::write(&targets, "# wallets\nabc\nbad\nabc\n").await.unwrap();

        let config = test_support::config_with(&[
            ("HARVEST_TARGETS_FILE", targets.to_str().unwrap()),
            ("HARVEST_OUTPUT_FILE", output.to_str().unwrap()),
            ("HARVEST_FAILED_FILE", failed.to_str().unwrap()),
            ("HARVEST_PREFLIGHT_TARGET", "abc"),
        ]);
        let harvester = test_support::harvester_from(&config, None).await;
        let (_tx, rx) = watch::channel(false);
        let mut progress = RunProgress::default();

        run_session(&config, &harvester, rx, &mut progress).await.unwrap();
        assert_eq!(
            progress,
            RunProgress {
                targets: 2,
                processed: 2,
                cancelled: false
            }
        );
        let ledger = fs::read_to_string(&failed).await.unwrap();
        assert!(ledger.contains("bad,HTTP_400"));

        for path in [&targets, &output, &failed] {
            let _ = fs::remove_file(path).await;
        }
    }
}
