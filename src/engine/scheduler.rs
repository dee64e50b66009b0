//! Bounded-parallel batch runner
//!
//! Targets are cut into fixed-size batches. Every operation of a batch is
//! dispatched at once behind its family's semaphore and the batch is awaited
//! fully and handed to the sink before a random pause and the next batch.
//! Cancellation is observed between batches only.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tracing::{debug, info};

use super::backoff::JitterWindow;
use super::identity::IdentityManager;
use crate::config::SchedulerConfig;

/// How far a scheduler run got
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub batches: usize,
    /// Operations that completed and reached the sink
    pub processed: usize,
    /// True when the run stopped early on the cancellation flag
    pub cancelled: bool,
}

pub struct ConcurrencyScheduler {
    identity: Arc<IdentityManager>,
    batch_size: usize,
    batch_pause: JitterWindow,
    family_limits: HashMap<String, usize>,
    default_family_limit: usize,
    families: DashMap<String, Arc<Semaphore>>,
}

impl ConcurrencyScheduler {
    pub fn new(identity: Arc<IdentityManager>, batch_size: usize, batch_pause: JitterWindow) -> Self {
        Self {
            identity,
            batch_size: batch_size.max(1),
            batch_pause,
            family_limits: HashMap::new(),
            default_family_limit: 10,
            families: DashMap::new(),
        }
    }

    pub fn from_config(identity: Arc<IdentityManager>, config: &SchedulerConfig) -> Self {
        Self::new(identity, config.batch_size, config.batch_pause)
            .with_family_limits(config.family_limits.clone(), config.default_family_limit)
    }

    pub fn with_family_limits(mut self, limits: HashMap<String, usize>, default_limit: usize) -> Self {
        self.family_limits = limits;
        self.default_family_limit = default_limit.max(1);
        self
    }

    /// Semaphore shared by every operation of `family`
    pub fn family_gate(&self, family: &str) -> Arc<Semaphore> {
        self.families
            .entry(family.to_string())
            .or_insert_with(|| {
                let limit = self
                    .family_limits
                    .get(family)
                    .copied()
                    .unwrap_or(self.default_family_limit)
                    .max(1);
                debug!(family, limit, "Created family concurrency gate");
                Arc::new(Semaphore::new(limit))
            })
            .clone()
    }

    /// Run `op` over every item in paced batches
    ///
    /// Each finished batch goes to `sink` before the pause; a sink error stops
    /// the run.
    pub async fn run<I, T, F, Fut, S, SFut, E>(
        &self,
        family: &str,
        items: Vec<I>,
        mut cancel: watch::Receiver<bool>,
        op: F,
        mut sink: S,
    ) -> std::result::Result<BatchProgress, E>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = T>,
        S: FnMut(Vec<T>) -> SFut,
        SFut: Future<Output = std::result::Result<(), E>>,
    {
        let gate = self.family_gate(family);
        let total = items.len();
        let total_batches = total.div_ceil(self.batch_size);
        let mut progress = BatchProgress::default();
        let op = &op;

        let mut remaining = items.into_iter().peekable();
        while remaining.peek().is_some() {
            if *cancel.borrow() {
                info!(done = progress.processed, total, "Cancellation requested, stopping before next batch");
                progress.cancelled = true;
                break;
            }

            let batch: Vec<I> = remaining.by_ref().take(self.batch_size).collect();
            progress.batches += 1;
            info!(
                family,
                batch = progress.batches,
                of = total_batches,
                size = batch.len(),
                "Dispatching batch"
            );

            let operations = batch.into_iter().map(|item| {
                let gate = gate.clone();
                async move {
                    // Held for the whole operation; the gate is never closed
                    let _permit = gate.acquire_owned().await;
                    self.identity.rotate_if_due().await;
                    let out = op(item).await;
                    self.identity.record_completed();
                    out
                }
            });
            let outputs = join_all(operations).await;
            progress.processed += outputs.len();
            sink(outputs).await?;

            if remaining.peek().is_some() {
                self.pause(&mut cancel).await;
            }
        }

        Ok(progress)
    }

    async fn pause(&self, cancel: &mut watch::Receiver<bool>) {
        let pause = self.batch_pause.sample();
        info!(pause_secs = pause.as_secs_f64(), "Batch complete, pausing");
        tokio::select! {
            _ = sleep(pause) => {}
            _ = wait_for_cancel(cancel) => {
                debug!("Pause interrupted by cancellation");
            }
        }
    }
}

/// Resolves once the flag is set; never resolves if the sender is gone
async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::transport::{ApiRequest, ApiResponse, SessionFactory, Transport, TransportError};
    use crate::error::Result;
    use crate::models::{default_identities, Identity};
    use crate::proxy::Egress;
    use async_trait::async_trait;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Collected<T> {
        results: Vec<T>,
        batches: usize,
        cancelled: bool,
    }

    /// Runs the scheduler with a sink that keeps every output
    async fn collect<I, T, F, Fut>(
        scheduler: &ConcurrencyScheduler,
        family: &str,
        items: Vec<I>,
        cancel: watch::Receiver<bool>,
        op: F,
    ) -> Collected<T>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut results = Vec::new();
        let progress = scheduler
            .run(family, items, cancel, op, |batch| {
                results.extend(batch);
                std::future::ready(Ok::<(), Infallible>(()))
            })
            .await;
        let progress = match progress {
            Ok(progress) => progress,
            Err(never) => match never {},
        };
        assert_eq!(progress.processed, results.len());
        Collected {
            results,
            batches: progress.batches,
            cancelled: progress.cancelled,
        }
    }

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(
            &self,
            _request: &ApiRequest,
            _egress: Option<&Egress>,
        ) -> std::result::Result<ApiResponse, TransportError> {
            Ok(ApiResponse::new(200, b"{}".to_vec()))
        }
    }

    struct NullFactory;

    #[async_trait]
    impl SessionFactory for NullFactory {
        async fn open(&self, _identity: &Identity) -> Result<Arc<dyn Transport>> {
            Ok(Arc::new(NullTransport))
        }
    }

    async fn identity(rotate_every: u64) -> Arc<IdentityManager> {
        Arc::new(
            IdentityManager::start(Arc::new(NullFactory), default_identities(), rotate_every, None)
                .await
                .unwrap(),
        )
    }

    fn fixed(secs: u64) -> JitterWindow {
        JitterWindow::fixed(Duration::from_secs(secs))
    }

    #[tokio::test(start_paused = true)]
    async fn test_family_limit_bounds_concurrency() {
        let mut limits = HashMap::new();
        limits.insert("wallet_stats".to_string(), 2);
        let scheduler = ConcurrencyScheduler::new(identity(100).await, 6, fixed(0))
            .with_family_limits(limits, 10);
        let (_tx, rx) = watch::channel(false);

        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let report = collect(&scheduler, "wallet_stats", (0..6).collect::<Vec<u32>>(), rx, |i| {
            let in_flight = &in_flight;
            let peak = &peak;
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(100)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                i * 2
            }
        })
        .await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        let mut results = report.results;
        results.sort();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10]);
        assert_eq!(report.batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_only_between_batches() {
        let scheduler = ConcurrencyScheduler::new(identity(100).await, 2, fixed(5));
        let (_tx, rx) = watch::channel(false);
        let started = tokio::time::Instant::now();

        let report = collect(&scheduler, "token_traders", (0..5).collect::<Vec<u32>>(), rx, |i| async move { i }).await;

        assert_eq!(report.batches, 3);
        assert_eq!(report.results.len(), 5);
        // Two pauses for three batches
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_do_not_overlap() {
        let scheduler = ConcurrencyScheduler::new(identity(100).await, 2, fixed(0));
        let (_tx, rx) = watch::channel(false);
        let finished = AtomicUsize::new(0);

        let report = collect(&scheduler, "wallet_stats", (0..4).collect::<Vec<u64>>(), rx, |i| {
            let finished = &finished;
            async move {
                let seen_at_start = finished.load(Ordering::SeqCst);
                // Earlier items in the batch take longer
                sleep(Duration::from_millis(100 * (4 - i))).await;
                finished.fetch_add(1, Ordering::SeqCst);
                (i, seen_at_start)
            }
        })
        .await;

        for (i, seen_at_start) in report.results {
            let expected = if i < 2 { 0 } else { 2 };
            assert_eq!(seen_at_start, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_between_batches() {
        let scheduler = ConcurrencyScheduler::new(identity(100).await, 2, fixed(30));
        let (tx, rx) = watch::channel(false);

        let report = collect(&scheduler, "wallet_stats", (0..6).collect::<Vec<u32>>(), rx, |i| {
            let tx = &tx;
            async move {
                if i == 1 {
                    let _ = tx.send(true);
                }
                i
            }
        })
        .await;

        assert!(report.cancelled);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_rotates_every_n_operations() {
        let identity = identity(2).await;
        let scheduler = ConcurrencyScheduler::new(identity.clone(), 1, fixed(0));
        let (_tx, rx) = watch::channel(false);

        collect(&scheduler, "wallet_stats", (0..6).collect::<Vec<u32>>(), rx, |i| async move { i }).await;

        assert_eq!(identity.completed(), 6);
        assert_eq!(identity.rotations(), 2);
    }

    #[tokio::test]
    async fn test_family_gates_are_shared_per_family() {
        let scheduler = ConcurrencyScheduler::new(identity(100).await, 5, fixed(0));
        let a = scheduler.family_gate("wallet_stats");
        let b = scheduler.family_gate("wallet_stats");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.available_permits(), 10);
        assert!(!Arc::ptr_eq(&a, &scheduler.family_gate("token_traders")));
    }

    #[test]
    fn test_wait_for_cancel_pends_until_flag_is_set() {
        let (tx, mut rx) = watch::channel(false);
        let mut wait = tokio_test::task::spawn(async move { wait_for_cancel(&mut rx).await });

        tokio_test::assert_pending!(wait.poll());
        tx.send(true).unwrap();
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }

    #[test]
    fn test_wait_for_cancel_never_fires_without_sender() {
        let (tx, mut rx) = watch::channel(false);
        let mut wait = tokio_test::task::spawn(async move { wait_for_cancel(&mut rx).await });

        drop(tx);
        tokio_test::assert_pending!(wait.poll());
        tokio_test::assert_pending!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_sees_each_batch_and_its_error_stops_the_run() {
        let scheduler = ConcurrencyScheduler::new(identity(100).await, 2, fixed(1));
        let (_tx, rx) = watch::channel(false);
        let mut seen = Vec::new();

        let outcome = scheduler
            .run("wallet_stats", (0..6).collect::<Vec<u32>>(), rx, |i| async move { i }, |batch| {
                seen.push(batch.clone());
                std::future::ready(if batch.contains(&3) { Err("disk full") } else { Ok(()) })
            })
            .await;

        assert_eq!(outcome, Err("disk full"));
        assert_eq!(seen, vec![vec![0, 1], vec![2, 3]]);
    }
}
