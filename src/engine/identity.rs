//! Identity rotation
//!
//! The manager owns exactly one active session. Rotation swaps in a new
//! identity and session atomically; requests already in flight keep the
//! snapshot they loaded and finish on the old session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::backoff::JitterWindow;
use super::transport::{ApiRequest, SessionFactory, Transport};
use crate::config::IdentityConfig;
use crate::error::{HarvestError, Result};
use crate::models::Identity;

/// Identity plus the session bound to it
pub struct ActiveSession {
    pub identity: Identity,
    pub transport: Arc<dyn Transport>,
    /// Increments on every rotation
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct WarmupSettings {
    pub url: String,
    pub timeout: Duration,
    pub pause: JitterWindow,
}

pub struct IdentityManager {
    factory: Arc<dyn SessionFactory>,
    identities: Vec<Identity>,
    current: ArcSwap<ActiveSession>,
    rotation_lock: Mutex<()>,
    rotate_every: u64,
    warmup: Option<WarmupSettings>,
    completed: AtomicU64,
    /// Value of `completed` at the last scheduled rotation
    rotated_at: AtomicU64,
    rotations: AtomicU64,
}

impl IdentityManager {
    /// Pick a random identity and open its session
    pub async fn start(
        factory: Arc<dyn SessionFactory>,
        identities: Vec<Identity>,
        rotate_every: u64,
        warmup: Option<WarmupSettings>,
    ) -> Result<Self> {
        let identity = identities
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| HarvestError::InvalidConfig("identity pool is empty".into()))?;

        let transport = factory.open(&identity).await?;
        run_warmup(transport.as_ref(), warmup.as_ref()).await;
        info!(fingerprint = %identity.fingerprint, "Identity initialized");

        Ok(Self {
            factory,
            identities,
            current: ArcSwap::from_pointee(ActiveSession {
                identity,
                transport,
                generation: 0,
            }),
            rotation_lock: Mutex::new(()),
            rotate_every: rotate_every.max(1),
            warmup,
            completed: AtomicU64::new(0),
            rotated_at: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
        })
    }

    pub async fn from_config(
        factory: Arc<dyn SessionFactory>,
        identities: Vec<Identity>,
        config: &IdentityConfig,
    ) -> Result<Self> {
        let warmup = config.warmup_url.as_ref().map(|url| WarmupSettings {
            url: url.clone(),
            timeout: config.warmup_timeout,
            pause: config.warmup_pause,
        });
        Self::start(factory, identities, config.rotate_every, warmup).await
    }

    /// Snapshot of the active session
    pub fn current(&self) -> Arc<ActiveSession> {
        self.current.load_full()
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    /// Rotate once every `rotate_every` completed operations
    pub async fn rotate_if_due(&self) {
        if !self.is_due() {
            return;
        }

        let _guard = self.rotation_lock.lock().await;
        // Another caller may have rotated while we waited
        if !self.is_due() {
            return;
        }
        let completed = self.completed();
        if let Err(e) = self.rotate_locked().await {
            warn!(error = %e, "Scheduled identity rotation failed, keeping current session");
        }
        self.rotated_at.store(completed, Ordering::Relaxed);
    }

    fn is_due(&self) -> bool {
        let completed = self.completed.load(Ordering::Relaxed);
        completed.saturating_sub(self.rotated_at.load(Ordering::Relaxed)) >= self.rotate_every
    }

    /// Rotate unconditionally
    pub async fn rotate(&self) -> Result<()> {
        let _guard = self.rotation_lock.lock().await;
        self.rotate_locked().await
    }

    /// Rotate only if the session of `generation` is still active
    ///
    /// Concurrent callers reacting to the same block collapse into one rotation.
    pub async fn rotate_from(&self, generation: u64) -> Result<()> {
        let _guard = self.rotation_lock.lock().await;
        if self.current.load().generation != generation {
            debug!(generation, "Session already rotated, skipping");
            return Ok(());
        }
        self.rotate_locked().await
    }

    async fn rotate_locked(&self) -> Result<()> {
        let previous = self.current.load_full();
        let candidates: Vec<&Identity> = self
            .identities
            .iter()
            .filter(|i| **i != previous.identity)
            .collect();
        let identity = candidates
            .choose(&mut rand::thread_rng())
            .map(|i| (*i).clone())
            .unwrap_or_else(|| previous.identity.clone());

        let transport = self.factory.open(&identity).await?;
        run_warmup(transport.as_ref(), self.warmup.as_ref()).await;

        debug!(
            from = %previous.identity.fingerprint,
            to = %identity.fingerprint,
            "Rotating identity"
        );
        self.current.store(Arc::new(ActiveSession {
            identity,
            transport,
            generation: previous.generation.wrapping_add(1),
        }));
        self.rotations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Best-effort landing-page visit; failures are logged and ignored
async fn run_warmup(transport: &dyn Transport, warmup: Option<&WarmupSettings>) {
    let Some(warmup) = warmup else {
        return;
    };

    let request = ApiRequest::get("warmup", warmup.url.clone());
    match tokio::time::timeout(warmup.timeout, transport.send(&request, None)).await {
        Ok(Ok(response)) => debug!(status = response.status, "Session warmup complete"),
        Ok(Err(e)) => warn!(error = %e, "Session warmup failed (non-critical)"),
        Err(_) => warn!("Session warmup timed out (non-critical)"),
    }
    tokio::time::sleep(warmup.pause.sample()).await;
}
