//! Health-aware round-robin proxy pool
//!
//! Records live in an index-addressed arena for the lifetime of the process.
//! Strikes accumulate per record: a rate limit costs one, any other failure
//! costs two, and three strikes put the record into cooldown.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use secrecy::SecretString;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::address::{parse_proxy_list, ProxyAddress};
use crate::config::PoolConfig;
use crate::models::{PoolStats, ProxyHealth, ProxyId, ProxyStat};

const STRIKE_LIMIT: u32 = 3;
const RATE_LIMIT_STRIKES: u32 = 1;
const HARD_FAILURE_STRIKES: u32 = 2;

/// Egress handed to one request attempt
#[derive(Clone)]
pub struct Egress {
    pub id: ProxyId,
    pub url: SecretString,
    pub masked: String,
}

impl std::fmt::Debug for Egress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Egress")
            .field("id", &self.id)
            .field("proxy", &self.masked)
            .finish()
    }
}

struct ProxyRecord {
    address: ProxyAddress,
    success_count: u64,
    failure_count: u64,
    consecutive_failures: u32,
    last_used: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    cooldown_until: Option<Instant>,
    cooling_down: bool,
}

impl ProxyRecord {
    fn new(address: ProxyAddress) -> Self {
        Self {
            address,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_used: None,
            last_success: None,
            cooldown_until: None,
            cooling_down: false,
        }
    }

    fn health(&self, now: Instant) -> ProxyHealth {
        let in_window = self.cooling_down && self.cooldown_until.is_some_and(|until| now < until);
        if in_window {
            ProxyHealth::CoolingDown
        } else if self.consecutive_failures >= STRIKE_LIMIT {
            ProxyHealth::Degraded
        } else {
            ProxyHealth::Healthy
        }
    }

    /// Clears an elapsed cooldown; returns true when the record recovered
    fn try_recover(&mut self, now: Instant) -> bool {
        let elapsed = self.cooldown_until.map_or(true, |until| now >= until);
        if self.cooling_down && elapsed {
            self.cooling_down = false;
            self.consecutive_failures = 0;
            return true;
        }
        false
    }

    fn egress(&self, id: ProxyId) -> Egress {
        Egress {
            id,
            url: self.address.url().clone(),
            masked: self.address.masked().to_string(),
        }
    }
}

struct PoolState {
    records: Vec<ProxyRecord>,
    cursor: usize,
}

pub struct ProxyPool {
    state: Mutex<PoolState>,
    enabled: bool,
    cooldown: Duration,
    force_when_exhausted: bool,
}

impl ProxyPool {
    /// Build a pool in the given order
    pub fn new(addresses: Vec<ProxyAddress>, cooldown: Duration, force_when_exhausted: bool) -> Self {
        let records = addresses.into_iter().map(ProxyRecord::new).collect();
        Self {
            state: Mutex::new(PoolState { records, cursor: 0 }),
            enabled: true,
            cooldown,
            force_when_exhausted,
        }
    }

    /// A pool that always yields direct connections
    pub fn disabled() -> Self {
        Self {
            state: Mutex::new(PoolState {
                records: Vec::new(),
                cursor: 0,
            }),
            enabled: false,
            cooldown: Duration::ZERO,
            force_when_exhausted: false,
        }
    }

    /// Parse the configured entries once and shuffle them
    pub fn from_config(config: &PoolConfig) -> Self {
        if !config.enabled {
            info!("Proxy pool disabled, using direct connections");
            return Self::disabled();
        }

        let mut addresses = parse_proxy_list(&config.raw_proxies);
        if addresses.is_empty() {
            warn!("No usable egress addresses configured, using direct connections");
            return Self::disabled();
        }
        addresses.shuffle(&mut rand::thread_rng());

        info!(count = addresses.len(), "Loaded proxy pool");
        Self::new(addresses, config.cooldown, config.force_when_exhausted)
    }

    /// True when requests leave through proxies
    pub fn is_active(&self) -> bool {
        self.enabled && !self.state.lock().records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every record as an egress, in pool order
    pub fn egresses(&self) -> Vec<Egress> {
        if !self.enabled {
            return Vec::new();
        }
        let state = self.state.lock();
        state
            .records
            .iter()
            .enumerate()
            .map(|(idx, r)| r.egress(ProxyId(idx)))
            .collect()
    }

    /// Next egress, or `None` for a direct connection
    pub fn get_proxy(&self) -> Option<Egress> {
        self.get_proxy_at(Instant::now())
    }

    pub fn get_proxy_at(&self, now: Instant) -> Option<Egress> {
        if !self.enabled {
            return None;
        }

        let mut state = self.state.lock();
        let len = state.records.len();
        if len == 0 {
            return None;
        }

        for _ in 0..len {
            let idx = state.cursor;
            state.cursor = (state.cursor + 1) % len;

            let record = &mut state.records[idx];
            if record.try_recover(now) {
                info!(proxy = %record.address, "Proxy recovered from cooldown");
            }
            if record.health(now).is_healthy() {
                record.last_used = Some(Utc::now());
                return Some(record.egress(ProxyId(idx)));
            }
        }

        if !self.force_when_exhausted {
            warn!("All proxies unhealthy, falling back to a direct connection");
            return None;
        }

        // Every record is unhealthy: reuse the one closest to recovery
        let idx = state
            .records
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| r.cooldown_until.unwrap_or(now))
            .map(|(idx, _)| idx)?;
        let record = &mut state.records[idx];
        record.cooling_down = false;
        warn!(proxy = %record.address, "All proxies in cooldown, forcing soonest-recovering proxy");
        Some(record.egress(ProxyId(idx)))
    }

    pub fn report_success(&self, id: ProxyId) {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(id.0) else {
            return;
        };
        record.success_count += 1;
        record.consecutive_failures = 0;
        record.cooling_down = false;
        record.last_success = Some(Utc::now());
    }

    pub fn report_failure(&self, id: ProxyId, is_rate_limit: bool) {
        self.report_failure_at(id, is_rate_limit, Instant::now());
    }

    pub fn report_failure_at(&self, id: ProxyId, is_rate_limit: bool, now: Instant) {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(id.0) else {
            return;
        };
        record.failure_count += 1;
        let strikes = if is_rate_limit {
            RATE_LIMIT_STRIKES
        } else {
            HARD_FAILURE_STRIKES
        };
        record.consecutive_failures = record.consecutive_failures.saturating_add(strikes);

        if record.consecutive_failures >= STRIKE_LIMIT {
            record.cooling_down = true;
            record.cooldown_until = Some(now + self.cooldown);
            warn!(
                proxy = %record.address,
                cooldown_secs = self.cooldown.as_secs(),
                "Proxy entering cooldown"
            );
        } else {
            debug!(
                proxy = %record.address,
                strikes = record.consecutive_failures,
                "Proxy failure recorded"
            );
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> PoolStats {
        let state = self.state.lock();
        let proxies: Vec<ProxyStat> = state
            .records
            .iter()
            .map(|r| ProxyStat {
                proxy: r.address.masked().to_string(),
                success: r.success_count,
                failures: r.failure_count,
                consecutive_failures: r.consecutive_failures,
                health: r.health(now),
                last_used: r.last_used,
                last_success: r.last_success,
            })
            .collect();

        PoolStats {
            enabled: self.enabled,
            total: proxies.len(),
            healthy: proxies.iter().filter(|p| p.health.is_healthy()).count(),
            in_cooldown: proxies
                .iter()
                .filter(|p| p.health == ProxyHealth::CoolingDown)
                .count(),
            proxies,
        }
    }
}
