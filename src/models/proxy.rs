use chrono::{DateTime, Utc};
use serde::Serialize;

/// Index of a record in the proxy pool arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ProxyId(pub usize);

impl std::fmt::Display for ProxyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Health classification of a proxy at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyHealth {
    Healthy,
    /// Inside an unexpired cooldown window
    CoolingDown,
    /// Too many consecutive failures without an active cooldown
    Degraded,
}

impl ProxyHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyHealth::Healthy => "healthy",
            ProxyHealth::CoolingDown => "cooling_down",
            ProxyHealth::Degraded => "degraded",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, ProxyHealth::Healthy)
    }
}

impl std::fmt::Display for ProxyHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-proxy snapshot; the address is always masked
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStat {
    pub proxy: String,
    pub success: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub health: ProxyHealth,
    pub last_used: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

impl ProxyStat {
    /// Fraction of successful requests; 1.0 for an unused proxy
    pub fn success_rate(&self) -> f64 {
        let total = self.success + self.failures;
        if total == 0 {
            1.0
        } else {
            self.success as f64 / total as f64
        }
    }
}

/// Pool-wide snapshot used by the session summary
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub enabled: bool,
    pub total: usize,
    pub healthy: usize,
    pub in_cooldown: usize,
    pub proxies: Vec<ProxyStat>,
}

impl PoolStats {
    pub fn healthy_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.healthy as f64 / self.total as f64
        }
    }
}
