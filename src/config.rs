use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::backoff::JitterWindow;
use crate::error::{HarvestError, Result};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Egress proxy pool configuration
    pub pool: PoolConfig,
    /// Circuit breaker configuration
    pub breaker: BreakerConfig,
    /// Retry/backoff configuration
    pub retry: RetryConfig,
    /// Identity rotation configuration
    pub identity: IdentityConfig,
    /// Batch scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Harvester binary configuration
    pub harvest: HarvestConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Use the proxy pool at all (default: true)
    pub enabled: bool,
    /// Raw egress entries, `host:port[:user:pass]` or full proxy URLs
    pub raw_proxies: Vec<String>,
    /// Abort startup when the pool ends up empty
    pub required: bool,
    /// Cooldown applied after the third strike
    pub cooldown: Duration,
    /// Hand out the soonest-recovering proxy when every proxy is cooling down
    pub force_when_exhausted: bool,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failure threshold while a proxy pool is active (default: 20)
    pub threshold_with_proxies: u32,
    /// Failure threshold on a single direct IP (default: 10)
    pub threshold_no_proxies: u32,
    /// Time spent OPEN before a trial request is admitted
    pub open_duration: Duration,
}

impl BreakerConfig {
    pub fn threshold(&self, pool_active: bool) -> u32 {
        if pool_active {
            self.threshold_with_proxies
        } else {
            self.threshold_no_proxies
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per logical request (default: 3)
    pub max_attempts: u32,
    /// 429 backoff unit with / without proxies
    pub rate_limit_unit_with_proxies: Duration,
    pub rate_limit_unit_no_proxies: Duration,
    /// 403 backoff unit with / without proxies
    pub forbidden_unit_with_proxies: Duration,
    pub forbidden_unit_no_proxies: Duration,
    /// Fixed backoff after other HTTP errors and transport failures
    pub error_backoff: Duration,
    /// Pre-request jitter window
    pub request_delay: JitterWindow,
    /// Timeout applied to every request
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Completed operations between identity rotations (default: 15)
    pub rotate_every: u64,
    /// Rotate immediately after a 403
    pub rotate_on_forbidden: bool,
    /// Page fetched after a new session is built
    pub warmup_url: Option<String>,
    /// Timeout for the warmup request
    pub warmup_timeout: Duration,
    /// Pause after the warmup request
    pub warmup_pause: JitterWindow,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Operations dispatched per batch (default: 25)
    pub batch_size: usize,
    /// Pause between batches
    pub batch_pause: JitterWindow,
    /// Global cap on in-flight requests across all families
    pub max_global_requests: usize,
    /// Per-family caps, `family=limit` pairs
    pub family_limits: HashMap<String, usize>,
    /// Cap for families without an explicit entry
    pub default_family_limit: usize,
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Operation family the binary harvests (selects the family cap)
    pub family: String,
    /// API name reported in schema-drift alerts
    pub api_name: String,
    /// Endpoint URL with a `{target}` placeholder
    pub url_template: String,
    /// Optional JSON body with a `{target}` placeholder; switches to POST
    pub body_template: Option<String>,
    /// JSON pointers that must be present in a valid response
    pub required_fields: Vec<String>,
    /// Newline-separated target list
    pub targets_file: PathBuf,
    /// Failed-target ledger
    pub failed_file: PathBuf,
    /// JSON-lines result sink
    pub output_file: PathBuf,
    /// Re-run the targets listed in the failed ledger
    pub retry_failed: bool,
    /// Known-good target executed before the run
    pub preflight_target: Option<String>,
    /// URL used to check each proxy before the run
    pub proxy_warmup_url: Option<String>,
    /// Concurrent proxy checks during warmup
    pub proxy_warmup_workers: usize,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config {
            pool: PoolConfig {
                enabled: parse_env("USE_PROXIES", "true")?,
                raw_proxies: split_list(&get_env_or("RESIDENTIAL_PROXIES", "")),
                required: parse_env("PROXIES_REQUIRED", "false")?,
                cooldown: parse_secs("PROXY_COOLDOWN_SECS", "60")?,
                force_when_exhausted: parse_env("PROXY_FORCE_WHEN_EXHAUSTED", "true")?,
            },
            breaker: BreakerConfig {
                threshold_with_proxies: parse_env("CIRCUIT_BREAKER_WITH_PROXIES", "20")?,
                threshold_no_proxies: parse_env("CIRCUIT_BREAKER_NO_PROXIES", "10")?,
                open_duration: parse_secs("CIRCUIT_OPEN_DURATION", "60")?,
            },
            retry: RetryConfig {
                max_attempts: parse_env("MAX_RETRIES", "3")?,
                rate_limit_unit_with_proxies: parse_secs("RATE_LIMIT_BACKOFF_WITH_PROXIES", "5")?,
                rate_limit_unit_no_proxies: parse_secs("RATE_LIMIT_BACKOFF_NO_PROXIES", "15")?,
                forbidden_unit_with_proxies: parse_secs("FORBIDDEN_BACKOFF_WITH_PROXIES", "10")?,
                forbidden_unit_no_proxies: parse_secs("FORBIDDEN_BACKOFF_NO_PROXIES", "30")?,
                error_backoff: parse_secs("ERROR_BACKOFF_SECS", "3")?,
                request_delay: parse_window("REQUEST_DELAY_MIN", "0.3", "REQUEST_DELAY_MAX", "0.8")?,
                request_timeout: parse_secs("REQUEST_TIMEOUT_SECS", "30")?,
            },
            identity: IdentityConfig {
                rotate_every: parse_env("ROTATE_IDENTITY_EVERY", "15")?,
                rotate_on_forbidden: parse_env("ROTATE_ON_FORBIDDEN", "true")?,
                warmup_url: get_env_opt("IDENTITY_WARMUP_URL"),
                warmup_timeout: parse_secs("IDENTITY_WARMUP_TIMEOUT_SECS", "15")?,
                warmup_pause: parse_window(
                    "IDENTITY_WARMUP_PAUSE_MIN",
                    "1.0",
                    "IDENTITY_WARMUP_PAUSE_MAX",
                    "2.0",
                )?,
            },
            scheduler: SchedulerConfig {
                batch_size: parse_env("BREAK_AFTER_BATCH", "25")?,
                batch_pause: parse_window("BREAK_DURATION_MIN", "3.0", "BREAK_DURATION_MAX", "8.0")?,
                max_global_requests: parse_env("MAX_GLOBAL_REQUESTS", "20")?,
                family_limits: parse_family_limits(&get_env_or("FAMILY_LIMITS", ""))?,
                default_family_limit: parse_env("DEFAULT_FAMILY_LIMIT", "10")?,
            },
            harvest: HarvestConfig {
                family: get_env_or("HARVEST_FAMILY", "wallet_stats"),
                api_name: get_env_or("HARVEST_API_NAME", "wallet-analytics"),
                url_template: get_env_or("HARVEST_URL_TEMPLATE", ""),
                body_template: get_env_opt("HARVEST_BODY_TEMPLATE"),
                required_fields: split_list(&get_env_or("HARVEST_REQUIRED_FIELDS", "")),
                targets_file: PathBuf::from(get_env_or("HARVEST_TARGETS_FILE", "targets.txt")),
                failed_file: PathBuf::from(get_env_or("HARVEST_FAILED_FILE", "failed_targets.txt")),
                output_file: PathBuf::from(get_env_or("HARVEST_OUTPUT_FILE", "results.jsonl")),
                retry_failed: parse_env("HARVEST_RETRY_FAILED", "false")?,
                preflight_target: get_env_opt("HARVEST_PREFLIGHT_TARGET"),
                proxy_warmup_url: get_env_opt("PROXY_WARMUP_URL"),
                proxy_warmup_workers: parse_env("PROXY_WARMUP_WORKERS", "10")?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(HarvestError::InvalidConfig(
                "MAX_RETRIES must be at least 1".into(),
            ));
        }
        if self.scheduler.batch_size == 0 {
            return Err(HarvestError::InvalidConfig(
                "BREAK_AFTER_BATCH must be at least 1".into(),
            ));
        }
        if self.scheduler.max_global_requests == 0 || self.scheduler.default_family_limit == 0 {
            return Err(HarvestError::InvalidConfig(
                "concurrency limits must be at least 1".into(),
            ));
        }
        if self.identity.rotate_every == 0 {
            return Err(HarvestError::InvalidConfig(
                "ROTATE_IDENTITY_EVERY must be at least 1".into(),
            ));
        }
        if self.breaker.threshold_with_proxies == 0 || self.breaker.threshold_no_proxies == 0 {
            return Err(HarvestError::InvalidConfig(
                "circuit breaker thresholds must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Parse `family=limit` pairs separated by commas
fn parse_family_limits(raw: &str) -> Result<HashMap<String, usize>> {
    let mut limits = HashMap::new();
    for entry in split_list(raw) {
        let (family, limit) = entry.split_once('=').ok_or_else(|| {
            HarvestError::InvalidConfig(format!(
                "FAMILY_LIMITS entry '{}' must look like family=limit",
                entry
            ))
        })?;
        let limit: usize = limit.trim().parse().map_err(|_| {
            HarvestError::InvalidConfig(format!(
                "FAMILY_LIMITS limit for '{}' must be a positive number",
                family.trim()
            ))
        })?;
        if limit == 0 {
            return Err(HarvestError::InvalidConfig(format!(
                "FAMILY_LIMITS limit for '{}' must be at least 1",
                family.trim()
            )));
        }
        limits.insert(family.trim().to_string(), limit);
    }
    Ok(limits)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| HarvestError::InvalidConfig(format!("{} has an invalid value", key)))
}

fn parse_secs(key: &str, default: &str) -> Result<Duration> {
    let secs: f64 = parse_env(key, default)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(HarvestError::InvalidConfig(format!(
            "{} must be a non-negative number of seconds",
            key
        )));
    }
    // Millisecond resolution keeps decimal inputs like 0.3 exact
    Ok(Duration::from_millis((secs * 1000.0).round() as u64))
}

fn parse_window(
    min_key: &str,
    min_default: &str,
    max_key: &str,
    max_default: &str,
) -> Result<JitterWindow> {
    let min = parse_secs(min_key, min_default)?;
    let max = parse_secs(max_key, max_default)?;
    JitterWindow::new(min, max).ok_or_else(|| {
        HarvestError::InvalidConfig(format!("{} must not exceed {}", min_key, max_key))
    })
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Env isolation shared by tests that load [`Config`]
#[cfg(test)]
pub(crate) mod test_env {
    use std::env;
    use std::sync::Mutex;

    pub(crate) static ENV_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) const CONFIG_ENV_KEYS: &[&str] = &[
        "USE_PROXIES",
        "RESIDENTIAL_PROXIES",
        "PROXIES_REQUIRED",
        "PROXY_COOLDOWN_SECS",
        "PROXY_FORCE_WHEN_EXHAUSTED",
        "CIRCUIT_BREAKER_WITH_PROXIES",
        "CIRCUIT_BREAKER_NO_PROXIES",
        "CIRCUIT_OPEN_DURATION",
        "MAX_RETRIES",
        "RATE_LIMIT_BACKOFF_WITH_PROXIES",
        "RATE_LIMIT_BACKOFF_NO_PROXIES",
        "FORBIDDEN_BACKOFF_WITH_PROXIES",
        "FORBIDDEN_BACKOFF_NO_PROXIES",
        "ERROR_BACKOFF_SECS",
        "REQUEST_DELAY_MIN",
        "REQUEST_DELAY_MAX",
        "REQUEST_TIMEOUT_SECS",
        "ROTATE_IDENTITY_EVERY",
        "ROTATE_ON_FORBIDDEN",
        "IDENTITY_WARMUP_URL",
        "IDENTITY_WARMUP_TIMEOUT_SECS",
        "IDENTITY_WARMUP_PAUSE_MIN",
        "IDENTITY_WARMUP_PAUSE_MAX",
        "BREAK_AFTER_BATCH",
        "BREAK_DURATION_MIN",
        "BREAK_DURATION_MAX",
        "MAX_GLOBAL_REQUESTS",
        "FAMILY_LIMITS",
        "DEFAULT_FAMILY_LIMIT",
        "HARVEST_FAMILY",
        "HARVEST_API_NAME",
        "HARVEST_URL_TEMPLATE",
        "HARVEST_BODY_TEMPLATE",
        "HARVEST_REQUIRED_FIELDS",
        "HARVEST_TARGETS_FILE",
        "HARVEST_FAILED_FILE",
        "HARVEST_OUTPUT_FILE",
        "HARVEST_RETRY_FAILED",
        "HARVEST_PREFLIGHT_TARGET",
        "PROXY_WARMUP_URL",
        "PROXY_WARMUP_WORKERS",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    pub(crate) struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        pub(crate) fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
