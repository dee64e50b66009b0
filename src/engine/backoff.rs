//! Backoff and jitter policy for the retry loop

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Closed interval `[min, max]` sampled uniformly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterWindow {
    min: Duration,
    max: Duration,
}

impl JitterWindow {
    /// Returns `None` when `min > max`
    pub fn new(min: Duration, max: Duration) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    pub fn fixed(value: Duration) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let lo = u64::try_from(self.min.as_nanos()).unwrap_or(u64::MAX);
        let hi = u64::try_from(self.max.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::thread_rng().gen_range(lo..=hi))
    }
}

/// Wait durations applied between attempts
///
/// The rate-limit and forbidden units depend on whether requests leave
/// through a proxy pool: a single direct IP backs off harder.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    rate_limit_unit: Duration,
    forbidden_unit: Duration,
    error_backoff: Duration,
    request_delay: JitterWindow,
}

impl BackoffPolicy {
    pub fn new(
        rate_limit_unit: Duration,
        forbidden_unit: Duration,
        error_backoff: Duration,
        request_delay: JitterWindow,
    ) -> Self {
        Self {
            rate_limit_unit,
            forbidden_unit,
            error_backoff,
            request_delay,
        }
    }

    /// Pick the units matching the egress mode
    pub fn from_config(config: &RetryConfig, pool_active: bool) -> Self {
        let (rate_limit_unit, forbidden_unit) = if pool_active {
            (
                config.rate_limit_unit_with_proxies,
                config.forbidden_unit_with_proxies,
            )
        } else {
            (
                config.rate_limit_unit_no_proxies,
                config.forbidden_unit_no_proxies,
            )
        };
        Self::new(
            rate_limit_unit,
            forbidden_unit,
            config.error_backoff,
            config.request_delay,
        )
    }

    /// `(attempt + 1) * unit` for a 429 on zero-based `attempt`
    pub fn rate_limited(&self, attempt: u32) -> Duration {
        self.rate_limit_unit.saturating_mul(attempt.saturating_add(1))
    }

    /// `(attempt + 1) * unit` for a 403 on zero-based `attempt`
    pub fn forbidden(&self, attempt: u32) -> Duration {
        self.forbidden_unit.saturating_mul(attempt.saturating_add(1))
    }

    pub fn error(&self) -> Duration {
        self.error_backoff
    }

    pub fn request_delay(&self) -> Duration {
        self.request_delay.sample()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(3),
            JitterWindow::new(Duration::from_millis(300), Duration::from_millis(800)).unwrap(),
        )
    }

    #[test]
    fn test_rate_limit_backoff_grows_linearly() {
        let policy = policy();
        assert_eq!(policy.rate_limited(0), Duration::from_secs(5));
        assert_eq!(policy.rate_limited(1), Duration::from_secs(10));
        assert_eq!(policy.rate_limited(2), Duration::from_secs(15));
    }

    #[test]
    fn test_forbidden_backoff_grows_linearly() {
        let policy = policy();
        assert_eq!(policy.forbidden(0), Duration::from_secs(10));
        assert_eq!(policy.forbidden(2), Duration::from_secs(30));
        assert_eq!(policy.error(), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_window_samples_within_bounds() {
        let window =
            JitterWindow::new(Duration::from_millis(300), Duration::from_millis(800)).unwrap();
        for _ in 0..200 {
            let d = window.sample();
            assert!(d >= Duration::from_millis(300));
            assert!(d <= Duration::from_millis(800));
        }
    }

    #[test]
    fn test_jitter_window_rejects_inverted_bounds() {
        assert!(JitterWindow::new(Duration::from_secs(2), Duration::from_secs(1)).is_none());
        assert_eq!(
            JitterWindow::fixed(Duration::from_secs(1)).sample(),
            Duration::from_secs(1)
        );
    }
}
