use parking_lot::Mutex;
use tracing::warn;

use crate::models::ApiAlert;

/// Write-only channel for unexpected-shape events
pub trait AlertSink: Send + Sync {
    fn alert(&self, alert: ApiAlert);
}

/// Logs every alert and keeps it for the session summary
#[derive(Default)]
pub struct AlertLog {
    alerts: Mutex<Vec<ApiAlert>>,
}

impl AlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<ApiAlert> {
        self.alerts.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AlertSink for AlertLog {
    fn alert(&self, alert: ApiAlert) {
        warn!(
            target: "api_alert",
            api = %alert.api,
            expected = alert.expected.as_deref().unwrap_or("-"),
            got = alert.got.as_deref().unwrap_or("-"),
            "{}",
            alert.message
        );
        self.alerts.lock().push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_log_keeps_events() {
        let log = AlertLog::new();
        assert!(log.is_empty());

        log.alert(ApiAlert::new("token-analytics", "missing 'data'"));
        log.alert(
            ApiAlert::new("token-analytics", "'list' is not an array")
                .with_shape(Some("array".into()), Some("object".into())),
        );

        let alerts = log.snapshot();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[1].expected.as_deref(), Some("array"));
    }
}
