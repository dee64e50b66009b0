use chrono::{DateTime, Utc};
use serde::Serialize;

/// Unexpected-shape event raised when a 2xx body fails validation
#[derive(Debug, Clone, Serialize)]
pub struct ApiAlert {
    pub api: String,
    pub message: String,
    pub expected: Option<String>,
    pub got: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ApiAlert {
    pub fn new(api: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            api: api.into(),
            message: message.into(),
            expected: None,
            got: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_shape(mut self, expected: Option<String>, got: Option<String>) -> Self {
        self.expected = expected;
        self.got = got;
        self
    }
}
