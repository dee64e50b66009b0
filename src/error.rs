use thiserror::Error;

/// Unified error type for engine setup and harvester I/O.
///
/// Per-request failures never surface here: the retry orchestrator folds them
/// into an [`Outcome`](crate::models::Outcome).
#[derive(Error, Debug)]
pub enum HarvestError {
    // Proxy errors
    #[error("No proxies available")]
    NoProxiesAvailable,

    #[error("No healthy proxies after warmup ({total} checked)")]
    NoHealthyProxies { total: usize },

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Session errors
    #[error("Failed to build HTTP session: {0}")]
    SessionBuild(String),

    #[error("Preflight check failed: {0}")]
    PreflightFailed(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

impl HarvestError {
    /// Process exit code reported when this error aborts a run
    pub fn exit_code(&self) -> i32 {
        match self {
            HarvestError::InvalidConfig(_)
            | HarvestError::InvalidProxyAddress(_)
            | HarvestError::UnsupportedProtocol(_) => 2,

            HarvestError::NoProxiesAvailable | HarvestError::NoHealthyProxies { .. } => 3,

            HarvestError::PreflightFailed(_) => 4,

            HarvestError::SessionBuild(_) | HarvestError::Io(_) | HarvestError::Json(_) => 1,
        }
    }

    /// Check if this error comes from operator-provided configuration
    pub fn is_config_error(&self) -> bool {
        self.exit_code() == 2
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for HarvestError {
    fn from(err: url::ParseError) -> Self {
        HarvestError::InvalidProxyAddress(err.to_string())
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(err: reqwest::Error) -> Self {
        HarvestError::SessionBuild(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_exit_code_mapping() {
        assert_eq!(HarvestError::InvalidConfig("bad".to_string()).exit_code(), 2);
        assert_eq!(HarvestError::NoProxiesAvailable.exit_code(), 3);
        assert_eq!(HarvestError::NoHealthyProxies { total: 4 }.exit_code(), 3);
        assert_eq!(
            HarvestError::PreflightFailed("schema".to_string()).exit_code(),
            4
        );
        assert_eq!(HarvestError::SessionBuild("tls".to_string()).exit_code(), 1);
    }

    #[test]
    fn test_error_config_classification() {
        assert!(HarvestError::UnsupportedProtocol("ftp".to_string()).is_config_error());
        assert!(HarvestError::InvalidProxyAddress("x".to_string()).is_config_error());
        assert!(!HarvestError::NoProxiesAvailable.is_config_error());
    }

    #[test]
    fn test_url_parse_error_maps_to_invalid_proxy() {
        let err: HarvestError = url::Url::parse("not a url").unwrap_err().into();
        assert!(matches!(err, HarvestError::InvalidProxyAddress(_)));
    }
}
