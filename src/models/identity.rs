use serde::Serialize;

/// Browser identity presented to the upstream API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_agent: String,
    /// Client fingerprint tag, e.g. `chrome120`; drives the client-hint headers
    pub fingerprint: String,
}

impl Identity {
    pub fn new(user_agent: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            fingerprint: fingerprint.into(),
        }
    }

    /// Value for the `Sec-Ch-Ua-Platform` header
    pub fn platform(&self) -> &'static str {
        if self.user_agent.contains("Mac") {
            "\"macOS\""
        } else if self.user_agent.contains("Linux") {
            "\"Linux\""
        } else {
            "\"Windows\""
        }
    }

    /// `Sec-Ch-Ua` brand list for a `chrome<major>` fingerprint tag
    pub fn client_hints(&self) -> Option<String> {
        let major: u32 = self.fingerprint.strip_prefix("chrome")?.parse().ok()?;
        let brand = if self.user_agent.contains("Edg/") {
            "Microsoft Edge"
        } else {
            "Google Chrome"
        };
        Some(format!(
            "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"{major}\", \"{brand}\";v=\"{major}\""
        ))
    }
}

/// Built-in rotation pool
pub fn default_identities() -> Vec<Identity> {
    vec![
        Identity::new(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            "chrome120",
        ),
        Identity::new(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
            "chrome119",
        ),
        Identity::new(
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/116.0.0.0 Safari/537.36",
            "chrome116",
        ),
        Identity::new(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
            "chrome120",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_identities_are_distinct() {
        let ids = default_identities();
        assert_eq!(ids.len(), 4);
        for (i, a) in ids.iter().enumerate() {
            for b in ids.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_platform_hint() {
        let ids = default_identities();
        assert_eq!(ids[0].platform(), "\"macOS\"");
        assert_eq!(ids[1].platform(), "\"Windows\"");
        assert_eq!(ids[2].platform(), "\"Linux\"");
    }

    #[test]
    fn test_client_hints_follow_fingerprint() {
        let ids = default_identities();
        assert_eq!(
            ids[1].client_hints().as_deref(),
            Some("\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"119\", \"Google Chrome\";v=\"119\"")
        );
        assert!(ids[3].client_hints().unwrap().contains("\"Microsoft Edge\";v=\"120\""));
        assert_eq!(Identity::new("curl/8.0", "curl").client_hints(), None);
    }
}
