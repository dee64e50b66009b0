use serde::Serialize;
use serde_json::Value;

/// Why the last retryable attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    RateLimited,
    Forbidden,
    HttpStatus(u16),
    Timeout,
    Transport(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::RateLimited => write!(f, "rate limited (429)"),
            FailureReason::Forbidden => write!(f, "forbidden (403)"),
            FailureReason::HttpStatus(status) => write!(f, "HTTP {}", status),
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

/// Final result of one logical request, delivered exactly once
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success { data: Value, warnings: Vec<String> },
    /// 400 from upstream; the input is malformed and never retried
    BadRequest,
    /// 2xx whose body failed validation
    SchemaDrift { reason: String },
    Exhausted { attempts: u32, last_failure: FailureReason },
    /// Rejected by an open circuit without touching the network
    CircuitOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    BadRequest,
    SchemaDrift,
    Exhausted,
    CircuitOpen,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::BadRequest => "bad_request",
            OutcomeKind::SchemaDrift => "schema_drift",
            OutcomeKind::Exhausted => "exhausted",
            OutcomeKind::CircuitOpen => "circuit_open",
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Success { .. } => OutcomeKind::Success,
            Outcome::BadRequest => OutcomeKind::BadRequest,
            Outcome::SchemaDrift { .. } => OutcomeKind::SchemaDrift,
            Outcome::Exhausted { .. } => OutcomeKind::Exhausted,
            Outcome::CircuitOpen => OutcomeKind::CircuitOpen,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// Reason recorded in the failed-target ledger, if this outcome belongs there
    pub fn ledger_reason(&self) -> Option<&'static str> {
        match self {
            Outcome::BadRequest => Some("HTTP_400"),
            Outcome::Exhausted { .. } => Some("CONNECTION_FAILED"),
            // Never sent; retried on the next ledger run
            Outcome::CircuitOpen => Some("CIRCUIT_OPEN"),
            Outcome::Success { .. } | Outcome::SchemaDrift { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ledger_reasons() {
        assert_eq!(Outcome::BadRequest.ledger_reason(), Some("HTTP_400"));
        let exhausted = Outcome::Exhausted {
            attempts: 3,
            last_failure: FailureReason::Timeout,
        };
        assert_eq!(exhausted.ledger_reason(), Some("CONNECTION_FAILED"));
        assert_eq!(Outcome::CircuitOpen.ledger_reason(), Some("CIRCUIT_OPEN"));
        assert_eq!(
            Outcome::SchemaDrift {
                reason: "missing field".into()
            }
            .ledger_reason(),
            None
        );
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let outcome = Outcome::Success {
            data: json!({"pnl": 1}),
            warnings: vec![],
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["outcome"], "success");
        assert_eq!(value["data"]["pnl"], 1);
        assert_eq!(outcome.kind().as_str(), "success");
    }
}
