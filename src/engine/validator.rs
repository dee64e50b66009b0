//! Response validation hook
//!
//! The engine never interprets response bodies itself; a [`Validator`] tells
//! it whether a 2xx body has the shape the caller expects.

use serde_json::Value;

use crate::error::{HarvestError, Result};

/// Verdict on one response body
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub data: Option<Value>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub expected: Option<String>,
    pub got: Option<String>,
}

impl ValidationResult {
    pub fn valid(data: Value) -> Self {
        Self {
            valid: true,
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_shape(mut self, expected: impl Into<String>, got: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.got = Some(got.into());
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}

/// Pure, infallible shape check
pub trait Validator: Send + Sync {
    /// Name reported in alerts
    fn api_name(&self) -> &str;

    fn validate(&self, body: &Value) -> ValidationResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl JsonKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonKind::Null,
            Value::Bool(_) => JsonKind::Bool,
            Value::Number(_) => JsonKind::Number,
            Value::String(_) => JsonKind::String,
            Value::Array(_) => JsonKind::Array,
            Value::Object(_) => JsonKind::Object,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JsonKind::Null => "null",
            JsonKind::Bool => "bool",
            JsonKind::Number => "number",
            JsonKind::String => "string",
            JsonKind::Array => "array",
            JsonKind::Object => "object",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "null" => Some(JsonKind::Null),
            "bool" | "boolean" => Some(JsonKind::Bool),
            "number" => Some(JsonKind::Number),
            "string" | "str" => Some(JsonKind::String),
            "array" | "list" => Some(JsonKind::Array),
            "object" | "dict" => Some(JsonKind::Object),
            _ => None,
        }
    }
}

/// One JSON-pointer rule: `[?]/path/to/field[:kind]`
///
/// A leading `?` makes the rule advisory: violations become warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    pub pointer: String,
    pub kind: Option<JsonKind>,
    pub optional: bool,
}

impl FieldRule {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (optional, raw) = match raw.strip_prefix('?') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let (pointer, kind) = match raw.rsplit_once(':') {
            Some((pointer, kind)) => {
                let kind = JsonKind::from_str(kind).ok_or_else(|| {
                    HarvestError::InvalidConfig(format!("unknown JSON kind '{}' in field rule", kind))
                })?;
                (pointer, Some(kind))
            }
            None => (raw, None),
        };
        if !pointer.starts_with('/') {
            return Err(HarvestError::InvalidConfig(format!(
                "field rule '{}' must be a JSON pointer starting with '/'",
                pointer
            )));
        }
        Ok(Self {
            pointer: pointer.to_string(),
            kind,
            optional,
        })
    }

    /// `None` when the rule holds, otherwise (message, expected, got)
    fn check(&self, body: &Value) -> Option<(String, String, String)> {
        let expected = self.kind.map(|k| k.as_str()).unwrap_or("present");
        match body.pointer(&self.pointer) {
            None => Some((
                format!("missing '{}'", self.pointer),
                expected.to_string(),
                "missing".to_string(),
            )),
            Some(value) => {
                let actual = JsonKind::of(value);
                match self.kind {
                    Some(kind) if kind != actual => Some((
                        format!("'{}' is {} instead of {}", self.pointer, actual.as_str(), kind.as_str()),
                        kind.as_str().to_string(),
                        actual.as_str().to_string(),
                    )),
                    _ => None,
                }
            }
        }
    }
}

/// Checks a list of JSON-pointer rules against the body
pub struct RequiredFieldsValidator {
    api: String,
    rules: Vec<FieldRule>,
}

impl RequiredFieldsValidator {
    pub fn new(api: impl Into<String>, rules: Vec<FieldRule>) -> Self {
        Self {
            api: api.into(),
            rules,
        }
    }

    pub fn from_specs(api: impl Into<String>, specs: &[String]) -> Result<Self> {
        let rules = specs
            .iter()
            .map(|s| FieldRule::parse(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(api, rules))
    }
}

impl Validator for RequiredFieldsValidator {
    fn api_name(&self) -> &str {
        &self.api
    }

    fn validate(&self, body: &Value) -> ValidationResult {
        let mut warnings = Vec::new();

        for rule in &self.rules {
            let Some((message, expected, got)) = rule.check(body) else {
                if let Some(Value::Array(items)) = body.pointer(&rule.pointer) {
                    if items.is_empty() {
                        warnings.push(format!("'{}' is empty", rule.pointer));
                    }
                }
                continue;
            };

            if rule.optional {
                warnings.push(message);
            } else {
                return ValidationResult::invalid(message)
                    .with_shape(expected, got)
                    .with_warnings(warnings);
            }
        }

        ValidationResult::valid(body.clone()).with_warnings(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator(specs: &[&str]) -> RequiredFieldsValidator {
        let specs: Vec<String> = specs.iter().map(|s| s.to_string()).collect();
        RequiredFieldsValidator::from_specs("wallet-analytics", &specs).unwrap()
    }

    #[test]
    fn test_field_rule_parse() {
        let rule = FieldRule::parse("?/data/list:array").unwrap();
        assert!(rule.optional);
        assert_eq!(rule.pointer, "/data/list");
        assert_eq!(rule.kind, Some(JsonKind::Array));

        let rule = FieldRule::parse("/code").unwrap();
        assert!(!rule.optional);
        assert_eq!(rule.kind, None);

        assert!(FieldRule::parse("code").is_err());
        assert!(FieldRule::parse("/code:integerish").is_err());
    }

    #[test]
    fn test_valid_body_passes() {
        let v = validator(&["/code:number", "/data/list:array"]);
        let result = v.validate(&json!({"code": 0, "data": {"list": [{"address": "x"}]}}));
        assert!(result.valid);
        assert!(result.warnings.is_empty());
        assert!(result.data.is_some());
    }

    #[test]
    fn test_missing_field_is_invalid_with_shape() {
        let v = validator(&["/code", "/data/list:array"]);
        let result = v.validate(&json!({"code": 0, "data": {"holders": []}}));
        assert!(!result.valid);
        assert_eq!(result.expected.as_deref(), Some("array"));
        assert_eq!(result.got.as_deref(), Some("missing"));
    }

    #[test]
    fn test_kind_mismatch_is_invalid() {
        let v = validator(&["/data:object"]);
        let result = v.validate(&json!({"data": []}));
        assert!(!result.valid);
        assert_eq!(result.got.as_deref(), Some("array"));
    }

    #[test]
    fn test_optional_rules_and_empty_arrays_warn() {
        let v = validator(&["/data/list:array", "?/data/symbol:string"]);
        let result = v.validate(&json!({"data": {"list": []}}));
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 2);
    }
}
