//! Failed-target ledger
//!
//! Plain-text file of `target,REASON` lines. Comment lines (`#`) are kept
//! verbatim at the top, entries are written sorted, and a newer reason for
//! the same target replaces the older one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{info, warn};

use crate::error::Result;

const HEADER: &[&str] = &[
    "# FAILED TARGETS",
    "# Format: target,error_reason",
    "# Retried with HARVEST_RETRY_FAILED=true",
];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Ledger {
    comments: Vec<String>,
    entries: BTreeMap<String, String>,
}

impl Ledger {
    pub fn parse(content: &str) -> Self {
        let mut ledger = Ledger::default();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('#') {
                ledger.comments.push(line.trim_end().to_string());
                continue;
            }
            if let Some((target, reason)) = trimmed.split_once(',') {
                let target = target.trim();
                if !target.is_empty() {
                    ledger
                        .entries
                        .insert(target.to_string(), reason.trim().to_string());
                }
            }
        }
        ledger
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.comments.is_empty() {
            for line in HEADER {
                out.push_str(line);
                out.push('\n');
            }
        } else {
            for line in &self.comments {
                out.push_str(line);
                out.push('\n');
            }
        }
        for (target, reason) in &self.entries {
            out.push_str(target);
            out.push(',');
            out.push_str(reason);
            out.push('\n');
        }
        out
    }

    pub fn record(&mut self, target: impl Into<String>, reason: impl Into<String>) {
        self.entries.insert(target.into(), reason.into());
    }

    pub fn resolve(&mut self, target: &str) -> bool {
        self.entries.remove(target).is_some()
    }

    pub fn targets(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn reason(&self, target: &str) -> Option<&str> {
        self.entries.get(target).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// File-backed ledger
pub struct FailedTargets {
    path: PathBuf,
}

impl FailedTargets {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file reads as an empty ledger
    pub async fn load(&self) -> Result<Ledger> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Ledger::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Ledger::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Merge this run's failures and drop targets that now succeeded
    pub async fn merge(&self, failures: &[(String, String)], resolved: &[String]) -> Result<Ledger> {
        let mut ledger = self.load().await?;
        if failures.is_empty() && resolved.is_empty() {
            return Ok(ledger);
        }

        let mut cleared = 0;
        for target in resolved {
            if ledger.resolve(target) {
                cleared += 1;
            }
        }
        for (target, reason) in failures {
            ledger.record(target.clone(), reason.clone());
        }

        fs::write(&self.path, ledger.render()).await?;
        if !failures.is_empty() {
            warn!(
                new = failures.len(),
                tracked = ledger.len(),
                path = %self.path.display(),
                "Failed targets updated"
            );
        }
        if cleared > 0 {
            info!(cleared, "Cleared recovered targets from the failed ledger");
        }
        Ok(ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("harvest-{}-{}", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_parse_skips_comments_and_junk() {
        let ledger = Ledger::parse("# header\nabc,HTTP_400\n\nnot-a-record\n def , CONNECTION_FAILED \n");
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.reason("def"), Some("CONNECTION_FAILED"));
        assert_eq!(ledger.comments, vec!["# header".to_string()]);
    }

    #[test]
    fn test_render_writes_header_when_new() {
        let mut ledger = Ledger::default();
        ledger.record("zzz", "HTTP_400");
        ledger.record("aaa", "CONNECTION_FAILED");
        let rendered = ledger.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert!(lines[0].starts_with('#'));
        assert_eq!(&lines[HEADER.len()..], &["aaa,CONNECTION_FAILED", "zzz,HTTP_400"]);
    }

    #[tokio::test]
    async fn test_merge_preserves_comments_and_newest_reason_wins() {
        let path = temp_path("ledger");
        fs::write(&path, "# my notes\nbbb,HTTP_400\nccc,CONNECTION_FAILED\n")
            .await
            .unwrap();
        let ledger_file = FailedTargets::new(&path);

        let failures = vec![
            ("bbb".to_string(), "CONNECTION_FAILED".to_string()),
            ("aaa".to_string(), "HTTP_400".to_string()),
        ];
        ledger_file.merge(&failures, &["ccc".to_string()]).await.unwrap();

        let content = fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "# my notes\naaa,HTTP_400\nbbb,CONNECTION_FAILED\n");
        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let ledger = FailedTargets::new(temp_path("missing")).load().await.unwrap();
        assert!(ledger.is_empty());
    }
}
