//! Detection of retryable failures in the external tool's output

use crate::config::SupervisorConfig;
use crate::error::{Result, StudioError};
use crate::process::OutputStream;
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    None,
    /// The tool reported an authentication failure; `signature` is the matched text
    Unauthorized { signature: String },
    /// The tool does not understand the credential helper flag
    EnhancedModeRejected,
}

pub struct FailureClassifier {
    auth: Regex,
    rejection: Regex,
}

impl FailureClassifier {
    pub fn new(auth_pattern: &str, rejection_pattern: &str) -> Result<Self> {
        let auth = Regex::new(auth_pattern).map_err(|source| StudioError::InvalidPattern {
            name: "auth failure",
            source,
        })?;
        let rejection =
            Regex::new(rejection_pattern).map_err(|source| StudioError::InvalidPattern {
                name: "enhanced rejection",
                source,
            })?;
        Ok(Self { auth, rejection })
    }

    pub fn from_config(config: &SupervisorConfig) -> Result<Self> {
        Self::new(
            &config.auth_failure_pattern,
            &config.enhanced_rejection_pattern,
        )
    }

    /// Classify one output line read from `stream`.
    ///
    /// Structured records are only inspected when they are error records, so an
    /// assistant message that merely mentions "401" never triggers a retry.
    /// Plain stdout is agent progress and is never treated as an auth failure.
    pub fn classify(&self, stream: OutputStream, line: &str) -> FailureKind {
        let line = line.trim();
        if line.is_empty() {
            return FailureKind::None;
        }

        let structured = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(record)) if record.get("type").and_then(Value::as_str).is_some() => {
                if !is_error_record(&record) {
                    return FailureKind::None;
                }
                true
            }
            _ => false,
        };

        if self.rejection.is_match(line) {
            return FailureKind::EnhancedModeRejected;
        }
        if !structured && stream == OutputStream::Stdout {
            return FailureKind::None;
        }
        match self.auth.find(line) {
            Some(m) => FailureKind::Unauthorized {
                signature: m.as_str().to_string(),
            },
            None => FailureKind::None,
        }
    }
}

fn is_error_record(record: &serde_json::Map<String, Value>) -> bool {
    match record.get("type").and_then(Value::as_str) {
        Some("error") => true,
        Some("result") => {
            record.get("is_error").and_then(Value::as_bool).unwrap_or(false)
                || record
                    .get("subtype")
                    .and_then(Value::as_str)
                    .map(|s| s.starts_with("error"))
                    .unwrap_or(false)
        }
        _ => false,
    }
}
