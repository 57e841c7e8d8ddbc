//! Command requests handed to the pipeline by the agent loop.
//!
//! A request is built once with the `with_*` builder methods and then only
//! read. The pipeline consumes it exactly once.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ReceiptId, RequestId};

/// Upper bound accepted for a per-request timeout (24 hours)
pub const MAX_TIMEOUT_SECONDS: u64 = 24 * 60 * 60;

/// A request to run one shell command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Idempotency key for recording
    pub id: RequestId,

    /// Who is asking (agent name, user id, ...)
    pub requester: String,

    /// Shell command text
    pub command: String,

    /// Directory the command runs in
    pub working_dir: PathBuf,

    /// What the requester claims this command does or proves
    pub intent: String,

    /// Falsifiable expectations about the outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<ExpectedEvidence>,

    /// Wall-clock budget for the sandboxed command
    pub timeout_seconds: u64,

    /// Executor backend name (registry default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    /// Out-of-band approval for REQUIRE_APPROVAL rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_token: Option<String>,

    /// Prior receipt this re-execution supersedes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<ReceiptId>,

    /// When the caller created the request
    pub created_at: DateTime<Utc>,
}

impl CommandRequest {
    /// Create a request with a fresh id, the current directory, and a 60s timeout
    pub fn new(requester: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            requester: requester.into(),
            command: command.into(),
            working_dir: PathBuf::from("."),
            intent: String::new(),
            expected: None,
            timeout_seconds: 60,
            backend: None,
            approval_token: None,
            supersedes: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = intent.into();
        self
    }

    pub fn with_expected(mut self, expected: ExpectedEvidence) -> Self {
        self.expected = Some(expected);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_approval_token(mut self, token: impl Into<String>) -> Self {
        self.approval_token = Some(token.into());
        self
    }

    pub fn with_supersedes(mut self, receipt: ReceiptId) -> Self {
        self.supersedes = Some(receipt);
        self
    }

    /// Structural validation performed at intake
    pub fn check_well_formed(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("command is empty".to_string());
        }
        if self.command.contains('\0') {
            return Err("command contains a NUL byte".to_string());
        }
        if self.requester.trim().is_empty() {
            return Err("requester is empty".to_string());
        }
        if self.timeout_seconds == 0 {
            return Err("timeout must be at least one second".to_string());
        }
        if self.timeout_seconds > MAX_TIMEOUT_SECONDS {
            return Err(format!(
                "timeout {}s exceeds maximum {}s",
                self.timeout_seconds, MAX_TIMEOUT_SECONDS
            ));
        }
        if let Some(ref expected) = self.expected {
            expected.check_well_formed()?;
        }
        Ok(())
    }

    /// Whether the request declared anything falsifiable
    pub fn has_expectations(&self) -> bool {
        self.expected.as_ref().map(|e| !e.is_empty()).unwrap_or(false)
    }
}

/// Declared expectations the validation engine checks against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedEvidence {
    /// Exact exit code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Substring that must appear in stdout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_contains: Option<String>,

    /// Regex that must match somewhere in stdout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_pattern: Option<String>,

    /// Hex SHA-256 of the captured stdout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_sha256: Option<String>,

    /// File the command is expected to produce
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactExpectation>,
}

impl ExpectedEvidence {
    pub fn exit_code(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Default::default()
        }
    }

    pub fn stdout_contains(text: impl Into<String>) -> Self {
        Self {
            stdout_contains: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exit_code.is_none()
            && self.stdout_contains.is_none()
            && self.stdout_pattern.is_none()
            && self.stdout_sha256.is_none()
            && self.artifact.is_none()
    }

    fn check_well_formed(&self) -> Result<(), String> {
        if let Some(ref pattern) = self.stdout_pattern {
            regex::Regex::new(pattern).map_err(|e| format!("stdout_pattern: {}", e))?;
        }
        if let Some(ref hash) = self.stdout_sha256 {
            check_sha256_hex(hash).map_err(|e| format!("stdout_sha256: {}", e))?;
        }
        if let Some(ref artifact) = self.artifact {
            if artifact.path.as_os_str().is_empty() {
                return Err("artifact path is empty".to_string());
            }
            check_sha256_hex(&artifact.sha256).map_err(|e| format!("artifact sha256: {}", e))?;
        }
        Ok(())
    }
}

/// Expected output file and its content hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactExpectation {
    /// Relative paths resolve against the request's working directory
    pub path: PathBuf,

    /// Hex SHA-256 of the file content
    pub sha256: String,
}

fn check_sha256_hex(value: &str) -> Result<(), String> {
    if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("'{}' is not a 64-character hex digest", value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let request = CommandRequest::new("agent", "echo hi");
        assert_eq!(request.timeout_seconds, 60);
        assert_eq!(request.working_dir, PathBuf::from("."));
        assert!(!request.has_expectations());
        assert!(request.check_well_formed().is_ok());
    }

    #[test]
    fn test_empty_command_rejected() {
        let request = CommandRequest::new("agent", "   ");
        assert!(request.check_well_formed().is_err());
    }

    #[test]
    fn test_timeout_bounds() {
        let zero = CommandRequest::new("agent", "ls").with_timeout(0);
        assert!(zero.check_well_formed().is_err());

        let huge = CommandRequest::new("agent", "ls").with_timeout(MAX_TIMEOUT_SECONDS + 1);
        assert!(huge.check_well_formed().is_err());
    }

    #[test]
    fn test_malformed_hash_rejected() {
        let expected = ExpectedEvidence {
            stdout_sha256: Some("abc".to_string()),
            ..Default::default()
        };
        let request = CommandRequest::new("agent", "ls").with_expected(expected);
        let err = request.check_well_formed().unwrap_err();
        assert!(err.contains("stdout_sha256"));
    }

    #[test]
    fn test_uncompilable_pattern_rejected() {
        let expected = ExpectedEvidence {
            stdout_pattern: Some("(unclosed".to_string()),
            ..Default::default()
        };
        let request = CommandRequest::new("agent", "echo hello").with_expected(expected);
        let err = request.check_well_formed().unwrap_err();
        assert!(err.starts_with("stdout_pattern"), "{}", err);

        let request = CommandRequest::new("agent", "echo hello").with_expected(ExpectedEvidence {
            stdout_pattern: Some("^hel+o$".to_string()),
            ..Default::default()
        });
        assert!(request.check_well_formed().is_ok());
    }

    #[test]
    fn test_empty_expectations_are_not_expectations() {
        let request = CommandRequest::new("agent", "ls").with_expected(ExpectedEvidence::default());
        assert!(!request.has_expectations());

        let request = CommandRequest::new("agent", "ls").with_expected(ExpectedEvidence::exit_code(0));
        assert!(request.has_expectations());
    }
}
