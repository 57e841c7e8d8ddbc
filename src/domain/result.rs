//! Sandbox execution results.

use serde::{Deserialize, Serialize};

/// Exit code reported when the sandbox killed a command on timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Outcome of running one command in an executor
///
/// Produced once per executed request and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxResult {
    /// Process exit code, or [`TIMEOUT_EXIT_CODE`] on timeout
    pub exit_code: i32,

    /// Captured stdout, capped at the configured limit
    #[serde(with = "lossy_bytes")]
    pub stdout: Vec<u8>,

    /// Captured stderr, capped at the configured limit
    #[serde(with = "lossy_bytes")]
    pub stderr: Vec<u8>,

    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,

    /// Resource limits that were hit
    #[serde(default)]
    pub violations: Vec<LimitViolation>,

    /// Whether the sandbox terminated the command on timeout
    pub terminated_by_timeout: bool,

    /// Executor that produced this result ("local", "remote", ...)
    pub provider: String,
}

impl SandboxResult {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.terminated_by_timeout
    }

    pub fn output_truncated(&self) -> bool {
        self.violations
            .iter()
            .any(|v| matches!(v, LimitViolation::OutputTruncated { .. }))
    }
}

/// Which output stream a violation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A resource limit hit during execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LimitViolation {
    /// Command ran past its timeout and was killed
    Timeout { limit_seconds: u64 },

    /// Output beyond the cap was discarded
    OutputTruncated {
        stream: OutputStream,
        limit_bytes: u64,
        discarded_bytes: u64,
    },

    /// Killed by a signal while an advisory memory limit was set
    MemoryLimitSuspected { limit_bytes: u64, signal: i32 },
}

/// Raw output bytes travel as strings in JSON (lossy for non-UTF-8).
/// Exact bytes are stored separately as evidence.
mod lossy_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32) -> SandboxResult {
        SandboxResult {
            exit_code,
            stdout: b"hello\n".to_vec(),
            stderr: Vec::new(),
            duration_ms: 3,
            violations: Vec::new(),
            terminated_by_timeout: false,
            provider: "local".to_string(),
        }
    }

    #[test]
    fn test_success() {
        assert!(result(0).success());
        assert!(!result(1).success());
    }

    #[test]
    fn test_violation_serialization() {
        let violation = LimitViolation::OutputTruncated {
            stream: OutputStream::Stdout,
            limit_bytes: 10,
            discarded_bytes: 5,
        };
        let json = serde_json::to_value(&violation).unwrap();
        assert_eq!(json["kind"], "output_truncated");
        assert_eq!(json["stream"], "stdout");
    }

    #[test]
    fn test_output_serializes_as_text() {
        let json = serde_json::to_value(result(0)).unwrap();
        assert_eq!(json["stdout"], "hello\n");
    }
}
