//! Sandbox limits and output capping.
//!
//! Bounds every execution through configurable limits on:
//! - Wall-clock time (with a termination grace period)
//! - Captured output size per stream
//! - Address space (advisory)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{CommandRequest, LimitViolation, OutputStream, MAX_TIMEOUT_SECONDS};

/// Resource limits for one sandboxed execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Wall-clock timeout in seconds (default: 60)
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Per-stream capture cap in bytes (default: 1MB)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,

    /// Advisory address-space limit, applied where the platform allows
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,

    /// Directory to run in (the request's directory when unset)
    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Time between SIGTERM and SIGKILL in milliseconds (default: 2000)
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

fn default_timeout_seconds() -> u64 {
    60
}
fn default_max_output_bytes() -> u64 {
    1024 * 1024
} // 1MB
fn default_grace_period_ms() -> u64 {
    2000
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            max_output_bytes: default_max_output_bytes(),
            max_memory_bytes: None,
            working_directory: None,
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl SandboxLimits {
    /// Limits for a specific request: its timeout and directory over these defaults
    pub fn for_request(&self, request: &CommandRequest) -> Self {
        Self {
            timeout_seconds: request.timeout_seconds,
            working_directory: Some(request.working_dir.clone()),
            ..self.clone()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Latest point a sandbox call may return, relative to spawn
    pub fn deadline(&self) -> Duration {
        self.timeout() + self.grace_period()
    }

    /// Check the limits are usable
    pub fn validate(&self) -> Result<(), LimitError> {
        if self.timeout_seconds == 0 || self.timeout_seconds > MAX_TIMEOUT_SECONDS {
            return Err(LimitError::Timeout {
                seconds: self.timeout_seconds,
            });
        }
        if self.max_output_bytes == 0 {
            return Err(LimitError::ZeroOutputCap);
        }
        if let Some(0) = self.max_memory_bytes {
            return Err(LimitError::ZeroMemoryLimit);
        }
        Ok(())
    }
}

/// Invalid limit configuration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LimitError {
    #[error("timeout must be between 1 and {} seconds, got {seconds}", MAX_TIMEOUT_SECONDS)]
    Timeout { seconds: u64 },

    #[error("max_output_bytes must be greater than zero")]
    ZeroOutputCap,

    #[error("max_memory_bytes must be greater than zero when set")]
    ZeroMemoryLimit,
}

/// Output buffer that keeps the first `limit` bytes and counts the rest
#[derive(Debug)]
pub struct CappedBuffer {
    stream: OutputStream,
    limit: u64,
    kept: Vec<u8>,
    discarded: u64,
}

impl CappedBuffer {
    pub fn new(stream: OutputStream, limit: u64) -> Self {
        Self {
            stream,
            limit,
            kept: Vec::new(),
            discarded: 0,
        }
    }

    /// Append a chunk; bytes past the cap are dropped, not buffered
    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.kept.len() as u64) as usize;
        let take = room.min(chunk.len());
        self.kept.extend_from_slice(&chunk[..take]);
        self.discarded += (chunk.len() - take) as u64;
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Captured bytes, plus a violation if anything was dropped
    pub fn finish(self) -> (Vec<u8>, Option<LimitViolation>) {
        let violation = (self.discarded > 0).then(|| LimitViolation::OutputTruncated {
            stream: self.stream,
            limit_bytes: self.limit,
            discarded_bytes: self.discarded,
        });
        (self.kept, violation)
    }
}

/// Cap an already-collected buffer (used for remote results)
pub fn cap_output(stream: OutputStream, bytes: Vec<u8>, limit: u64) -> (Vec<u8>, Option<LimitViolation>) {
    let mut buffer = CappedBuffer::new(stream, limit);
    buffer.push(&bytes);
    buffer.finish()
}
