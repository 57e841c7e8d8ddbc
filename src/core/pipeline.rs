//! Pipeline settings and loading.
//!
//! Settings are defined in YAML and hold the default sandbox limits and
//! the retry policy used for the RECORDING stage. The orchestrator takes
//! them explicitly at construction.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::safety::SandboxLimits;

/// Settings for one orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Default limits; each request's timeout and directory override these
    #[serde(default)]
    pub limits: SandboxLimits,

    /// Retry policy for recording claims
    #[serde(default)]
    pub recording: RetryPolicy,

    /// Read cap for declared output artifacts (default: 16MB)
    #[serde(default = "default_artifact_max_bytes")]
    pub artifact_max_bytes: u64,
}

fn default_artifact_max_bytes() -> u64 {
    16 * 1024 * 1024
}

impl PipelineSettings {
    /// Load settings from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse settings from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let settings: Self =
            serde_yaml::from_str(content).context("Failed to parse settings YAML")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        self.limits.validate().context("Invalid sandbox limits")?;

        if self.recording.max_attempts == 0 {
            anyhow::bail!("recording.max_attempts must be at least 1");
        }
        if self.recording.backoff_multiplier < 1.0 {
            anyhow::bail!("recording.backoff_multiplier must be at least 1.0");
        }
        if self.artifact_max_bytes == 0 {
            anyhow::bail!("artifact_max_bytes must be greater than zero");
        }

        Ok(())
    }
}

/// Retry policy for the RECORDING stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_delay() -> u64 {
    200
}
fn default_max_delay() -> u64 {
    5000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Policy that tries once and never waits
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SETTINGS_YAML: &str = r#"
limits:
  timeout_seconds: 30
  max_output_bytes: 4096
recording:
  max_attempts: 3
"#;

    #[test]
    fn test_settings_parsing() {
        let settings = PipelineSettings::from_yaml(TEST_SETTINGS_YAML).unwrap();

        assert_eq!(settings.limits.timeout_seconds, 30);
        assert_eq!(settings.limits.max_output_bytes, 4096);
        assert_eq!(settings.recording.max_attempts, 3);
        assert_eq!(settings.recording.initial_delay_ms, 200);
        assert_eq!(settings.artifact_max_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let yaml = r#"
recording:
  max_attempts: 0
"#;
        assert!(PipelineSettings::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_recording_backoff_defaults() {
        let policy = RetryPolicy::default();

        let delays: Vec<u64> = (1..=7)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![200, 400, 800, 1600, 3200, 5000, 5000]);

        // Sleeps happen only between attempts
        let waited: Duration = (1..policy.max_attempts)
            .map(|attempt| policy.delay_for_attempt(attempt))
            .sum();
        assert_eq!(waited, Duration::from_millis(3000));
    }

    #[test]
    fn test_flat_backoff_keeps_the_initial_delay() {
        let policy = RetryPolicy {
            backoff_multiplier: 1.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(4), policy.delay_for_attempt(1));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }
}
