//! Remote execution proxy client.
//!
//! Endpoints:
//! - GET  /healthz -> {ok, service, version}
//! - POST /run {command, cwd, timeout} -> {exit_code, stdout, stderr, duration_ms, timed_out}
//!
//! The proxy enforces its own limits; output caps are re-applied here so a
//! misbehaving proxy cannot exceed what the caller allowed.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Executor, SandboxError};
use crate::core::redact::redact_secrets;
use crate::core::safety::{cap_output, SandboxLimits};
use crate::domain::{CommandRequest, LimitViolation, OutputStream, SandboxResult, TIMEOUT_EXIT_CODE};

/// Slack added on top of the sandbox deadline for the HTTP round trip
const HTTP_SLACK: Duration = Duration::from_secs(5);

/// Client for a remote execution proxy
pub struct RemoteExecutor {
    base_url: String,
    client: reqwest::Client,
}

/// Body of POST /run
#[derive(Debug, Serialize)]
pub struct RunPayload<'a> {
    pub command: &'a str,
    pub cwd: String,
    pub timeout: u64,
}

/// Response from POST /run
#[derive(Debug, Deserialize)]
pub struct RunResponse {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
}

/// Response from GET /healthz
#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub version: String,
}

impl RemoteExecutor {
    /// Create a client for the proxy at `base_url` (e.g. "http://10.0.0.5:5055")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Create from the CLAIMGATE_REMOTE_URL environment variable
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("CLAIMGATE_REMOTE_URL")
            .context("CLAIMGATE_REMOTE_URL environment variable required")?;
        Ok(Self::new(url))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn into_result(response: RunResponse, limits: &SandboxLimits) -> SandboxResult {
        let (stdout, stdout_violation) = cap_output(
            OutputStream::Stdout,
            response.stdout.into_bytes(),
            limits.max_output_bytes,
        );
        let (stderr, stderr_violation) = cap_output(
            OutputStream::Stderr,
            response.stderr.into_bytes(),
            limits.max_output_bytes,
        );

        let mut violations: Vec<LimitViolation> =
            stdout_violation.into_iter().chain(stderr_violation).collect();
        let exit_code = if response.timed_out {
            violations.push(LimitViolation::Timeout {
                limit_seconds: limits.timeout_seconds,
            });
            TIMEOUT_EXIT_CODE
        } else {
            response.exit_code
        };

        SandboxResult {
            exit_code,
            stdout,
            stderr,
            duration_ms: response.duration_ms,
            violations,
            terminated_by_timeout: response.timed_out,
            provider: "remote".to_string(),
        }
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    fn provider(&self) -> &str {
        "remote"
    }

    async fn execute(
        &self,
        request: &CommandRequest,
        limits: &SandboxLimits,
    ) -> std::result::Result<SandboxResult, SandboxError> {
        limits.validate()?;

        let cwd = limits
            .working_directory
            .as_ref()
            .unwrap_or(&request.working_dir)
            .to_string_lossy()
            .into_owned();
        let payload = RunPayload {
            command: &request.command,
            cwd,
            timeout: limits.timeout_seconds,
        };

        debug!(
            url = %self.base_url,
            command = %redact_secrets(&request.command),
            "Dispatching command to remote executor"
        );

        let response = self
            .client
            .post(format!("{}/run", self.base_url))
            .timeout(limits.deadline() + HTTP_SLACK)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SandboxError::Remote(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SandboxError::Remote(format!("proxy error ({}): {}", status, text)));
        }

        let body: RunResponse = response
            .json()
            .await
            .map_err(|e| SandboxError::Remote(format!("malformed response: {}", e)))?;

        Ok(Self::into_result(body, limits))
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/healthz", self.base_url))
            .timeout(HTTP_SLACK)
            .send()
            .await
            .context("Failed to reach remote executor")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Remote executor health check failed ({})", status);
        }

        let health: HealthResponse = response
            .json()
            .await
            .context("Malformed health response")?;
        if !health.ok {
            anyhow::bail!(
                "Remote executor {} {} reports not ok",
                health.service,
                health.version
            );
        }
        debug!(service = %health.service, version = %health.version, "Remote executor healthy");
        Ok(())
    }
}
