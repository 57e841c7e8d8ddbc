//! Executor interfaces for running commands.
//!
//! Executors provide a unified interface for running one command under
//! sandbox limits, either in a local process group or through a remote
//! execution proxy. The pipeline only sees the `Executor` contract and
//! the `SandboxResult` it returns.

pub mod local;
pub mod remote;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::core::safety::SandboxLimits;
use crate::domain::{CommandRequest, SandboxResult};

// Re-export the executors
pub use local::LocalSandbox;
pub use remote::RemoteExecutor;

/// Errors that prevent an execution from producing a result
///
/// A non-zero exit is not an error; it comes back as a normal result.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("command not executable: {0}")]
    NotExecutable(String),

    #[error("invalid sandbox limits: {0}")]
    InvalidLimits(#[from] crate::core::safety::LimitError),

    #[error("remote executor failed: {0}")]
    Remote(String),
}

/// Trait for command executors
#[async_trait]
pub trait Executor: Send + Sync {
    /// Provider tag recorded on claims ("local", "remote", ...)
    fn provider(&self) -> &str;

    /// Run the request's command under the given limits
    async fn execute(
        &self,
        request: &CommandRequest,
        limits: &SandboxLimits,
    ) -> std::result::Result<SandboxResult, SandboxError>;

    /// Health check (meaningful for remote executors)
    async fn health_check(&self) -> Result<()>;
}

/// Named executors, built once and handed to the orchestrator
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: BTreeMap<String, Arc<dyn Executor>>,
    default: String,
}

impl ExecutorRegistry {
    /// Registry with a single executor that is also the default
    pub fn new(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        let name = name.into();
        let mut executors = BTreeMap::new();
        executors.insert(name.clone(), executor);
        Self {
            executors,
            default: name,
        }
    }

    /// Registry with just the local sandbox
    pub fn local() -> Self {
        Self::new("local", Arc::new(LocalSandbox::new()))
    }

    pub fn with(mut self, name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(name.into(), executor);
        self
    }

    /// Change the default backend; unknown names are ignored
    pub fn with_default(mut self, name: &str) -> Self {
        if self.executors.contains_key(name) {
            self.default = name.to_string();
        }
        self
    }

    /// Resolve a backend name, falling back to the default when unset
    pub fn resolve(&self, name: Option<&str>) -> Option<Arc<dyn Executor>> {
        let name = name.unwrap_or(&self.default);
        self.executors.get(name).cloned()
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.executors.keys().collect::<Vec<_>>())
            .field("default", &self.default)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_default_and_named() {
        let registry = ExecutorRegistry::local()
            .with("remote", Arc::new(RemoteExecutor::new("http://127.0.0.1:1")));

        assert_eq!(registry.resolve(None).unwrap().provider(), "local");
        assert_eq!(registry.resolve(Some("remote")).unwrap().provider(), "remote");
        assert!(registry.resolve(Some("gpu")).is_none());
    }

    #[test]
    fn test_with_default_ignores_unknown() {
        let registry = ExecutorRegistry::local().with_default("nope");
        assert_eq!(registry.default_name(), "local");
    }
}
