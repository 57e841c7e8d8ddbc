//! Configuration for claimgate.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CLAIMGATE_HOME, CLAIMGATE_POLICY,
//!    CLAIMGATE_REMOTE_URL, CLAIMGATE_APPROVAL_KEY)
//! 2. Config file (.claimgate/config.yaml)
//! 3. Defaults (~/.claimgate)
//!
//! Config file discovery:
//! - Searches current directory and parents for .claimgate/config.yaml
//! - `paths.home` is relative to the .claimgate/ directory; `paths.policy`
//!   is relative to the project root (its parent)
//!
//! Only the CLI reads this; library types take their settings explicitly.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::pipeline::{PipelineSettings, RetryPolicy};
use crate::core::safety::SandboxLimits;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".claimgate";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub sandbox: Option<SandboxConfig>,
    #[serde(default)]
    pub recording: Option<RetryPolicy>,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub audit: Option<AuditConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .claimgate/)
    pub home: Option<String>,
    /// Policy rule set (relative to the project root)
    pub policy: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxConfig {
    pub timeout_seconds: Option<u64>,
    pub max_output_bytes: Option<u64>,
    pub max_memory_bytes: Option<u64>,
    pub grace_period_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteConfig {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditConfig {
    pub sample_rate: Option<f64>,
    pub interval_seconds: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory holding the claims store and spool
    pub home: PathBuf,
    /// Policy rule set file
    pub policy_file: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Sandbox limits and recording retries
    pub pipeline: PipelineSettings,
    /// Remote execution proxy, when configured
    pub remote_url: Option<String>,
    /// Key for approval tokens; never read from the config file
    pub approval_key: Option<String>,
    pub audit: AuditSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditSettings {
    pub sample_rate: f64,
    pub interval_seconds: u64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            sample_rate: 1.0,
            interval_seconds: 300,
        }
    }
}

impl ResolvedConfig {
    /// SQLite claims store ($CLAIMGATE_HOME/claims.db)
    pub fn claims_db(&self) -> PathBuf {
        self.home.join("claims.db")
    }

    /// Unrecorded-claim spool ($CLAIMGATE_HOME/spool.jsonl)
    pub fn spool_path(&self) -> PathBuf {
        self.home.join("spool.jsonl")
    }
}

/// Find config file by searching a directory and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn sandbox_limits(config: Option<&SandboxConfig>) -> SandboxLimits {
    let defaults = SandboxLimits::default();
    let Some(config) = config else {
        return defaults;
    };

    SandboxLimits {
        timeout_seconds: config.timeout_seconds.unwrap_or(defaults.timeout_seconds),
        max_output_bytes: config.max_output_bytes.unwrap_or(defaults.max_output_bytes),
        max_memory_bytes: config.max_memory_bytes.or(defaults.max_memory_bytes),
        grace_period_ms: config.grace_period_ms.unwrap_or(defaults.grace_period_ms),
        working_directory: None,
    }
}

/// Resolve configuration from an optional file and an environment lookup
fn resolve(
    config_file: Option<PathBuf>,
    default_home: PathBuf,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    // .claimgate/ and the project root above it
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));
    let base_dir = config_dir.parent().unwrap_or(Path::new("."));

    let home = if let Some(env_home) = env("CLAIMGATE_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(home_path), Some(_)) = (file.paths.home.as_deref(), config_file.as_ref()) {
        resolve_path(config_dir, home_path)
    } else {
        default_home
    };

    let policy_file = if let Some(env_policy) = env("CLAIMGATE_POLICY") {
        PathBuf::from(env_policy)
    } else if let (Some(policy), Some(_)) = (file.paths.policy.as_deref(), config_file.as_ref()) {
        resolve_path(base_dir, policy)
    } else {
        home.join("policy.yaml")
    };

    let pipeline = PipelineSettings {
        limits: sandbox_limits(file.sandbox.as_ref()),
        recording: file.recording.unwrap_or_default(),
        ..Default::default()
    };
    pipeline
        .validate()
        .context("Invalid sandbox or recording settings")?;

    let remote_url = env("CLAIMGATE_REMOTE_URL").or_else(|| file.remote.and_then(|r| r.url));

    let defaults = AuditSettings::default();
    let audit = AuditSettings {
        sample_rate: file
            .audit
            .as_ref()
            .and_then(|a| a.sample_rate)
            .unwrap_or(defaults.sample_rate),
        interval_seconds: file
            .audit
            .as_ref()
            .and_then(|a| a.interval_seconds)
            .unwrap_or(defaults.interval_seconds),
    };

    Ok(ResolvedConfig {
        home,
        policy_file,
        config_file,
        pipeline,
        remote_url,
        approval_key: env("CLAIMGATE_APPROVAL_KEY").filter(|k| !k.is_empty()),
        audit,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let config_file = find_config_file(&cwd);

    resolve(config_file, default_home, |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let home = PathBuf::from("/tmp/claimgate-home");
        let config = resolve(None, home.clone(), no_env).unwrap();

        assert_eq!(config.home, home);
        assert_eq!(config.policy_file, home.join("policy.yaml"));
        assert_eq!(config.claims_db(), home.join("claims.db"));
        assert_eq!(config.spool_path(), home.join("spool.jsonl"));
        assert_eq!(config.pipeline, PipelineSettings::default());
        assert!(config.remote_url.is_none());
        assert!(config.approval_key.is_none());
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1"
paths:
  home: ./state
  policy: rules/policy.yaml
sandbox:
  timeout_seconds: 15
  max_memory_bytes: 268435456
recording:
  max_attempts: 2
remote:
  url: http://127.0.0.1:8787
audit:
  sample_rate: 0.25
"#
        )
        .unwrap();

        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, config_path);

        let config = resolve(Some(found), PathBuf::from("/unused"), no_env).unwrap();
        assert_eq!(config.home, dir.join("state"));
        assert_eq!(config.policy_file, temp.path().join("rules/policy.yaml"));
        assert_eq!(config.pipeline.limits.timeout_seconds, 15);
        assert_eq!(config.pipeline.limits.max_memory_bytes, Some(268_435_456));
        assert_eq!(config.pipeline.recording.max_attempts, 2);
        assert_eq!(config.remote_url.as_deref(), Some("http://127.0.0.1:8787"));
        assert_eq!(config.audit.sample_rate, 0.25);
        assert_eq!(config.audit.interval_seconds, 300);
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("config.yaml");
        std::fs::write(&config_path, "paths:\n  home: ./state\nremote:\n  url: http://file\n").unwrap();

        let env: HashMap<&str, &str> = [
            ("CLAIMGATE_HOME", "/srv/claimgate"),
            ("CLAIMGATE_REMOTE_URL", "http://env"),
            ("CLAIMGATE_APPROVAL_KEY", "k"),
        ]
        .into_iter()
        .collect();

        let config = resolve(Some(config_path), PathBuf::from("/unused"), |k| {
            env.get(k).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(config.home, PathBuf::from("/srv/claimgate"));
        assert_eq!(config.policy_file, PathBuf::from("/srv/claimgate/policy.yaml"));
        assert_eq!(config.remote_url.as_deref(), Some("http://env"));
        assert_eq!(config.approval_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "sandbox:\n  max_output_bytes: 0\n").unwrap();

        assert!(resolve(Some(path), PathBuf::from("/unused"), no_env).is_err());
    }
}
