//! Command-line interface for claimgate.
//!
//! Provides commands for running commands through the verified pipeline,
//! inspecting recorded claims, auditing evidence, and checking policy.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use crate::adapters::{ExecutorRegistry, LocalSandbox, RemoteExecutor};
use crate::config::{config, ResolvedConfig};
use crate::core::{
    redact_secrets, ApprovalAuthority, Auditor, ClaimLedger, CompiledRuleSet, Orchestrator,
    PolicyContext, PolicyEngine, SamplePolicy, Spool, SqliteClaimStore,
};
use crate::domain::{
    ArtifactExpectation, Claim, ClaimDisposition, CommandRequest, ExpectedEvidence, ReceiptId,
    RequestId, ValidationOutcome,
};

/// claimgate - Verified command execution with evidence-linked claims
#[derive(Parser, Debug)]
#[command(name = "claimgate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command through policy, sandbox, validation and recording
    Run {
        /// Command line (run with /bin/sh -c)
        command: String,

        /// Working directory
        #[arg(long, default_value = ".")]
        cwd: PathBuf,

        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Why the command is being run
        #[arg(long, default_value = "")]
        intent: String,

        /// Requester identity
        #[arg(long, env = "CLAIMGATE_REQUESTER", default_value = "operator")]
        requester: String,

        /// Expected exit code
        #[arg(long)]
        expect_exit: Option<i32>,

        /// Text stdout must contain
        #[arg(long)]
        expect_stdout: Option<String>,

        /// Regex stdout must match
        #[arg(long)]
        expect_pattern: Option<String>,

        /// Expected SHA-256 of stdout (hex)
        #[arg(long)]
        expect_sha256: Option<String>,

        /// Output file the command must produce, as PATH=SHA256
        #[arg(long)]
        expect_artifact: Option<String>,

        /// Execution backend (local, remote)
        #[arg(long)]
        backend: Option<String>,

        /// Approval token for commands that require approval
        #[arg(long)]
        approval_token: Option<String>,

        /// Request id (UUID); generated when omitted
        #[arg(long)]
        request_id: Option<String>,

        /// Receipt this request supersedes
        #[arg(long)]
        supersedes: Option<String>,
    },

    /// Show a recorded claim and its audit findings
    Show {
        /// Receipt ID (UUID)
        receipt_id: String,
    },

    /// List claims recorded since a point in time
    List {
        /// RFC 3339 timestamp (default: everything)
        #[arg(long)]
        since: Option<String>,
    },

    /// Recompute evidence hashes of recorded claims
    Audit {
        /// RFC 3339 timestamp (default: everything)
        #[arg(long)]
        since: Option<String>,

        /// Fraction of claims to audit (overrides config)
        #[arg(long)]
        sample_rate: Option<f64>,

        /// Keep auditing new claims until interrupted
        #[arg(long)]
        watch: bool,
    },

    /// Policy rule set tools
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },

    /// Issue an approval token for a request
    Approve {
        /// Request id (UUID) the token is bound to
        request_id: String,

        /// Exact command being approved
        command: String,
    },

    /// Check execution backends
    Health {
        /// Only check this backend
        #[arg(long)]
        backend: Option<String>,
    },

    /// Show resolved configuration (debug)
    Config,

    /// Unrecorded-claim spool tools
    Spool {
        #[command(subcommand)]
        command: SpoolCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum PolicyCommands {
    /// Evaluate a command against the active rule set
    Check {
        command: String,

        #[arg(long, default_value = "operator")]
        requester: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum SpoolCommands {
    /// Record spooled claims now that the store is reachable
    Drain,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = config()?;

        match self.command {
            Commands::Run {
                command,
                cwd,
                timeout,
                intent,
                requester,
                expect_exit,
                expect_stdout,
                expect_pattern,
                expect_sha256,
                expect_artifact,
                backend,
                approval_token,
                request_id,
                supersedes,
            } => {
                let expected = ExpectedEvidence {
                    exit_code: expect_exit,
                    stdout_contains: expect_stdout,
                    stdout_pattern: expect_pattern,
                    stdout_sha256: expect_sha256,
                    artifact: expect_artifact.as_deref().map(parse_artifact).transpose()?,
                };

                let mut request = CommandRequest::new(requester, command)
                    .with_working_dir(cwd)
                    .with_intent(intent)
                    .with_timeout(timeout.unwrap_or(config.pipeline.limits.timeout_seconds));
                if !expected.is_empty() {
                    request = request.with_expected(expected);
                }
                if let Some(backend) = backend {
                    request = request.with_backend(backend);
                }
                if let Some(token) = approval_token {
                    request = request.with_approval_token(token);
                }
                if let Some(id) = request_id {
                    request = request.with_id(parse_request_id(&id)?);
                }
                if let Some(receipt) = supersedes {
                    request = request.with_supersedes(parse_receipt_id(&receipt)?);
                }

                run_command(config, request).await
            }
            Commands::Show { receipt_id } => show_claim(config, &receipt_id).await,
            Commands::List { since } => list_claims(config, since.as_deref()).await,
            Commands::Audit {
                since,
                sample_rate,
                watch,
            } => audit(config, since.as_deref(), sample_rate, watch).await,
            Commands::Policy {
                command: PolicyCommands::Check { command, requester },
            } => check_policy(config, &command, &requester),
            Commands::Approve {
                request_id,
                command,
            } => approve(config, &request_id, &command),
            Commands::Health { backend } => health(config, backend.as_deref()).await,
            Commands::Config => show_config(config),
            Commands::Spool {
                command: SpoolCommands::Drain,
            } => drain_spool(config).await,
        }
    }
}

/// Active policy: the configured rule set file, or the standard rules
fn load_policy(config: &ResolvedConfig) -> Result<PolicyEngine> {
    if config.policy_file.exists() {
        let engine = PolicyEngine::new(CompiledRuleSet::empty("empty"));
        engine
            .load_file(&config.policy_file)
            .with_context(|| format!("Failed to load policy: {}", config.policy_file.display()))?;
        Ok(engine)
    } else {
        PolicyEngine::standard().context("Failed to build standard policy")
    }
}

fn executors(config: &ResolvedConfig) -> ExecutorRegistry {
    let registry = ExecutorRegistry::new("local", Arc::new(LocalSandbox::new()));
    match config.remote_url {
        Some(ref url) => registry.with("remote", Arc::new(RemoteExecutor::new(url.clone()))),
        None => registry,
    }
}

fn open_store(config: &ResolvedConfig) -> Result<Arc<SqliteClaimStore>> {
    let store = SqliteClaimStore::open(config.claims_db())
        .with_context(|| format!("Failed to open claims store: {}", config.claims_db().display()))?;
    Ok(Arc::new(store))
}

fn build_orchestrator(config: &ResolvedConfig) -> Result<Orchestrator> {
    let approvals = match config.approval_key {
        Some(ref key) => ApprovalAuthority::new(key).context("Invalid approval key")?,
        None => ApprovalAuthority::disabled(),
    };

    Ok(Orchestrator::new(
        Arc::new(load_policy(config)?),
        executors(config),
        open_store(config)?,
        config.pipeline.clone(),
    )
    .with_approvals(approvals)
    .with_spool(Spool::new(config.spool_path())))
}

/// Run one command through the pipeline
async fn run_command(config: &ResolvedConfig, request: CommandRequest) -> Result<()> {
    let orchestrator = Arc::new(build_orchestrator(config)?);
    let outcome = orchestrator.submit(request).wait().await?;

    if let Some(ref result) = outcome.result {
        print!("{}", result.stdout_lossy());
        eprint!("{}", result.stderr_lossy());
    }

    eprintln!();
    eprintln!("Request:  {}", outcome.request_id);
    eprintln!("Receipt:  {}", outcome.receipt_id);
    eprintln!("Stage:    {}", outcome.stage);
    if let Some(ref validation) = outcome.validation {
        eprintln!(
            "Outcome:  {} (confidence {:?})",
            validation.outcome, validation.confidence
        );
        for check in validation.failed_checks() {
            eprintln!(
                "  failed {:?}: expected {}, observed {}",
                check.check, check.expected, check.observed
            );
        }
    }
    if let Some(ref reason) = outcome.reason {
        eprintln!("Reason:   [{}] {}", reason.code(), reason);
    }

    if outcome.is_failed() || outcome.is_rejected() {
        std::process::exit(1);
    }
    let contradicted = outcome
        .validation
        .as_ref()
        .map(|v| v.outcome == ValidationOutcome::Contradicted)
        .unwrap_or(false);
    if contradicted {
        std::process::exit(2);
    }

    Ok(())
}

/// Show a claim with its findings
async fn show_claim(config: &ResolvedConfig, receipt: &str) -> Result<()> {
    let receipt_id = parse_receipt_id(receipt)?;
    let store = open_store(config)?;

    let claim = store
        .get(receipt_id)
        .await?
        .with_context(|| format!("Claim {} not found", receipt_id))?;

    println!(
        "{}",
        serde_json::to_string_pretty(&claim).context("Failed to render claim")?
    );

    let findings = store.findings_for(receipt_id).await?;
    if !findings.is_empty() {
        println!("\nAudit findings:");
        for finding in findings {
            println!(
                "  {} {:?} {}",
                finding.audited_at.to_rfc3339(),
                finding.outcome,
                finding.discrepancy.unwrap_or_default()
            );
        }
    }

    Ok(())
}

/// List claims in timestamp order
async fn list_claims(config: &ResolvedConfig, since: Option<&str>) -> Result<()> {
    let store = open_store(config)?;
    let mut feed = store.list_since(parse_since(since)?).await?;

    println!(
        "{:<38} {:<26} {:<13} {:<8} {}",
        "RECEIPT", "RECORDED", "OUTCOME", "EXIT", "COMMAND"
    );
    println!("{}", "-".repeat(100));

    let mut count = 0usize;
    while let Some(claim) = feed.next().await {
        print_claim_row(&claim?);
        count += 1;
    }

    if count == 0 {
        println!("No claims found");
    }

    Ok(())
}

fn print_claim_row(claim: &Claim) {
    let exit = match claim.disposition {
        ClaimDisposition::Executed { exit_code, .. } => exit_code.to_string(),
        ClaimDisposition::PolicyRejected { .. } => "denied".to_string(),
    };
    let command = redact_secrets(&claim.command);
    let command: String = command.chars().take(60).collect();

    println!(
        "{:<38} {:<26} {:<13} {:<8} {}",
        claim.receipt_id.to_string(),
        claim.recorded_at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        claim.validation.outcome.as_str(),
        exit,
        command
    );
}

/// Audit recorded claims
async fn audit(
    config: &ResolvedConfig,
    since: Option<&str>,
    sample_rate: Option<f64>,
    watch: bool,
) -> Result<()> {
    let store = open_store(config)?;
    let sample = SamplePolicy::new(sample_rate.unwrap_or(config.audit.sample_rate));
    let auditor = Auditor::new(store, sample);
    let since = parse_since(since)?;

    if watch {
        let (tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(true);
            }
        });

        let interval = Duration::from_secs(config.audit.interval_seconds.max(1));
        auditor.run_periodic(since, interval, rx).await?;
        return Ok(());
    }

    let report = auditor.audit_since(since).await?;
    let contradicted: Vec<_> = report.contradicted().collect();

    println!(
        "Audited {} claims ({} skipped by sampling), {} contradicted",
        report.findings.len(),
        report.skipped,
        contradicted.len()
    );
    for finding in &contradicted {
        println!(
            "  {}: {}",
            finding.receipt_id,
            finding.discrepancy.as_deref().unwrap_or("contradicted")
        );
    }

    if !contradicted.is_empty() {
        std::process::exit(1);
    }

    Ok(())
}

/// Evaluate a command without running it
fn check_policy(config: &ResolvedConfig, command: &str, requester: &str) -> Result<()> {
    let engine = load_policy(config)?;
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let decision = engine.evaluate(command, &PolicyContext::new(requester, cwd))?;

    println!("Decision: {}", decision.decision.as_str());
    println!("Rule:     {}", decision.rule_id.as_deref().unwrap_or("<none>"));
    println!("Reason:   {}", decision.rationale);
    println!("Rule set: {}", decision.ruleset_version);

    Ok(())
}

/// Print an approval token
fn approve(config: &ResolvedConfig, request_id: &str, command: &str) -> Result<()> {
    let key = config
        .approval_key
        .as_deref()
        .context("CLAIMGATE_APPROVAL_KEY is not set")?;
    let authority = ApprovalAuthority::new(key).context("Invalid approval key")?;
    let token = authority.issue(parse_request_id(request_id)?, command)?;
    println!("{}", token);
    Ok(())
}

/// Check one or every backend
async fn health(config: &ResolvedConfig, backend: Option<&str>) -> Result<()> {
    let registry = executors(config);
    let names: Vec<String> = match backend {
        Some(name) => vec![name.to_string()],
        None => registry.names().map(String::from).collect(),
    };

    let mut healthy = true;
    for name in names {
        let Some(executor) = registry.resolve(Some(&name)) else {
            println!("{:<10} unknown backend", name);
            healthy = false;
            continue;
        };
        match executor.health_check().await {
            Ok(()) => println!("{:<10} ok", name),
            Err(e) => {
                println!("{:<10} unhealthy: {:#}", name, e);
                healthy = false;
            }
        }
    }

    if !healthy {
        std::process::exit(1);
    }
    Ok(())
}

/// Show resolved configuration
fn show_config(config: &ResolvedConfig) -> Result<()> {
    println!("claimgate configuration");
    println!("{}", "=".repeat(50));
    println!();

    if let Some(ref path) = config.config_file {
        println!("Config file: {}", path.display());
    } else {
        println!("Config file: (none found, using defaults)");
    }
    println!();

    println!("Paths:");
    println!("  home:    {}", config.home.display());
    println!("  policy:  {}", config.policy_file.display());
    println!("  claims:  {}", config.claims_db().display());
    println!("  spool:   {}", config.spool_path().display());
    println!();

    let limits = &config.pipeline.limits;
    println!("Sandbox:");
    println!("  timeout_seconds:  {}", limits.timeout_seconds);
    println!("  max_output_bytes: {}", limits.max_output_bytes);
    match limits.max_memory_bytes {
        Some(bytes) => println!("  max_memory_bytes: {}", bytes),
        None => println!("  max_memory_bytes: (unlimited)"),
    }
    println!("  grace_period_ms:  {}", limits.grace_period_ms);
    println!();

    let retry = &config.pipeline.recording;
    println!("Recording:");
    println!("  max_attempts:       {}", retry.max_attempts);
    println!("  initial_delay_ms:   {}", retry.initial_delay_ms);
    println!("  max_delay_ms:       {}", retry.max_delay_ms);
    println!("  backoff_multiplier: {}", retry.backoff_multiplier);
    println!();

    println!("Remote:   {}", config.remote_url.as_deref().unwrap_or("(not configured)"));
    println!(
        "Approval: {}",
        if config.approval_key.is_some() { "key configured" } else { "disabled" }
    );
    println!(
        "Audit:    sample_rate {}, every {}s",
        config.audit.sample_rate, config.audit.interval_seconds
    );

    Ok(())
}

/// Replay the spool into the claims store
async fn drain_spool(config: &ResolvedConfig) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let report = orchestrator.drain_spool().await?;
    println!(
        "Recorded {} spooled claims, {} remaining",
        report.recorded, report.remaining
    );
    Ok(())
}

fn parse_request_id(value: &str) -> Result<RequestId> {
    value
        .parse()
        .with_context(|| format!("Invalid request ID: {}", value))
}

fn parse_receipt_id(value: &str) -> Result<ReceiptId> {
    value
        .parse()
        .with_context(|| format!("Invalid receipt ID: {}", value))
}

fn parse_since(value: Option<&str>) -> Result<DateTime<Utc>> {
    match value {
        Some(text) => Ok(DateTime::parse_from_rfc3339(text)
            .with_context(|| format!("Invalid timestamp (expected RFC 3339): {}", text))?
            .with_timezone(&Utc)),
        None => Ok(DateTime::<Utc>::UNIX_EPOCH),
    }
}

/// Parse `PATH=SHA256`
fn parse_artifact(value: &str) -> Result<ArtifactExpectation> {
    let (path, sha256) = value
        .rsplit_once('=')
        .with_context(|| format!("Expected PATH=SHA256, got: {}", value))?;
    if path.is_empty() || sha256.is_empty() {
        anyhow::bail!("Expected PATH=SHA256, got: {}", value);
    }
    Ok(ArtifactExpectation {
        path: PathBuf::from(path),
        sha256: sha256.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_artifact() {
        let artifact = parse_artifact("out/report.txt=abc123").unwrap();
        assert_eq!(artifact.path, PathBuf::from("out/report.txt"));
        assert_eq!(artifact.sha256, "abc123");
        assert!(parse_artifact("no-hash").is_err());
        assert!(parse_artifact("=abc").is_err());
    }

    #[test]
    fn test_parse_since() {
        assert_eq!(parse_since(None).unwrap().timestamp(), 0);
        let ts = parse_since(Some("2026-01-02T03:04:05Z")).unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-01-02T03:04:05+00:00");
        assert!(parse_since(Some("yesterday")).is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "claimgate",
            "run",
            "echo hi",
            "--expect-exit",
            "0",
            "--expect-stdout",
            "hi",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                command,
                expect_exit,
                expect_stdout,
                ..
            } => {
                assert_eq!(command, "echo hi");
                assert_eq!(expect_exit, Some(0));
                assert_eq!(expect_stdout.as_deref(), Some("hi"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
