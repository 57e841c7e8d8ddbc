//! Lifecycle orchestrator.
//!
//! Drives one command request through INTAKE, POLICY_CHECK, EXECUTING,
//! VALIDATING and RECORDING, recording the stage path on a `PipelineRun`.
//! Request-level failures end in a terminal stage with a `FailureReason`;
//! `Err` is reserved for illegal stage transitions.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::ExecutorRegistry;
use crate::domain::{
    Claim, ClaimDisposition, ClaimDraft, CommandRequest, PipelineRun, ReceiptId, RequestId,
    SandboxResult, Stage, ValidationRecord, POLICY_PROVIDER,
};
use crate::evidence::{capture_artifact, ArtifactEvidence, EvidenceBundle};

use super::approval::ApprovalAuthority;
use super::claim_store::{ClaimLedger, StoreError};
use super::pipeline::PipelineSettings;
use super::policy::{Decision, PolicyContext, PolicyDecision, PolicyEngine};
use super::redact::redact_secrets;
use super::safety::SandboxLimits;
use super::spool::{Spool, SpoolEntry};
use super::validation::validate;

/// Why a run ended somewhere other than DONE
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("structural error: {detail}")]
    StructuralError { detail: String },

    #[error("policy denied: {rationale}")]
    PolicyDenied {
        rule_id: Option<String>,
        rationale: String,
    },

    #[error("approval required: {detail}")]
    ApprovalRequired {
        rule_id: Option<String>,
        detail: String,
    },

    #[error("execution failure: {detail}")]
    ExecutionFailure { detail: String },

    #[error("storage failure: {detail}")]
    StorageFailure {
        detail: String,
        retryable: bool,
        spooled: bool,
    },
}

impl FailureReason {
    /// Stable reason code
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::StructuralError { .. } => "structural_error",
            FailureReason::PolicyDenied { .. } => "policy_denied",
            FailureReason::ApprovalRequired { .. } => "approval_required",
            FailureReason::ExecutionFailure { .. } => "execution_failure",
            FailureReason::StorageFailure { .. } => "storage_failure",
        }
    }

    fn structural(detail: impl Into<String>) -> Self {
        FailureReason::StructuralError {
            detail: detail.into(),
        }
    }
}

/// What a pipeline run produced
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    /// Receipt of the recorded claim, or the one reserved for this run
    pub receipt_id: ReceiptId,
    pub request_id: RequestId,
    pub stage: Stage,
    pub reason: Option<FailureReason>,
    pub run: PipelineRun,
    pub claim: Option<Claim>,
    pub validation: Option<ValidationRecord>,
    /// Sandbox result, when the command ran
    pub result: Option<SandboxResult>,
    /// Draft that could not be recorded
    pub unrecorded: Option<ClaimDraft>,
}

impl PipelineOutcome {
    fn new(run: PipelineRun) -> Self {
        Self {
            receipt_id: run.receipt_id,
            request_id: run.request_id,
            stage: run.stage,
            reason: None,
            run,
            claim: None,
            validation: None,
            result: None,
            unrecorded: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    pub fn is_rejected(&self) -> bool {
        self.stage == Stage::Rejected
    }

    pub fn is_failed(&self) -> bool {
        self.stage == Stage::Failed
    }
}

/// Handle to a pipeline running on its own task
///
/// Dropping the handle, or giving up on `wait`, detaches from the run.
/// The command keeps executing and its claim is still recorded.
#[derive(Debug)]
pub struct PipelineHandle {
    request_id: RequestId,
    task: JoinHandle<Result<PipelineOutcome>>,
}

impl PipelineHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to finish
    pub async fn wait(self) -> Result<PipelineOutcome> {
        self.task.await.context("Pipeline task panicked")?
    }

    /// Wait up to `limit`; `None` means the run is still going
    pub async fn wait_timeout(&mut self, limit: Duration) -> Option<Result<PipelineOutcome>> {
        match tokio::time::timeout(limit, &mut self.task).await {
            Ok(joined) => Some(joined.context("Pipeline task panicked").and_then(|r| r)),
            Err(_) => None,
        }
    }
}

/// Result of replaying the spool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub recorded: usize,
    pub remaining: usize,
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    policy: Arc<PolicyEngine>,
    executors: ExecutorRegistry,
    ledger: Arc<dyn ClaimLedger>,
    settings: PipelineSettings,
    approvals: ApprovalAuthority,
    spool: Option<Spool>,
}

impl Orchestrator {
    /// Create a new orchestrator
    ///
    /// Approvals are disabled and nothing is spooled until configured.
    pub fn new(
        policy: Arc<PolicyEngine>,
        executors: ExecutorRegistry,
        ledger: Arc<dyn ClaimLedger>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            policy,
            executors,
            ledger,
            settings,
            approvals: ApprovalAuthority::disabled(),
            spool: None,
        }
    }

    pub fn with_approvals(mut self, approvals: ApprovalAuthority) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_spool(mut self, spool: Spool) -> Self {
        self.spool = Some(spool);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &Arc<dyn ClaimLedger> {
        &self.ledger
    }

    /// Run a request on a spawned task
    pub fn submit(self: &Arc<Self>, request: CommandRequest) -> PipelineHandle {
        let this = Arc::clone(self);
        let request_id = request.id;
        let task = tokio::spawn(async move { this.run(request).await });
        PipelineHandle { request_id, task }
    }

    /// Drive one request through the pipeline
    #[instrument(skip(self, request), fields(request_id = %request.id, requester = %request.requester))]
    pub async fn run(&self, request: CommandRequest) -> Result<PipelineOutcome> {
        let mut run = PipelineRun::new(ReceiptId::new(), request.id);
        info!(
            receipt_id = %run.receipt_id,
            command = %redact_secrets(&request.command),
            "Starting pipeline run"
        );

        // INTAKE
        if let Err(detail) = request.check_well_formed() {
            return self.fail(run, FailureReason::structural(detail));
        }
        let executor = match self.executors.resolve(request.backend.as_deref()) {
            Some(executor) => executor,
            None => {
                let detail = format!(
                    "unknown execution backend '{}'",
                    request.backend.as_deref().unwrap_or_default()
                );
                return self.fail(run, FailureReason::structural(detail));
            }
        };
        let limits = self.settings.limits.for_request(&request);
        if let Err(e) = limits.validate() {
            return self.fail(run, FailureReason::structural(e.to_string()));
        }

        // POLICY_CHECK
        self.advance(&mut run, Stage::PolicyCheck)?;
        let ctx = PolicyContext::new(request.requester.clone(), request.working_dir.clone());
        let decision = match self.policy.evaluate(&request.command, &ctx) {
            Ok(decision) => decision,
            Err(e) => return self.fail(run, FailureReason::structural(e.to_string())),
        };
        info!(
            decision = %decision.decision.as_str(),
            rule_id = decision.rule_id.as_deref().unwrap_or("<none>"),
            ruleset = %decision.ruleset_version,
            command = %redact_secrets(&request.command),
            "Policy decision"
        );

        match decision.decision {
            Decision::Allow => {}
            Decision::Deny => return self.reject(run, &request, decision).await,
            Decision::RequireApproval => {
                if let Err(detail) = self.check_approval(&request) {
                    let reason = FailureReason::ApprovalRequired {
                        rule_id: decision.rule_id,
                        detail,
                    };
                    return self.fail(run, reason);
                }
                info!(rule_id = decision.rule_id.as_deref().unwrap_or("<none>"), "Approval token accepted");
            }
        }

        // EXECUTING
        self.advance(&mut run, Stage::Executing)?;
        let result = match executor.execute(&request, &limits).await {
            Ok(result) => result,
            Err(e) => {
                return self.fail(
                    run,
                    FailureReason::ExecutionFailure {
                        detail: e.to_string(),
                    },
                )
            }
        };
        info!(
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            timed_out = result.terminated_by_timeout,
            provider = %result.provider,
            "Command finished"
        );

        // VALIDATING
        self.advance(&mut run, Stage::Validating)?;
        let artifact = self.capture_artifact(&request, &limits, &result).await;
        let validation = validate(&request, &result, artifact.as_ref());
        info!(outcome = %validation.outcome, confidence = ?validation.confidence, "Validated result");

        let evidence = EvidenceBundle::new(result.stdout.clone(), result.stderr.clone(), artifact);
        let draft = ClaimDraft {
            receipt_id: run.receipt_id,
            request_id: request.id,
            requester: request.requester.clone(),
            command: request.command.clone(),
            intent: request.intent.clone(),
            disposition: ClaimDisposition::executed(&result),
            validation: validation.clone(),
            evidence_hash: evidence.digest(),
            provider: result.provider.clone(),
            supersedes: request.supersedes,
        };

        // RECORDING
        self.advance(&mut run, Stage::Recording)?;
        let recorded = self.record_with_retry(&mut run, &draft, &evidence).await;

        let mut outcome = match recorded {
            Ok(receipt_id) => {
                self.advance(&mut run, Stage::Done)?;
                run.receipt_id = receipt_id;
                let claim = self.load_claim(receipt_id).await;
                info!(%receipt_id, attempts = run.recording_attempts, "Claim recorded");
                let mut outcome = PipelineOutcome::new(run);
                outcome.claim = claim;
                outcome
            }
            Err(e) => {
                let reason = self.store_failure(&draft, &evidence, &e).await;
                let mut outcome = self.fail(run, reason)?;
                outcome.unrecorded = Some(draft);
                outcome
            }
        };

        outcome.validation = Some(validation);
        outcome.result = Some(result);
        Ok(outcome)
    }

    /// Record a policy-rejected claim and end the run as REJECTED
    async fn reject(
        &self,
        mut run: PipelineRun,
        request: &CommandRequest,
        decision: PolicyDecision,
    ) -> Result<PipelineOutcome> {
        let evidence = EvidenceBundle::empty();
        let draft = ClaimDraft {
            receipt_id: run.receipt_id,
            request_id: request.id,
            requester: request.requester.clone(),
            command: request.command.clone(),
            intent: request.intent.clone(),
            disposition: ClaimDisposition::PolicyRejected {
                rule_id: decision.rule_id.clone(),
                rationale: decision.rationale.clone(),
                ruleset_version: decision.ruleset_version.clone(),
            },
            validation: ValidationRecord::policy_rejected(),
            evidence_hash: evidence.digest(),
            provider: POLICY_PROVIDER.to_string(),
            supersedes: request.supersedes,
        };

        match self.record_with_retry(&mut run, &draft, &evidence).await {
            Ok(receipt_id) => {
                self.advance(&mut run, Stage::Rejected)?;
                run.receipt_id = receipt_id;
                warn!(
                    %receipt_id,
                    rule_id = decision.rule_id.as_deref().unwrap_or("<none>"),
                    rationale = %decision.rationale,
                    "Command rejected by policy"
                );
                let claim = self.load_claim(receipt_id).await;
                let mut outcome = PipelineOutcome::new(run);
                outcome.reason = Some(FailureReason::PolicyDenied {
                    rule_id: decision.rule_id,
                    rationale: decision.rationale,
                });
                outcome.validation = claim.as_ref().map(|c| c.validation.clone());
                outcome.claim = claim;
                Ok(outcome)
            }
            Err(e) => {
                let reason = self.store_failure(&draft, &evidence, &e).await;
                let mut outcome = self.fail(run, reason)?;
                outcome.unrecorded = Some(draft);
                Ok(outcome)
            }
        }
    }

    fn check_approval(&self, request: &CommandRequest) -> std::result::Result<(), String> {
        let token = request
            .approval_token
            .as_deref()
            .ok_or_else(|| "command requires an approval token".to_string())?;
        self.approvals
            .verify(request.id, &request.command, token)
            .map_err(|e| e.to_string())
    }

    /// Read the declared artifact for local runs
    async fn capture_artifact(
        &self,
        request: &CommandRequest,
        limits: &SandboxLimits,
        result: &SandboxResult,
    ) -> Option<ArtifactEvidence> {
        let declared = request.expected.as_ref()?.artifact.as_ref()?;
        if result.provider != "local" {
            debug!(provider = %result.provider, "Artifact not reachable from this executor");
            return None;
        }

        let working_dir = limits
            .working_directory
            .clone()
            .unwrap_or_else(|| request.working_dir.clone());
        let path = declared.path.clone();
        let max_bytes = self.settings.artifact_max_bytes;

        tokio::task::spawn_blocking(move || capture_artifact(&working_dir, &path, max_bytes))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Artifact capture task failed");
                None
            })
    }

    /// Record with exponential backoff on transient store errors
    async fn record_with_retry(
        &self,
        run: &mut PipelineRun,
        draft: &ClaimDraft,
        evidence: &EvidenceBundle,
    ) -> std::result::Result<ReceiptId, StoreError> {
        let policy = &self.settings.recording;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            run.recording_attempts = attempt;

            match self.ledger.record(draft.clone(), evidence.clone()).await {
                Ok(receipt_id) => return Ok(receipt_id),
                Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Recording failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(attempt, error = %e, "Recording failed permanently");
                    return Err(e);
                }
            }
        }
    }

    /// Spool what could not be recorded and describe the failure
    async fn store_failure(
        &self,
        draft: &ClaimDraft,
        evidence: &EvidenceBundle,
        error: &StoreError,
    ) -> FailureReason {
        let retryable = error.is_retryable();
        let mut spooled = false;

        if retryable {
            if let Some(ref spool) = self.spool {
                let spool = spool.clone();
                let entry = SpoolEntry::new(draft.clone(), evidence.clone(), error.to_string());
                match tokio::task::spawn_blocking(move || spool.append(&entry)).await {
                    Ok(Ok(())) => {
                        spooled = true;
                        warn!(request_id = %draft.request_id, "Unrecorded claim spooled");
                    }
                    Ok(Err(e)) => error!(error = %e, "Failed to spool unrecorded claim"),
                    Err(e) => error!(error = %e, "Spool task failed"),
                }
            }
        }

        FailureReason::StorageFailure {
            detail: error.to_string(),
            retryable,
            spooled,
        }
    }

    async fn load_claim(&self, receipt_id: ReceiptId) -> Option<Claim> {
        match self.ledger.get(receipt_id).await {
            Ok(claim) => claim,
            Err(e) => {
                warn!(%receipt_id, error = %e, "Recorded claim could not be read back");
                None
            }
        }
    }

    fn advance(&self, run: &mut PipelineRun, to: Stage) -> Result<()> {
        let from = run.stage;
        run.advance(to)?;
        debug!(%from, %to, "Stage transition");
        Ok(())
    }

    fn fail(&self, mut run: PipelineRun, reason: FailureReason) -> Result<PipelineOutcome> {
        error!(stage = %run.stage, code = reason.code(), reason = %reason, "Pipeline run failed");
        self.advance(&mut run, Stage::Failed)?;
        let mut outcome = PipelineOutcome::new(run);
        outcome.reason = Some(reason);
        Ok(outcome)
    }

    /// Replay spooled claims through the ledger
    ///
    /// Entries that record (or were already recorded) leave the spool;
    /// everything else stays for the next drain.
    pub async fn drain_spool(&self) -> Result<DrainReport> {
        let spool = match self.spool {
            Some(ref spool) => spool.clone(),
            None => return Ok(DrainReport::default()),
        };

        let reader = spool.clone();
        let entries = tokio::task::spawn_blocking(move || reader.entries())
            .await
            .context("Spool task failed")??;

        let mut recorded: HashSet<RequestId> = HashSet::new();
        for entry in &entries {
            let request_id = entry.draft.request_id;
            match self
                .ledger
                .record(entry.draft.clone(), entry.evidence.clone())
                .await
            {
                Ok(receipt_id) => {
                    info!(%request_id, %receipt_id, "Spooled claim recorded");
                    recorded.insert(request_id);
                }
                Err(e) => warn!(%request_id, error = %e, "Spooled claim still unrecorded"),
            }
        }

        let count = recorded.len();
        let removed = tokio::task::spawn_blocking(move || spool.remove(&recorded))
            .await
            .context("Spool task failed")??;
        debug!(removed, "Spool rewritten");

        Ok(DrainReport {
            recorded: count,
            remaining: entries.len() - count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::claim_store::SqliteClaimStore;
    use crate::core::policy::{PolicyRule, RulePattern, RuleSet};
    use crate::domain::ExpectedEvidence;
    use tempfile::TempDir;

    fn orchestrator(dir: &TempDir, rules: Vec<PolicyRule>) -> Orchestrator {
        let compiled = RuleSet::new("test", rules).compile().unwrap();
        let store = SqliteClaimStore::open(dir.path().join("claims.db")).unwrap();
        Orchestrator::new(
            Arc::new(PolicyEngine::new(compiled)),
            ExecutorRegistry::local(),
            Arc::new(store),
            PipelineSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_malformed_request_fails_at_intake() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir, Vec::new());

        let outcome = orchestrator
            .run(CommandRequest::new("agent", "   "))
            .await
            .unwrap();

        assert!(outcome.is_failed());
        assert_eq!(outcome.reason.unwrap().code(), "structural_error");
        assert_eq!(outcome.run.path(), vec![Stage::Intake, Stage::Failed]);
    }

    #[tokio::test]
    async fn test_unknown_backend_is_structural() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(&dir, Vec::new());

        let request = CommandRequest::new("agent", "echo hi").with_backend("mars");
        let outcome = orchestrator.run(request).await.unwrap();

        assert_eq!(outcome.reason.unwrap().code(), "structural_error");
    }

    #[tokio::test]
    async fn test_allowed_command_is_recorded() {
        let dir = TempDir::new().unwrap();
        let rule = PolicyRule::new("echo", RulePattern::Prefix("echo ".into()), Decision::Allow, 1);
        let orchestrator = orchestrator(&dir, vec![rule]);

        let request = CommandRequest::new("agent", "echo hi")
            .with_expected(ExpectedEvidence::stdout_contains("hi"));
        let outcome = orchestrator.run(request).await.unwrap();

        assert!(outcome.is_done());
        let claim = outcome.claim.unwrap();
        assert_eq!(claim.provider, "local");
        assert_eq!(outcome.run.recording_attempts, 1);
    }

    #[test]
    fn test_reason_codes() {
        let reason = FailureReason::StorageFailure {
            detail: "locked".into(),
            retryable: true,
            spooled: false,
        };
        assert_eq!(reason.code(), "storage_failure");
        assert_eq!(reason.to_string(), "storage failure: locked");
    }
}
