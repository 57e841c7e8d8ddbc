//! Core pipeline logic.
//!
//! This module contains:
//! - Policy: rule sets and the policy engine
//! - Safety: sandbox limits and output caps
//! - Validation: expectations checked against results
//! - ClaimStore: durable SQLite claims ledger
//! - Orchestrator: the per-request state machine
//! - Auditor: out-of-band evidence re-checks

pub mod approval;
pub mod auditor;
pub mod claim_store;
pub mod orchestrator;
pub mod pipeline;
pub mod policy;
pub mod redact;
pub mod safety;
pub mod spool;
pub mod validation;

// Re-export commonly used types
pub use approval::{ApprovalAuthority, ApprovalError};
pub use auditor::{AuditReport, Auditor, SamplePolicy};
pub use claim_store::{
    ClaimFeed, ClaimLedger, FeedEntry, FeedPosition, FeedSource, SqliteClaimStore, StoreError,
};
pub use orchestrator::{DrainReport, FailureReason, Orchestrator, PipelineHandle, PipelineOutcome};
pub use pipeline::{PipelineSettings, RetryPolicy};
pub use policy::{
    CompiledRuleSet, Decision, PolicyContext, PolicyDecision, PolicyEngine, PolicyError,
    PolicyRule, RulePattern, RuleSet,
};
pub use redact::redact_secrets;
pub use safety::{cap_output, CappedBuffer, LimitError, SandboxLimits};
pub use spool::{Spool, SpoolEntry};
pub use validation::validate;
