//! Domain types for the claimgate pipeline.
//!
//! This module contains the core data structures:
//! - Request: what the caller wants run and what it expects
//! - Result: what the sandbox observed
//! - Validation: how the observation compares to the expectation
//! - Claim: the durable record tying them together
//! - Run: per-request stage machine

pub mod audit;
pub mod claim;
pub mod ids;
pub mod request;
pub mod result;
pub mod run;
pub mod validation;

// Re-export commonly used types
pub use audit::{AuditFinding, AuditOutcome};
pub use claim::{Claim, ClaimDisposition, ClaimDraft, POLICY_PROVIDER};
pub use ids::{ReceiptId, RequestId};
pub use request::{ArtifactExpectation, CommandRequest, ExpectedEvidence, MAX_TIMEOUT_SECONDS};
pub use result::{LimitViolation, OutputStream, SandboxResult, TIMEOUT_EXIT_CODE};
pub use run::{IllegalTransition, PipelineRun, Stage, StageTransition};
pub use validation::{CheckDetail, CheckKind, Confidence, ValidationOutcome, ValidationRecord};
