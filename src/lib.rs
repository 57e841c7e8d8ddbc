//! claimgate - Verified command execution pipeline
//!
//! Runs commands on behalf of an agent and records what actually happened
//! as evidence-linked claims, so a reported result can be checked rather
//! than trusted.
//!
//! # Architecture
//!
//! Each request moves through a fixed state machine:
//! - POLICY_CHECK: first-match-wins rules, default deny
//! - EXECUTING: process-group sandbox (or a remote proxy) with hard limits
//! - VALIDATING: declared expectations checked against captured output
//! - RECORDING: claim plus evidence bytes written atomically to SQLite
//!
//! An independent auditor later recomputes evidence hashes from the stored
//! bytes and records any mismatch as a finding.
//!
//! # Modules
//!
//! - `adapters`: Executors (local sandbox, remote proxy)
//! - `core`: Policy, validation, claims store, orchestrator, auditor
//! - `domain`: Data structures (CommandRequest, Claim, PipelineRun)
//! - `evidence`: Evidence bundles and their digest
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a command and check its output
//! claimgate run "echo hello" --expect-exit 0 --expect-stdout hello
//!
//! # Inspect the recorded claim
//! claimgate show <receipt-id>
//!
//! # Re-verify stored evidence
//! claimgate audit
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod evidence;

// Re-export main types at crate root for convenience
pub use adapters::{Executor, ExecutorRegistry, LocalSandbox, RemoteExecutor, SandboxError};
pub use core::{
    Auditor, ClaimLedger, Orchestrator, PipelineOutcome, PipelineSettings, PolicyEngine,
    SqliteClaimStore,
};
pub use domain::{Claim, CommandRequest, ExpectedEvidence, ReceiptId, RequestId, Stage};
pub use evidence::EvidenceBundle;
