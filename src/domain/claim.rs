//! Claims: append-only records of what a command did.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ReceiptId, RequestId};
use super::result::{LimitViolation, SandboxResult};
use super::validation::ValidationRecord;

/// Provider tag for claims that never reached an executor
pub const POLICY_PROVIDER: &str = "policy";

/// What happened to the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ClaimDisposition {
    /// The command ran and produced a sandbox result
    Executed {
        exit_code: i32,
        duration_ms: u64,
        terminated_by_timeout: bool,
        #[serde(default)]
        violations: Vec<LimitViolation>,
    },

    /// The policy engine refused the command; no sandbox result exists
    PolicyRejected {
        rule_id: Option<String>,
        rationale: String,
        ruleset_version: String,
    },
}

impl ClaimDisposition {
    pub fn executed(result: &SandboxResult) -> Self {
        ClaimDisposition::Executed {
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            terminated_by_timeout: result.terminated_by_timeout,
            violations: result.violations.clone(),
        }
    }

    pub fn is_policy_rejected(&self) -> bool {
        matches!(self, ClaimDisposition::PolicyRejected { .. })
    }
}

/// A claim ready to be recorded
///
/// The store stamps `recorded_at` when it accepts the draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimDraft {
    pub receipt_id: ReceiptId,
    pub request_id: RequestId,
    pub requester: String,
    pub command: String,
    pub intent: String,
    pub disposition: ClaimDisposition,
    pub validation: ValidationRecord,
    pub evidence_hash: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<ReceiptId>,
}

impl ClaimDraft {
    pub fn into_claim(self, recorded_at: DateTime<Utc>) -> Claim {
        Claim {
            receipt_id: self.receipt_id,
            request_id: self.request_id,
            requester: self.requester,
            command: self.command,
            intent: self.intent,
            disposition: self.disposition,
            validation: self.validation,
            evidence_hash: self.evidence_hash,
            recorded_at,
            provider: self.provider,
            supersedes: self.supersedes,
        }
    }
}

/// A recorded claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub receipt_id: ReceiptId,
    pub request_id: RequestId,
    pub requester: String,
    pub command: String,
    pub intent: String,
    pub disposition: ClaimDisposition,
    pub validation: ValidationRecord,
    /// Hex SHA-256 of the evidence bundle at record time
    pub evidence_hash: String,
    pub recorded_at: DateTime<Utc>,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<ReceiptId>,
}

impl Claim {
    pub fn is_policy_rejected(&self) -> bool {
        self.disposition.is_policy_rejected()
    }
}
