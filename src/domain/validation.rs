//! Validation records produced by the validation engine.

use serde::{Deserialize, Serialize};

/// Verdict on whether the observed outcome supports the request's claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationOutcome {
    /// Every declared expectation held
    Verified,
    /// Nothing falsifiable was declared
    Unverified,
    /// At least one declared expectation failed
    Contradicted,
}

impl ValidationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationOutcome::Verified => "VERIFIED",
            ValidationOutcome::Unverified => "UNVERIFIED",
            ValidationOutcome::Contradicted => "CONTRADICTED",
        }
    }
}

impl std::fmt::Display for ValidationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much weight the outcome carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    None,
    Weak,
    Moderate,
    Strong,
}

/// Kind of comparison performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    ExitCode,
    StdoutContains,
    StdoutPattern,
    StdoutSha256,
    ArtifactSha256,
    /// Explanatory entry, not a comparison
    Note,
}

/// Expected vs. observed for one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDetail {
    pub check: CheckKind,
    pub expected: String,
    pub observed: String,
    pub passed: bool,
}

/// Result of comparing a sandbox result against declared expectations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub outcome: ValidationOutcome,
    pub checks: Vec<CheckDetail>,
    pub confidence: Confidence,
}

impl ValidationRecord {
    /// Record attached to claims the policy engine refused
    pub fn policy_rejected() -> Self {
        Self {
            outcome: ValidationOutcome::Unverified,
            checks: vec![CheckDetail {
                check: CheckKind::Note,
                expected: "execution".to_string(),
                observed: "not executed: rejected by policy".to_string(),
                passed: false,
            }],
            confidence: Confidence::None,
        }
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckDetail> {
        self.checks
            .iter()
            .filter(|c| c.check != CheckKind::Note && !c.passed)
    }
}
