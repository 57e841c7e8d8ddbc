//! Validation engine.
//!
//! Compares a sandbox result against the request's declared expectations.
//! Absence of expectations is never success: a request that declared
//! nothing falsifiable validates as UNVERIFIED.

use regex::Regex;

use crate::domain::{
    CheckDetail, CheckKind, CommandRequest, Confidence, SandboxResult, ValidationOutcome,
    ValidationRecord,
};
use crate::evidence::{sha256_hex, ArtifactEvidence};

/// Longest observed value kept in a check detail
const OBSERVED_PREVIEW_CHARS: usize = 200;

/// Validate a result against the request's expectations
///
/// `artifact` is the captured output file, if the request declared one and
/// the executor could read it. A declared artifact that is missing fails.
pub fn validate(
    request: &CommandRequest,
    result: &SandboxResult,
    artifact: Option<&ArtifactEvidence>,
) -> ValidationRecord {
    let expected = match request.expected {
        Some(ref e) if !e.is_empty() => e,
        _ => {
            return ValidationRecord {
                outcome: ValidationOutcome::Unverified,
                checks: Vec::new(),
                confidence: Confidence::None,
            }
        }
    };

    let stdout = String::from_utf8_lossy(&result.stdout);
    let mut checks = Vec::new();

    if let Some(code) = expected.exit_code {
        checks.push(CheckDetail {
            check: CheckKind::ExitCode,
            expected: code.to_string(),
            observed: if result.terminated_by_timeout {
                format!("{} (timed out)", result.exit_code)
            } else {
                result.exit_code.to_string()
            },
            passed: result.exit_code == code && !result.terminated_by_timeout,
        });
    }

    if let Some(ref needle) = expected.stdout_contains {
        checks.push(CheckDetail {
            check: CheckKind::StdoutContains,
            expected: needle.clone(),
            observed: preview(&stdout),
            passed: stdout.contains(needle.as_str()),
        });
    }

    if let Some(ref pattern) = expected.stdout_pattern {
        let (passed, observed) = match Regex::new(pattern) {
            Ok(re) => (re.is_match(&stdout), preview(&stdout)),
            Err(e) => (false, format!("invalid pattern: {}", e)),
        };
        checks.push(CheckDetail {
            check: CheckKind::StdoutPattern,
            expected: pattern.clone(),
            observed,
            passed,
        });
    }

    if let Some(ref hash) = expected.stdout_sha256 {
        let actual = sha256_hex(&result.stdout);
        checks.push(CheckDetail {
            check: CheckKind::StdoutSha256,
            expected: hash.to_lowercase(),
            passed: actual.eq_ignore_ascii_case(hash),
            observed: actual,
        });
    }

    if let Some(ref declared) = expected.artifact {
        let (passed, observed) = match artifact {
            Some(captured) => {
                let actual = sha256_hex(&captured.bytes);
                (actual.eq_ignore_ascii_case(&declared.sha256), actual)
            }
            None => (false, format!("artifact {} not found", declared.path.display())),
        };
        checks.push(CheckDetail {
            check: CheckKind::ArtifactSha256,
            expected: declared.sha256.to_lowercase(),
            observed,
            passed,
        });
    }

    let all_passed = checks.iter().all(|c| c.passed);
    let (outcome, confidence) = if all_passed {
        (ValidationOutcome::Verified, verified_confidence(&checks))
    } else {
        (ValidationOutcome::Contradicted, Confidence::Strong)
    };

    ValidationRecord {
        outcome,
        checks,
        confidence,
    }
}

/// Strength of a VERIFIED outcome, by the strongest check that passed
fn verified_confidence(checks: &[CheckDetail]) -> Confidence {
    checks
        .iter()
        .map(|c| match c.check {
            CheckKind::StdoutSha256 | CheckKind::ArtifactSha256 => Confidence::Strong,
            CheckKind::StdoutContains | CheckKind::StdoutPattern => Confidence::Moderate,
            CheckKind::ExitCode => Confidence::Weak,
            CheckKind::Note => Confidence::None,
        })
        .max()
        .unwrap_or(Confidence::None)
}

fn preview(text: &str) -> String {
    if text.chars().count() <= OBSERVED_PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(OBSERVED_PREVIEW_CHARS).collect();
    format!("{}...", cut)
}
