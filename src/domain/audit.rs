//! Audit findings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ids::ReceiptId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Verified,
    Contradicted,
}

/// Result of independently re-checking one claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFinding {
    pub id: Uuid,
    pub receipt_id: ReceiptId,
    pub outcome: AuditOutcome,
    /// What disagreed, when something did
    pub discrepancy: Option<String>,
    pub recorded_hash: String,
    /// None when the evidence bytes could not be found
    pub recomputed_hash: Option<String>,
    pub audited_at: DateTime<Utc>,
}

impl AuditFinding {
    pub fn new(
        receipt_id: ReceiptId,
        recorded_hash: String,
        recomputed_hash: Option<String>,
    ) -> Self {
        let (outcome, discrepancy) = match recomputed_hash {
            Some(ref hash) if *hash == recorded_hash => (AuditOutcome::Verified, None),
            Some(ref hash) => (
                AuditOutcome::Contradicted,
                Some(format!(
                    "evidence hash mismatch: recorded {}, recomputed {}",
                    recorded_hash, hash
                )),
            ),
            None => (
                AuditOutcome::Contradicted,
                Some("evidence bytes missing".to_string()),
            ),
        };

        Self {
            id: Uuid::new_v4(),
            receipt_id,
            outcome,
            discrepancy,
            recorded_hash,
            recomputed_hash,
            audited_at: Utc::now(),
        }
    }

    pub fn is_contradicted(&self) -> bool {
        self.outcome == AuditOutcome::Contradicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_hash_verifies() {
        let finding = AuditFinding::new(ReceiptId::new(), "ab".into(), Some("ab".into()));
        assert_eq!(finding.outcome, AuditOutcome::Verified);
        assert!(finding.discrepancy.is_none());
    }

    #[test]
    fn test_mismatch_and_missing_contradict() {
        let mismatch = AuditFinding::new(ReceiptId::new(), "ab".into(), Some("cd".into()));
        assert!(mismatch.is_contradicted());
        assert!(mismatch.discrepancy.unwrap().contains("mismatch"));

        let missing = AuditFinding::new(ReceiptId::new(), "ab".into(), None);
        assert!(missing.is_contradicted());
    }
}
