//! Auditor Integration Tests
//!
//! Tamper with stored evidence behind the store's back and check the
//! auditor notices without touching the claims.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use claimgate::core::{Auditor, ClaimLedger, SamplePolicy, SqliteClaimStore};
use claimgate::domain::{
    AuditOutcome, ClaimDisposition, ClaimDraft, ReceiptId, RequestId, ValidationRecord,
};
use claimgate::evidence::EvidenceBundle;
use rusqlite::{params, Connection};
use tempfile::TempDir;
use tokio::sync::watch;

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

async fn record(store: &SqliteClaimStore, stdout: &str) -> ReceiptId {
    let evidence = EvidenceBundle::new(stdout.as_bytes().to_vec(), Vec::new(), None);
    let draft = ClaimDraft {
        receipt_id: ReceiptId::new(),
        request_id: RequestId::new(),
        requester: "agent".into(),
        command: format!("echo {}", stdout),
        intent: String::new(),
        disposition: ClaimDisposition::Executed {
            exit_code: 0,
            duration_ms: 1,
            terminated_by_timeout: false,
            violations: Vec::new(),
        },
        validation: ValidationRecord::policy_rejected(),
        evidence_hash: evidence.digest(),
        provider: "local".into(),
        supersedes: None,
    };
    store.record(draft, evidence).await.unwrap()
}

fn tamper(dir: &TempDir, receipt: ReceiptId, stdout: &str) {
    let conn = Connection::open(dir.path().join("claims.db")).unwrap();
    conn.busy_timeout(Duration::from_secs(5)).unwrap();
    let changed = conn
        .execute(
            "UPDATE evidence SET stdout = ?1 WHERE receipt_id = ?2",
            params![stdout.as_bytes(), receipt.to_string()],
        )
        .unwrap();
    assert_eq!(changed, 1);
}

#[tokio::test]
async fn test_untouched_claims_verify() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteClaimStore::open(dir.path().join("claims.db")).unwrap());
    for i in 0..3 {
        record(&store, &format!("fine-{}", i)).await;
    }

    let auditor = Auditor::new(store.clone(), SamplePolicy::all());
    let report = auditor.audit_since(epoch()).await.unwrap();

    assert_eq!(report.findings.len(), 3);
    assert_eq!(report.contradicted().count(), 0);
    assert!(report
        .findings
        .iter()
        .all(|f| f.outcome == AuditOutcome::Verified));
}

#[tokio::test]
async fn test_tampered_evidence_is_contradicted() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteClaimStore::open(dir.path().join("claims.db")).unwrap());
    let honest = record(&store, "all tests passed").await;
    let forged = record(&store, "all tests passed!").await;
    let before = store.get(forged).await.unwrap().unwrap();

    tamper(&dir, forged, "3 tests failed");

    let auditor = Auditor::new(store.clone(), SamplePolicy::all());
    let report = auditor.audit_since(epoch()).await.unwrap();

    let contradicted: Vec<_> = report.contradicted().collect();
    assert_eq!(contradicted.len(), 1);
    assert_eq!(contradicted[0].receipt_id, forged);
    assert!(contradicted[0]
        .discrepancy
        .as_deref()
        .unwrap()
        .starts_with("evidence hash mismatch"));

    // Findings are stored next to the claim, and the claim is unchanged
    let findings = store.findings_for(forged).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert!(findings[0].is_contradicted());
    assert_eq!(store.get(forged).await.unwrap().unwrap(), before);

    let findings = store.findings_for(honest).await.unwrap();
    assert_eq!(findings[0].outcome, AuditOutcome::Verified);
}

#[tokio::test]
async fn test_missing_evidence_is_contradicted() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteClaimStore::open(dir.path().join("claims.db")).unwrap());
    let receipt = record(&store, "vanishing").await;

    let conn = Connection::open(dir.path().join("claims.db")).unwrap();
    conn.execute(
        "DELETE FROM evidence WHERE receipt_id = ?1",
        params![receipt.to_string()],
    )
    .unwrap();

    let auditor = Auditor::new(store.clone(), SamplePolicy::all());
    let claim = store.get(receipt).await.unwrap().unwrap();
    let finding = auditor.audit_claim(&claim).await.unwrap();

    assert!(finding.is_contradicted());
    assert!(finding.recomputed_hash.is_none());
    assert_eq!(finding.discrepancy.as_deref(), Some("evidence bytes missing"));
}

#[tokio::test]
async fn test_zero_sample_rate_skips_everything() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteClaimStore::open(dir.path().join("claims.db")).unwrap());
    let receipt = record(&store, "skipped").await;

    let auditor = Auditor::new(store.clone(), SamplePolicy::new(0.0));
    let report = auditor.audit_since(epoch()).await.unwrap();

    assert!(report.findings.is_empty());
    assert_eq!(report.skipped, 1);
    assert!(store.findings_for(receipt).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_periodic_audit_picks_up_new_claims_and_stops() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteClaimStore::open(dir.path().join("claims.db")).unwrap());
    let early = record(&store, "before start").await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let auditor = Auditor::new(store.clone(), SamplePolicy::all());
    let task = tokio::spawn(async move {
        auditor
            .run_periodic(epoch(), Duration::from_millis(50), shutdown_rx)
            .await
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let late = record(&store, "after start").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    shutdown_tx.send(true).unwrap();
    let position = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("auditor stops on shutdown")
        .unwrap()
        .unwrap();

    assert_eq!(store.findings_for(early).await.unwrap().len(), 1);
    assert_eq!(store.findings_for(late).await.unwrap().len(), 1);

    // Nothing left past the returned position
    let rest = store.resume_feed(position).await.unwrap().collect().await.unwrap();
    assert!(rest.is_empty());
}
