//! Out-of-band claim auditor.
//!
//! Samples recorded claims, recomputes each evidence digest from the
//! stored bytes, and appends a finding. Claims themselves are never
//! modified.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::domain::{AuditFinding, Claim, ReceiptId};

use super::claim_store::{ClaimFeed, ClaimLedger, FeedPosition, StoreError};

/// Fraction of claims to audit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplePolicy {
    /// 0.0 audits nothing, 1.0 audits every claim
    pub rate: f64,
}

impl Default for SamplePolicy {
    fn default() -> Self {
        Self::all()
    }
}

impl SamplePolicy {
    /// Rate clamped into [0, 1]; NaN audits nothing
    pub fn new(rate: f64) -> Self {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        Self { rate }
    }

    pub fn all() -> Self {
        Self { rate: 1.0 }
    }

    /// Whether this receipt falls in the sample
    ///
    /// Deterministic: the same receipt is always in or always out.
    pub fn selects(&self, receipt_id: ReceiptId) -> bool {
        if self.rate >= 1.0 {
            return true;
        }
        if self.rate <= 0.0 {
            return false;
        }

        let digest = Sha256::digest(receipt_id.as_uuid().as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let point = u64::from_be_bytes(prefix) as f64 / u64::MAX as f64;
        point < self.rate
    }
}

/// Summary of one audit pass
#[derive(Debug, Clone, Default)]
pub struct AuditReport {
    pub findings: Vec<AuditFinding>,
    /// Claims seen but outside the sample
    pub skipped: usize,
}

impl AuditReport {
    pub fn contradicted(&self) -> impl Iterator<Item = &AuditFinding> {
        self.findings.iter().filter(|f| f.is_contradicted())
    }
}

/// Re-checks recorded claims against their stored evidence
pub struct Auditor {
    ledger: Arc<dyn ClaimLedger>,
    sample: SamplePolicy,
}

impl Auditor {
    pub fn new(ledger: Arc<dyn ClaimLedger>, sample: SamplePolicy) -> Self {
        Self { ledger, sample }
    }

    /// Audit one claim and append the finding
    pub async fn audit_claim(&self, claim: &Claim) -> Result<AuditFinding, StoreError> {
        let recomputed = self
            .ledger
            .evidence(claim.receipt_id)
            .await?
            .map(|evidence| evidence.digest());

        let finding = AuditFinding::new(claim.receipt_id, claim.evidence_hash.clone(), recomputed);
        if let Some(ref discrepancy) = finding.discrepancy {
            warn!(
                receipt_id = %claim.receipt_id,
                request_id = %claim.request_id,
                discrepancy = %discrepancy,
                "Audit contradicted claim"
            );
        } else {
            debug!(receipt_id = %claim.receipt_id, "Audit verified claim");
        }

        self.ledger.record_finding(finding.clone()).await?;
        Ok(finding)
    }

    /// Audit every sampled claim left in a feed
    ///
    /// The feed's position advances as claims are consumed, so a failed
    /// pass can resume from where it stopped.
    pub async fn audit_feed(&self, feed: &mut ClaimFeed) -> Result<AuditReport, StoreError> {
        let mut report = AuditReport::default();

        while let Some(claim) = feed.next().await {
            let claim = claim?;
            if !self.sample.selects(claim.receipt_id) {
                report.skipped += 1;
                continue;
            }
            report.findings.push(self.audit_claim(&claim).await?);
        }

        Ok(report)
    }

    /// Audit sampled claims recorded at or after `since`
    #[instrument(skip(self))]
    pub async fn audit_since(&self, since: DateTime<Utc>) -> Result<AuditReport, StoreError> {
        let mut feed = self.ledger.list_since(since).await?;
        let report = self.audit_feed(&mut feed).await?;
        info!(
            audited = report.findings.len(),
            contradicted = report.contradicted().count(),
            skipped = report.skipped,
            "Audit pass complete"
        );
        Ok(report)
    }

    /// Audit new claims every `interval` until `shutdown` flips to true
    ///
    /// Returns the position reached, so a later call can continue from it.
    pub async fn run_periodic(
        &self,
        since: DateTime<Utc>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<FeedPosition, StoreError> {
        let mut position = self.ledger.list_since(since).await?.position();
        let mut ticker = tokio::time::interval(interval);
        info!(interval_ms = interval.as_millis() as u64, "Auditor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut feed = self.ledger.follow_feed(position).await?;
                    let result = self.audit_feed(&mut feed).await;
                    position = feed.position();
                    match result {
                        Ok(report) if !report.findings.is_empty() => info!(
                            audited = report.findings.len(),
                            contradicted = report.contradicted().count(),
                            "Periodic audit tick"
                        ),
                        Ok(_) => {}
                        // Transient failures are picked up again next tick
                        Err(e) if e.is_retryable() => warn!(error = %e, "Audit tick failed"),
                        Err(e) => return Err(e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Auditor stopping");
                        return Ok(position);
                    }
                }
            }
        }
    }
}
