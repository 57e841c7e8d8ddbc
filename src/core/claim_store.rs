//! Durable claims store backed by SQLite.
//!
//! Claims and their evidence bytes are written together in a single
//! `BEGIN IMMEDIATE` transaction on one writer connection, with WAL and
//! `synchronous=FULL`, so an acknowledged record survives a crash. Reads
//! open their own read-only connection and never wait on the writer.
//!
//! `recorded_at` is assigned under the writer lock and never goes
//! backwards, so timestamp order equals insertion order and the claim feed
//! can page on `(recorded_at, seq)`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::{AuditFinding, Claim, ClaimDraft, ReceiptId, RequestId};
use crate::evidence::{ArtifactEvidence, EvidenceBundle};

/// Claims fetched per feed page
const FEED_PAGE_SIZE: usize = 256;

/// How long a connection waits on a locked database
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS claims (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    receipt_id     TEXT NOT NULL UNIQUE,
    request_id     TEXT NOT NULL UNIQUE,
    recorded_at_us INTEGER NOT NULL,
    evidence_hash  TEXT NOT NULL,
    provider       TEXT NOT NULL,
    supersedes     TEXT,
    payload        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS claims_by_time ON claims (recorded_at_us, seq);

CREATE TABLE IF NOT EXISTS evidence (
    receipt_id    TEXT PRIMARY KEY REFERENCES claims (receipt_id),
    stdout        BLOB NOT NULL,
    stderr        BLOB NOT NULL,
    artifact_path TEXT,
    artifact      BLOB
);

CREATE TABLE IF NOT EXISTS audit_findings (
    id            TEXT PRIMARY KEY,
    receipt_id    TEXT NOT NULL,
    outcome       TEXT NOT NULL,
    audited_at_us INTEGER NOT NULL,
    payload       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS findings_by_receipt ON audit_findings (receipt_id);
";

/// Claims store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient: locked, busy, or unreachable storage
    #[error("claims store unavailable: {0}")]
    Unavailable(String),

    #[error("claims store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Same request id recorded before with different evidence
    #[error("request {request_id} already recorded as {existing} with different evidence")]
    Conflict {
        request_id: RequestId,
        existing: ReceiptId,
    },

    #[error("evidence hash mismatch: draft says {declared}, bytes hash to {actual}")]
    EvidenceMismatch { declared: String, actual: String },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(rusqlite::Error),
}

impl StoreError {
    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::DiskFull
                | ErrorCode::SystemIoFailure,
            ) => StoreError::Unavailable(e.to_string()),
            _ => StoreError::Database(e),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Unavailable(format!("store task failed: {}", e))
    }
}

/// Where a claim feed stands; feeds restart from here
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedPosition {
    /// Last delivered `recorded_at` in microseconds
    pub after_us: i64,
    /// Last delivered sequence number
    pub after_seq: i64,
    /// Highest sequence number this feed will deliver
    pub until_seq: i64,
}

/// One row from a feed page
#[derive(Debug, Clone)]
pub struct FeedEntry {
    pub seq: i64,
    pub recorded_at_us: i64,
    pub claim: Claim,
}

/// Backend for paging claims in timestamp order
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_page(
        &self,
        position: FeedPosition,
        limit: usize,
    ) -> Result<Vec<FeedEntry>, StoreError>;
}

/// Lazy, finite, restartable sequence of claims ordered by timestamp
pub struct ClaimFeed {
    source: Arc<dyn FeedSource>,
    position: FeedPosition,
    page: VecDeque<FeedEntry>,
    exhausted: bool,
}

impl ClaimFeed {
    pub fn new(source: Arc<dyn FeedSource>, position: FeedPosition) -> Self {
        Self {
            source,
            position,
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Next claim, fetching another page when the buffer runs dry
    pub async fn next(&mut self) -> Option<Result<Claim, StoreError>> {
        if self.page.is_empty() && !self.exhausted {
            match self.source.fetch_page(self.position, FEED_PAGE_SIZE).await {
                Ok(rows) => {
                    if rows.len() < FEED_PAGE_SIZE {
                        self.exhausted = true;
                    }
                    self.page.extend(rows);
                }
                Err(e) => return Some(Err(e)),
            }
        }

        let entry = self.page.pop_front()?;
        self.position.after_us = entry.recorded_at_us;
        self.position.after_seq = entry.seq;
        Some(Ok(entry.claim))
    }

    /// Drain the rest of the feed
    pub async fn collect(mut self) -> Result<Vec<Claim>, StoreError> {
        let mut claims = Vec::new();
        while let Some(claim) = self.next().await {
            claims.push(claim?);
        }
        Ok(claims)
    }

    /// Position after the last delivered claim
    pub fn position(&self) -> FeedPosition {
        self.position
    }
}

/// Durable, append-only claims ledger
#[async_trait]
pub trait ClaimLedger: Send + Sync {
    /// Persist a claim and its evidence atomically
    ///
    /// Idempotent by request id: re-recording the same evidence returns the
    /// existing receipt.
    async fn record(&self, draft: ClaimDraft, evidence: EvidenceBundle) -> Result<ReceiptId, StoreError>;

    async fn get(&self, receipt_id: ReceiptId) -> Result<Option<Claim>, StoreError>;

    /// Stored evidence bytes for a claim
    async fn evidence(&self, receipt_id: ReceiptId) -> Result<Option<EvidenceBundle>, StoreError>;

    async fn find_by_request(&self, request_id: RequestId) -> Result<Option<Claim>, StoreError>;

    /// Claims recorded at or after `since`, up to those present now
    async fn list_since(&self, since: DateTime<Utc>) -> Result<ClaimFeed, StoreError>;

    /// Restart a feed exactly where it stopped, with its original bound
    async fn resume_feed(&self, position: FeedPosition) -> Result<ClaimFeed, StoreError>;

    /// Continue past a feed's end, up to the claims present now
    async fn follow_feed(&self, position: FeedPosition) -> Result<ClaimFeed, StoreError>;

    /// Append an audit finding (claims are never touched)
    async fn record_finding(&self, finding: AuditFinding) -> Result<(), StoreError>;

    async fn findings_for(&self, receipt_id: ReceiptId) -> Result<Vec<AuditFinding>, StoreError>;
}

struct Writer {
    conn: Connection,
}

/// SQLite implementation of [`ClaimLedger`]
#[derive(Clone)]
pub struct SqliteClaimStore {
    writer: Arc<Mutex<Writer>>,
    reader: Arc<SqliteReader>,
}

/// Opens a fresh read-only connection per operation
struct SqliteReader {
    path: PathBuf,
}

impl SqliteReader {
    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn max_seq(&self) -> Result<i64, StoreError> {
        let conn = self.connect()?;
        let max: Option<i64> = conn.query_row("SELECT MAX(seq) FROM claims", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0))
    }
}

#[async_trait]
impl FeedSource for SqliteReader {
    async fn fetch_page(
        &self,
        position: FeedPosition,
        limit: usize,
    ) -> Result<Vec<FeedEntry>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT seq, recorded_at_us, payload FROM claims \
             WHERE (recorded_at_us > ?1 OR (recorded_at_us = ?1 AND seq > ?2)) \
               AND seq <= ?3 \
             ORDER BY recorded_at_us ASC, seq ASC \
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![position.after_us, position.after_seq, position.until_seq, limit as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(seq, recorded_at_us, payload)| {
                Ok(FeedEntry {
                    seq,
                    recorded_at_us,
                    claim: decode_claim(&payload)?,
                })
            })
            .collect()
    }
}

impl SqliteClaimStore {
    /// Open (or create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "Opened claims store");

        Ok(Self {
            writer: Arc::new(Mutex::new(Writer { conn })),
            reader: Arc::new(SqliteReader { path }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.reader.path
    }

    async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let reader = Arc::clone(&self.reader);
        tokio::task::spawn_blocking(move || {
            let conn = reader.connect()?;
            f(&conn)
        })
        .await?
    }

    async fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Writer) -> Result<T, StoreError> + Send + 'static,
    {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut guard = writer.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        })
        .await?
    }

    fn feed(&self, position: FeedPosition) -> ClaimFeed {
        ClaimFeed::new(self.reader.clone() as Arc<dyn FeedSource>, position)
    }

    async fn current_max_seq(&self) -> Result<i64, StoreError> {
        let reader = Arc::clone(&self.reader);
        tokio::task::spawn_blocking(move || reader.max_seq()).await?
    }
}

fn record_blocking(
    writer: &mut Writer,
    draft: ClaimDraft,
    evidence: EvidenceBundle,
) -> Result<ReceiptId, StoreError> {
    let actual = evidence.digest();
    if actual != draft.evidence_hash {
        return Err(StoreError::EvidenceMismatch {
            declared: draft.evidence_hash,
            actual,
        });
    }

    let tx = writer
        .conn
        .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    let existing: Option<(String, String)> = tx
        .query_row(
            "SELECT receipt_id, evidence_hash FROM claims WHERE request_id = ?1",
            params![draft.request_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((receipt, hash)) = existing {
        let existing = parse_receipt(&receipt)?;
        if hash == draft.evidence_hash {
            debug!(receipt_id = %existing, request_id = %draft.request_id, "Claim already recorded");
            return Ok(existing);
        }
        return Err(StoreError::Conflict {
            request_id: draft.request_id,
            existing,
        });
    }

    // Read under the write lock so other processes sharing the file keep
    // recorded_at non-decreasing too
    let floor: Option<i64> =
        tx.query_row("SELECT MAX(recorded_at_us) FROM claims", [], |row| row.get(0))?;
    let now_us = Utc::now().timestamp_micros().max(floor.unwrap_or(i64::MIN));
    let recorded_at = DateTime::<Utc>::from_timestamp_micros(now_us)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {} out of range", now_us)))?;

    let receipt_id = draft.receipt_id;
    let claim = draft.into_claim(recorded_at);
    let payload =
        serde_json::to_string(&claim).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    tx.execute(
        "INSERT INTO claims \
         (receipt_id, request_id, recorded_at_us, evidence_hash, provider, supersedes, payload) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            receipt_id.to_string(),
            claim.request_id.to_string(),
            now_us,
            claim.evidence_hash,
            claim.provider,
            claim.supersedes.map(|r| r.to_string()),
            payload,
        ],
    )?;

    let (artifact_path, artifact_bytes) = match evidence.artifact {
        Some(a) => (Some(a.path.to_string_lossy().into_owned()), Some(a.bytes)),
        None => (None, None),
    };
    tx.execute(
        "INSERT INTO evidence (receipt_id, stdout, stderr, artifact_path, artifact) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            receipt_id.to_string(),
            evidence.stdout,
            evidence.stderr,
            artifact_path,
            artifact_bytes,
        ],
    )?;

    tx.commit()?;

    Ok(receipt_id)
}

fn decode_claim(payload: &str) -> Result<Claim, StoreError> {
    serde_json::from_str(payload).map_err(|e| StoreError::Corrupt(format!("claim payload: {}", e)))
}

fn parse_receipt(value: &str) -> Result<ReceiptId, StoreError> {
    value
        .parse()
        .map_err(|e| StoreError::Corrupt(format!("receipt id '{}': {}", value, e)))
}

#[async_trait]
impl ClaimLedger for SqliteClaimStore {
    async fn record(&self, draft: ClaimDraft, evidence: EvidenceBundle) -> Result<ReceiptId, StoreError> {
        self.write(move |writer| record_blocking(writer, draft, evidence))
            .await
    }

    async fn get(&self, receipt_id: ReceiptId) -> Result<Option<Claim>, StoreError> {
        self.read(move |conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM claims WHERE receipt_id = ?1",
                    params![receipt_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            payload.as_deref().map(decode_claim).transpose()
        })
        .await
    }

    async fn evidence(&self, receipt_id: ReceiptId) -> Result<Option<EvidenceBundle>, StoreError> {
        self.read(move |conn| {
            let row = conn
                .query_row(
                    "SELECT stdout, stderr, artifact_path, artifact FROM evidence WHERE receipt_id = ?1",
                    params![receipt_id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, Vec<u8>>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<Vec<u8>>>(3)?,
                        ))
                    },
                )
                .optional()?;

            Ok(row.map(|(stdout, stderr, path, bytes)| {
                let artifact = path.map(|p| ArtifactEvidence {
                    path: PathBuf::from(p),
                    bytes: bytes.unwrap_or_default(),
                });
                EvidenceBundle::new(stdout, stderr, artifact)
            }))
        })
        .await
    }

    async fn find_by_request(&self, request_id: RequestId) -> Result<Option<Claim>, StoreError> {
        self.read(move |conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM claims WHERE request_id = ?1",
                    params![request_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            payload.as_deref().map(decode_claim).transpose()
        })
        .await
    }

    async fn list_since(&self, since: DateTime<Utc>) -> Result<ClaimFeed, StoreError> {
        let until_seq = self.current_max_seq().await?;
        Ok(self
            .feed(FeedPosition {
                after_us: since.timestamp_micros(),
                // seq starts at 1, so this includes claims at exactly `since`
                after_seq: 0,
                until_seq,
            }))
    }

    async fn resume_feed(&self, position: FeedPosition) -> Result<ClaimFeed, StoreError> {
        Ok(self.feed(position))
    }

    async fn follow_feed(&self, position: FeedPosition) -> Result<ClaimFeed, StoreError> {
        let until_seq = self.current_max_seq().await?;
        Ok(self
            .feed(FeedPosition {
                until_seq,
                ..position
            }))
    }

    async fn record_finding(&self, finding: AuditFinding) -> Result<(), StoreError> {
        self.write(move |writer| {
            let payload =
                serde_json::to_string(&finding).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let outcome = serde_json::to_value(finding.outcome)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default();
            writer.conn.execute(
                "INSERT INTO audit_findings (id, receipt_id, outcome, audited_at_us, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    finding.id.to_string(),
                    finding.receipt_id.to_string(),
                    outcome,
                    finding.audited_at.timestamp_micros(),
                    payload,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn findings_for(&self, receipt_id: ReceiptId) -> Result<Vec<AuditFinding>, StoreError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM audit_findings WHERE receipt_id = ?1 ORDER BY audited_at_us ASC",
            )?;
            let payloads = stmt
                .query_map(params![receipt_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            payloads
                .iter()
                .map(|p| {
                    serde_json::from_str(p)
                        .map_err(|e| StoreError::Corrupt(format!("finding payload: {}", e)))
                })
                .collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClaimDisposition, ValidationRecord};
    use tempfile::TempDir;

    fn draft(stdout: &[u8]) -> (ClaimDraft, EvidenceBundle) {
        let evidence = EvidenceBundle::new(stdout.to_vec(), Vec::new(), None);
        let draft = ClaimDraft {
            receipt_id: ReceiptId::new(),
            request_id: RequestId::new(),
            requester: "agent".into(),
            command: "echo".into(),
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
        (draft, evidence)
    }

    #[tokio::test]
    async fn test_record_and_get() {
        let dir = TempDir::new().unwrap();
        let store = SqliteClaimStore::open(dir.path().join("claims.db")).unwrap();

        let (draft, evidence) = draft(b"hi");
        let receipt = store.record(draft.clone(), evidence.clone()).await.unwrap();
        assert_eq!(receipt, draft.receipt_id);

        let claim = store.get(receipt).await.unwrap().unwrap();
        assert_eq!(claim.request_id, draft.request_id);
        assert_eq!(store.evidence(receipt).await.unwrap().unwrap(), evidence);
    }

    #[tokio::test]
    async fn test_evidence_must_match_hash() {
        let dir = TempDir::new().unwrap();
        let store = SqliteClaimStore::open(dir.path().join("claims.db")).unwrap();

        let (draft, _) = draft(b"hi");
        let other = EvidenceBundle::new(b"bye".to_vec(), Vec::new(), None);
        let err = store.record(draft, other).await.unwrap_err();
        assert!(matches!(err, StoreError::EvidenceMismatch { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_reopen_keeps_timestamps_monotonic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("claims.db");

        let first = {
            let store = SqliteClaimStore::open(&path).unwrap();
            let (d, e) = draft(b"1");
            let receipt = store.record(d, e).await.unwrap();
            store.get(receipt).await.unwrap().unwrap().recorded_at
        };

        let store = SqliteClaimStore::open(&path).unwrap();
        let (d, e) = draft(b"2");
        let receipt = store.record(d, e).await.unwrap();
        let second = store.get(receipt).await.unwrap().unwrap().recorded_at;
        assert!(second >= first);
    }
}
