//! Dead-letter spool for claims that could not be recorded.
//!
//! When the claims store stays unavailable after every retry, the draft
//! and its evidence are appended here as JSONL so the execution is not
//! lost. Draining replays entries through the ledger; recording is
//! idempotent by request id, so replaying an entry twice is harmless.
//!
//! All access is serialized through an exclusive lock on a sidecar
//! `.lock` file, since draining replaces the spool file itself.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::domain::{ClaimDraft, RequestId};
use crate::evidence::EvidenceBundle;

/// One unrecorded claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolEntry {
    pub spooled_at: DateTime<Utc>,
    pub draft: ClaimDraft,
    pub evidence: EvidenceBundle,
    /// Store error from the last recording attempt
    pub last_error: String,
}

impl SpoolEntry {
    pub fn new(draft: ClaimDraft, evidence: EvidenceBundle, last_error: impl Into<String>) -> Self {
        Self {
            spooled_at: Utc::now(),
            draft,
            evidence,
            last_error: last_error.into(),
        }
    }
}

/// File-based spool using JSONL format
#[derive(Debug, Clone)]
pub struct Spool {
    path: PathBuf,
}

impl Spool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Acquire the spool lock; released when the returned file drops
    fn lock(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create spool directory: {}", parent.display())
                })?;
            }
        }

        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open spool lock: {}", lock_path.display()))?;
        file.lock_exclusive()
            .context("Failed to acquire spool lock")?;
        Ok(file)
    }

    /// Append an entry durably
    pub fn append(&self, entry: &SpoolEntry) -> Result<()> {
        let _lock = self.lock()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open spool: {}", self.path.display()))?;

        let json = serde_json::to_string(entry).context("Failed to serialize spool entry")?;
        writeln!(file, "{}", json).context("Failed to write spool entry")?;
        file.flush().context("Failed to flush spool")?;
        file.sync_all().context("Failed to sync spool")?;

        Ok(())
    }

    /// Read every entry in append order
    pub fn entries(&self) -> Result<Vec<SpoolEntry>> {
        let _lock = self.lock()?;
        self.read_unlocked()
    }

    fn read_unlocked(&self) -> Result<Vec<SpoolEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open spool: {}", self.path.display()))?;

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context("Failed to read spool")?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: SpoolEntry = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse spool entry: {}", line))?;
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Drop entries for the given requests, rewriting the spool atomically
    ///
    /// Entries appended since they were read are preserved.
    pub fn remove(&self, recorded: &HashSet<RequestId>) -> Result<usize> {
        if recorded.is_empty() {
            return Ok(0);
        }

        let _lock = self.lock()?;
        let entries = self.read_unlocked()?;
        let before = entries.len();
        let remaining: Vec<_> = entries
            .into_iter()
            .filter(|e| !recorded.contains(&e.draft.request_id))
            .collect();

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).context("Failed to create spool temp file")?;
        for entry in &remaining {
            let json = serde_json::to_string(entry).context("Failed to serialize spool entry")?;
            writeln!(tmp, "{}", json).context("Failed to write spool temp file")?;
        }
        tmp.as_file().sync_all().context("Failed to sync spool temp file")?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace spool: {}", self.path.display()))?;

        Ok(before - remaining.len())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
