//! Evidence bundles and their canonical digest

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Domain separator for the evidence digest
const DIGEST_DOMAIN: &[u8] = b"claimgate-evidence-v1";

const TAG_STDOUT: u8 = 0x01;
const TAG_STDERR: u8 = 0x02;
const TAG_ARTIFACT_PATH: u8 = 0x03;
const TAG_ARTIFACT_BYTES: u8 = 0x04;

/// Captured bytes a claim is checked against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    #[serde(with = "hex_bytes")]
    pub stdout: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub stderr: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactEvidence>,
}

/// An output file captured after execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEvidence {
    /// Path as declared by the request
    pub path: PathBuf,
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
}

impl EvidenceBundle {
    pub fn new(stdout: Vec<u8>, stderr: Vec<u8>, artifact: Option<ArtifactEvidence>) -> Self {
        Self {
            stdout,
            stderr,
            artifact,
        }
    }

    /// Bundle for a claim that never executed
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compute the canonical evidence digest
    ///
    /// Each section is written as a one-byte tag, a big-endian u64 length,
    /// and the bytes, after a fixed domain prefix. Moving bytes between
    /// sections therefore changes the digest.
    ///
    /// # Returns
    /// * Lowercase hex SHA-256 (64 chars)
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(DIGEST_DOMAIN);
        update_section(&mut hasher, TAG_STDOUT, &self.stdout);
        update_section(&mut hasher, TAG_STDERR, &self.stderr);
        if let Some(ref artifact) = self.artifact {
            let path = artifact.path.to_string_lossy();
            update_section(&mut hasher, TAG_ARTIFACT_PATH, path.as_bytes());
            update_section(&mut hasher, TAG_ARTIFACT_BYTES, &artifact.bytes);
        }
        hex::encode(hasher.finalize())
    }

    /// Total evidence size in bytes
    pub fn len(&self) -> usize {
        self.stdout.len()
            + self.stderr.len()
            + self.artifact.as_ref().map(|a| a.bytes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn update_section(hasher: &mut Sha256, tag: u8, bytes: &[u8]) {
    hasher.update([tag]);
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Plain hex SHA-256 of a byte slice
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Read a declared output artifact
///
/// # Arguments
/// * `working_dir` - Directory relative paths resolve against
/// * `path` - Declared artifact path
/// * `max_bytes` - Read cap; larger files are truncated
///
/// # Returns
/// * `None` if the file does not exist or cannot be read
pub fn capture_artifact(working_dir: &Path, path: &Path, max_bytes: u64) -> Option<ArtifactEvidence> {
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    };

    let file = File::open(&resolved).ok()?;
    let mut bytes = Vec::new();
    file.take(max_bytes).read_to_end(&mut bytes).ok()?;

    Some(ArtifactEvidence {
        path: path.to_path_buf(),
        bytes,
    })
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_digest_is_stable() {
        let bundle = EvidenceBundle::new(b"hello\n".to_vec(), Vec::new(), None);
        assert_eq!(bundle.digest(), bundle.clone().digest());
        assert_eq!(bundle.digest().len(), 64);
    }

    #[test]
    fn test_moving_bytes_between_streams_changes_digest() {
        let a = EvidenceBundle::new(b"ab".to_vec(), b"c".to_vec(), None);
        let b = EvidenceBundle::new(b"a".to_vec(), b"bc".to_vec(), None);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_artifact_contributes_to_digest() {
        let plain = EvidenceBundle::new(b"x".to_vec(), Vec::new(), None);
        let with_artifact = EvidenceBundle::new(
            b"x".to_vec(),
            Vec::new(),
            Some(ArtifactEvidence {
                path: PathBuf::from("out.txt"),
                bytes: Vec::new(),
            }),
        );
        assert_ne!(plain.digest(), with_artifact.digest());
    }

    #[test]
    fn test_capture_artifact_relative_and_missing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("out.txt"), b"0123456789").unwrap();

        let captured = capture_artifact(dir.path(), Path::new("out.txt"), 4).unwrap();
        assert_eq!(captured.bytes, b"0123");
        assert_eq!(captured.path, PathBuf::from("out.txt"));

        assert!(capture_artifact(dir.path(), Path::new("missing.txt"), 4).is_none());
    }

    #[test]
    fn test_json_uses_hex() {
        let bundle = EvidenceBundle::new(vec![0xff, 0x00], Vec::new(), None);
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["stdout"], "ff00");
        let back: EvidenceBundle = serde_json::from_value(json).unwrap();
        assert_eq!(back, bundle);
    }
}
