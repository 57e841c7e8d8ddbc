//! Evidence capture and tamper-evident hashing
//!
//! Every recorded claim carries the SHA-256 digest of its evidence bundle
//! (stdout, stderr, and an optional output artifact). The raw bytes are
//! stored next to the claim, so the digest can be recomputed at any later
//! time and compared against what was recorded.
//!
//! # Design Principles
//!
//! - **Canonical encoding**: sections are tagged and length-prefixed, so the
//!   digest is a function of the exact bytes in each section.
//! - **Capped capture**: artifacts are read up to a byte limit, the same way
//!   the sandbox caps output streams.
//!
//! # Example
//!
//! ```ignore
//! use claimgate::evidence::{capture_artifact, EvidenceBundle};
//!
//! let artifact = capture_artifact(&cwd, Path::new("report.txt"), 1 << 20);
//! let bundle = EvidenceBundle::new(result.stdout, result.stderr, artifact);
//! let hash = bundle.digest();
//! ```

pub mod bundle;

pub use bundle::{capture_artifact, sha256_hex, ArtifactEvidence, EvidenceBundle};
