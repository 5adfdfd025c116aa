//! Transparency log anchoring.
//!
//! The transparency log is an append-only ledger of package checksum
//! commitments maintained by an external writer. The pipeline only reads
//! it: a package is installable only if the log holds an entry under the
//! artifact's declared Merkle root whose payload names exactly the same
//! package type, supplier, package name, and checksum.
//!
//! # Security
//!
//! All four comparisons are evaluated (no early exit) and each uses
//! constant-time equality, so neither timing nor short-circuiting reveals
//! which field or byte differed. Every mismatching field is reported.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::{Choice, ConstantTimeEq};

use crate::error::UpdateError;
use crate::package::PackageIdentity;

/// Payload committed by one transparency log leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload {
    pub pkg_type: String,
    pub supplier: String,
    pub name: String,
    pub checksum: String,
    #[serde(default)]
    pub version: String,
}

/// One transparency log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub merkle_root: String,
    pub payload: LogPayload,
    pub recorded_at: DateTime<Utc>,
}

/// Read interface over the transparency log.
#[async_trait]
pub trait TransparencyLog: Send + Sync {
    /// Find the entry recorded under `merkle_root`, if any.
    async fn lookup(&self, merkle_root: &str) -> Result<Option<LogEntry>, UpdateError>;
}

/// A field of the logged payload that disagreed with the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchReason {
    PackageType,
    Supplier,
    PackageName,
    Checksum,
}

impl fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PackageType => "wrong package type",
            Self::Supplier => "wrong supplier",
            Self::PackageName => "wrong package",
            Self::Checksum => "checksum mismatch",
        })
    }
}

/// Why an artifact failed transparency log anchoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MerkleFailure {
    /// The artifact declared no Merkle root
    RootNotDeclared,
    /// No entry exists under the declared root
    AnchorMissing,
    /// An entry exists but disagrees on one or more fields
    Mismatch(Vec<MismatchReason>),
}

impl fmt::Display for MerkleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RootNotDeclared => f.write_str("no Merkle root declared"),
            Self::AnchorMissing => f.write_str("Merkle root not found in transparency log"),
            Self::Mismatch(reasons) => {
                let reasons: Vec<String> = reasons.iter().map(ToString::to_string).collect();
                f.write_str(&reasons.join(", "))
            }
        }
    }
}

/// Constant-time string equality.
///
/// Running time depends only on the lengths of the inputs, never on the
/// position of the first differing byte.
pub fn ct_eq_str(a: &str, b: &str) -> bool {
    ct_eq_choice(a, b).into()
}

fn ct_eq_choice(a: &str, b: &str) -> Choice {
    a.as_bytes().ct_eq(b.as_bytes())
}

/// Check a looked-up log entry against the artifact's identity and
/// locally computed checksum.
///
/// Package type and checksum compare case-insensitively (type names and
/// hex digests carry no case information); supplier and package name are
/// exact.
pub fn verify_anchor(
    entry: Option<&LogEntry>,
    identity: &PackageIdentity,
    checksum: &str,
) -> Result<(), MerkleFailure> {
    let entry = entry.ok_or(MerkleFailure::AnchorMissing)?;
    let payload = &entry.payload;

    let checks = [
        (
            MismatchReason::PackageType,
            ct_eq_choice(
                &payload.pkg_type.to_ascii_lowercase(),
                identity.kind.as_str(),
            ),
        ),
        (
            MismatchReason::Supplier,
            ct_eq_choice(&payload.supplier, &identity.supplier),
        ),
        (
            MismatchReason::PackageName,
            ct_eq_choice(&payload.name, &identity.name),
        ),
        (
            MismatchReason::Checksum,
            ct_eq_choice(
                &payload.checksum.to_ascii_lowercase(),
                &checksum.to_ascii_lowercase(),
            ),
        ),
    ];

    let all_match = checks
        .iter()
        .fold(Choice::from(1u8), |acc, (_, ok)| acc & *ok);
    if bool::from(all_match) {
        return Ok(());
    }

    let reasons = checks
        .iter()
        .filter(|(_, ok)| !bool::from(*ok))
        .map(|(reason, _)| *reason)
        .collect();
    Err(MerkleFailure::Mismatch(reasons))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::PackageKind;

    fn entry(pkg_type: &str, supplier: &str, name: &str, checksum: &str) -> LogEntry {
        LogEntry {
            merkle_root: "root".to_string(),
            payload: LogPayload {
                pkg_type: pkg_type.to_string(),
                supplier: supplier.to_string(),
                name: name.to_string(),
                checksum: checksum.to_string(),
                version: "2.0.0".to_string(),
            },
            recorded_at: Utc::now(),
        }
    }

    fn identity() -> PackageIdentity {
        PackageIdentity::new(PackageKind::Extension, "acme", "widget")
    }

    #[test]
    fn test_exact_match_passes() {
        let e = entry("Extension", "acme", "widget", "ABCDEF");
        assert_eq!(verify_anchor(Some(&e), &identity(), "abcdef"), Ok(()));
    }

    #[test]
    fn test_missing_entry() {
        assert_eq!(
            verify_anchor(None, &identity(), "abcdef"),
            Err(MerkleFailure::AnchorMissing)
        );
    }

    #[test]
    fn test_each_field_checked_independently() {
        let cases = [
            (entry("theme", "acme", "widget", "aa"), MismatchReason::PackageType),
            (entry("extension", "evil", "widget", "aa"), MismatchReason::Supplier),
            (entry("extension", "acme", "gadget", "aa"), MismatchReason::PackageName),
            (entry("extension", "acme", "widget", "bb"), MismatchReason::Checksum),
        ];
        for (e, reason) in cases {
            assert_eq!(
                verify_anchor(Some(&e), &identity(), "aa"),
                Err(MerkleFailure::Mismatch(vec![reason]))
            );
        }
    }

    #[test]
    fn test_all_mismatches_reported() {
        let e = entry("core", "evil", "gadget", "bb");
        let err = verify_anchor(Some(&e), &identity(), "aa").unwrap_err();
        assert_eq!(
            err,
            MerkleFailure::Mismatch(vec![
                MismatchReason::PackageType,
                MismatchReason::Supplier,
                MismatchReason::PackageName,
                MismatchReason::Checksum,
            ])
        );
        assert_eq!(
            err.to_string(),
            "wrong package type, wrong supplier, wrong package, checksum mismatch"
        );
    }

    #[test]
    fn test_ct_eq_str() {
        assert!(ct_eq_str("abc", "abc"));
        assert!(!ct_eq_str("abc", "abd"));
        assert!(!ct_eq_str("abc", "abcd"));
        assert!(ct_eq_str("", ""));
    }
}
