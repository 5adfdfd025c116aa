//! Property-based tests for continuum-updater.
//!
//! These tests use proptest to verify correctness properties across
//! randomly generated inputs.
//!
//! # Properties Tested
//!
//! - Version selection picks the semver maximum
//! - Channel envelopes only open under the pinned channel key
//! - Package signatures bind the exact bytes
//! - Transparency log anchoring reports exactly the mismatching fields
//! - Constant-time comparisons agree with ordinary equality
//! - Artifact hashes detect modification on disk
//! - Onion prioritization is a stable partition

#![cfg(test)]

use proptest::prelude::*;
use tempfile::TempDir;

use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use semver::Version;

use crate::artifact::{compute_hash, UpdateArtifact};
use crate::channel::{Channel, MetadataPayload, SignedEnvelope, VersionEntry};
use crate::config::ChannelConfig;
use crate::installer::select_latest_version;
use crate::keys::{encode_signature, ChannelPublicKey, SupplierPublicKey};
use crate::package::{PackageIdentity, PackageKind};
use crate::transparency::{
    ct_eq_str, verify_anchor, LogEntry, LogPayload, MerkleFailure, MismatchReason,
};

// =============================================================================
// Generators
// =============================================================================

/// Generate a random Ed25519 signing key from 32 random bytes.
fn arb_signing_key() -> impl Strategy<Value = SigningKey> {
    prop::array::uniform32(any::<u8>()).prop_map(|bytes| SigningKey::from_bytes(&bytes))
}

/// Generate a random version.
fn arb_version() -> impl Strategy<Value = Version> {
    (0u64..20, 0u64..20, 0u64..20)
        .prop_map(|(major, minor, patch)| Version::new(major, minor, patch))
}

/// Generate random package content (1 byte to 4KB).
fn arb_content() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..4096)
}

/// Generate a short identifier.
fn arb_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,11}"
}

fn arb_kind() -> impl Strategy<Value = PackageKind> {
    prop_oneof![
        Just(PackageKind::Core),
        Just(PackageKind::Extension),
        Just(PackageKind::Theme),
    ]
}

/// Generate a URL that may or may not be an onion service.
fn arb_url() -> impl Strategy<Value = String> {
    ("[a-z]{1,8}", any::<bool>()).prop_map(|(host, onion)| {
        if onion {
            format!("http://{}.onion", host)
        } else {
            format!("https://{}.example", host)
        }
    })
}

fn log_entry(pkg_type: &str, supplier: &str, name: &str, checksum: &str) -> LogEntry {
    LogEntry {
        merkle_root: "root".to_string(),
        payload: LogPayload {
            pkg_type: pkg_type.to_string(),
            supplier: supplier.to_string(),
            name: name.to_string(),
            checksum: checksum.to_string(),
            version: "1.0.0".to_string(),
        },
        recorded_at: Utc::now(),
    }
}

// =============================================================================
// Version selection
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// The selected version is the maximum of all offered versions.
    #[test]
    fn prop_latest_version_is_maximum(
        versions in prop::collection::vec(arb_version(), 1..20),
    ) {
        let entries: Vec<VersionEntry> = versions
            .iter()
            .map(|v| VersionEntry {
                version: v.to_string(),
                merkle_root: None,
                signature: None,
            })
            .collect();

        let selected = select_latest_version(&entries).unwrap();
        let max = versions.iter().max().unwrap();
        prop_assert_eq!(Version::parse(&selected.version).unwrap(), max.clone());
    }
}

// =============================================================================
// Signatures
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// An envelope opens only under the key that signed it.
    #[test]
    fn prop_envelope_requires_pinned_key(
        signer in arb_signing_key(),
        other in arb_signing_key(),
        version in arb_version(),
    ) {
        prop_assume!(signer.verifying_key() != other.verifying_key());

        let payload = serde_json::to_string(&MetadataPayload {
            versions: vec![VersionEntry {
                version: version.to_string(),
                merkle_root: None,
                signature: None,
            }],
        })
        .unwrap();
        let envelope = SignedEnvelope {
            signature: encode_signature(&signer.sign(payload.as_bytes())),
            payload,
        };

        let pinned = ChannelPublicKey::from_verifying_key(signer.verifying_key());
        let wrong = ChannelPublicKey::from_verifying_key(other.verifying_key());

        let opened = envelope.open(&pinned).unwrap();
        prop_assert_eq!(&opened.versions[0].version, &version.to_string());
        prop_assert!(envelope.open(&wrong).is_err());
    }

    /// Flipping any byte of the package invalidates the supplier signature.
    #[test]
    fn prop_package_signature_binds_bytes(
        signer in arb_signing_key(),
        content in arb_content(),
        index in any::<prop::sample::Index>(),
    ) {
        let key = SupplierPublicKey::from_verifying_key(signer.verifying_key());
        let signature = signer.sign(&content);
        prop_assert!(key.verify(&content, &signature).is_ok());

        let mut tampered = content.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= 0x01;
        prop_assert!(key.verify(&tampered, &signature).is_err());
    }
}

// =============================================================================
// Transparency log anchoring
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// A log entry matching on every field passes; the package type and
    /// checksum compare case-insensitively.
    #[test]
    fn prop_matching_entry_passes(
        kind in arb_kind(),
        supplier in arb_name(),
        name in arb_name(),
        content in arb_content(),
    ) {
        let checksum = compute_hash(&content);
        let entry = log_entry(
            &kind.as_str().to_uppercase(),
            &supplier,
            &name,
            &checksum.to_uppercase(),
        );
        let identity = PackageIdentity::new(kind, supplier, name);
        prop_assert_eq!(verify_anchor(Some(&entry), &identity, &checksum), Ok(()));
    }

    /// Exactly the fields that differ are reported, in a fixed order.
    #[test]
    fn prop_mismatches_reported_exactly(
        kind in arb_kind(),
        other_kind in arb_kind(),
        supplier in arb_name(),
        other_supplier in arb_name(),
        name in arb_name(),
        other_name in arb_name(),
        checksum in "[0-9a-f]{64}",
        other_checksum in "[0-9a-f]{64}",
    ) {
        let entry = log_entry(other_kind.as_str(), &other_supplier, &other_name, &other_checksum);
        let identity = PackageIdentity::new(kind, supplier.clone(), name.clone());

        let mut expected = Vec::new();
        if kind != other_kind {
            expected.push(MismatchReason::PackageType);
        }
        if supplier != other_supplier {
            expected.push(MismatchReason::Supplier);
        }
        if name != other_name {
            expected.push(MismatchReason::PackageName);
        }
        if checksum != other_checksum {
            expected.push(MismatchReason::Checksum);
        }

        let result = verify_anchor(Some(&entry), &identity, &checksum);
        if expected.is_empty() {
            prop_assert_eq!(result, Ok(()));
        } else {
            prop_assert_eq!(result, Err(MerkleFailure::Mismatch(expected)));
        }
    }

    /// Constant-time equality agrees with `==`.
    #[test]
    fn prop_ct_eq_matches_eq(a in ".{0,40}", b in ".{0,40}") {
        prop_assert_eq!(ct_eq_str(&a, &b), a == b);
        prop_assert!(ct_eq_str(&a, &a));
    }
}

// =============================================================================
// Artifact hashing
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(30))]

    /// The recorded hash matches the content, and any rewrite of the file
    /// with different bytes is detected by a fresh hash.
    #[test]
    fn prop_artifact_hash_detects_modification(
        content in arb_content(),
        replacement in arb_content(),
    ) {
        prop_assume!(content != replacement);
        let dir = TempDir::new().unwrap();
        let artifact = UpdateArtifact::write_temporary(
            dir.path(),
            PackageIdentity::new(PackageKind::Extension, "acme", "widget"),
            "1.0.0",
            &content,
            None,
            None,
        )
        .unwrap();

        prop_assert!(artifact.hash_matches(&compute_hash(&content)));
        prop_assert_eq!(artifact.size(), content.len() as u64);

        std::fs::write(artifact.path(), &replacement).unwrap();
        let fresh = crate::artifact::compute_file_hash(artifact.path()).unwrap();
        prop_assert!(!artifact.hash_matches(&fresh));
    }
}

// =============================================================================
// Channel URL ordering
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// With onion prioritization, onion URLs come first and the configured
    /// order within each group is kept. Without it, the order is unchanged.
    #[test]
    fn prop_onion_priority_is_stable_partition(
        urls in prop::collection::vec(arb_url(), 0..10),
        key in arb_signing_key(),
    ) {
        let channel = Channel::new(
            "main",
            ChannelConfig {
                public_key: ChannelPublicKey::from_verifying_key(key.verifying_key()),
                urls: urls.clone(),
            },
        );

        let plain: Vec<&str> = urls.iter().map(String::as_str).collect();
        prop_assert_eq!(channel.all_urls(false), plain.clone());

        let (onion, clear): (Vec<&str>, Vec<&str>) =
            plain.into_iter().partition(|u| u.ends_with(".onion"));
        let expected: Vec<&str> = onion.into_iter().chain(clear).collect();
        prop_assert_eq!(channel.all_urls(true), expected);
    }
}
