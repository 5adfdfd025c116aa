//! # continuum-updater
//!
//! Secure update pipeline for the core platform, extensions, and themes.
//!
//! This crate handles:
//! - Channel metadata fetching with multi-URL failover
//! - Ed25519 verification of channel responses and package signatures
//! - Transparency log anchoring of package checksums
//! - Atomic kind-specific installation and installation records
//! - Periodic update checks across every installed unit
//!
//! ## Security
//!
//! The pipeline fails closed:
//! - Channel responses are verified against pinned channel keys before use
//! - Packages must carry a valid supplier signature
//! - The transparency log must commit to the exact type, supplier, name,
//!   and checksum of the package
//! - The file is re-hashed from disk right before installation
//! - Nothing is marked installed unless every stage succeeded

pub mod artifact;
pub mod cache;
pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod install;
pub mod installer;
pub mod keys;
pub mod orchestrator;
pub mod package;
#[cfg(test)]
mod proptests;
pub mod store;
pub mod supplier;
pub mod transparency;

// Re-export main types for convenience
pub use artifact::{compute_file_hash, ArtifactFile, UpdateArtifact};
pub use cache::CacheInvalidator;
pub use channel::{
    Channel, ChannelClient, ChannelMetadata, ChannelTransport, HttpTransport, SignedEnvelope,
    VersionEntry,
};
pub use config::{ChannelConfig, SupplierConfig, UpdateConfig};
pub use error::UpdateError;
pub use install::{
    CoreInstaller, ExtensionInstaller, InstallLayout, Installable, InstallerSet, ThemeInstaller,
};
pub use installer::{
    select_latest_version, FailureReason, Installer, InstallerContext, PipelineReport, Stage,
    StageFailure, UpdateOutcome,
};
pub use keys::{ChannelPublicKey, SupplierPublicKey};
pub use orchestrator::{CycleReport, InstallableUnit, UpdateOrchestrator};
pub use package::{PackageIdentity, PackageKind};
pub use store::{InstallationRecord, InstallationStore, SqliteStore};
pub use supplier::{Supplier, SupplierRegistry};
pub use transparency::{LogEntry, LogPayload, MerkleFailure, TransparencyLog};
