//! Package installation pipeline.
//!
//! An [`Installer`] drives one package through a fixed sequence of stages:
//!
//! ```text
//! Start -> MetadataFetched -> Downloaded -> SigVerified -> MerkleVerified
//!       -> ChecksumVerified -> Installed -> Committed
//! ```
//!
//! The first failing stage ends the run with a [`StageFailure`]; no later
//! stage is attempted and nothing is marked installed. The order of the
//! verification stages is fixed:
//!
//! 1. The supplier's Ed25519 signature over the package bytes.
//! 2. Transparency log anchoring of (type, supplier, name, checksum).
//! 3. A fresh hash of the file on disk against the download-time hash.
//!
//! # Security
//!
//! Channel responses are authenticated with the channel key only; package
//! contents are trusted solely on the strength of the supplier signature and
//! the transparency log. Verification failures are logged at ALERT level
//! (`error!` with `alert = true`).

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use semver::Version;
use tracing::{debug, error, info, warn};

use crate::artifact::{compute_file_hash, UpdateArtifact};
use crate::cache::CacheInvalidator;
use crate::channel::{
    ChannelClient, ChannelMetadata, FailedAttempt, HttpTransport, RequestArgs, VersionEntry,
};
use crate::config::UpdateConfig;
use crate::error::UpdateError;
use crate::install::Installable;
use crate::keys::decode_signature;
use crate::package::{PackageIdentity, PackageKind};
use crate::store::{InstallationStore, SqliteStore};
use crate::supplier::{Supplier, SupplierRegistry};
use crate::transparency::{verify_anchor, MerkleFailure, TransparencyLog};

/// Pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Start,
    MetadataFetched,
    Downloaded,
    SigVerified,
    MerkleVerified,
    ChecksumVerified,
    Installed,
    Committed,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::MetadataFetched => "metadata_fetched",
            Self::Downloaded => "downloaded",
            Self::SigVerified => "sig_verified",
            Self::MerkleVerified => "merkle_verified",
            Self::ChecksumVerified => "checksum_verified",
            Self::Installed => "installed",
            Self::Committed => "committed",
            Self::Failed => "failed",
        })
    }
}

/// Why a pipeline run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// A channel the supplier publishes through is not configured, or the
    /// supplier has no channels at all
    NoChannelAvailable(String),
    /// No channel URL produced a validly signed response
    NoApiResponse,
    /// The channel answered but offered no usable version
    NoVersionsOffered,
    /// The package body could not be fetched or written
    TransferError(String),
    /// The operator-provided package file does not exist
    FileNotFound(String),
    /// The channel did not declare a package signature
    SignatureMissing,
    /// The package signature does not verify against the supplier key
    SignatureInvalid(String),
    /// The transparency log could not be read
    LogUnavailable(String),
    /// Transparency log anchoring failed
    Merkle(MerkleFailure),
    /// The file on disk no longer hashes to the download-time hash
    ChecksumMismatch,
    /// The kind-specific install step rejected the artifact
    InstallFailed(String),
    /// The installation record did not commit
    CommitFailed(String),
    /// Any other error
    Other(String),
}

impl FailureReason {
    /// Verification failures are logged at ALERT level.
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            Self::SignatureMissing
                | Self::SignatureInvalid(_)
                | Self::Merkle(_)
                | Self::ChecksumMismatch
        )
    }
}

impl From<UpdateError> for FailureReason {
    fn from(err: UpdateError) -> Self {
        match err {
            UpdateError::NoChannelAvailable(name) => Self::NoChannelAvailable(name),
            UpdateError::NoApiResponse { .. } => Self::NoApiResponse,
            UpdateError::NoVersionsOffered(_) => Self::NoVersionsOffered,
            UpdateError::TransferError(msg) => Self::TransferError(msg),
            UpdateError::TransportFailure(msg) => Self::TransferError(msg),
            UpdateError::RequestFailed { status } => {
                Self::TransferError(format!("download failed with status {}", status))
            }
            UpdateError::FileNotFound(path) => Self::FileNotFound(path),
            UpdateError::SignatureInvalid(msg) => Self::SignatureInvalid(msg),
            UpdateError::InstallationFailed(msg) => Self::InstallFailed(msg),
            UpdateError::CommitFailed(msg) => Self::CommitFailed(msg),
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoChannelAvailable(name) => write!(f, "no channel available: {}", name),
            Self::NoApiResponse => f.write_str("no channel responded"),
            Self::NoVersionsOffered => f.write_str("no versions offered"),
            Self::TransferError(msg) => write!(f, "transfer error: {}", msg),
            Self::FileNotFound(path) => write!(f, "file not found: {}", path),
            Self::SignatureMissing => f.write_str("no package signature declared"),
            Self::SignatureInvalid(msg) => write!(f, "invalid signature: {}", msg),
            Self::LogUnavailable(msg) => write!(f, "transparency log unavailable: {}", msg),
            Self::Merkle(failure) => write!(f, "{}", failure),
            Self::ChecksumMismatch => f.write_str("checksum mismatch"),
            Self::InstallFailed(msg) => write!(f, "install step failed: {}", msg),
            Self::CommitFailed(msg) => write!(f, "commit failed: {}", msg),
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

/// A terminated pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    /// Last stage completed before the failure
    pub stage: Stage,
    pub reason: FailureReason,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed after {}: {}", self.stage, self.reason)
    }
}

impl std::error::Error for StageFailure {}

/// A completed pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub identity: PackageIdentity,
    pub version: String,
    /// Stages passed through, in order, starting with `Start`
    pub stages: Vec<Stage>,
    pub security_bypassed: bool,
    /// Mirror the package came from (`None` for local installs)
    pub channel_url: Option<String>,
    /// Channel URLs abandoned before a valid response
    pub failed_attempts: Vec<FailedAttempt>,
    pub cache_files_cleared: usize,
}

/// Result of an automatic update attempt.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// Nothing newer than the installed version is offered
    UpToDate { current: String },
    Installed(PipelineReport),
    Failed(StageFailure),
}

/// Shared handles every installer needs.
#[derive(Clone)]
pub struct InstallerContext {
    pub registry: Arc<SupplierRegistry>,
    pub client: ChannelClient,
    pub log: Arc<dyn TransparencyLog>,
    pub store: Arc<dyn InstallationStore>,
    pub cache: CacheInvalidator,
    pub temp_dir: PathBuf,
}

impl InstallerContext {
    /// Build the production context: HTTPS channel transport and one SQLite
    /// database serving as both installation store and transparency log.
    pub fn from_config(config: &UpdateConfig) -> Result<Self, UpdateError> {
        let store = Arc::new(SqliteStore::new(config.resolve(&config.paths.database))?);
        Ok(Self {
            registry: Arc::new(SupplierRegistry::from_config(config)?),
            client: ChannelClient::new(Arc::new(HttpTransport::new(&config.network)?)),
            log: store.clone(),
            store,
            cache: CacheInvalidator::from_config(config),
            temp_dir: config.resolve(&config.paths.temp_dir),
        })
    }
}

/// Operator-provided package used instead of a download.
#[derive(Debug, Clone)]
struct LocalInstallFile {
    path: PathBuf,
    version: String,
    merkle_root: Option<String>,
    signature: Option<String>,
}

/// Installs one package from one supplier.
pub struct Installer {
    ctx: InstallerContext,
    installable: Arc<dyn Installable>,
    supplier: Arc<Supplier>,
    identity: PackageIdentity,
    local_file: Option<LocalInstallFile>,
    unit_dir: Option<PathBuf>,
    bypass_security: bool,
}

impl Installer {
    /// # Errors
    ///
    /// Returns `UpdateError::ConfigError` if the supplier is unknown.
    pub fn new(
        ctx: InstallerContext,
        installable: Arc<dyn Installable>,
        supplier: &str,
        package: impl Into<String>,
    ) -> Result<Self, UpdateError> {
        let supplier = ctx.registry.supplier(supplier)?;
        let identity = PackageIdentity::new(installable.kind(), supplier.name(), package);
        Ok(Self {
            ctx,
            installable,
            supplier,
            identity,
            local_file: None,
            unit_dir: None,
            bypass_security: false,
        })
    }

    pub fn identity(&self) -> &PackageIdentity {
        &self.identity
    }

    pub fn kind(&self) -> PackageKind {
        self.identity.kind
    }

    /// Install into an existing unit directory instead of the one derived
    /// from the package identity.
    pub fn install_into(&mut self, unit_dir: impl Into<PathBuf>) {
        self.unit_dir = Some(unit_dir.into());
    }

    fn request_args(&self, minimum: Option<&str>, version: Option<&str>) -> RequestArgs {
        RequestArgs {
            kind: self.identity.kind.as_str().to_string(),
            supplier: self.identity.supplier.clone(),
            package: self.identity.name.clone(),
            minimum: minimum.filter(|m| !m.is_empty()).map(str::to_string),
            version: version.map(str::to_string),
        }
    }

    /// Fetch verified metadata, trying each of the supplier's channels in
    /// order and, within each channel, each URL in order.
    ///
    /// # Errors
    ///
    /// - `UpdateError::NoChannelAvailable` if the supplier has no channels
    /// - `UpdateError::NoApiResponse` once every channel and URL has failed
    pub async fn get_package_data(
        &self,
        min_version: Option<&str>,
    ) -> Result<ChannelMetadata, UpdateError> {
        let channels = self.supplier.channels();
        if channels.is_empty() {
            return Err(UpdateError::NoChannelAvailable(format!(
                "supplier {} has no channels configured",
                self.supplier.name()
            )));
        }

        let args = self.request_args(min_version, None);
        let mut failures = Vec::new();

        for name in channels {
            let channel = match self.ctx.registry.channel(name).await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(
                        supplier = %self.supplier.name(),
                        channel = %name,
                        error = %e,
                        "Skipping unusable channel"
                    );
                    continue;
                }
            };

            if let Some(metadata) = self
                .ctx
                .client
                .try_channel_urls(&channel, &args, self.ctx.registry.tor_only(), &mut failures)
                .await
            {
                return Ok(metadata);
            }
        }

        Err(UpdateError::NoApiResponse {
            supplier: self.identity.supplier.clone(),
            package: self.identity.name.clone(),
        })
    }

    /// Download `update`, or the latest version offered in `metadata`, from
    /// the mirror that answered the metadata request.
    ///
    /// The body is written to a uniquely named temporary file and hashed
    /// from disk.
    pub async fn download(
        &self,
        metadata: &ChannelMetadata,
        update: Option<&VersionEntry>,
    ) -> Result<UpdateArtifact, UpdateError> {
        let entry = match update {
            Some(entry) => entry,
            None => select_latest_version(&metadata.versions)
                .ok_or_else(|| UpdateError::NoVersionsOffered(self.identity.to_string()))?,
        };

        let args = self.request_args(None, Some(&entry.version));
        let body = self.ctx.client.download_body(&metadata.url, &args).await?;

        let artifact = UpdateArtifact::write_temporary(
            &self.ctx.temp_dir,
            self.identity.clone(),
            entry.version.clone(),
            &body,
            entry.merkle_root.clone(),
            entry.signature.clone(),
        )?;

        info!(
            supplier = %self.identity.supplier,
            package = %self.identity.name,
            version = %entry.version,
            url = %metadata.url,
            size = artifact.size(),
            "Downloaded package"
        );
        Ok(artifact)
    }

    /// Check the supplier's signature over the package bytes.
    pub fn verify_signature(&self, artifact: &UpdateArtifact) -> Result<(), FailureReason> {
        let encoded = artifact.signature().ok_or(FailureReason::SignatureMissing)?;
        let signature = decode_signature(encoded).map_err(|e| match e {
            UpdateError::SignatureInvalid(msg) => FailureReason::SignatureInvalid(msg),
            other => FailureReason::SignatureInvalid(other.to_string()),
        })?;
        let bytes = artifact
            .read_bytes()
            .map_err(|e| FailureReason::FileNotFound(e.to_string()))?;

        self.supplier
            .public_key()
            .verify(&bytes, &signature)
            .map_err(|e| FailureReason::SignatureInvalid(e.to_string()))
    }

    /// Check that the transparency log commits to this exact package.
    pub async fn verify_merkle_root(&self, artifact: &UpdateArtifact) -> Result<(), FailureReason> {
        let root = artifact
            .merkle_root()
            .ok_or(FailureReason::Merkle(MerkleFailure::RootNotDeclared))?;
        let entry = self
            .ctx
            .log
            .lookup(root)
            .await
            .map_err(|e| FailureReason::LogUnavailable(e.to_string()))?;

        verify_anchor(entry.as_ref(), artifact.identity(), artifact.content_hash())
            .map_err(FailureReason::Merkle)
    }

    /// Recompute the hash from disk and compare it with the download-time
    /// hash.
    pub fn verify_checksum(&self, artifact: &UpdateArtifact) -> Result<(), FailureReason> {
        let current = compute_file_hash(artifact.path())
            .map_err(|e| FailureReason::FileNotFound(e.to_string()))?;
        if artifact.hash_matches(&current) {
            Ok(())
        } else {
            Err(FailureReason::ChecksumMismatch)
        }
    }

    /// Run the kind-specific install step.
    pub async fn install(&self, artifact: &UpdateArtifact) -> Result<(), FailureReason> {
        self.installable
            .install(artifact, self.unit_dir.as_deref())
            .await
            .map_err(|e| match e {
                UpdateError::InstallationFailed(msg) => FailureReason::InstallFailed(msg),
                other => FailureReason::InstallFailed(other.to_string()),
            })
    }

    /// Record the package as installed at the artifact's version.
    pub async fn mark_package_installed(
        &self,
        artifact: &UpdateArtifact,
    ) -> Result<(), FailureReason> {
        self.ctx
            .store
            .mark_installed(artifact.identity(), artifact.version())
            .await
            .map_err(|e| match e {
                UpdateError::CommitFailed(msg) => FailureReason::CommitFailed(msg),
                other => FailureReason::CommitFailed(other.to_string()),
            })
    }

    /// Invalidate derived caches. Returns the number of files removed.
    pub fn clear_cache(&self) -> Result<usize, UpdateError> {
        self.ctx.cache.clear()
    }

    /// Install from `path` instead of downloading. Every verification
    /// stage still runs.
    ///
    /// # Errors
    ///
    /// - `UpdateError::FileNotFound` if `path` is not an existing file
    /// - `UpdateError::VersionParseError` if `version` is not semver
    pub fn use_local_install_file(
        &mut self,
        path: impl Into<PathBuf>,
        version: &str,
    ) -> Result<(), UpdateError> {
        let path = path.into();
        if !path.is_file() {
            return Err(UpdateError::FileNotFound(path.display().to_string()));
        }
        Version::parse(version)?;

        self.local_file = Some(LocalInstallFile {
            path,
            version: version.to_string(),
            merkle_root: None,
            signature: None,
        });
        Ok(())
    }

    /// Declare the Merkle root and signature of the local install file.
    pub fn declare_local_metadata(&mut self, merkle_root: Option<String>, signature: Option<String>) {
        if let Some(local) = self.local_file.as_mut() {
            local.merkle_root = merkle_root;
            local.signature = signature;
        }
    }

    /// Skip signature, Merkle, and checksum verification.
    ///
    /// For manual operator use only; never enabled by automated flows.
    pub fn bypass_security_and_just_install(&mut self, bypass: bool) {
        if bypass {
            warn!(
                supplier = %self.identity.supplier,
                package = %self.identity.name,
                "Security verification will be bypassed for this package"
            );
        }
        self.bypass_security = bypass;
    }

    /// Run the full pipeline.
    pub async fn run_pipeline(&self) -> Result<PipelineReport, StageFailure> {
        let mut stages = vec![Stage::Start];

        let (artifact, channel_url, failed_attempts) = match &self.local_file {
            Some(local) => {
                let artifact = UpdateArtifact::from_local_file(
                    &local.path,
                    self.identity.clone(),
                    local.version.clone(),
                    local.merkle_root.clone(),
                    local.signature.clone(),
                )
                .map_err(|e| self.fail(&stages, e.into()))?;
                stages.push(Stage::Downloaded);
                (artifact, None, Vec::new())
            }
            None => {
                let metadata = self
                    .get_package_data(None)
                    .await
                    .map_err(|e| self.fail(&stages, e.into()))?;
                stages.push(Stage::MetadataFetched);

                let artifact = self
                    .download(&metadata, None)
                    .await
                    .map_err(|e| self.fail(&stages, e.into()))?;
                stages.push(Stage::Downloaded);
                (artifact, Some(metadata.url), metadata.failed_attempts)
            }
        };

        self.verify_and_install(artifact, stages, channel_url, failed_attempts)
            .await
    }

    async fn verify_and_install(
        &self,
        artifact: UpdateArtifact,
        mut stages: Vec<Stage>,
        channel_url: Option<String>,
        failed_attempts: Vec<FailedAttempt>,
    ) -> Result<PipelineReport, StageFailure> {
        if self.bypass_security {
            warn!(
                supplier = %self.identity.supplier,
                package = %self.identity.name,
                version = %artifact.version(),
                "Installing without security verification"
            );
        } else {
            self.verify_signature(&artifact)
                .map_err(|r| self.fail(&stages, r))?;
            stages.push(Stage::SigVerified);

            self.verify_merkle_root(&artifact)
                .await
                .map_err(|r| self.fail(&stages, r))?;
            stages.push(Stage::MerkleVerified);

            self.verify_checksum(&artifact)
                .map_err(|r| self.fail(&stages, r))?;
            stages.push(Stage::ChecksumVerified);
        }

        self.install(&artifact)
            .await
            .map_err(|r| self.fail(&stages, r))?;
        stages.push(Stage::Installed);

        self.mark_package_installed(&artifact)
            .await
            .map_err(|r| self.fail(&stages, r))?;
        stages.push(Stage::Committed);

        let cache_files_cleared = match self.clear_cache() {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to clear caches after install");
                0
            }
        };

        info!(
            supplier = %self.identity.supplier,
            package = %self.identity.name,
            kind = %self.identity.kind,
            version = %artifact.version(),
            "Package installed"
        );

        Ok(PipelineReport {
            identity: self.identity.clone(),
            version: artifact.version().to_string(),
            stages,
            security_bypassed: self.bypass_security,
            channel_url,
            failed_attempts,
            cache_files_cleared,
        })
    }

    fn fail(&self, stages: &[Stage], reason: FailureReason) -> StageFailure {
        let stage = stages.last().copied().unwrap_or(Stage::Start);
        if reason.is_security_failure() {
            error!(
                alert = true,
                supplier = %self.identity.supplier,
                package = %self.identity.name,
                kind = %self.identity.kind,
                stage = %stage,
                reason = %reason,
                "Install failed: package verification rejected"
            );
        } else {
            error!(
                supplier = %self.identity.supplier,
                package = %self.identity.name,
                kind = %self.identity.kind,
                stage = %stage,
                reason = %reason,
                "Install failed"
            );
        }
        StageFailure { stage, reason }
    }

    /// Run the full pipeline, reporting only success.
    pub async fn easy_install(&self) -> bool {
        self.run_pipeline().await.is_ok()
    }

    /// Install the newest offered version if it is newer than
    /// `current_version`.
    pub async fn auto_update(&self, current_version: Option<&str>) -> UpdateOutcome {
        let mut stages = vec![Stage::Start];

        let metadata = match self.get_package_data(current_version).await {
            Ok(metadata) => metadata,
            Err(e) => return UpdateOutcome::Failed(self.fail(&stages, e.into())),
        };

        let Some(latest) = select_latest_version(&metadata.versions) else {
            return UpdateOutcome::Failed(self.fail(&stages, FailureReason::NoVersionsOffered));
        };

        if let Some(current) = current_version {
            let newer = match (Version::parse(&latest.version), Version::parse(current)) {
                (Ok(offered), Ok(installed)) => offered > installed,
                _ => true,
            };
            if !newer {
                debug!(
                    package = %self.identity,
                    version = %current,
                    "Already up to date"
                );
                return UpdateOutcome::UpToDate {
                    current: current.to_string(),
                };
            }
        }

        stages.push(Stage::MetadataFetched);
        let artifact = match self.download(&metadata, Some(latest)).await {
            Ok(artifact) => artifact,
            Err(e) => return UpdateOutcome::Failed(self.fail(&stages, e.into())),
        };
        stages.push(Stage::Downloaded);

        match self
            .verify_and_install(artifact, stages, Some(metadata.url), metadata.failed_attempts)
            .await
        {
            Ok(report) => UpdateOutcome::Installed(report),
            Err(failure) => UpdateOutcome::Failed(failure),
        }
    }
}

/// Pick the highest semver among `versions`.
///
/// Versions are sorted ascending with a stable sort and the last element is
/// taken, so among equal versions the one listed last wins. Entries whose
/// version does not parse are ignored.
pub fn select_latest_version(versions: &[VersionEntry]) -> Option<&VersionEntry> {
    let mut parsed: Vec<(Version, &VersionEntry)> = versions
        .iter()
        .filter_map(|entry| match Version::parse(&entry.version) {
            Ok(version) => Some((version, entry)),
            Err(e) => {
                warn!(version = %entry.version, error = %e, "Ignoring unparseable version");
                None
            }
        })
        .collect();
    parsed.sort_by(|a, b| a.0.cmp(&b.0));
    parsed.pop().map(|(_, entry)| entry)
}
