//! Downloaded update artifacts.
//!
//! An [`UpdateArtifact`] describes one candidate package on local disk.
//! Its content hash is computed from the bytes actually written, right after
//! the write, and is later compared against a fresh hash of the same file
//! so that any modification in between is detected.
//!
//! # Security
//!
//! - SHA-256, hex encoded
//! - Constant-time hash comparison
//! - Downloaded files live in a [`TempPath`] and are deleted when the
//!   artifact is dropped, whatever the outcome of the pipeline

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tempfile::TempPath;

use crate::error::UpdateError;
use crate::package::PackageIdentity;

/// Buffer size for reading files during hash computation.
const HASH_BUFFER_SIZE: usize = 8192;

/// Where the artifact bytes live.
#[derive(Debug)]
pub enum ArtifactFile {
    /// Downloaded by the pipeline; removed on drop
    Temporary(TempPath),
    /// Provided by the operator; never removed
    Local(PathBuf),
}

impl ArtifactFile {
    pub fn path(&self) -> &Path {
        match self {
            Self::Temporary(path) => path,
            Self::Local(path) => path,
        }
    }
}

/// Immutable descriptor of a candidate update on disk.
#[derive(Debug)]
pub struct UpdateArtifact {
    identity: PackageIdentity,
    version: String,
    file: ArtifactFile,
    size: u64,
    content_hash: String,
    merkle_root: Option<String>,
    signature: Option<String>,
}

impl UpdateArtifact {
    /// Write `bytes` to a uniquely named file in `dir` and describe it.
    ///
    /// # Errors
    ///
    /// Returns `UpdateError::TransferError` if the file cannot be written.
    pub fn write_temporary(
        dir: &Path,
        identity: PackageIdentity,
        version: impl Into<String>,
        bytes: &[u8],
        merkle_root: Option<String>,
        signature: Option<String>,
    ) -> Result<Self, UpdateError> {
        let transfer = |e: std::io::Error| {
            UpdateError::TransferError(format!("cannot write download to {}: {}", dir.display(), e))
        };

        std::fs::create_dir_all(dir).map_err(transfer)?;
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-", identity.kind))
            .suffix(&format!(".{}", identity.kind.file_extension()))
            .tempfile_in(dir)
            .map_err(transfer)?;
        file.write_all(bytes).map_err(transfer)?;
        file.as_file().sync_all().map_err(transfer)?;
        let path = file.into_temp_path();

        Ok(Self {
            identity,
            version: version.into(),
            file: ArtifactFile::Temporary(path),
            size: bytes.len() as u64,
            content_hash: compute_hash(bytes),
            merkle_root,
            signature,
        })
    }

    /// Describe an operator-provided package file.
    ///
    /// # Errors
    ///
    /// Returns `UpdateError::FileNotFound` if `path` is not an existing file.
    pub fn from_local_file(
        path: &Path,
        identity: PackageIdentity,
        version: impl Into<String>,
        merkle_root: Option<String>,
        signature: Option<String>,
    ) -> Result<Self, UpdateError> {
        if !path.is_file() {
            return Err(UpdateError::FileNotFound(path.display().to_string()));
        }
        let content_hash = compute_file_hash(path)?;
        let size = std::fs::metadata(path)?.len();
        Ok(Self {
            identity,
            version: version.into(),
            file: ArtifactFile::Local(path.to_path_buf()),
            size,
            content_hash,
            merkle_root,
            signature,
        })
    }

    pub fn identity(&self) -> &PackageIdentity {
        &self.identity
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Size of the package when it was written or described.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Hex SHA-256 of the downloaded bytes, or of a local file when it was
    /// described.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn merkle_root(&self) -> Option<&str> {
        self.merkle_root.as_deref()
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Whether the file will be removed when the artifact is dropped.
    pub fn is_temporary(&self) -> bool {
        matches!(self.file, ArtifactFile::Temporary(_))
    }

    /// Constant-time comparison of `hash` with the recorded content hash.
    pub fn hash_matches(&self, hash: &str) -> bool {
        self.content_hash
            .as_bytes()
            .ct_eq(hash.to_ascii_lowercase().as_bytes())
            .into()
    }

    /// Read the full package contents.
    pub fn read_bytes(&self) -> Result<Vec<u8>, UpdateError> {
        Ok(std::fs::read(self.path())?)
    }
}

/// Compute the hex SHA-256 of a file, streaming it in fixed-size chunks.
pub fn compute_file_hash(path: &Path) -> Result<String, UpdateError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute the hex SHA-256 of an in-memory buffer.
pub fn compute_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
