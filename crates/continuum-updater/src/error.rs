//! Error types for the update pipeline.

use thiserror::Error;

/// Errors that can occur during update operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Network or channel endpoint unreachable
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Channel response returned a non-success HTTP status
    #[error("channel request failed with status {status}")]
    RequestFailed { status: u16 },

    /// Channel envelope or package signature failed verification
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    /// No channel is configured under the given name
    #[error("no channel available: {0}")]
    NoChannelAvailable(String),

    /// Every configured channel URL was tried without a validly signed reply
    #[error("no channel responded with a valid signed response for {supplier}/{package}")]
    NoApiResponse { supplier: String, package: String },

    /// The downloaded body could not be written to disk
    #[error("transfer error: {0}")]
    TransferError(String),

    /// The channel offered no installable version
    #[error("no versions offered for {0}")]
    NoVersionsOffered(String),

    /// Local install file does not exist
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Kind-specific install step rejected the artifact
    #[error("installation failed: {0}")]
    InstallationFailed(String),

    /// Durable state transition did not commit
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// Configuration error (unknown supplier, malformed key, bad config file)
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Storage backend error
    #[error("storage error: {0}")]
    StorageError(String),

    /// Version parsing error
    #[error("version parse error: {0}")]
    VersionParseError(String),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        UpdateError::TransportFailure(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for UpdateError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        UpdateError::SignatureInvalid(err.to_string())
    }
}

impl From<semver::Error> for UpdateError {
    fn from(err: semver::Error) -> Self {
        UpdateError::VersionParseError(err.to_string())
    }
}

impl From<rusqlite::Error> for UpdateError {
    fn from(err: rusqlite::Error) -> Self {
        UpdateError::StorageError(err.to_string())
    }
}
