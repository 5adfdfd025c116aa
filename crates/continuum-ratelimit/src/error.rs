//! Error types for rate limiting.

use thiserror::Error;

/// Errors from rate limiting.
#[derive(Debug, Clone, Error)]
pub enum RateLimitError {
    /// The failure log could not be read or written
    #[error("failure log error: {0}")]
    Storage(String),
}
