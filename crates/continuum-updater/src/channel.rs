//! Distribution channels.
//!
//! A channel is a named set of mirror URLs sharing one pinned
//! [`ChannelPublicKey`]. Every metadata response is a [`SignedEnvelope`]
//! whose signature is checked before any field of the payload is read.
//!
//! # Failover
//!
//! [`ChannelClient::fetch_metadata`] tries each URL of a channel in order.
//! Transport failures are logged at INFO and signature failures at WARNING;
//! in both cases the next URL is tried. A bad mirror never blocks the
//! remaining ones, and the same endpoint is never retried.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, NetworkConfig};
use crate::error::UpdateError;
use crate::keys::{decode_signature, ChannelPublicKey};

/// Path of the metadata endpoint below a channel base URL.
pub const VERSION_ENDPOINT: &str = "/version";

/// Path of the package download endpoint below a channel base URL.
pub const DOWNLOAD_ENDPOINT: &str = "/download";

/// A configured distribution channel.
#[derive(Debug, Clone)]
pub struct Channel {
    name: String,
    public_key: ChannelPublicKey,
    urls: Vec<String>,
}

impl Channel {
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            name: name.into(),
            public_key: config.public_key,
            urls: config.urls,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_key(&self) -> &ChannelPublicKey {
        &self.public_key
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// All URLs in the order they should be tried.
    ///
    /// With `tor_only` set, `.onion` mirrors come first; the relative order
    /// within each group is the configured order.
    pub fn all_urls(&self, tor_only: bool) -> Vec<&str> {
        let mut urls: Vec<&str> = self.urls.iter().map(String::as_str).collect();
        if tor_only {
            urls.sort_by_key(|url| !is_onion_url(url));
        }
        urls
    }
}

/// Whether the host of `url` is an onion service.
fn is_onion_url(url: &str) -> bool {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host_port = without_scheme.split('/').next().unwrap_or_default();
    let host = host_port.rsplit_once(':').map_or(host_port, |(h, _)| h);
    host.to_ascii_lowercase().ends_with(".onion")
}

/// Arguments POSTed to a channel endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestArgs {
    #[serde(rename = "type")]
    pub kind: String,
    pub supplier: String,
    pub package: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Signed response envelope returned by a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// JSON string of the metadata payload
    pub payload: String,
    /// Base64 Ed25519 signature over the payload bytes
    pub signature: String,
}

impl SignedEnvelope {
    /// Verify the envelope against the channel key and parse the payload.
    pub fn open(&self, key: &ChannelPublicKey) -> Result<MetadataPayload, UpdateError> {
        let signature = decode_signature(&self.signature)?;
        key.verify(self.payload.as_bytes(), &signature)?;
        serde_json::from_str(&self.payload).map_err(|e| {
            UpdateError::SignatureInvalid(format!("signed payload is malformed: {}", e))
        })
    }
}

/// One version offered by a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: String,
    /// Root of the transparency log leaf committing to this package
    #[serde(default)]
    pub merkle_root: Option<String>,
    /// Base64 supplier signature over the package bytes
    #[serde(default)]
    pub signature: Option<String>,
}

/// Channel metadata payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataPayload {
    #[serde(default)]
    pub versions: Vec<VersionEntry>,
}

/// Why a single channel URL was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptFailure {
    Transport,
    Signature,
}

/// A channel URL that did not yield a validly signed response.
#[derive(Debug, Clone)]
pub struct FailedAttempt {
    pub channel: String,
    pub url: String,
    pub kind: AttemptFailure,
    pub message: String,
}

/// Verified metadata plus the mirror that produced it.
#[derive(Debug, Clone)]
pub struct ChannelMetadata {
    /// Name of the channel that answered
    pub channel: String,
    /// Base URL that answered; downloads go to the same mirror
    pub url: String,
    pub versions: Vec<VersionEntry>,
    /// Minimum version that was requested ("0.0.0" when none)
    pub minimum: String,
    /// URLs tried and abandoned before this response
    pub failed_attempts: Vec<FailedAttempt>,
}

/// Raw request transport to channel mirrors.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// POST a JSON body and return the raw response body.
    async fn post(&self, url: &str, body: &[u8]) -> Result<Vec<u8>, UpdateError>;
}

/// HTTPS transport backed by reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
    max_response_bytes: u64,
}

impl HttpTransport {
    pub fn new(config: &NetworkConfig) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_seconds))
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| UpdateError::ConfigError(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            max_response_bytes: config.max_response_bytes,
        })
    }
}

#[async_trait]
impl ChannelTransport for HttpTransport {
    async fn post(&self, url: &str, body: &[u8]) -> Result<Vec<u8>, UpdateError> {
        debug!("POST {}", url);

        let mut response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(UpdateError::RequestFailed {
                status: response.status().as_u16(),
            });
        }

        check_declared_length(response.content_length(), self.max_response_bytes)?;

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            append_capped(&mut bytes, &chunk, self.max_response_bytes)?;
        }
        debug!("Received {} bytes from {}", bytes.len(), url);
        Ok(bytes)
    }
}

/// Reject a response whose declared length is over `limit`.
fn check_declared_length(length: Option<u64>, limit: u64) -> Result<(), UpdateError> {
    match length {
        Some(length) if length > limit => Err(UpdateError::TransportFailure(format!(
            "response of {} bytes exceeds limit of {} bytes",
            length, limit
        ))),
        _ => Ok(()),
    }
}

/// Append `chunk` to `buffer` unless that takes it over `limit`.
fn append_capped(buffer: &mut Vec<u8>, chunk: &[u8], limit: u64) -> Result<(), UpdateError> {
    if (buffer.len() + chunk.len()) as u64 > limit {
        return Err(UpdateError::TransportFailure(format!(
            "response exceeds limit of {} bytes",
            limit
        )));
    }
    buffer.extend_from_slice(chunk);
    Ok(())
}

/// Client that fetches verified metadata and package bodies from channels.
#[derive(Clone)]
pub struct ChannelClient {
    transport: Arc<dyn ChannelTransport>,
}

impl ChannelClient {
    pub fn new(transport: Arc<dyn ChannelTransport>) -> Self {
        Self { transport }
    }

    /// POST to one URL and return the payload only if the envelope
    /// signature verifies against `key`.
    pub async fn post_signed_json(
        &self,
        url: &str,
        key: &ChannelPublicKey,
        args: &RequestArgs,
    ) -> Result<MetadataPayload, UpdateError> {
        let body = serde_json::to_vec(args)?;
        let raw = self.transport.post(url, &body).await?;
        let envelope: SignedEnvelope = serde_json::from_slice(&raw).map_err(|e| {
            UpdateError::SignatureInvalid(format!("response is not a signed envelope: {}", e))
        })?;
        envelope.open(key)
    }

    /// Try every URL of `channel` in order, appending each abandoned URL
    /// to `failures`. Returns the first validly signed response.
    pub async fn try_channel_urls(
        &self,
        channel: &Channel,
        args: &RequestArgs,
        tor_only: bool,
        failures: &mut Vec<FailedAttempt>,
    ) -> Option<ChannelMetadata> {
        for base in channel.all_urls(tor_only) {
            let url = endpoint(base, VERSION_ENDPOINT);
            match self.post_signed_json(&url, channel.public_key(), args).await {
                Ok(payload) => {
                    debug!(channel = %channel.name(), url = %base, "Channel responded with valid signature");
                    return Some(ChannelMetadata {
                        channel: channel.name().to_string(),
                        url: base.to_string(),
                        versions: payload.versions,
                        minimum: args.minimum.clone().unwrap_or_else(|| "0.0.0".to_string()),
                        failed_attempts: failures.clone(),
                    });
                }
                Err(UpdateError::SignatureInvalid(message)) => {
                    warn!(
                        channel = %channel.name(),
                        url = %base,
                        error = %message,
                        "Channel signature validation failed"
                    );
                    failures.push(FailedAttempt {
                        channel: channel.name().to_string(),
                        url: base.to_string(),
                        kind: AttemptFailure::Signature,
                        message,
                    });
                }
                Err(e) => {
                    info!(
                        channel = %channel.name(),
                        url = %base,
                        error = %e,
                        "This channel URL did not respond"
                    );
                    failures.push(FailedAttempt {
                        channel: channel.name().to_string(),
                        url: base.to_string(),
                        kind: AttemptFailure::Transport,
                        message: e.to_string(),
                    });
                }
            }
        }
        None
    }

    /// Fetch verified metadata from a single channel.
    ///
    /// # Errors
    ///
    /// Returns `UpdateError::NoApiResponse` if no URL yields a validly
    /// signed response.
    pub async fn fetch_metadata(
        &self,
        channel: &Channel,
        args: &RequestArgs,
        tor_only: bool,
    ) -> Result<ChannelMetadata, UpdateError> {
        let mut failures = Vec::new();
        self.try_channel_urls(channel, args, tor_only, &mut failures)
            .await
            .ok_or_else(|| UpdateError::NoApiResponse {
                supplier: args.supplier.clone(),
                package: args.package.clone(),
            })
    }

    /// Request a package body from the mirror at `base_url`.
    pub async fn download_body(
        &self,
        base_url: &str,
        args: &RequestArgs,
    ) -> Result<Vec<u8>, UpdateError> {
        let body = serde_json::to_vec(args)?;
        self.transport
            .post(&endpoint(base_url, DOWNLOAD_ENDPOINT), &body)
            .await
    }
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}
