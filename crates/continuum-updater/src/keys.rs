//! Pinned public keys.
//!
//! Two distinct key types exist and cannot be converted into each other:
//!
//! - [`ChannelPublicKey`] authenticates the signed metadata envelope a
//!   channel mirror returns. It says nothing about package contents.
//! - [`SupplierPublicKey`] authenticates package bytes published by a
//!   supplier, regardless of which channel delivered them.
//!
//! Both are Ed25519 keys written as `ed25519:<hex>` or `ed25519:<base64>`.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

const KEY_PREFIX: &str = "ed25519:";

/// Public key pinned for a channel's metadata signatures.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelPublicKey(VerifyingKey);

/// Code-signing public key of a supplier.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SupplierPublicKey(VerifyingKey);

impl ChannelPublicKey {
    pub fn from_verifying_key(key: VerifyingKey) -> Self {
        Self(key)
    }

    /// Verify a channel envelope signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), UpdateError> {
        self.0
            .verify_strict(message, signature)
            .map_err(|e| UpdateError::SignatureInvalid(format!("channel signature: {}", e)))
    }
}

impl SupplierPublicKey {
    pub fn from_verifying_key(key: VerifyingKey) -> Self {
        Self(key)
    }

    /// Verify a package signature over the package bytes.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), UpdateError> {
        self.0
            .verify_strict(message, signature)
            .map_err(|e| UpdateError::SignatureInvalid(format!("package signature: {}", e)))
    }
}

impl FromStr for ChannelPublicKey {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_ed25519_key(s).map(Self)
    }
}

impl FromStr for SupplierPublicKey {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_ed25519_key(s).map(Self)
    }
}

impl TryFrom<String> for ChannelPublicKey {
    type Error = UpdateError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl TryFrom<String> for SupplierPublicKey {
    type Error = UpdateError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ChannelPublicKey> for String {
    fn from(key: ChannelPublicKey) -> Self {
        format!("{}{}", KEY_PREFIX, hex::encode(key.0.as_bytes()))
    }
}

impl From<SupplierPublicKey> for String {
    fn from(key: SupplierPublicKey) -> Self {
        format!("{}{}", KEY_PREFIX, hex::encode(key.0.as_bytes()))
    }
}

impl fmt::Debug for ChannelPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelPublicKey({})", hex::encode(self.0.as_bytes()))
    }
}

impl fmt::Debug for SupplierPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SupplierPublicKey({})", hex::encode(self.0.as_bytes()))
    }
}

/// Parse an Ed25519 public key from string format.
///
/// Supports formats:
/// - "ed25519:<hex_encoded_32_bytes>"
/// - "ed25519:<base64_encoded_32_bytes>"
fn parse_ed25519_key(s: &str) -> Result<VerifyingKey, UpdateError> {
    let encoded = s
        .trim()
        .strip_prefix(KEY_PREFIX)
        .ok_or_else(|| UpdateError::ConfigError("key must start with 'ed25519:'".to_string()))?;

    let key_data = match hex::decode(encoded) {
        Ok(bytes) => bytes,
        Err(_) => BASE64
            .decode(encoded)
            .map_err(|e| UpdateError::ConfigError(format!("invalid key encoding: {}", e)))?,
    };

    let key_bytes: [u8; 32] = key_data.try_into().map_err(|_| {
        UpdateError::ConfigError("Ed25519 public key must be 32 bytes".to_string())
    })?;

    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| UpdateError::ConfigError(format!("invalid Ed25519 public key: {}", e)))
}

/// Decode a base64 Ed25519 signature.
pub fn decode_signature(encoded: &str) -> Result<Signature, UpdateError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| UpdateError::SignatureInvalid(format!("invalid signature encoding: {}", e)))?;
    Signature::from_slice(&bytes)
        .map_err(|_| UpdateError::SignatureInvalid("invalid signature length".to_string()))
}

/// Encode an Ed25519 signature as base64.
pub fn encode_signature(signature: &Signature) -> String {
    BASE64.encode(signature.to_bytes())
}
