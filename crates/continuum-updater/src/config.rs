//! Configuration structures for the update pipeline.
//!
//! The main [`UpdateConfig`] is TOML. Channel and supplier definitions are
//! static JSON files consumed (never written) by the pipeline:
//!
//! ```json
//! // channels.json
//! { "main": { "public_key": "ed25519:...", "urls": ["https://a", "https://b"] } }
//!
//! // suppliers.json
//! { "acme": { "channels": ["main"], "public_key": "ed25519:..." } }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;
use crate::keys::{ChannelPublicKey, SupplierPublicKey};

/// Main update configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Minimum number of seconds between automatic update checks
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Prefer anonymity-network (.onion) channel URLs
    #[serde(default)]
    pub tor_only: bool,

    /// Supplier of the core platform package (empty = core is not updated)
    #[serde(default)]
    pub trusted_supplier: String,

    /// Package name of the core platform
    #[serde(default = "default_core_package")]
    pub core_package: String,

    /// Filesystem locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Derived caches to invalidate after an install
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            tor_only: false,
            trusted_supplier: String::new(),
            core_package: default_core_package(),
            paths: PathsConfig::default(),
            network: NetworkConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl UpdateConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Resolve a possibly relative configured path against `paths.root`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.paths.root.join(path)
        }
    }
}

/// Filesystem layout. Relative paths are resolved against `root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_channels_file")]
    pub channels_file: PathBuf,
    #[serde(default = "default_suppliers_file")]
    pub suppliers_file: PathBuf,
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default = "default_last_check_file")]
    pub last_check_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            channels_file: default_channels_file(),
            suppliers_file: default_suppliers_file(),
            database: default_database(),
            cache_dir: default_cache_dir(),
            temp_dir: default_temp_dir(),
            last_check_file: default_last_check_file(),
        }
    }
}

/// Network configuration for channel requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// User agent sent to channels
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Largest response body accepted from a channel, in bytes
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            user_agent: default_user_agent(),
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

/// Derived caches cleared after a successful install.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Subdirectories of `paths.cache_dir` holding rendered output
    #[serde(default = "default_cache_subdirs")]
    pub subdirs: Vec<String>,

    /// Manifest cache file inside `paths.cache_dir`
    #[serde(default = "default_manifest_cache_file")]
    pub manifest_cache_file: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            subdirs: default_cache_subdirs(),
            manifest_cache_file: default_manifest_cache_file(),
        }
    }
}

/// One channel entry in the channel configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub public_key: ChannelPublicKey,
    pub urls: Vec<String>,
}

/// One supplier entry in the supplier configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierConfig {
    #[serde(default)]
    pub channels: Vec<String>,
    pub public_key: SupplierPublicKey,
}

/// Load the channel configuration file.
pub fn load_channel_configs(path: &Path) -> Result<BTreeMap<String, ChannelConfig>, UpdateError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        UpdateError::ConfigError(format!("cannot read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| UpdateError::ConfigError(format!("invalid {}: {}", path.display(), e)))
}

/// Load the supplier configuration file.
pub fn load_supplier_configs(
    path: &Path,
) -> Result<BTreeMap<String, SupplierConfig>, UpdateError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        UpdateError::ConfigError(format!("cannot read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| UpdateError::ConfigError(format!("invalid {}: {}", path.display(), e)))
}

// Default value functions for serde
fn default_check_interval() -> u64 {
    3600 // Hourly
}

fn default_core_package() -> String {
    "core".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_channels_file() -> PathBuf {
    PathBuf::from("config/channels.json")
}

fn default_suppliers_file() -> PathBuf {
    PathBuf::from("config/suppliers.json")
}

fn default_database() -> PathBuf {
    PathBuf::from("data/continuum.sqlite")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("tmp/cache")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("tmp/downloads")
}

fn default_last_check_file() -> PathBuf {
    PathBuf::from("tmp/last_update_check.txt")
}

fn default_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("continuum-updater/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_response_bytes() -> u64 {
    256 * 1024 * 1024 // 256 MB
}

fn default_cache_subdirs() -> Vec<String> {
    ["csp_hash", "csp_static", "markdown", "rst", "static", "templates"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_manifest_cache_file() -> String {
    "extension_data.json".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = UpdateConfig::default();
        assert_eq!(config.check_interval_secs, 3600);
        assert!(!config.tor_only);
        assert!(config.trusted_supplier.is_empty());
        assert_eq!(config.core_package, "core");
        assert_eq!(config.network.timeout_seconds, 30);
        assert_eq!(config.network.max_response_bytes, 256 * 1024 * 1024);
        assert!(config.cache.subdirs.contains(&"templates".to_string()));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: UpdateConfig = toml::from_str(
            r#"
            tor_only = true
            trusted_supplier = "acme"

            [paths]
            root = "/srv/site"
            "#,
        )
        .unwrap();

        assert!(config.tor_only);
        assert_eq!(config.trusted_supplier, "acme");
        assert_eq!(config.paths.root, PathBuf::from("/srv/site"));
        assert_eq!(config.paths.channels_file, PathBuf::from("config/channels.json"));
        assert_eq!(
            config.resolve(&config.paths.channels_file),
            PathBuf::from("/srv/site/config/channels.json")
        );
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("continuum.toml");

        let mut config = UpdateConfig::default();
        config.check_interval_secs = 60;
        config.save_to_file(&path).unwrap();

        let loaded = UpdateConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.check_interval_secs, 60);
    }

    #[test]
    fn test_load_channel_configs_rejects_bad_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("channels.json");
        std::fs::write(&path, r#"{"main": {"public_key": "rsa:00", "urls": []}}"#).unwrap();

        assert!(matches!(
            load_channel_configs(&path),
            Err(UpdateError::ConfigError(_))
        ));
    }
}
