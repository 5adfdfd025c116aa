//! Supplier registry.
//!
//! Holds every known supplier and lazily builds the [`Channel`] instances
//! they publish through. The registry is constructed once at process start
//! and shared by handle with every installer; channel configuration is
//! parsed on first use and cached by name for the rest of the process.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::debug;

use crate::channel::Channel;
use crate::config::{
    load_channel_configs, load_supplier_configs, ChannelConfig, SupplierConfig, UpdateConfig,
};
use crate::error::UpdateError;
use crate::keys::SupplierPublicKey;

/// A package publisher.
#[derive(Debug, Clone)]
pub struct Supplier {
    name: String,
    channels: Vec<String>,
    public_key: SupplierPublicKey,
}

impl Supplier {
    pub fn new(name: impl Into<String>, config: SupplierConfig) -> Self {
        Self {
            name: name.into(),
            channels: config.channels,
            public_key: config.public_key,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the channels this supplier publishes through, in order.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn public_key(&self) -> &SupplierPublicKey {
        &self.public_key
    }
}

/// Source of channel definitions, read on first lookup.
enum ChannelSource {
    File(PathBuf),
    Preloaded(BTreeMap<String, ChannelConfig>),
}

/// Registry of suppliers and channels.
pub struct SupplierRegistry {
    suppliers: HashMap<String, Arc<Supplier>>,
    channel_source: ChannelSource,
    channels: OnceCell<HashMap<String, Arc<Channel>>>,
    tor_only: bool,
}

impl SupplierRegistry {
    /// Build a registry whose channels are read from `channels_path` on
    /// first use.
    pub fn new(
        suppliers: BTreeMap<String, SupplierConfig>,
        channels_path: PathBuf,
        tor_only: bool,
    ) -> Result<Self, UpdateError> {
        Ok(Self {
            suppliers: build_suppliers(suppliers)?,
            channel_source: ChannelSource::File(channels_path),
            channels: OnceCell::new(),
            tor_only,
        })
    }

    /// Build a registry from already-parsed channel definitions.
    pub fn with_channels(
        suppliers: BTreeMap<String, SupplierConfig>,
        channels: BTreeMap<String, ChannelConfig>,
        tor_only: bool,
    ) -> Result<Self, UpdateError> {
        Ok(Self {
            suppliers: build_suppliers(suppliers)?,
            channel_source: ChannelSource::Preloaded(channels),
            channels: OnceCell::new(),
            tor_only,
        })
    }

    /// Load suppliers from the configured supplier file.
    pub fn from_config(config: &UpdateConfig) -> Result<Self, UpdateError> {
        let suppliers = load_supplier_configs(&config.resolve(&config.paths.suppliers_file))?;
        Self::new(
            suppliers,
            config.resolve(&config.paths.channels_file),
            config.tor_only,
        )
    }

    /// Whether onion mirrors are prioritized.
    pub fn tor_only(&self) -> bool {
        self.tor_only
    }

    /// Look up a supplier by name.
    ///
    /// # Errors
    ///
    /// Returns `UpdateError::ConfigError` if the supplier is unknown.
    pub fn supplier(&self, name: &str) -> Result<Arc<Supplier>, UpdateError> {
        self.suppliers
            .get(name)
            .cloned()
            .ok_or_else(|| UpdateError::ConfigError(format!("unknown supplier: {}", name)))
    }

    /// Look up a channel by name, parsing the channel configuration on the
    /// first call.
    ///
    /// # Errors
    ///
    /// Returns `UpdateError::NoChannelAvailable` if no channel has that name,
    /// or `UpdateError::ConfigError` if the channel configuration is invalid.
    pub async fn channel(&self, name: &str) -> Result<Arc<Channel>, UpdateError> {
        let channels = self
            .channels
            .get_or_try_init(|| async { self.load_channels() })
            .await?;
        channels
            .get(name)
            .cloned()
            .ok_or_else(|| UpdateError::NoChannelAvailable(name.to_string()))
    }

    fn load_channels(&self) -> Result<HashMap<String, Arc<Channel>>, UpdateError> {
        let configs = match &self.channel_source {
            ChannelSource::File(path) => {
                debug!("Loading channel configuration from {:?}", path);
                load_channel_configs(path)?
            }
            ChannelSource::Preloaded(configs) => configs.clone(),
        };
        Ok(configs
            .into_iter()
            .map(|(name, config)| {
                let channel = Arc::new(Channel::new(name.clone(), config));
                (name, channel)
            })
            .collect())
    }
}

fn build_suppliers(
    configs: BTreeMap<String, SupplierConfig>,
) -> Result<HashMap<String, Arc<Supplier>>, UpdateError> {
    configs
        .into_iter()
        .map(|(name, config)| {
            if !is_valid_supplier_name(&name) {
                return Err(UpdateError::ConfigError(format!(
                    "invalid supplier name: {:?}",
                    name
                )));
            }
            let supplier = Arc::new(Supplier::new(name.clone(), config));
            Ok((name, supplier))
        })
        .collect()
}

/// Supplier names become directory names, so path syntax is rejected.
fn is_valid_supplier_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}
