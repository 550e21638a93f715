use std::collections::BTreeMap;
use std::fmt;

use tenant_storage_core::{FileStorageProvider, ProviderConfig, StorageError};
use tracing::debug;

use crate::placeholders;

/// Builds a protocol adapter from the tenant's provider configuration.
pub type AdapterFactory =
    fn(&ProviderConfig) -> Result<Box<dyn FileStorageProvider>, StorageError>;

/// Protocol name to adapter factory map.
///
/// Built once at startup and handed to every [`crate::NasProvider`] by
/// reference. Adapters behind a disabled cargo feature are simply absent.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    factories: BTreeMap<String, AdapterFactory>,
}

impl ProtocolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every adapter compiled into this build.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        #[cfg(feature = "smb")]
        registry.register("smb", smb);
        registry.register("nfs", placeholders::nfs);
        registry.register("webdav", placeholders::webdav);
        registry.register("sftp", placeholders::sftp);
        registry.register("ftp", placeholders::ftp);
        registry.register("ftps", placeholders::ftps);
        registry
    }

    /// Add or replace the factory for `protocol` (case-insensitive).
    pub fn register(&mut self, protocol: &str, factory: AdapterFactory) {
        let protocol = normalize(protocol);
        debug!("Registered NAS protocol adapter: {}", protocol);
        self.factories.insert(protocol, factory);
    }

    pub fn get(&self, protocol: &str) -> Option<AdapterFactory> {
        self.factories.get(&normalize(protocol)).copied()
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.factories.contains_key(&normalize(protocol))
    }

    /// Registered protocol names, sorted.
    pub fn supported_protocols(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.supported_protocols())
            .finish()
    }
}

#[cfg(feature = "smb")]
fn smb(config: &ProviderConfig) -> Result<Box<dyn FileStorageProvider>, StorageError> {
    Ok(Box::new(crate::smb::SmbAdapter::new(config)?))
}

/// Protocol identifiers are compared trimmed and lower-cased.
pub fn normalize(protocol: &str) -> String {
    protocol.trim().to_lowercase()
}
