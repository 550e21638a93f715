use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tenant_storage_core::{FileStorageProvider, ProviderConfig, StorageError};
use tenant_storage_local::LocalStorage;
use tenant_storage_nas::{NasProvider, ProtocolRegistry};
use tracing::{debug, info, instrument};

use crate::tenant::TenantStorageSettings;

type ProviderFactory =
    Arc<dyn Fn(ProviderConfig) -> Result<Arc<dyn FileStorageProvider>, StorageError> + Send + Sync>;

#[derive(Clone)]
struct Entry {
    factory: ProviderFactory,
    type_name: &'static str,
    description: String,
}

/// Descriptive record for a registered provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    /// Fully qualified Rust type the factory builds.
    pub type_name: String,
    pub description: String,
}

/// Provider name to constructor map.
///
/// Constructed once at startup and passed to whatever resolves tenants.
/// Registration is allowed at any time and is safe from concurrent tasks.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: DashMap<String, Entry>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `localfs` and `nas`, the latter resolving protocols
    /// through [`ProtocolRegistry::with_builtin`].
    pub fn with_builtin() -> Self {
        Self::with_protocols(ProtocolRegistry::with_builtin())
    }

    /// Registry with `localfs` and a `nas` provider bound to `protocols`.
    pub fn with_protocols(protocols: ProtocolRegistry) -> Self {
        let registry = Self::new();
        registry.register::<LocalStorage, _>(
            "localfs",
            "Local or kernel-mounted filesystem with locked quote spreadsheet updates",
            LocalStorage::new,
        );

        let protocols = Arc::new(protocols);
        registry.register::<NasProvider, _>(
            "nas",
            "Network attached storage reached over a wire protocol (smb, nfs, webdav, sftp, ftp, ftps)",
            move |config| NasProvider::new(&protocols, config),
        );
        registry
    }

    /// Add or replace a provider.
    ///
    /// `P` must implement [`FileStorageProvider`]; anything else is rejected
    /// by the compiler.
    pub fn register<P, F>(&self, name: &str, description: &str, factory: F)
    where
        P: FileStorageProvider + 'static,
        F: Fn(ProviderConfig) -> Result<P, StorageError> + Send + Sync + 'static,
    {
        let name = normalize(name);
        let factory: ProviderFactory = Arc::new(move |config| {
            factory(config).map(|provider| Arc::new(provider) as Arc<dyn FileStorageProvider>)
        });
        self.entries.insert(
            name.clone(),
            Entry {
                factory,
                type_name: type_name::<P>(),
                description: description.to_string(),
            },
        );
        info!("Registered file storage provider: {}", name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&normalize(name))
    }

    /// Registered provider names, sorted.
    pub fn list_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn provider_info(&self, name: &str) -> Result<ProviderInfo, StorageError> {
        let name = normalize(name);
        let entry = self.entry(&name)?;
        Ok(ProviderInfo {
            name,
            type_name: entry.type_name.to_string(),
            description: entry.description,
        })
    }

    /// Build a provider from an explicit name and configuration.
    #[instrument(skip(self, config), level = "debug")]
    pub fn create(
        &self,
        name: &str,
        config: ProviderConfig,
    ) -> Result<Arc<dyn FileStorageProvider>, StorageError> {
        let name = normalize(name);
        let entry = self.entry(&name)?;
        let provider = (entry.factory)(config).map_err(|e| {
            StorageError::Config(format!("Failed to initialize {} provider: {}", name, e))
        })?;
        debug!("Created {} provider ({})", name, provider.provider_name());
        Ok(provider)
    }

    /// Build the provider declared by a tenant record.
    #[instrument(skip(self, settings), level = "debug", fields(tenant_id = %settings.tenant_id))]
    pub fn from_tenant(
        &self,
        settings: &TenantStorageSettings,
    ) -> Result<Arc<dyn FileStorageProvider>, StorageError> {
        let tenant_id = &settings.tenant_id;

        let name = match settings.file_provider.as_deref().map(normalize) {
            Some(name) if !name.is_empty() => name,
            _ => {
                return Err(StorageError::Config(format!(
                    "Tenant {} has no file_provider configured. Set file_provider to one of: {:?}",
                    tenant_id,
                    self.list_providers()
                )))
            }
        };

        let config = match &settings.file_config {
            Some(config) if !config.is_empty() => config.clone(),
            _ => {
                return Err(StorageError::Config(format!(
                    "Tenant {} has no file_config. Set file_config with provider-specific configuration.",
                    tenant_id
                )))
            }
        };

        let entry = self.entry(&name)?;
        let provider = (entry.factory)(config).map_err(|e| {
            StorageError::Config(format!(
                "Failed to initialize {} provider for tenant {}: {}",
                name, tenant_id, e
            ))
        })?;

        info!("Initialized {} provider for tenant {}", name, tenant_id);
        Ok(provider)
    }

    fn entry(&self, name: &str) -> Result<Entry, StorageError> {
        self.entries
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                StorageError::Config(format!(
                    "Unknown file storage provider: '{}'. Available providers: {:?}",
                    name,
                    self.list_providers()
                ))
            })
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.list_providers())
            .finish()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::any::Any;
    use tenant_storage_core::{FileInfo, HealthCheckResult, OperationResult};

    struct NullProvider {
        label: String,
    }

    #[async_trait]
    impl FileStorageProvider for NullProvider {
        fn provider_name(&self) -> &'static str {
            "NullProvider"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        async fn list_files(
            &self,
            _path: &str,
            _pattern: Option<&str>,
            _recursive: bool,
        ) -> Result<Vec<FileInfo>, StorageError> {
            Ok(Vec::new())
        }

        async fn read_file(&self, path: &str) -> Result<Vec<u8>, StorageError> {
            Err(StorageError::NotFound(path.to_string()))
        }

        async fn write_file(
            &self,
            path: &str,
            _data: &[u8],
            _overwrite: bool,
        ) -> Result<OperationResult, StorageError> {
            Ok(OperationResult::ok("written").with_path(path))
        }

        async fn delete_file(&self, path: &str) -> Result<OperationResult, StorageError> {
            Err(StorageError::NotFound(path.to_string()))
        }

        async fn move_file(
            &self,
            src: &str,
            _dst: &str,
            _overwrite: bool,
        ) -> Result<OperationResult, StorageError> {
            Err(StorageError::NotFound(src.to_string()))
        }

        async fn copy_file(
            &self,
            src: &str,
            _dst: &str,
            _overwrite: bool,
        ) -> Result<OperationResult, StorageError> {
            Err(StorageError::NotFound(src.to_string()))
        }

        async fn mkdir(&self, path: &str, _parents: bool) -> Result<OperationResult, StorageError> {
            Ok(OperationResult::ok("created").with_path(path))
        }

        async fn rmdir(&self, path: &str, _recursive: bool) -> Result<OperationResult, StorageError> {
            Err(StorageError::NotFound(path.to_string()))
        }

        async fn file_exists(&self, _path: &str) -> bool {
            false
        }

        async fn get_metadata(&self, path: &str) -> Result<FileInfo, StorageError> {
            Err(StorageError::NotFound(path.to_string()))
        }

        async fn health_check(&self) -> HealthCheckResult {
            HealthCheckResult::healthy(self.provider_name(), &self.label)
        }
    }

    fn null_factory(config: ProviderConfig) -> Result<NullProvider, StorageError> {
        match config.get_str("label") {
            Some(label) => Ok(NullProvider {
                label: label.to_string(),
            }),
            None => Err(StorageError::Config("label is required".to_string())),
        }
    }

    #[test]
    fn test_builtin_providers() {
        let registry = ProviderRegistry::with_builtin();
        assert_eq!(registry.list_providers(), vec!["localfs", "nas"]);
        assert!(registry.contains(" LocalFS "));

        let info = registry.provider_info("NAS").unwrap();
        assert_eq!(info.name, "nas");
        assert!(info.type_name.ends_with("NasProvider"), "{}", info.type_name);
    }

    #[test]
    fn test_register_then_create_yields_that_type() {
        let registry = ProviderRegistry::with_builtin();
        registry.register::<NullProvider, _>("null", "Discards everything", null_factory);

        let provider = registry
            .create("Null", ProviderConfig::new().with("label", "x"))
            .unwrap();
        let concrete = provider.as_any().downcast_ref::<NullProvider>();
        assert_eq!(concrete.map(|p| p.label.as_str()), Some("x"));
        assert_eq!(registry.list_providers(), vec!["localfs", "nas", "null"]);
    }

    #[test]
    fn test_unknown_provider_lists_available() {
        let registry = ProviderRegistry::with_builtin();
        let err = registry.create("gdrive", ProviderConfig::new()).err().unwrap();
        let message = err.to_string();
        assert!(matches!(err, StorageError::Config(_)));
        assert!(message.contains("Unknown file storage provider: 'gdrive'"), "{message}");
        assert!(message.contains("\"localfs\""), "{message}");
        assert!(message.contains("\"nas\""), "{message}");

        assert!(registry.provider_info("gdrive").is_err());
    }

    #[test]
    fn test_construction_failure_is_wrapped() {
        let registry = ProviderRegistry::new();
        registry.register::<NullProvider, _>("null", "", null_factory);

        let err = registry.create("null", ProviderConfig::new()).err().unwrap();
        let message = err.to_string();
        assert!(matches!(err, StorageError::Config(_)));
        assert!(message.contains("Failed to initialize null provider"), "{message}");
        assert!(message.contains("label is required"), "{message}");
    }

    #[test]
    fn test_from_tenant_validates_record() {
        let registry = ProviderRegistry::new();
        registry.register::<NullProvider, _>("null", "", null_factory);

        let missing_provider = TenantStorageSettings {
            tenant_id: "t1".to_string(),
            file_provider: None,
            file_config: Some(ProviderConfig::new().with("label", "x")),
        };
        let message = registry.from_tenant(&missing_provider).err().unwrap().to_string();
        assert!(message.contains("Tenant t1 has no file_provider configured"), "{message}");
        assert!(message.contains("\"null\""), "{message}");

        let missing_config = TenantStorageSettings {
            tenant_id: "t1".to_string(),
            file_provider: Some("null".to_string()),
            file_config: Some(ProviderConfig::new()),
        };
        let message = registry.from_tenant(&missing_config).err().unwrap().to_string();
        assert!(message.contains("Tenant t1 has no file_config"), "{message}");

        let bad_config = TenantStorageSettings {
            tenant_id: "t1".to_string(),
            file_provider: Some("null".to_string()),
            file_config: Some(ProviderConfig::new().with("other", 1)),
        };
        let message = registry.from_tenant(&bad_config).err().unwrap().to_string();
        assert!(
            message.contains("Failed to initialize null provider for tenant t1"),
            "{message}"
        );

        let ok = TenantStorageSettings {
            tenant_id: "t1".to_string(),
            file_provider: Some(" NULL ".to_string()),
            file_config: Some(ProviderConfig::new().with("label", "x")),
        };
        let provider = registry.from_tenant(&ok).unwrap();
        assert_eq!(provider.provider_name(), "NullProvider");
    }

    #[test]
    fn test_nas_placeholder_surfaces_at_construction() {
        let registry = ProviderRegistry::with_builtin();
        let config = ProviderConfig::new()
            .with("protocol", "webdav")
            .with("url", "https://dav.local/");
        let message = registry.create("nas", config).err().unwrap().to_string();
        assert!(message.contains("Failed to initialize nas provider"), "{message}");
        assert!(
            message.contains("WebDAV protocol adapter is not yet implemented"),
            "{message}"
        );
    }
}
