use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tenant_storage_core::{
    ByteStream, CustomerInfo, FileInfo, FileStorageProvider, HealthCheckResult, OperationResult,
    ProviderConfig, QuoteRecord, StorageError,
};
use tracing::{info, warn};

use crate::registry::{normalize, ProtocolRegistry};

/// Network storage provider that picks its wire protocol from configuration.
///
/// Holds exactly one adapter, chosen by the `protocol` key of the provider
/// config, and forwards every contract operation to it unchanged.
pub struct NasProvider {
    protocol: String,
    adapter: Arc<dyn FileStorageProvider>,
    supported: Vec<String>,
}

/// Disconnects the adapter in the background if a scoped call is dropped
/// before it finishes, by cancellation or panic.
struct DisconnectGuard {
    adapter: Option<Arc<dyn FileStorageProvider>>,
    protocol: String,
}

impl DisconnectGuard {
    fn disarm(mut self) {
        self.adapter = None;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let Some(adapter) = self.adapter.take() else {
            return;
        };
        let protocol = std::mem::take(&mut self.protocol);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match adapter.disconnect().await {
                        Ok(()) => info!("Disconnected {} after an interrupted scoped call", protocol),
                        Err(e) => warn!(
                            "Disconnect of {} after an interrupted scoped call failed: {}",
                            protocol, e
                        ),
                    }
                });
            }
            Err(_) => warn!("No runtime left to disconnect {}", protocol),
        }
    }
}

impl NasProvider {
    pub fn new(registry: &ProtocolRegistry, config: ProviderConfig) -> Result<Self, StorageError> {
        let supported = registry.supported_protocols();

        let protocol = config
            .get_str("protocol")
            .map(normalize)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                StorageError::Config(format!(
                    "NAS provider config missing 'protocol'. Supported protocols: {}",
                    supported.join(", ")
                ))
            })?;

        let factory = registry.get(&protocol).ok_or_else(|| {
            StorageError::Config(format!(
                "Unsupported NAS protocol '{}'. Supported protocols: {}",
                protocol,
                supported.join(", ")
            ))
        })?;
        let adapter: Arc<dyn FileStorageProvider> = Arc::from(factory(&config)?);

        info!(
            "NasProvider initialized with protocol={} adapter={}",
            protocol,
            adapter.provider_name()
        );

        Ok(Self {
            protocol,
            adapter,
            supported,
        })
    }

    /// Normalized protocol identifier.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn adapter(&self) -> &dyn FileStorageProvider {
        self.adapter.as_ref()
    }

    /// Protocols the registry knew when this provider was built.
    pub fn supported_protocols(&self) -> &[String] {
        &self.supported
    }

    /// Connect, run `f`, then disconnect whether `f` succeeded or not.
    ///
    /// If the returned future is dropped early or `f` panics, the
    /// disconnect is spawned onto the current runtime instead.
    pub async fn scoped<'a, F, Fut, T>(&'a self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&'a Self) -> Fut,
        Fut: Future<Output = Result<T, StorageError>> + 'a,
    {
        self.connect().await?;
        let guard = DisconnectGuard {
            adapter: Some(Arc::clone(&self.adapter)),
            protocol: self.protocol.clone(),
        };
        let result = f(self).await;
        guard.disarm();
        if let Err(e) = self.disconnect().await {
            warn!("Disconnect after scoped use of {} failed: {}", self.protocol, e);
        }
        result
    }
}

#[async_trait]
impl FileStorageProvider for NasProvider {
    fn provider_name(&self) -> &'static str {
        "NasProvider"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn connect(&self) -> Result<(), StorageError> {
        self.adapter.connect().await
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.adapter.disconnect().await
    }

    async fn list_files(
        &self,
        path: &str,
        pattern: Option<&str>,
        recursive: bool,
    ) -> Result<Vec<FileInfo>, StorageError> {
        self.adapter.list_files(path, pattern, recursive).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.adapter.read_file(path).await
    }

    async fn write_file(
        &self,
        path: &str,
        data: &[u8],
        overwrite: bool,
    ) -> Result<OperationResult, StorageError> {
        self.adapter.write_file(path, data, overwrite).await
    }

    async fn delete_file(&self, path: &str) -> Result<OperationResult, StorageError> {
        self.adapter.delete_file(path).await
    }

    async fn move_file(
        &self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<OperationResult, StorageError> {
        self.adapter.move_file(source, destination, overwrite).await
    }

    async fn copy_file(
        &self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<OperationResult, StorageError> {
        self.adapter.copy_file(source, destination, overwrite).await
    }

    async fn mkdir(&self, path: &str, parents: bool) -> Result<OperationResult, StorageError> {
        self.adapter.mkdir(path, parents).await
    }

    async fn rmdir(&self, path: &str, recursive: bool) -> Result<OperationResult, StorageError> {
        self.adapter.rmdir(path, recursive).await
    }

    async fn file_exists(&self, path: &str) -> bool {
        self.adapter.file_exists(path).await
    }

    async fn get_metadata(&self, path: &str) -> Result<FileInfo, StorageError> {
        self.adapter.get_metadata(path).await
    }

    async fn health_check(&self) -> HealthCheckResult {
        let mut result = self.adapter.health_check().await;
        result.protocol = Some(self.protocol.clone());
        result.details.insert("protocol".into(), json!(self.protocol));
        result
            .details
            .insert("adapter".into(), json!(self.adapter.provider_name()));
        result
    }

    async fn stream_read(
        &self,
        path: &str,
        chunk_size: usize,
    ) -> Result<ByteStream<'static>, StorageError> {
        self.adapter.stream_read(path, chunk_size).await
    }

    async fn stream_write(
        &self,
        path: &str,
        chunks: ByteStream<'_>,
        overwrite: bool,
    ) -> Result<OperationResult, StorageError> {
        self.adapter.stream_write(path, chunks, overwrite).await
    }

    async fn update_quote_spreadsheet(
        &self,
        tenant_id: &str,
        quote: &QuoteRecord,
        customer: &CustomerInfo,
    ) -> Result<OperationResult, StorageError> {
        self.adapter
            .update_quote_spreadsheet(tenant_id, quote, customer)
            .await
    }
}
