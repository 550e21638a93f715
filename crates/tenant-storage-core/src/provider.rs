use std::any::Any;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::StorageError;
use crate::quote::{CustomerInfo, QuoteRecord};
use crate::types::{FileInfo, HealthCheckResult, OperationResult};

/// Default chunk size for [`FileStorageProvider::stream_read`].
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Stream of byte chunks produced by `stream_read` or consumed by `stream_write`.
pub type ByteStream<'a> = BoxStream<'a, Result<Vec<u8>, StorageError>>;

/// Storage contract every backend satisfies.
///
/// Every path is relative to the provider's base directory. A path that
/// would resolve outside of it fails with [`StorageError::PermissionDenied`]
/// before any I/O.
///
/// Mutators return `Err` only for the typed error kinds (see
/// [`StorageError::is_typed`]); other backend failures come back as
/// `Ok(OperationResult { success: false, .. })`.
#[async_trait]
pub trait FileStorageProvider: Send + Sync {
    /// Short name of the implementation, used in logs and health reports.
    fn provider_name(&self) -> &'static str;

    /// Concrete type access, used to check what a registry produced.
    fn as_any(&self) -> &dyn Any;

    /// Establish the backend session. No-op for backends without one.
    async fn connect(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Tear down the backend session. Safe to call when not connected.
    async fn disconnect(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// List a directory. An empty directory yields an empty list.
    ///
    /// `pattern` is a glob applied to the names of non-directory entries.
    async fn list_files(
        &self,
        path: &str,
        pattern: Option<&str>,
        recursive: bool,
    ) -> Result<Vec<FileInfo>, StorageError>;

    /// Read a whole file. Fails with `NotFound` if absent.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Write a whole file. Fails with `AlreadyExists` when the path exists
    /// and `overwrite` is false.
    async fn write_file(
        &self,
        path: &str,
        data: &[u8],
        overwrite: bool,
    ) -> Result<OperationResult, StorageError>;

    async fn delete_file(&self, path: &str) -> Result<OperationResult, StorageError>;

    async fn move_file(
        &self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<OperationResult, StorageError>;

    async fn copy_file(
        &self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<OperationResult, StorageError>;

    async fn mkdir(&self, path: &str, parents: bool) -> Result<OperationResult, StorageError>;

    async fn rmdir(&self, path: &str, recursive: bool) -> Result<OperationResult, StorageError>;

    /// Never fails: any backend error is reported as `false`.
    async fn file_exists(&self, path: &str) -> bool;

    /// Fails with `NotFound` if absent.
    async fn get_metadata(&self, path: &str) -> Result<FileInfo, StorageError>;

    /// Never fails: problems are captured in the returned report.
    async fn health_check(&self) -> HealthCheckResult;

    /// Read a file as a stream of chunks of at most `chunk_size` bytes.
    async fn stream_read(
        &self,
        path: &str,
        chunk_size: usize,
    ) -> Result<ByteStream<'static>, StorageError> {
        let data = self.read_file(path).await?;
        let chunk_size = chunk_size.max(1);
        let chunks: Vec<Result<Vec<u8>, StorageError>> = data
            .chunks(chunk_size)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    /// Write a file from a stream of chunks.
    async fn stream_write(
        &self,
        path: &str,
        mut chunks: ByteStream<'_>,
        overwrite: bool,
    ) -> Result<OperationResult, StorageError> {
        let mut data = Vec::new();
        while let Some(chunk) = chunks.next().await {
            data.extend_from_slice(&chunk?);
        }
        self.write_file(path, &data, overwrite).await
    }

    /// Insert or update one quote row in the tenant's spreadsheet.
    ///
    /// Never fails for expected failure modes: they come back as
    /// `success = false` so a per-tenant loop can carry on.
    async fn update_quote_spreadsheet(
        &self,
        tenant_id: &str,
        quote: &QuoteRecord,
        _customer: &CustomerInfo,
    ) -> Result<OperationResult, StorageError> {
        Ok(OperationResult::failure(format!(
            "{} does not support quote spreadsheet updates",
            self.provider_name()
        ))
        .with_detail("tenant_id", tenant_id)
        .with_detail("quote_id", quote.id.clone()))
    }
}
