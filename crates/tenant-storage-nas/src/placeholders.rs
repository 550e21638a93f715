//! Protocols reserved in the registry without an adapter.
//!
//! Each factory validates the configuration shape, so a malformed tenant
//! record is reported as such, then refuses construction.

use tenant_storage_core::{FileStorageProvider, ProviderConfig, StorageError};
use tracing::debug;

use crate::config::{FtpConfig, NfsConfig, SftpConfig, WebDavConfig};

fn not_implemented(protocol: &str) -> StorageError {
    StorageError::NotImplemented(format!(
        "{} protocol adapter is not yet implemented",
        protocol
    ))
}

pub fn nfs(config: &ProviderConfig) -> Result<Box<dyn FileStorageProvider>, StorageError> {
    let shape: NfsConfig = config.parse()?;
    debug!("NFS config for {}:{} (v{})", shape.host, shape.export, shape.version);
    Err(not_implemented("NFS"))
}

pub fn webdav(config: &ProviderConfig) -> Result<Box<dyn FileStorageProvider>, StorageError> {
    let shape: WebDavConfig = config.parse()?;
    debug!("WebDAV config for {}", shape.url);
    Err(not_implemented("WebDAV"))
}

pub fn sftp(config: &ProviderConfig) -> Result<Box<dyn FileStorageProvider>, StorageError> {
    let shape: SftpConfig = config.parse()?;
    debug!(
        "SFTP config for {}@{}:{} (host keys: {:?})",
        shape.username, shape.host, shape.port, shape.host_key_policy
    );
    Err(not_implemented("SFTP"))
}

pub fn ftp(config: &ProviderConfig) -> Result<Box<dyn FileStorageProvider>, StorageError> {
    let shape: FtpConfig = config.parse()?;
    debug!("FTP config for {}:{}", shape.host, shape.effective_port());
    Err(not_implemented("FTP"))
}

/// FTP over implicit TLS; `tls` is forced on.
pub fn ftps(config: &ProviderConfig) -> Result<Box<dyn FileStorageProvider>, StorageError> {
    let mut shape: FtpConfig = config.parse()?;
    shape.tls = true;
    debug!("FTPS config for {}:{}", shape.host, shape.effective_port());
    Err(not_implemented("FTPS"))
}
