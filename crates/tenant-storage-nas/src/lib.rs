//! Network-attached storage backend.
//!
//! [`NasProvider`] selects one protocol adapter from the tenant's
//! configuration through an explicit [`ProtocolRegistry`]. SMB is the only
//! protocol with a working adapter; NFS, WebDAV, SFTP, FTP and FTPS are
//! reserved names that refuse construction.

pub mod config;
pub mod orchestrator;
pub mod placeholders;
pub mod registry;
#[cfg(feature = "smb")]
pub mod smb;

pub use config::{FtpConfig, HostKeyPolicy, NfsConfig, SftpConfig, SmbConfig, WebDavConfig};
pub use orchestrator::NasProvider;
pub use registry::{AdapterFactory, ProtocolRegistry};
#[cfg(feature = "smb")]
pub use smb::SmbAdapter;
