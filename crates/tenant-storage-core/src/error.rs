use std::io;

use thiserror::Error;

/// Boxed error used as the chained source of connection failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by storage providers.
///
/// The first group are the *typed kinds* callers branch on. Everything else
/// is a backend failure that result-returning operations report as
/// `success = false` instead of raising (see [`StorageError::is_typed`]).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Document error: {0}")]
    Document(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// Connection failure with a chained cause.
    pub fn connection(
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Map an OS-level error onto the contract's error kinds.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_string()),
            io::ErrorKind::PermissionDenied => {
                Self::PermissionDenied(format!("{}: {}", path, err))
            }
            io::ErrorKind::NotADirectory => Self::NotADirectory(path.to_string()),
            io::ErrorKind::IsADirectory => Self::IsADirectory(path.to_string()),
            io::ErrorKind::DirectoryNotEmpty => Self::DirectoryNotEmpty(path.to_string()),
            _ => Self::Io(format!("{}: {}", path, err)),
        }
    }

    /// Whether this error belongs to a kind callers are expected to branch on.
    pub fn is_typed(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::AlreadyExists(_)
                | Self::PermissionDenied(_)
                | Self::NotADirectory(_)
                | Self::IsADirectory(_)
                | Self::DirectoryNotEmpty(_)
                | Self::NotConnected(_)
                | Self::Connection { .. }
                | Self::Config(_)
        )
    }

    /// Short machine-readable name of the error kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::PermissionDenied(_) => "permission_denied",
            Self::NotADirectory(_) => "not_a_directory",
            Self::IsADirectory(_) => "is_a_directory",
            Self::DirectoryNotEmpty(_) => "directory_not_empty",
            Self::NotConnected(_) => "not_connected",
            Self::Connection { .. } => "connection",
            Self::Config(_) => "config",
            Self::NotImplemented(_) => "not_implemented",
            Self::Lock(_) => "lock",
            Self::Document(_) => "document",
            Self::Protocol(_) => "protocol",
            Self::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Config(err.to_string())
    }
}
