//! SMB client errors and NTSTATUS codes.

use std::fmt;
use std::io;

use tenant_storage_core::StorageError;
use thiserror::Error;

pub type SmbResult<T> = Result<T, SmbError>;

#[derive(Debug, Error)]
pub enum SmbError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server returned {0}")]
    NtStatus(NtStatus),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl From<NtStatus> for SmbError {
    fn from(status: NtStatus) -> Self {
        SmbError::NtStatus(status)
    }
}

impl SmbError {
    /// NTSTATUS carried by this error, if the server produced one.
    pub fn status(&self) -> Option<NtStatus> {
        match self {
            SmbError::NtStatus(status) => Some(*status),
            _ => None,
        }
    }

    /// Whether the transport is gone and the session must be rebuilt.
    pub fn is_fatal(&self) -> bool {
        match self {
            SmbError::Io(_) | SmbError::Protocol(_) => true,
            SmbError::NtStatus(status) => matches!(
                *status,
                NtStatus::USER_SESSION_DELETED
                    | NtStatus::NETWORK_SESSION_EXPIRED
                    | NtStatus::NETWORK_NAME_DELETED
            ),
            _ => false,
        }
    }

    /// Translate into the storage contract's error kinds for `path`.
    pub fn into_storage(self, path: &str) -> StorageError {
        let status = match self {
            SmbError::NtStatus(status) => status,
            SmbError::Io(e) => {
                return StorageError::connection(format!("SMB transport failed on {}", path), e)
            }
            SmbError::AuthFailed(msg) => {
                return StorageError::Connection {
                    message: format!("SMB authentication failed: {}", msg),
                    source: None,
                }
            }
            SmbError::Protocol(msg) => return StorageError::Protocol(msg),
            SmbError::NotSupported(msg) => return StorageError::NotImplemented(msg),
        };

        match status {
            NtStatus::NO_SUCH_FILE
            | NtStatus::OBJECT_NAME_NOT_FOUND
            | NtStatus::OBJECT_PATH_NOT_FOUND => StorageError::NotFound(path.to_string()),
            NtStatus::OBJECT_NAME_COLLISION => StorageError::AlreadyExists(path.to_string()),
            NtStatus::ACCESS_DENIED | NtStatus::NETWORK_ACCESS_DENIED => {
                StorageError::PermissionDenied(format!("{}: {}", path, status))
            }
            NtStatus::NOT_A_DIRECTORY => StorageError::NotADirectory(path.to_string()),
            NtStatus::FILE_IS_A_DIRECTORY => StorageError::IsADirectory(path.to_string()),
            NtStatus::DIRECTORY_NOT_EMPTY => StorageError::DirectoryNotEmpty(path.to_string()),
            NtStatus::USER_SESSION_DELETED
            | NtStatus::NETWORK_SESSION_EXPIRED
            | NtStatus::NETWORK_NAME_DELETED => {
                StorageError::NotConnected(format!("SMB session lost: {}", status))
            }
            NtStatus::LOGON_FAILURE | NtStatus::BAD_NETWORK_NAME => StorageError::Connection {
                message: format!("{}: {}", path, status),
                source: None,
            },
            other => StorageError::Protocol(format!("{}: {}", path, other)),
        }
    }
}

/// NTSTATUS value returned in every SMB2 response header.
///
/// Kept as the raw code so statuses this client has no name for still
/// survive into logs and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NtStatus(pub u32);

impl NtStatus {
    pub const SUCCESS: Self = Self(0x0000_0000);
    pub const PENDING: Self = Self(0x0000_0103);
    pub const BUFFER_OVERFLOW: Self = Self(0x8000_0005);
    pub const NO_MORE_FILES: Self = Self(0x8000_0006);
    pub const INVALID_PARAMETER: Self = Self(0xC000_000D);
    pub const NO_SUCH_FILE: Self = Self(0xC000_000F);
    pub const END_OF_FILE: Self = Self(0xC000_0011);
    pub const MORE_PROCESSING_REQUIRED: Self = Self(0xC000_0016);
    pub const ACCESS_DENIED: Self = Self(0xC000_0022);
    pub const OBJECT_NAME_INVALID: Self = Self(0xC000_0033);
    pub const OBJECT_NAME_NOT_FOUND: Self = Self(0xC000_0034);
    pub const OBJECT_NAME_COLLISION: Self = Self(0xC000_0035);
    pub const OBJECT_PATH_NOT_FOUND: Self = Self(0xC000_003A);
    pub const SHARING_VIOLATION: Self = Self(0xC000_0043);
    pub const DELETE_PENDING: Self = Self(0xC000_0056);
    pub const LOGON_FAILURE: Self = Self(0xC000_006D);
    pub const FILE_IS_A_DIRECTORY: Self = Self(0xC000_00BA);
    pub const NOT_SUPPORTED: Self = Self(0xC000_00BB);
    pub const NETWORK_ACCESS_DENIED: Self = Self(0xC000_00CA);
    pub const BAD_NETWORK_NAME: Self = Self(0xC000_00CC);
    pub const DIRECTORY_NOT_EMPTY: Self = Self(0xC000_0101);
    pub const NOT_A_DIRECTORY: Self = Self(0xC000_0103);
    pub const NETWORK_NAME_DELETED: Self = Self(0xC000_00C9);
    pub const USER_SESSION_DELETED: Self = Self(0xC000_0203);
    pub const NETWORK_SESSION_EXPIRED: Self = Self(0xC000_035C);

    pub fn from_u32(value: u32) -> Self {
        Self(value)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        self.0 < 0x4000_0000
    }

    pub fn is_error(&self) -> bool {
        self.0 >= 0xC000_0000
    }

    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Self::SUCCESS => "STATUS_SUCCESS",
            Self::PENDING => "STATUS_PENDING",
            Self::BUFFER_OVERFLOW => "STATUS_BUFFER_OVERFLOW",
            Self::NO_MORE_FILES => "STATUS_NO_MORE_FILES",
            Self::INVALID_PARAMETER => "STATUS_INVALID_PARAMETER",
            Self::NO_SUCH_FILE => "STATUS_NO_SUCH_FILE",
            Self::END_OF_FILE => "STATUS_END_OF_FILE",
            Self::MORE_PROCESSING_REQUIRED => "STATUS_MORE_PROCESSING_REQUIRED",
            Self::ACCESS_DENIED => "STATUS_ACCESS_DENIED",
            Self::OBJECT_NAME_INVALID => "STATUS_OBJECT_NAME_INVALID",
            Self::OBJECT_NAME_NOT_FOUND => "STATUS_OBJECT_NAME_NOT_FOUND",
            Self::OBJECT_NAME_COLLISION => "STATUS_OBJECT_NAME_COLLISION",
            Self::OBJECT_PATH_NOT_FOUND => "STATUS_OBJECT_PATH_NOT_FOUND",
            Self::SHARING_VIOLATION => "STATUS_SHARING_VIOLATION",
            Self::DELETE_PENDING => "STATUS_DELETE_PENDING",
            Self::LOGON_FAILURE => "STATUS_LOGON_FAILURE",
            Self::FILE_IS_A_DIRECTORY => "STATUS_FILE_IS_A_DIRECTORY",
            Self::NOT_SUPPORTED => "STATUS_NOT_SUPPORTED",
            Self::NETWORK_ACCESS_DENIED => "STATUS_NETWORK_ACCESS_DENIED",
            Self::BAD_NETWORK_NAME => "STATUS_BAD_NETWORK_NAME",
            Self::DIRECTORY_NOT_EMPTY => "STATUS_DIRECTORY_NOT_EMPTY",
            Self::NOT_A_DIRECTORY => "STATUS_NOT_A_DIRECTORY",
            Self::NETWORK_NAME_DELETED => "STATUS_NETWORK_NAME_DELETED",
            Self::USER_SESSION_DELETED => "STATUS_USER_SESSION_DELETED",
            Self::NETWORK_SESSION_EXPIRED => "STATUS_NETWORK_SESSION_EXPIRED",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:08X})", name, self.0),
            None => write!(f, "NTSTATUS 0x{:08X}", self.0),
        }
    }
}
