//! Local filesystem backend.
//!
//! Works over any directory the OS can reach, including NAS shares mounted
//! through the kernel. Owns the locked, idempotent quote spreadsheet update.

pub mod config;
pub mod lock;
pub mod quotes;
pub mod storage;

pub use config::{
    LocalConfig, DEFAULT_DOCUMENT_FILENAME, DEFAULT_LOCK_TIMEOUT_SECS, MAX_LOCK_TIMEOUT_SECS,
};
pub use lock::{FileLock, LockError};
pub use quotes::QUOTE_SHEET;
pub use storage::{guess_mime_type, LocalStorage};
