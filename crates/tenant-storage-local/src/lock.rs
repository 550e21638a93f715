use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tenant_storage_core::StorageError;
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to acquire file lock within {}s", .timeout.as_secs_f64())]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("Failed to open lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<LockError> for StorageError {
    fn from(err: LockError) -> Self {
        StorageError::Lock(err.to_string())
    }
}

/// Exclusive advisory lock on a sidecar file, held until dropped.
///
/// Only writers that take the same lock are excluded. The lock covers
/// processes on this host; nothing here coordinates across machines.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Sidecar lock path for a document (`quotes.xlsx` -> `quotes.lock`).
    pub fn sidecar_for(document: &Path) -> PathBuf {
        document.with_extension("lock")
    }

    /// Block until the lock is held or `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        // A timeout past the end of the clock waits without a deadline.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("Acquired lock {}", path.display());
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    let now = Instant::now();
                    match deadline {
                        Some(deadline) if now >= deadline => {
                            return Err(LockError::Timeout {
                                path: path.to_path_buf(),
                                timeout,
                            });
                        }
                        Some(deadline) => thread::sleep(POLL_INTERVAL.min(deadline - now)),
                        None => thread::sleep(POLL_INTERVAL),
                    }
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        } else {
            debug!("Released lock {}", self.path.display());
        }
    }
}
