use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tenant_storage_core::{default_true, ProviderConfig, StorageError};

/// Default name of the quote spreadsheet under the base path.
pub const DEFAULT_DOCUMENT_FILENAME: &str = "preventivi.xlsx";

/// Default lock wait, in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECS: f64 = 30.0;

/// Longest accepted lock wait, in seconds.
pub const MAX_LOCK_TIMEOUT_SECS: f64 = 3600.0;

/// Configuration of the local backend.
///
/// Older tenant records use `excel_filename` and `lock_timeout`; both are
/// accepted as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {
    pub base_path: PathBuf,

    #[serde(default = "default_document_filename", alias = "excel_filename")]
    pub document_filename: String,

    #[serde(default = "default_lock_timeout", alias = "lock_timeout")]
    pub lock_timeout_seconds: f64,

    #[serde(default = "default_true")]
    pub create_dirs: bool,
}

fn default_document_filename() -> String {
    DEFAULT_DOCUMENT_FILENAME.to_string()
}

fn default_lock_timeout() -> f64 {
    DEFAULT_LOCK_TIMEOUT_SECS
}

impl LocalConfig {
    pub fn from_provider_config(config: &ProviderConfig) -> Result<Self, StorageError> {
        if config.get("base_path").is_none() {
            return Err(StorageError::Config(
                "LocalStorage requires 'base_path' in config".to_string(),
            ));
        }
        let parsed: Self = config.parse()?;
        let timeout = parsed.lock_timeout_seconds;
        if Duration::try_from_secs_f64(timeout).is_err() || timeout > MAX_LOCK_TIMEOUT_SECS {
            return Err(StorageError::Config(format!(
                "lock_timeout_seconds must be between 0 and {}, got {}",
                MAX_LOCK_TIMEOUT_SECS, timeout
            )));
        }
        Ok(parsed)
    }

    /// Lock wait, clamped to `0..=MAX_LOCK_TIMEOUT_SECS` for configs built
    /// without validation.
    pub fn lock_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.lock_timeout_seconds.clamp(0.0, MAX_LOCK_TIMEOUT_SECS))
            .unwrap_or_default()
    }
}
