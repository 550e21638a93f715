use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StorageError;

/// Key/value bag used for structured details and provider-specific metadata.
pub type Details = Map<String, Value>;

/// A file or directory as seen through a storage provider.
///
/// `path` is always relative to the provider's base directory, using `/` as
/// separator. `modified` and `size` are the canonical change-detection fields
/// and every provider fills them in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub is_directory: bool,
    pub modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Details>,
}

impl FileInfo {
    /// Final path component, or the whole path when it has none.
    pub fn name_of(path: &str) -> String {
        path.trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(path)
            .to_string()
    }
}

/// Outcome of a mutating operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Details>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: None,
            path: None,
            size: None,
            modified: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(message)
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Add one entry to the details map, creating it on first use.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Apply the result-returning classification rule to a backend error.
    ///
    /// Typed kinds propagate as `Err`. Anything else is captured as a failed
    /// result carrying the error text.
    pub fn from_error(err: StorageError) -> Result<Self, StorageError> {
        if err.is_typed() {
            return Err(err);
        }
        Ok(Self::failure(err.to_string())
            .with_detail("error", err.to_string())
            .with_detail("error_kind", err.kind_name()))
    }
}

/// Health report of a provider. Always produced, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub provider: String,
    pub message: String,
    #[serde(default)]
    pub details: Details,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

impl HealthCheckResult {
    pub fn healthy(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            provider: provider.into(),
            message: message.into(),
            details: Map::new(),
            protocol: None,
            latency_ms: None,
        }
    }

    pub fn unhealthy(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            ..Self::healthy(provider, message)
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}
