use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StorageError;

/// Opaque, provider-specific configuration bag taken from a tenant record.
///
/// Providers read it once at construction and deserialize their own typed
/// view out of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderConfig(Map<String, Value>);

impl ProviderConfig {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build from any JSON value. Only objects are accepted.
    pub fn from_value(value: Value) -> Result<Self, StorageError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(StorageError::Config(format!(
                "Provider configuration must be an object, got {}",
                other
            ))),
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, StorageError> {
        Self::from_value(serde_json::from_str(raw)?)
    }

    /// Builder-style insert, handy when assembling configs in code.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Deserialize a typed configuration view.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| StorageError::Config(format!("Invalid provider configuration: {}", e)))
    }
}

impl From<Map<String, Value>> for ProviderConfig {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Serde default helper for boolean flags that default to `true`.
pub fn default_true() -> bool {
    true
}
