use serde::{Deserialize, Serialize};
use tenant_storage_core::ProviderConfig;

/// Storage fields of a tenant record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantStorageSettings {
    pub tenant_id: String,
    /// Registered provider name, e.g. `localfs` or `nas`.
    #[serde(default)]
    pub file_provider: Option<String>,
    #[serde(default)]
    pub file_config: Option<ProviderConfig>,
}

impl TenantStorageSettings {
    pub fn new(
        tenant_id: impl Into<String>,
        file_provider: impl Into<String>,
        file_config: ProviderConfig,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            file_provider: Some(file_provider.into()),
            file_config: Some(file_config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_tenant_record() {
        let settings: TenantStorageSettings = serde_json::from_value(json!({
            "tenant_id": "acme",
            "file_provider": "localfs",
            "file_config": {"base_path": "/srv/acme", "excel_filename": "quotes.xlsx"}
        }))
        .unwrap();

        assert_eq!(settings.file_provider.as_deref(), Some("localfs"));
        let config = settings.file_config.unwrap();
        assert_eq!(config.get_str("base_path"), Some("/srv/acme"));
    }

    #[test]
    fn test_missing_storage_fields_default_to_none() {
        let settings: TenantStorageSettings =
            serde_json::from_value(json!({"tenant_id": "acme"})).unwrap();
        assert!(settings.file_provider.is_none());
        assert!(settings.file_config.is_none());
    }
}
