use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tenant_storage_core::{default_true, ProviderConfig, StorageError};

pub const DEFAULT_SMB_PORT: u16 = 445;
pub const DEFAULT_DOMAIN: &str = "WORKGROUP";
pub const DEFAULT_CLIENT_NAME: &str = "tenant_storage";
pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;
pub const DEFAULT_MAX_SESSIONS: usize = 4;

/// Settings of the SMB adapter.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SmbConfig {
    pub host: String,
    pub share: String,
    pub username: String,
    pub password: String,

    #[serde(default = "default_domain")]
    pub domain: String,

    /// Directory inside the share every path is confined to.
    #[serde(default = "default_base_path")]
    pub base_path: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_client_name")]
    pub client_name: String,

    #[serde(default = "default_true")]
    pub use_ntlm_v2: bool,

    /// TCP connect/read/write timeout.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,

    /// Create missing parent directories on write and move.
    #[serde(default = "default_true")]
    pub create_dirs: bool,

    /// Upper bound on concurrently open SMB sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_base_path() -> String {
    "/".to_string()
}

fn default_port() -> u16 {
    DEFAULT_SMB_PORT
}

fn default_client_name() -> String {
    DEFAULT_CLIENT_NAME.to_string()
}

fn default_timeout() -> f64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS
}

impl SmbConfig {
    pub fn from_provider_config(config: &ProviderConfig) -> Result<Self, StorageError> {
        require(config, "SMB", &["host", "share", "username", "password"])?;
        let mut parsed: Self = config.parse()?;

        let trimmed = parsed.base_path.trim_end_matches(['/', '\\']);
        parsed.base_path = if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        };
        if parsed
            .base_path
            .split(['/', '\\'])
            .any(|segment| segment == "..")
        {
            return Err(StorageError::Config(format!(
                "SMB base_path must not contain '..': {}",
                parsed.base_path
            )));
        }
        if !parsed.timeout_seconds.is_finite() || parsed.timeout_seconds <= 0.0 {
            return Err(StorageError::Config(format!(
                "timeout_seconds must be a positive number, got {}",
                parsed.timeout_seconds
            )));
        }
        if parsed.max_sessions == 0 {
            return Err(StorageError::Config(
                "max_sessions must be at least 1".to_string(),
            ));
        }
        Ok(parsed)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds)
    }

    /// Segments of `base_path` inside the share.
    pub fn base_segments(&self) -> Vec<String> {
        self.base_path
            .split(['/', '\\'])
            .filter(|s| !s.is_empty() && *s != ".")
            .map(str::to_string)
            .collect()
    }
}

impl fmt::Debug for SmbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmbConfig")
            .field("host", &self.host)
            .field("share", &self.share)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .field("base_path", &self.base_path)
            .field("port", &self.port)
            .field("client_name", &self.client_name)
            .field("use_ntlm_v2", &self.use_ntlm_v2)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("create_dirs", &self.create_dirs)
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}

fn require(config: &ProviderConfig, protocol: &str, keys: &[&str]) -> Result<(), StorageError> {
    let missing: Vec<&str> = keys
        .iter()
        .copied()
        .filter(|k| config.get(k).map_or(true, |v| v.is_null()))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(StorageError::Config(format!(
            "{} config missing required fields: {}",
            protocol,
            missing.join(", ")
        )))
    }
}

// Configuration shapes of protocols without an adapter yet. They are parsed
// so a tenant record can be validated before construction is refused.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NfsConfig {
    pub host: String,
    pub export: String,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_nfs_version")]
    pub version: u8,
    #[serde(default)]
    pub mount_options: Option<String>,
}

fn default_nfs_version() -> u8 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebDavConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    #[default]
    AutoAdd,
    Reject,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing)]
    pub private_key_passphrase: Option<String>,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

fn default_sftp_port() -> u16 {
    22
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FtpConfig {
    pub host: String,
    /// 21 for FTP, 990 for implicit FTPS when unset.
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_base_path")]
    pub base_path: String,
    #[serde(default = "default_true")]
    pub passive: bool,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
}

impl FtpConfig {
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.tls { 990 } else { 21 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smb() -> ProviderConfig {
        ProviderConfig::new()
            .with("protocol", "smb")
            .with("host", "nas.local")
            .with("share", "documents")
            .with("username", "user")
            .with("password", "secret")
    }

    #[test]
    fn test_smb_defaults() {
        let config = SmbConfig::from_provider_config(&smb()).unwrap();
        assert_eq!(config.domain, "WORKGROUP");
        assert_eq!(config.base_path, "/");
        assert_eq!(config.port, 445);
        assert!(config.use_ntlm_v2);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(config.base_segments().is_empty());
        assert!(config.create_dirs);
        assert_eq!(config.max_sessions, 4);
    }

    #[test]
    fn test_smb_session_bounds() {
        let config = SmbConfig::from_provider_config(
            &smb().with("create_dirs", false).with("max_sessions", 2),
        )
        .unwrap();
        assert!(!config.create_dirs);
        assert_eq!(config.max_sessions, 2);

        let none = SmbConfig::from_provider_config(&smb().with("max_sessions", 0));
        assert!(matches!(none, Err(StorageError::Config(_))));
    }

    #[test]
    fn test_smb_base_path_trimmed() {
        let config =
            SmbConfig::from_provider_config(&smb().with("base_path", "/tenants/acme/")).unwrap();
        assert_eq!(config.base_path, "/tenants/acme");
        assert_eq!(config.base_segments(), vec!["tenants", "acme"]);

        let bad = SmbConfig::from_provider_config(&smb().with("base_path", "/a/../b"));
        assert!(matches!(bad, Err(StorageError::Config(_))));
    }

    #[test]
    fn test_smb_missing_fields_listed() {
        let config = ProviderConfig::new().with("host", "nas.local");
        let err = SmbConfig::from_provider_config(&config).unwrap_err();
        let StorageError::Config(message) = err else {
            panic!("expected a config error");
        };
        assert!(message.contains("share"));
        assert!(message.contains("password"));
        assert!(!message.contains("host"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = SmbConfig::from_provider_config(&smb()).unwrap();
        assert!(!format!("{:?}", config).contains("secret"));
    }

    #[test]
    fn test_placeholder_shapes() {
        let ftp: FtpConfig = ProviderConfig::new()
            .with("host", "ftp.local")
            .with("username", "u")
            .with("tls", true)
            .parse()
            .unwrap();
        assert_eq!(ftp.effective_port(), 990);
        assert!(ftp.passive);

        let sftp: SftpConfig = ProviderConfig::new()
            .with("host", "sftp.local")
            .with("username", "u")
            .with("host_key_policy", "reject")
            .parse()
            .unwrap();
        assert_eq!(sftp.port, 22);
        assert_eq!(sftp.host_key_policy, HostKeyPolicy::Reject);
    }
}
