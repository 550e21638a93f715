//! Provider registry and tenant resolution.
//!
//! Maps the `file_provider` name of a tenant record onto a constructed
//! [`FileStorageProvider`](tenant_storage_core::FileStorageProvider).

pub mod registry;
pub mod tenant;

pub use registry::{ProviderInfo, ProviderRegistry};
pub use tenant::TenantStorageSettings;
