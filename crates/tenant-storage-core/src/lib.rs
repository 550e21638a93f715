pub mod config;
pub mod error;
pub mod path;
pub mod pattern;
pub mod provider;
pub mod quote;
pub mod types;

pub use config::{default_true, ProviderConfig};
pub use error::{BoxError, StorageError};
pub use path::BasePath;
pub use pattern::glob_match;
pub use provider::{ByteStream, FileStorageProvider, DEFAULT_CHUNK_SIZE};
pub use quote::{CustomerInfo, QuoteRecord, QuoteRow, QUOTE_DATE_FORMAT, QUOTE_HEADERS};
pub use types::{Details, FileInfo, HealthCheckResult, OperationResult};
