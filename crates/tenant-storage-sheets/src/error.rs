use tenant_storage_core::StorageError;
use thiserror::Error;

/// Failures of the spreadsheet model and codec.
#[derive(Debug, Error)]
pub enum SheetError {
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML error: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid cell address: {0}")]
    InvalidAddress(String),

    #[error("Worksheet not found: {0}")]
    SheetNotFound(String),

    #[error("Malformed workbook: {0}")]
    Malformed(String),
}

impl From<SheetError> for StorageError {
    fn from(err: SheetError) -> Self {
        StorageError::Document(err.to_string())
    }
}
