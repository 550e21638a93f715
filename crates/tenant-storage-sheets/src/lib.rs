//! Spreadsheet support for tenant storage: an in-memory workbook model, an
//! xlsx codec, and document operations that work against any
//! [`FileStorageProvider`](tenant_storage_core::FileStorageProvider).

pub mod error;
pub mod ops;
pub mod workbook;
pub mod xlsx;

pub use error::SheetError;
pub use ops::{
    append_row, create_from_rows, read_as_records, read_workbook, update_cells, write_workbook,
    DEFAULT_SHEET,
};
pub use workbook::{CellAddress, CellValue, Formula, Workbook, Worksheet};
