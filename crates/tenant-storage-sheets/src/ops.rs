//! Spreadsheet helpers layered on any provider's byte-level read/write.
//!
//! None of these serialize concurrent callers. `update_cells` and
//! `append_row` are plain read-modify-write cycles; callers that need
//! exclusion use the local backend's locked quote update or their own
//! serialization.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tenant_storage_core::{FileStorageProvider, OperationResult, StorageError};
use tracing::{debug, error, info, instrument};

use crate::error::SheetError;
use crate::workbook::{CellAddress, CellValue, Workbook, Worksheet};
use crate::xlsx;

/// Sheet name used when a caller does not pick one.
pub const DEFAULT_SHEET: &str = "Sheet1";

async fn decode_blocking(data: Vec<u8>) -> Result<Workbook, StorageError> {
    tokio::task::spawn_blocking(move || xlsx::decode(&data))
        .await
        .map_err(|e| StorageError::Document(format!("Decode task failed: {}", e)))?
        .map_err(StorageError::from)
}

async fn encode_blocking(workbook: Workbook) -> Result<Vec<u8>, StorageError> {
    tokio::task::spawn_blocking(move || xlsx::encode(&workbook))
        .await
        .map_err(|e| StorageError::Document(format!("Encode task failed: {}", e)))?
        .map_err(StorageError::from)
}

/// Fetch and parse a workbook, activating `sheet` when it exists.
#[instrument(skip(provider), level = "debug")]
pub async fn read_workbook(
    provider: &dyn FileStorageProvider,
    path: &str,
    sheet: Option<&str>,
) -> Result<Workbook, StorageError> {
    let data = provider.read_file(path).await?;
    let mut workbook = decode_blocking(data).await.inspect_err(|e| {
        error!("Failed to parse spreadsheet {}: {}", path, e);
    })?;

    if let Some(name) = sheet {
        if !workbook.set_active(name) {
            debug!("Sheet {} not in {}, keeping active sheet", name, path);
        }
    }

    debug!("Read spreadsheet {} with sheets {:?}", path, workbook.sheet_names());
    Ok(workbook)
}

/// Serialize and store a workbook.
///
/// A non-success write result is turned into an error here, unlike the
/// contract layer.
#[instrument(skip(provider, workbook), level = "debug")]
pub async fn write_workbook(
    provider: &dyn FileStorageProvider,
    path: &str,
    workbook: &Workbook,
    overwrite: bool,
) -> Result<OperationResult, StorageError> {
    let data = encode_blocking(workbook.clone()).await?;
    let size = data.len();
    let result = provider.write_file(path, &data, overwrite).await?;

    if !result.success {
        error!("Failed to write spreadsheet {}: {}", path, result.message);
        return Err(StorageError::Document(format!(
            "Failed to write spreadsheet {}: {}",
            path, result.message
        )));
    }

    info!("Wrote spreadsheet {} ({} bytes)", path, size);
    Ok(result)
}

/// Apply sparse `address -> value` updates to `sheet` (created if absent).
#[instrument(skip(provider, updates), level = "debug", fields(updates = updates.len()))]
pub async fn update_cells(
    provider: &dyn FileStorageProvider,
    path: &str,
    updates: &BTreeMap<String, CellValue>,
    sheet: &str,
) -> Result<OperationResult, StorageError> {
    // Validate every address before touching the backend.
    let parsed = updates
        .iter()
        .map(|(address, value)| Ok((CellAddress::parse(address)?, value.clone())))
        .collect::<Result<Vec<_>, SheetError>>()?;

    let mut workbook = read_workbook(provider, path, None).await?;
    let ws = workbook.sheet_or_create(sheet);
    for (at, value) in parsed {
        ws.set(at.row, at.col, value);
    }

    let result = write_workbook(provider, path, &workbook, true).await?;
    info!("Updated {} cells in {}!{}", updates.len(), path, sheet);
    Ok(result.with_detail("updated_cells", updates.len()))
}

/// Create a workbook from rows, with an optional header row first.
#[instrument(skip(provider, rows, headers), level = "debug", fields(rows = rows.len()))]
pub async fn create_from_rows(
    provider: &dyn FileStorageProvider,
    path: &str,
    rows: &[Vec<CellValue>],
    sheet: &str,
    headers: Option<&[String]>,
    overwrite: bool,
) -> Result<OperationResult, StorageError> {
    let mut workbook = Workbook::new(sheet);
    let ws = workbook
        .active_sheet_mut()
        .ok_or_else(|| StorageError::Document("new workbook has no sheet".to_string()))?;

    if let Some(headers) = headers {
        ws.append_row(headers.iter().map(String::as_str));
    }
    for row in rows {
        ws.append_row(row.iter().cloned());
    }

    let result = write_workbook(provider, path, &workbook, overwrite).await?;
    info!("Created spreadsheet {} with {} rows", path, rows.len());
    Ok(result.with_detail("rows", rows.len()))
}

/// Append one row to `sheet` (created if absent) of an existing workbook.
#[instrument(skip(provider, row), level = "debug")]
pub async fn append_row(
    provider: &dyn FileStorageProvider,
    path: &str,
    row: &[CellValue],
    sheet: &str,
) -> Result<OperationResult, StorageError> {
    let mut workbook = read_workbook(provider, path, None).await?;
    let row_index = workbook.sheet_or_create(sheet).append_row(row.iter().cloned());

    let result = write_workbook(provider, path, &workbook, true).await?;
    info!("Appended row {} to {}!{}", row_index, path, sheet);
    Ok(result.with_detail("row_index", row_index))
}

/// Read a sheet as JSON records keyed by the `header_row` values.
///
/// A named `sheet` must exist.
///
/// Columns with an empty header are dropped and rows with no values at all
/// are skipped.
#[instrument(skip(provider), level = "debug")]
pub async fn read_as_records(
    provider: &dyn FileStorageProvider,
    path: &str,
    sheet: Option<&str>,
    header_row: u32,
) -> Result<Vec<Map<String, Value>>, StorageError> {
    let workbook = read_workbook(provider, path, sheet).await?;
    if let Some(name) = sheet.filter(|name| workbook.sheet(name).is_none()) {
        return Err(SheetError::SheetNotFound(format!("{} in {}", name, path)).into());
    }
    let ws = workbook
        .active_sheet()
        .ok_or_else(|| StorageError::Document(format!("{} has no sheets", path)))?;

    let records = records_from_sheet(ws, header_row);
    debug!("Read {} records from {}", records.len(), path);
    Ok(records)
}

fn records_from_sheet(ws: &Worksheet, header_row: u32) -> Vec<Map<String, Value>> {
    let Some(first_row) = header_row.checked_add(1) else {
        return Vec::new();
    };
    let width = ws.max_column();
    let headers: Vec<(u32, String)> = ws
        .row_values(header_row, width)
        .into_iter()
        .enumerate()
        .filter(|(_, v)| !v.is_empty())
        .map(|(idx, v)| (idx as u32 + 1, v.to_string()))
        .collect();

    ws.rows
        .range(first_row..)
        .filter_map(|(row, _)| {
            let mut record = Map::new();
            let mut any_value = false;
            for (col, header) in &headers {
                let value = ws.cell(*row, *col).cloned().unwrap_or_default();
                any_value |= !value.is_empty();
                record.insert(header.clone(), value.to_json());
            }
            any_value.then_some(record)
        })
        .collect()
}
