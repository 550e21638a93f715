use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tenant_storage_core::{
    CustomerInfo, OperationResult, QuoteRecord, QuoteRow, QUOTE_HEADERS,
};
use tenant_storage_sheets::{xlsx, CellValue, SheetError, Workbook, Worksheet};
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::lock::{FileLock, LockError};
use crate::storage::LocalStorage;

/// Title of the sheet created for a new quote spreadsheet.
pub const QUOTE_SHEET: &str = "Quotes";

#[derive(Debug, Error)]
enum UpdateError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Sheet(#[from] SheetError),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
struct UpdateOutcome {
    created: bool,
    row_index: u32,
    size: u64,
    modified: Option<DateTime<Utc>>,
}

impl LocalStorage {
    /// Insert or update the row for `quote` in the tenant spreadsheet.
    ///
    /// The whole read-modify-write cycle runs under the sidecar lock. Lock
    /// timeouts, document failures and an empty quote id are reported as
    /// `success = false`.
    #[instrument(skip(self, quote, customer), level = "debug", fields(quote_id = %quote.id))]
    pub async fn update_quote(
        &self,
        tenant_id: &str,
        quote: &QuoteRecord,
        customer: &CustomerInfo,
    ) -> OperationResult {
        if quote.id.trim().is_empty() {
            error!("Quote update for tenant {} rejected: empty quote id", tenant_id);
            return OperationResult::failure("Quote update failed: quote id is empty")
                .with_detail("error", "empty quote id")
                .with_detail("quote_id", quote.id.clone());
        }

        let (relative, document) = match self.resolve(&self.config.document_filename).await {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("Quote update for tenant {} rejected: {}", tenant_id, e);
                return OperationResult::failure(format!("Quote update failed: {}", e))
                    .with_detail("error", e.to_string())
                    .with_detail("quote_id", quote.id.clone());
            }
        };
        let lock_path = FileLock::sidecar_for(&document);
        let timeout = self.config.lock_timeout();
        let create_dirs = self.config.create_dirs;
        let row = quote.row(customer);

        let task = {
            let document = document.clone();
            let lock_path = lock_path.clone();
            tokio::task::spawn_blocking(move || {
                update_locked(&document, &lock_path, timeout, create_dirs, &row)
            })
        };

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                error!("Quote update task for tenant {} failed: {}", tenant_id, join_err);
                return OperationResult::failure(format!("Quote update failed: {}", join_err))
                    .with_detail("error", join_err.to_string())
                    .with_detail("quote_id", quote.id.clone());
            }
        };

        match outcome {
            Ok(done) => {
                let operation = if done.created { "created" } else { "updated" };
                info!(
                    "Spreadsheet {} for quote {} (tenant {}, row {})",
                    operation, quote.id, tenant_id, done.row_index
                );
                let mut result =
                    OperationResult::ok(format!("Quote {} successfully in spreadsheet", operation))
                        .with_path(relative)
                        .with_size(done.size)
                        .with_detail("operation", operation)
                        .with_detail("quote_id", quote.id.clone())
                        .with_detail("row_index", done.row_index)
                        .with_detail("document_path", document.to_string_lossy().to_string());
                if let Some(modified) = done.modified {
                    result = result.with_modified(modified);
                }
                result
            }
            Err(UpdateError::Lock(err @ LockError::Timeout { .. })) => {
                let message = err.to_string();
                error!("{} (tenant {})", message, tenant_id);
                OperationResult::failure(message)
                    .with_detail("timeout", self.config.lock_timeout_seconds)
                    .with_detail("lock_path", lock_path.to_string_lossy().to_string())
                    .with_detail("quote_id", quote.id.clone())
            }
            Err(e) => {
                error!("Spreadsheet update error for tenant {}: {}", tenant_id, e);
                OperationResult::failure(format!("Spreadsheet update failed: {}", e))
                    .with_detail("error", e.to_string())
                    .with_detail("quote_id", quote.id.clone())
            }
        }
    }
}

/// Blocking critical section. The lock is released when `_lock` drops, on
/// every return path.
fn update_locked(
    document: &Path,
    lock_path: &Path,
    timeout: Duration,
    create_dirs: bool,
    row: &QuoteRow,
) -> Result<UpdateOutcome, UpdateError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| UpdateError::Io { path, source }
    };

    if create_dirs {
        if let Some(parent) = document.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
    }

    let _lock = FileLock::acquire(lock_path, timeout)?;

    let mut workbook = match std::fs::read(document) {
        Ok(data) => xlsx::decode(&data)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => new_quote_workbook(),
        Err(e) => return Err(io_err(document)(e)),
    };

    let sheet_idx = workbook
        .sheets
        .iter()
        .position(|s| s.name == QUOTE_SHEET)
        .unwrap_or(workbook.active);
    let ws = workbook
        .sheets
        .get_mut(sheet_idx)
        .ok_or_else(|| SheetError::Malformed("workbook has no sheets".to_string()))?;

    let (row_index, created) = match ws.find_in_column(1, 2, &row.id) {
        Some(existing) => (existing, false),
        None => (ws.max_row().max(1).saturating_add(1), true),
    };
    write_quote_row(ws, row_index, row);

    let data = xlsx::encode(&workbook)?;
    // Write beside the document and rename over it so readers never see a torn file.
    let temp_path = document.with_extension("xlsx.tmp");
    std::fs::write(&temp_path, &data).map_err(io_err(&temp_path))?;
    std::fs::rename(&temp_path, document).map_err(io_err(document))?;

    let meta = std::fs::metadata(document).map_err(io_err(document))?;
    Ok(UpdateOutcome {
        created,
        row_index,
        size: meta.len(),
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
    })
}

fn new_quote_workbook() -> Workbook {
    let mut workbook = Workbook::new(QUOTE_SHEET);
    if let Some(ws) = workbook.active_sheet_mut() {
        ws.write_row(1, QUOTE_HEADERS);
        ws.style_header_row(1);
    }
    workbook
}

fn text(value: &str) -> CellValue {
    if value.is_empty() {
        CellValue::Empty
    } else {
        CellValue::Text(value.to_string())
    }
}

fn write_quote_row(ws: &mut Worksheet, row_index: u32, row: &QuoteRow) {
    ws.write_row(
        row_index,
        [
            text(&row.id),
            text(&row.date),
            text(&row.customer),
            text(&row.email),
            text(&row.phone),
            CellValue::Number(row.total),
            text(&row.status),
            text(&row.notes),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tenant_storage_core::{FileStorageProvider, ProviderConfig};
    use tenant_storage_sheets::Formula;
    use tempfile::TempDir;

    fn setup_with_timeout(timeout: f64) -> (LocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = ProviderConfig::new()
            .with("base_path", temp_dir.path().to_string_lossy().to_string())
            .with("document_filename", "tenant/quotes.xlsx")
            .with("lock_timeout_seconds", timeout);
        (LocalStorage::new(config).unwrap(), temp_dir)
    }

    fn quote(id: &str, total: f64) -> QuoteRecord {
        QuoteRecord {
            id: id.to_string(),
            created_at: Some(Utc.with_ymd_and_hms(2024, 5, 2, 9, 30, 0).unwrap()),
            total,
            status: "pending".to_string(),
            notes: String::new(),
        }
    }

    fn customer(name: &str) -> CustomerInfo {
        CustomerInfo {
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            phone: "+39 055 000000".to_string(),
        }
    }

    async fn read_sheet(storage: &LocalStorage) -> Worksheet {
        let data = storage.read_file("tenant/quotes.xlsx").await.unwrap();
        let workbook = xlsx::decode(&data).unwrap();
        workbook.sheet(QUOTE_SHEET).unwrap().clone()
    }

    #[tokio::test]
    async fn test_first_update_creates_styled_document() {
        let (storage, _temp) = setup_with_timeout(5.0);

        let result = storage
            .update_quote_spreadsheet("t1", &quote("Q-1", 100.0), &customer("Rossi"))
            .await
            .unwrap();
        assert!(result.success, "{}", result.message);
        let details = result.details.unwrap();
        assert_eq!(details["operation"], "created");
        assert_eq!(details["row_index"], 2);

        let ws = read_sheet(&storage).await;
        let headers: Vec<String> = ws.row_values(1, 8).iter().map(|v| v.to_string()).collect();
        assert_eq!(headers, QUOTE_HEADERS);
        assert_eq!(ws.style(1, 1), Some(1));
        assert_eq!(ws.style(2, 1), None);
        assert_eq!(ws.cell(2, 1), Some(&CellValue::from("Q-1")));
        assert_eq!(ws.cell(2, 2), Some(&CellValue::from("2024-05-02 09:30")));
        assert_eq!(ws.cell(2, 6), Some(&CellValue::Number(100.0)));
    }

    #[tokio::test]
    async fn test_second_update_replaces_row() {
        let (storage, _temp) = setup_with_timeout(5.0);
        storage
            .update_quote_spreadsheet("t1", &quote("Q-1", 100.0), &customer("Rossi"))
            .await
            .unwrap();
        storage
            .update_quote_spreadsheet("t1", &quote("Q-2", 50.0), &customer("Bianchi"))
            .await
            .unwrap();

        let mut revised = quote("Q-1", 180.0);
        revised.status = "accepted".to_string();
        let result = storage
            .update_quote_spreadsheet("t1", &revised, &customer("Rossi"))
            .await
            .unwrap();
        let details = result.details.unwrap();
        assert_eq!(details["operation"], "updated");
        assert_eq!(details["row_index"], 2);

        let ws = read_sheet(&storage).await;
        assert_eq!(ws.max_row(), 3);
        assert_eq!(ws.cell(2, 6), Some(&CellValue::Number(180.0)));
        assert_eq!(ws.cell(2, 7), Some(&CellValue::from("accepted")));
        assert_eq!(ws.cell(3, 1), Some(&CellValue::from("Q-2")));
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_rows() {
        let (storage, _temp) = setup_with_timeout(30.0);
        let storage = Arc::new(storage);

        let mut handles = Vec::new();
        for worker in 0..2 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                for n in 0..5 {
                    // Ids overlap between workers on even n.
                    let id = if n % 2 == 0 {
                        format!("shared-{}", n)
                    } else {
                        format!("w{}-{}", worker, n)
                    };
                    let result = storage
                        .update_quote_spreadsheet("t1", &quote(&id, n as f64), &customer("X"))
                        .await
                        .unwrap();
                    assert!(result.success, "{}", result.message);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // shared-0, shared-2, shared-4 plus two odd ids per worker.
        let ws = read_sheet(&storage).await;
        assert_eq!(ws.max_row() - 1, 7);
    }

    #[tokio::test]
    async fn test_lock_timeout_is_reported_not_raised() {
        let (storage, _temp) = setup_with_timeout(0.2);
        let document = storage.base_path().join("tenant/quotes.xlsx");
        std::fs::create_dir_all(document.parent().unwrap()).unwrap();
        let held = FileLock::acquire(&FileLock::sidecar_for(&document), Duration::from_secs(1))
            .unwrap();

        let result = storage
            .update_quote_spreadsheet("t1", &quote("Q-9", 1.0), &customer("Verdi"))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.message.contains("lock"));
        let details = result.details.unwrap();
        assert!(details["lock_path"].as_str().unwrap().ends_with("quotes.lock"));
        assert_eq!(details["timeout"], 0.2);

        drop(held);
        assert!(!storage.file_exists("tenant/quotes.xlsx").await);
    }

    #[tokio::test]
    async fn test_blank_quote_id_is_rejected() {
        let (storage, _temp) = setup_with_timeout(5.0);

        for id in ["", "   "] {
            let result = storage
                .update_quote_spreadsheet("t1", &quote(id, 1.0), &customer("Gialli"))
                .await
                .unwrap();
            assert!(!result.success);
            assert!(result.message.contains("quote id is empty"), "{}", result.message);
        }
        assert!(!storage.file_exists("tenant/quotes.xlsx").await);
        assert!(!storage.file_exists("tenant/quotes.lock").await);
    }

    #[tokio::test]
    async fn test_update_keeps_the_rest_of_the_workbook() {
        let (storage, _temp) = setup_with_timeout(5.0);
        let mut workbook = new_quote_workbook();
        let summary = workbook.sheet_or_create("Riepilogo");
        summary.set(1, 1, "Totale");
        summary.set_formula(1, 2, Formula::new("SUM(Quotes!F:F)"), 0.0);
        storage
            .write_file("tenant/quotes.xlsx", &xlsx::encode(&workbook).unwrap(), false)
            .await
            .unwrap();

        let result = storage
            .update_quote_spreadsheet("t1", &quote("Q-1", 75.0), &customer("Rossi"))
            .await
            .unwrap();
        assert!(result.success, "{}", result.message);

        let data = storage.read_file("tenant/quotes.xlsx").await.unwrap();
        let workbook = xlsx::decode(&data).unwrap();
        assert_eq!(workbook.sheet_names(), vec![QUOTE_SHEET, "Riepilogo"]);
        let summary = workbook.sheet("Riepilogo").unwrap();
        assert_eq!(
            summary.formula(1, 2).map(|f| f.text.as_str()),
            Some("SUM(Quotes!F:F)")
        );
        let quotes = workbook.sheet(QUOTE_SHEET).unwrap();
        assert_eq!(quotes.style(1, 1), Some(1));
        assert_eq!(quotes.style(2, 1), None);
        assert_eq!(quotes.cell(2, 6), Some(&CellValue::Number(75.0)));
    }

    #[tokio::test]
    async fn test_corrupt_document_is_reported_not_raised() {
        let (storage, _temp) = setup_with_timeout(5.0);
        storage
            .write_file("tenant/quotes.xlsx", b"definitely not a zip", false)
            .await
            .unwrap();

        let result = storage
            .update_quote_spreadsheet("t1", &quote("Q-1", 1.0), &customer("Neri"))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.details.unwrap().contains_key("error"));
    }
}
