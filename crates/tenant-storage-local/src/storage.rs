use std::any::Any;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tenant_storage_core::{
    glob_match, BasePath, CustomerInfo, FileInfo, FileStorageProvider, HealthCheckResult,
    OperationResult, ProviderConfig, QuoteRecord, StorageError,
};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::config::LocalConfig;

/// Name of the throwaway directory used by the health check.
const HEALTH_PROBE_DIR: &str = ".health_check_test";
const HEALTH_PROBE_FILE: &str = ".health_check_probe";

/// Storage backend over a local or OS-mounted directory.
///
/// Every path is resolved under `base_path`; attempts to leave it fail with
/// `PermissionDenied` before touching the filesystem.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    pub(crate) config: LocalConfig,
    pub(crate) base: BasePath,
}

impl LocalStorage {
    pub fn new(config: ProviderConfig) -> Result<Self, StorageError> {
        Self::from_config(LocalConfig::from_provider_config(&config)?)
    }

    pub fn from_config(config: LocalConfig) -> Result<Self, StorageError> {
        // Canonical root so absolute request paths compare against the real location.
        let root = match std::fs::canonicalize(&config.base_path) {
            Ok(root) => root,
            Err(_) => std::path::absolute(&config.base_path).map_err(|e| {
                StorageError::Config(format!(
                    "Invalid base_path {}: {}",
                    config.base_path.display(),
                    e
                ))
            })?,
        };

        info!(
            "LocalStorage initialized with base_path={}",
            root.display()
        );

        Ok(Self {
            base: BasePath::new(root),
            config,
        })
    }

    pub fn base_path(&self) -> &Path {
        self.base.root()
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    /// Lexical resolution under the base, then a check that symlinks along
    /// the path do not lead out of it.
    pub(crate) async fn resolve(&self, path: &str) -> Result<(String, PathBuf), StorageError> {
        let relative = self.base.relative(path)?;
        let full = self.base.resolve(&relative)?;
        self.confine(&full, &relative).await?;
        Ok((relative, full))
    }

    async fn canonical_root(&self) -> PathBuf {
        fs::canonicalize(self.base.root())
            .await
            .unwrap_or_else(|_| self.base.root().to_path_buf())
    }

    /// The deepest existing ancestor of `full` must canonicalize to a path
    /// under the root. Dangling links are refused: writing through one
    /// creates its target.
    async fn confine(&self, full: &Path, relative: &str) -> Result<(), StorageError> {
        let root = self.canonical_root().await;
        let escapes =
            || StorageError::PermissionDenied(format!("Path escapes base directory: {}", relative));

        let lexical_root = self.base.root();
        for ancestor in full.ancestors().take_while(|a| a.starts_with(lexical_root)) {
            match fs::canonicalize(ancestor).await {
                Ok(real) if real.starts_with(&root) => return Ok(()),
                Ok(real) => {
                    warn!("{} resolves to {} outside the base directory", relative, real.display());
                    return Err(escapes());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if fs::symlink_metadata(ancestor).await.is_ok() {
                        warn!("{} goes through a dangling link", relative);
                        return Err(escapes());
                    }
                }
                Err(e) => return Err(StorageError::from_io(e, relative)),
            }
        }
        Ok(())
    }

    async fn within_root(&self, full: &Path) -> bool {
        match fs::canonicalize(full).await {
            Ok(real) => real.starts_with(self.canonical_root().await),
            Err(_) => false,
        }
    }

    /// Metadata following symlinks, or `None` when the path does not exist.
    async fn stat(full: &Path, relative: &str) -> Result<Option<Metadata>, StorageError> {
        match fs::metadata(full).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::from_io(e, relative)),
        }
    }

    async fn ensure_parent(&self, full: &Path, relative: &str) -> Result<(), StorageError> {
        if !self.config.create_dirs {
            return Ok(());
        }
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(e, relative))?;
        }
        Ok(())
    }

    fn file_info(relative: &str, full: &Path, meta: &Metadata) -> FileInfo {
        let is_directory = meta.is_dir();
        FileInfo {
            path: relative.to_string(),
            name: FileInfo::name_of(relative),
            size: if is_directory { 0 } else { meta.len() },
            is_directory,
            modified: meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
            created: meta.created().ok().map(DateTime::<Utc>::from),
            mime_type: if is_directory {
                None
            } else {
                guess_mime_type(relative).map(str::to_string)
            },
            metadata: Some(provider_metadata(full, meta)),
        }
    }

    fn written(&self, message: String, relative: &str, meta: Option<Metadata>) -> OperationResult {
        let mut result = OperationResult::ok(message).with_path(relative);
        if let Some(meta) = meta {
            result = result.with_size(meta.len());
            if let Ok(modified) = meta.modified() {
                result = result.with_modified(DateTime::<Utc>::from(modified));
            }
        }
        result
    }
}

/// MIME type for the document kinds tenants keep in their storage.
pub fn guess_mime_type(path: &str) -> Option<&'static str> {
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "xls" => "application/vnd.ms-excel",
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "doc" => "application/msword",
        "txt" => "text/plain",
        "json" => "application/json",
        _ => return None,
    };
    Some(mime)
}

fn provider_metadata(full: &Path, meta: &Metadata) -> Map<String, Value> {
    let mut extra = Map::new();
    extra.insert("absolute_path".into(), json!(full.to_string_lossy()));
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        extra.insert("permissions".into(), json!(format!("{:o}", meta.mode() & 0o777)));
        extra.insert("owner_uid".into(), json!(meta.uid()));
        extra.insert("owner_gid".into(), json!(meta.gid()));
    }
    #[cfg(not(unix))]
    {
        extra.insert("readonly".into(), json!(meta.permissions().readonly()));
    }
    extra
}

/// Create `full` and fail if it already exists, closing the gap between the
/// existence check and the write.
async fn write_new(full: &Path, data: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(full)
        .await?;
    file.write_all(data).await?;
    file.flush().await
}

fn join_relative(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

#[async_trait]
impl FileStorageProvider for LocalStorage {
    fn provider_name(&self) -> &'static str {
        "LocalStorage"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_files(
        &self,
        path: &str,
        pattern: Option<&str>,
        recursive: bool,
    ) -> Result<Vec<FileInfo>, StorageError> {
        let (relative, full) = self.resolve(path).await?;
        match Self::stat(&full, &relative).await? {
            None => return Err(StorageError::NotFound(format!("Directory not found: {}", path))),
            Some(meta) if !meta.is_dir() => {
                return Err(StorageError::NotADirectory(path.to_string()))
            }
            Some(_) => {}
        }

        let mut files = Vec::new();
        let mut pending = vec![(relative.clone(), full)];
        while let Some((dir_rel, dir_full)) = pending.pop() {
            let mut entries = fs::read_dir(&dir_full)
                .await
                .map_err(|e| StorageError::from_io(e, &dir_rel))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::from_io(e, &dir_rel))?
            {
                let name = entry.file_name().to_string_lossy().to_string();
                let entry_rel = join_relative(&dir_rel, &name);
                let entry_full = entry.path();

                let is_link = entry.file_type().await.is_ok_and(|t| t.is_symlink());
                if is_link && !self.within_root(&entry_full).await {
                    warn!("Skipping {}: link leads out of the base directory", entry_rel);
                    continue;
                }

                let meta = match fs::metadata(&entry_full).await {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!("Failed to get metadata for {}: {}", entry_full.display(), e);
                        continue;
                    }
                };

                if meta.is_dir() {
                    if recursive {
                        pending.push((entry_rel.clone(), entry_full.clone()));
                    }
                } else if let Some(pattern) = pattern {
                    if !glob_match(pattern, &name) {
                        continue;
                    }
                }

                files.push(Self::file_info(&entry_rel, &entry_full, &meta));
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!("Listed {} files in {}", files.len(), path);
        Ok(files)
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let (relative, full) = self.resolve(path).await?;
        let data = fs::read(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &relative))?;
        debug!("Read {} bytes from {}", data.len(), path);
        Ok(data)
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write_file(
        &self,
        path: &str,
        data: &[u8],
        overwrite: bool,
    ) -> Result<OperationResult, StorageError> {
        let (relative, full) = self.resolve(path).await?;
        if relative.is_empty() {
            return Err(StorageError::IsADirectory(path.to_string()));
        }

        if let Some(meta) = Self::stat(&full, &relative).await? {
            if meta.is_dir() {
                return Err(StorageError::IsADirectory(path.to_string()));
            }
            if !overwrite {
                return Err(StorageError::AlreadyExists(path.to_string()));
            }
        }

        let outcome: Result<(), StorageError> = async {
            self.ensure_parent(&full, &relative).await?;
            let written = if overwrite {
                fs::write(&full, data).await
            } else {
                write_new(&full, data).await
            };
            written.map_err(|e| StorageError::from_io(e, &relative))
        }
        .await;

        if let Err(e) = outcome {
            warn!("Write to {} failed: {}", path, e);
            return OperationResult::from_error(e);
        }

        let meta = fs::metadata(&full).await.ok();
        debug!("Wrote {} bytes to {}", data.len(), path);
        Ok(self.written(format!("File written successfully: {}", path), &relative, meta))
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_file(&self, path: &str) -> Result<OperationResult, StorageError> {
        let (relative, full) = self.resolve(path).await?;
        match Self::stat(&full, &relative).await? {
            None => return Err(StorageError::NotFound(path.to_string())),
            Some(meta) if meta.is_dir() => {
                return Err(StorageError::IsADirectory(path.to_string()))
            }
            Some(_) => {}
        }

        if let Err(e) = fs::remove_file(&full).await {
            return OperationResult::from_error(StorageError::from_io(e, &relative));
        }

        debug!("Deleted {}", path);
        Ok(OperationResult::ok(format!("File deleted successfully: {}", path)).with_path(relative))
    }

    #[instrument(skip(self), level = "debug")]
    async fn move_file(
        &self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<OperationResult, StorageError> {
        let (src_rel, src_full) = self.resolve(source).await?;
        let (dst_rel, dst_full) = self.resolve(destination).await?;
        if src_rel.is_empty() {
            return Err(StorageError::PermissionDenied(
                "Refusing to move the base directory".to_string(),
            ));
        }

        if Self::stat(&src_full, &src_rel).await?.is_none() {
            return Err(StorageError::NotFound(source.to_string()));
        }
        if Self::stat(&dst_full, &dst_rel).await?.is_some() && !overwrite {
            return Err(StorageError::AlreadyExists(destination.to_string()));
        }

        let outcome = async {
            self.ensure_parent(&dst_full, &dst_rel).await?;
            fs::rename(&src_full, &dst_full)
                .await
                .map_err(|e| StorageError::from_io(e, &dst_rel))
        }
        .await;
        if let Err(e) = outcome {
            return OperationResult::from_error(e);
        }

        debug!("Moved {} to {}", source, destination);
        let meta = fs::metadata(&dst_full).await.ok();
        Ok(self.written(
            format!("Moved {} to {}", source, destination),
            &dst_rel,
            meta,
        ))
    }

    #[instrument(skip(self), level = "debug")]
    async fn copy_file(
        &self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<OperationResult, StorageError> {
        let (src_rel, src_full) = self.resolve(source).await?;
        let (dst_rel, dst_full) = self.resolve(destination).await?;

        match Self::stat(&src_full, &src_rel).await? {
            None => return Err(StorageError::NotFound(source.to_string())),
            Some(meta) if meta.is_dir() => {
                return Err(StorageError::IsADirectory(source.to_string()))
            }
            Some(_) => {}
        }
        if let Some(meta) = Self::stat(&dst_full, &dst_rel).await? {
            if meta.is_dir() {
                return Err(StorageError::IsADirectory(destination.to_string()));
            }
            if !overwrite {
                return Err(StorageError::AlreadyExists(destination.to_string()));
            }
        }

        let outcome = async {
            self.ensure_parent(&dst_full, &dst_rel).await?;
            fs::copy(&src_full, &dst_full)
                .await
                .map_err(|e| StorageError::from_io(e, &dst_rel))
        }
        .await;
        if let Err(e) = outcome {
            return OperationResult::from_error(e);
        }

        debug!("Copied {} to {}", source, destination);
        let meta = fs::metadata(&dst_full).await.ok();
        Ok(self.written(
            format!("Copied {} to {}", source, destination),
            &dst_rel,
            meta,
        ))
    }

    #[instrument(skip(self), level = "debug")]
    async fn mkdir(&self, path: &str, parents: bool) -> Result<OperationResult, StorageError> {
        let (relative, full) = self.resolve(path).await?;

        if let Some(meta) = Self::stat(&full, &relative).await? {
            if meta.is_dir() && parents {
                return Ok(OperationResult::ok(format!("Directory already exists: {}", path))
                    .with_path(relative));
            }
            return Err(StorageError::AlreadyExists(path.to_string()));
        }

        let created = if parents {
            fs::create_dir_all(&full).await
        } else {
            fs::create_dir(&full).await
        };
        if let Err(e) = created {
            return OperationResult::from_error(StorageError::from_io(e, &relative));
        }

        debug!("Created directory {}", path);
        Ok(OperationResult::ok(format!("Directory created: {}", path)).with_path(relative))
    }

    #[instrument(skip(self), level = "debug")]
    async fn rmdir(&self, path: &str, recursive: bool) -> Result<OperationResult, StorageError> {
        let (relative, full) = self.resolve(path).await?;
        if relative.is_empty() {
            return Err(StorageError::PermissionDenied(
                "Refusing to remove the base directory".to_string(),
            ));
        }

        match Self::stat(&full, &relative).await? {
            None => return Err(StorageError::NotFound(path.to_string())),
            Some(meta) if !meta.is_dir() => {
                return Err(StorageError::NotADirectory(path.to_string()))
            }
            Some(_) => {}
        }

        let removed = if recursive {
            fs::remove_dir_all(&full).await
        } else {
            fs::remove_dir(&full).await
        };
        if let Err(e) = removed {
            return OperationResult::from_error(StorageError::from_io(e, &relative));
        }

        debug!("Removed directory {} (recursive={})", path, recursive);
        Ok(OperationResult::ok(format!("Directory removed: {}", path)).with_path(relative))
    }

    async fn file_exists(&self, path: &str) -> bool {
        match self.resolve(path).await {
            Ok((_, full)) => fs::try_exists(&full).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_metadata(&self, path: &str) -> Result<FileInfo, StorageError> {
        let (relative, full) = self.resolve(path).await?;
        let meta = Self::stat(&full, &relative)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("File not found: {}", path)))?;
        Ok(Self::file_info(&relative, &full, &meta))
    }

    async fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let base = self.base.root().to_path_buf();

        let checks = tokio::task::spawn_blocking(move || run_health_checks(&base))
            .await
            .unwrap_or_else(|e| {
                warn!("Health check task failed: {}", e);
                HealthChecks::default()
            });

        let healthy = checks.base_path_exists && checks.base_path_readable && checks.base_path_writable;
        let message = if healthy {
            "LocalStorage healthy".to_string()
        } else {
            let mut issues = Vec::new();
            if !checks.base_path_exists {
                issues.push("base path doesn't exist");
            }
            if !checks.base_path_readable {
                issues.push("no read access");
            }
            if !checks.base_path_writable {
                issues.push("no write access");
            }
            format!("LocalStorage unhealthy: {}", issues.join(", "))
        };

        let mut result = if healthy {
            HealthCheckResult::healthy(self.provider_name(), message)
        } else {
            HealthCheckResult::unhealthy(self.provider_name(), message)
        }
        .with_detail("base_path", self.base.root().to_string_lossy().to_string())
        .with_detail("base_path_exists", checks.base_path_exists)
        .with_detail("base_path_readable", checks.base_path_readable)
        .with_detail("base_path_writable", checks.base_path_writable)
        .with_detail("can_create_dirs", checks.can_create_dirs)
        .with_detail(
            "disk_space_available",
            checks
                .free_bytes
                .map(|b| Value::String(format!("{:.2} GB", b as f64 / 1024f64.powi(3))))
                .unwrap_or(Value::Null),
        )
        .with_detail(
            "config",
            json!({
                "document_filename": self.config.document_filename,
                "lock_timeout_seconds": self.config.lock_timeout_seconds,
                "create_dirs": self.config.create_dirs,
            }),
        );
        result.latency_ms = Some(started.elapsed().as_secs_f64() * 1000.0);

        if !healthy {
            warn!("{}", result.message);
        }
        result
    }

    async fn update_quote_spreadsheet(
        &self,
        tenant_id: &str,
        quote: &QuoteRecord,
        customer: &CustomerInfo,
    ) -> Result<OperationResult, StorageError> {
        Ok(self.update_quote(tenant_id, quote, customer).await)
    }
}

#[derive(Debug, Default)]
struct HealthChecks {
    base_path_exists: bool,
    base_path_readable: bool,
    base_path_writable: bool,
    can_create_dirs: bool,
    free_bytes: Option<u64>,
}

fn run_health_checks(base: &Path) -> HealthChecks {
    let mut checks = HealthChecks::default();
    if !base.is_dir() {
        return checks;
    }
    checks.base_path_exists = true;
    checks.base_path_readable = std::fs::read_dir(base).is_ok();

    let probe_file = base.join(HEALTH_PROBE_FILE);
    if std::fs::write(&probe_file, b"ok").is_ok() {
        checks.base_path_writable = true;
        let _ = std::fs::remove_file(&probe_file);
    }

    let probe_dir = base.join(HEALTH_PROBE_DIR);
    if std::fs::create_dir_all(&probe_dir).is_ok() {
        checks.can_create_dirs = std::fs::remove_dir(&probe_dir).is_ok();
    }

    checks.free_bytes = fs2::available_space(base).ok();
    checks
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (LocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = ProviderConfig::new()
            .with("base_path", temp_dir.path().to_string_lossy().to_string());
        let storage = LocalStorage::new(config).unwrap();
        (storage, temp_dir)
    }

    #[tokio::test]
    async fn test_write_conflict_then_overwrite() {
        let (storage, _temp) = setup();

        let result = storage.write_file("a.txt", b"hi", false).await.unwrap();
        assert!(result.success);
        assert_eq!(result.size, Some(2));

        let err = storage.write_file("a.txt", b"hi", false).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));

        let result = storage.write_file("a.txt", b"hi", true).await.unwrap();
        assert!(result.success);
        assert_eq!(storage.read_file("a.txt").await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_write_creates_parents() {
        let (storage, temp) = setup();
        storage.write_file("x/y/z.txt", b"deep", false).await.unwrap();
        assert!(temp.path().join("x/y/z.txt").is_file());
    }

    #[tokio::test]
    async fn test_write_without_create_dirs_fails_typed() {
        let temp = TempDir::new().unwrap();
        let config = ProviderConfig::new()
            .with("base_path", temp.path().to_string_lossy().to_string())
            .with("create_dirs", false);
        let storage = LocalStorage::new(config).unwrap();

        let err = storage.write_file("missing/a.txt", b"x", false).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_path_escapes_are_denied_without_io() {
        let (storage, temp) = setup();
        let outside = temp.path().parent().unwrap().join("escaped.txt");

        for bad in ["../escaped.txt", "a/../../escaped.txt", "/etc/passwd"] {
            assert!(matches!(
                storage.write_file(bad, b"x", true).await,
                Err(StorageError::PermissionDenied(_))
            ));
            assert!(matches!(storage.read_file(bad).await, Err(StorageError::PermissionDenied(_))));
            assert!(matches!(storage.delete_file(bad).await, Err(StorageError::PermissionDenied(_))));
            assert!(matches!(storage.mkdir(bad, true).await, Err(StorageError::PermissionDenied(_))));
            assert!(matches!(storage.rmdir(bad, true).await, Err(StorageError::PermissionDenied(_))));
            assert!(matches!(
                storage.list_files(bad, None, false).await,
                Err(StorageError::PermissionDenied(_))
            ));
            assert!(matches!(
                storage.get_metadata(bad).await,
                Err(StorageError::PermissionDenied(_))
            ));
            assert!(matches!(
                storage.copy_file("a", bad, true).await,
                Err(StorageError::PermissionDenied(_))
            ));
            assert!(matches!(
                storage.move_file(bad, "a", true).await,
                Err(StorageError::PermissionDenied(_))
            ));
            assert!(!storage.file_exists(bad).await);
        }
        assert!(!outside.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_base_is_denied() {
        let (storage, temp) = setup();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"TOP-SECRET").unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("new.txt"),
            temp.path().join("dangling.txt"),
        )
        .unwrap();

        assert!(matches!(
            storage.read_file("link/secret.txt").await,
            Err(StorageError::PermissionDenied(_))
        ));
        assert!(matches!(
            storage.write_file("link/planted.txt", b"x", true).await,
            Err(StorageError::PermissionDenied(_))
        ));
        assert!(matches!(
            storage.write_file("dangling.txt", b"x", true).await,
            Err(StorageError::PermissionDenied(_))
        ));
        assert!(matches!(
            storage.list_files("link", None, false).await,
            Err(StorageError::PermissionDenied(_))
        ));
        assert!(!outside.path().join("planted.txt").exists());
        assert!(!outside.path().join("new.txt").exists());

        // The link is left out of listings of the base.
        storage.write_file("kept.txt", b"x", false).await.unwrap();
        let listed = storage.list_files("", None, true).await.unwrap();
        let paths: Vec<&str> = listed.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["kept.txt"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_inside_base_is_followed() {
        let (storage, temp) = setup();
        storage.write_file("real/a.txt", b"inside", false).await.unwrap();
        std::os::unix::fs::symlink(temp.path().join("real"), temp.path().join("alias")).unwrap();

        assert_eq!(storage.read_file("alias/a.txt").await.unwrap(), b"inside");
    }

    #[tokio::test]
    async fn test_absolute_path_inside_base_is_allowed() {
        let (storage, _temp) = setup();
        let inside = storage.base_path().join("abs.txt");
        storage
            .write_file(&inside.to_string_lossy(), b"ok", false)
            .await
            .unwrap();
        assert!(storage.file_exists("abs.txt").await);
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let (storage, _temp) = setup();
        assert!(matches!(
            storage.read_file("nope.txt").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.get_metadata("nope.txt").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_files_pattern_and_recursion() {
        let (storage, _temp) = setup();
        storage.write_file("q1.xlsx", b"1", false).await.unwrap();
        storage.write_file("notes.txt", b"2", false).await.unwrap();
        storage.write_file("archive/q0.xlsx", b"3", false).await.unwrap();
        storage.mkdir("empty", false).await.unwrap();

        let flat = storage.list_files("", Some("*.xlsx"), false).await.unwrap();
        let names: Vec<&str> = flat.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(names, vec!["archive", "empty", "q1.xlsx"]);

        let deep = storage.list_files("", Some("*.xlsx"), true).await.unwrap();
        let names: Vec<&str> = deep.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(names, vec!["archive", "archive/q0.xlsx", "empty", "q1.xlsx"]);

        assert!(storage.list_files("empty", None, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_errors() {
        let (storage, _temp) = setup();
        storage.write_file("file.txt", b"x", false).await.unwrap();
        assert!(matches!(
            storage.list_files("missing", None, false).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.list_files("file.txt", None, false).await,
            Err(StorageError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_metadata_extras() {
        let (storage, _temp) = setup();
        storage.write_file("doc.pdf", b"%PDF", false).await.unwrap();
        let info = storage.get_metadata("doc.pdf").await.unwrap();

        assert_eq!(info.name, "doc.pdf");
        assert_eq!(info.size, 4);
        assert!(!info.is_directory);
        assert_eq!(info.mime_type.as_deref(), Some("application/pdf"));
        let extra = info.metadata.unwrap();
        assert!(extra.contains_key("absolute_path"));
        #[cfg(unix)]
        assert!(extra.contains_key("permissions"));
    }

    #[tokio::test]
    async fn test_move_and_copy() {
        let (storage, _temp) = setup();
        storage.write_file("a.txt", b"A", false).await.unwrap();
        storage.write_file("b.txt", b"B", false).await.unwrap();

        assert!(matches!(
            storage.move_file("a.txt", "b.txt", false).await,
            Err(StorageError::AlreadyExists(_))
        ));
        storage.move_file("a.txt", "b.txt", true).await.unwrap();
        assert!(!storage.file_exists("a.txt").await);
        assert_eq!(storage.read_file("b.txt").await.unwrap(), b"A");

        storage.copy_file("b.txt", "sub/c.txt", false).await.unwrap();
        assert_eq!(storage.read_file("sub/c.txt").await.unwrap(), b"A");
        assert!(storage.file_exists("b.txt").await);

        assert!(matches!(
            storage.copy_file("missing.txt", "d.txt", false).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mkdir_and_rmdir() {
        let (storage, _temp) = setup();

        assert!(matches!(
            storage.mkdir("a/b", false).await,
            Err(StorageError::NotFound(_))
        ));
        storage.mkdir("a/b", true).await.unwrap();
        storage.mkdir("a/b", true).await.unwrap();
        assert!(matches!(
            storage.mkdir("a/b", false).await,
            Err(StorageError::AlreadyExists(_))
        ));

        storage.write_file("a/b/f.txt", b"x", false).await.unwrap();
        assert!(matches!(
            storage.rmdir("a", false).await,
            Err(StorageError::DirectoryNotEmpty(_))
        ));
        assert!(matches!(
            storage.rmdir("a/b/f.txt", false).await,
            Err(StorageError::NotADirectory(_))
        ));
        assert!(matches!(
            storage.delete_file("a").await,
            Err(StorageError::IsADirectory(_))
        ));
        storage.rmdir("a", true).await.unwrap();
        assert!(!storage.file_exists("a").await);

        assert!(matches!(
            storage.rmdir("", true).await,
            Err(StorageError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_health_check_healthy() {
        let (storage, temp) = setup();
        let health = storage.health_check().await;
        assert!(health.healthy, "{}", health.message);
        assert_eq!(health.provider, "LocalStorage");
        assert_eq!(health.details["base_path_writable"], true);
        assert_eq!(health.details["can_create_dirs"], true);
        assert!(!temp.path().join(HEALTH_PROBE_DIR).exists());
        assert!(health.latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_health_check_missing_base_does_not_fail() {
        let temp = TempDir::new().unwrap();
        let config = ProviderConfig::new()
            .with("base_path", temp.path().join("gone").to_string_lossy().to_string());
        let storage = LocalStorage::new(config).unwrap();

        let health = storage.health_check().await;
        assert!(!health.healthy);
        assert!(health.message.contains("base path doesn't exist"));
        assert_eq!(health.details["base_path_exists"], false);
    }
}
