use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map};
use tenant_storage_core::{
    glob_match, BasePath, FileInfo, FileStorageProvider, HealthCheckResult, OperationResult,
    ProviderConfig, StorageError,
};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::client::{is_missing, SmbClient};
use super::error::SmbResult;
use super::protocol::{CreateDisposition, DirectoryEntry};
use crate::config::SmbConfig;

/// Storage backend speaking SMB2 to a remote share.
///
/// Wire calls are blocking and run on the blocking thread pool. Each call
/// checks out its own session from a pool of at most `max_sessions`, so
/// operations on different paths proceed concurrently. Every operation
/// other than `connect` fails with `NotConnected` until `connect` has
/// opened the first session.
pub struct SmbAdapter {
    config: Arc<SmbConfig>,
    base: BasePath,
    base_segments: Vec<String>,
    pool: Arc<SessionPool>,
}

/// Idle authenticated sessions plus the permits bounding live ones.
struct SessionPool {
    idle: Mutex<Vec<SmbClient>>,
    connected: AtomicBool,
    permits: Arc<Semaphore>,
}

impl SessionPool {
    fn new(max_sessions: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            permits: Arc::new(Semaphore::new(max_sessions.max(1))),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<SmbClient>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checkout(&self) -> Option<SmbClient> {
        self.idle().pop()
    }

    /// Return a session after use. Sessions coming back after a disconnect
    /// are logged off instead.
    fn checkin(&self, client: SmbClient) {
        {
            let mut idle = self.idle();
            if self.is_connected() {
                idle.push(client);
                return;
            }
        }
        if let Err(e) = client.logoff() {
            debug!("Logoff of a returned SMB session failed: {}", e);
        }
    }

    fn open(&self, client: SmbClient) {
        let mut idle = self.idle();
        idle.push(client);
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Mark the pool disconnected and hand back its idle sessions.
    fn close(&self) -> Vec<SmbClient> {
        let mut idle = self.idle();
        self.connected.store(false, Ordering::SeqCst);
        std::mem::take(&mut *idle)
    }
}

fn not_connected() -> StorageError {
    StorageError::NotConnected("Not connected to SMB server. Call connect() first.".to_string())
}

fn open_session(config: &SmbConfig) -> Result<SmbClient, StorageError> {
    SmbClient::connect(config).map_err(|e| {
        StorageError::connection(
            format!(
                "Failed to connect to SMB share \\\\{}\\{} on port {}",
                config.host, config.share, config.port
            ),
            e,
        )
    })
}

impl SmbAdapter {
    pub fn new(config: &ProviderConfig) -> Result<Self, StorageError> {
        Ok(Self::from_config(SmbConfig::from_provider_config(config)?))
    }

    pub fn from_config(config: SmbConfig) -> Self {
        info!(
            "SmbAdapter configured for \\\\{}\\{} (base_path={}, max_sessions={})",
            config.host, config.share, config.base_path, config.max_sessions
        );
        Self {
            base: BasePath::share(&config.base_path),
            base_segments: config.base_segments(),
            pool: Arc::new(SessionPool::new(config.max_sessions)),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SmbConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.pool.is_connected()
    }

    /// Relative path and the share-relative wire path of `path`.
    fn resolve(&self, path: &str) -> Result<(String, String), StorageError> {
        let relative = self.base.relative(path)?;
        let wire = self.wire_path(&relative);
        Ok((relative, wire))
    }

    fn wire_path(&self, relative: &str) -> String {
        self.base_segments
            .iter()
            .map(String::as_str)
            .chain(relative.split('/').filter(|s| !s.is_empty()))
            .collect::<Vec<_>>()
            .join("\\")
    }

    /// Run `op` on a pooled session on the blocking pool.
    ///
    /// An idle session is reused when there is one; otherwise a new one is
    /// opened while the pool is below `max_sessions`, and the call waits
    /// for a free slot beyond that. A connection-class failure disconnects
    /// the whole pool; later calls fail with `NotConnected` until `connect`
    /// is called again.
    async fn with_client<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SmbClient) -> Result<T, StorageError> + Send + 'static,
    {
        if !self.pool.is_connected() {
            return Err(not_connected());
        }
        let permit = Arc::clone(&self.pool.permits)
            .acquire_owned()
            .await
            .map_err(|_| not_connected())?;
        let pool = Arc::clone(&self.pool);
        let config = Arc::clone(&self.config);

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            if !pool.is_connected() {
                return Err(not_connected());
            }
            let mut client = match pool.checkout() {
                Some(client) => client,
                None => {
                    debug!("Opening another SMB session to {}", config.host);
                    open_session(&config)?
                }
            };
            let result = op(&mut client);
            match &result {
                Err(e @ (StorageError::Connection { .. } | StorageError::NotConnected(_))) => {
                    warn!("Dropping SMB sessions after failure: {}", e);
                    drop(client);
                    pool.close();
                }
                _ => pool.checkin(client),
            }
            result
        })
        .await
        .map_err(|e| StorageError::Protocol(format!("SMB task failed: {}", e)))?
    }

    async fn probe<F>(&self, op: F) -> Result<bool, StorageError>
    where
        F: FnOnce(&mut SmbClient) -> SmbResult<bool> + Send + 'static,
    {
        self.with_client(move |client| op(client).map_err(|e| e.into_storage("")))
            .await
    }
}

fn file_info(relative: &str, entry: &DirectoryEntry) -> FileInfo {
    let is_directory = entry.is_directory();
    let mut extra = Map::new();
    extra.insert("is_readonly".into(), json!(entry.is_readonly()));
    extra.insert("is_hidden".into(), json!(entry.is_hidden()));
    extra.insert("is_archive".into(), json!(entry.is_archive()));
    FileInfo {
        path: relative.to_string(),
        name: FileInfo::name_of(relative),
        size: if is_directory { 0 } else { entry.end_of_file },
        is_directory,
        modified: entry.modified(),
        created: Some(entry.created()),
        mime_type: None,
        metadata: Some(extra),
    }
}

fn join_relative(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn join_wire(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}\\{}", dir, name)
    }
}

fn parent_wire(wire: &str) -> Option<&str> {
    wire.rsplit_once('\\').map(|(parent, _)| parent)
}

/// Depth-first listing: each directory entry is followed by its contents.
fn walk(
    client: &mut SmbClient,
    dir_rel: &str,
    dir_wire: &str,
    pattern: Option<&str>,
    recursive: bool,
    files: &mut Vec<FileInfo>,
) -> SmbResult<()> {
    for entry in client.list_directory(dir_wire)? {
        let entry_rel = join_relative(dir_rel, &entry.name);
        if entry.is_directory() {
            files.push(file_info(&entry_rel, &entry));
            if recursive {
                let entry_wire = join_wire(dir_wire, &entry.name);
                walk(client, &entry_rel, &entry_wire, pattern, recursive, files)?;
            }
        } else if pattern.map_or(true, |p| glob_match(p, &entry.name)) {
            files.push(file_info(&entry_rel, &entry));
        }
    }
    Ok(())
}

fn ensure_parent(client: &mut SmbClient, wire: &str, path: &str) -> Result<(), StorageError> {
    match parent_wire(wire) {
        Some(parent) => client
            .create_directory_all(parent)
            .map_err(|e| e.into_storage(path)),
        None => Ok(()),
    }
}

/// Existing entry at `wire`, or `None` when absent.
fn lookup(client: &mut SmbClient, wire: &str, path: &str) -> Result<Option<DirectoryEntry>, StorageError> {
    match client.stat(wire) {
        Ok(entry) => Ok(Some(entry)),
        Err(e) if is_missing(&e) => Ok(None),
        Err(e) => Err(e.into_storage(path)),
    }
}

fn written(message: String, relative: &str, size: u64, entry: Option<DirectoryEntry>) -> OperationResult {
    let mut result = OperationResult::ok(message).with_path(relative).with_size(size);
    if let Some(entry) = entry {
        result = result.with_modified(entry.modified());
    }
    result
}

#[async_trait]
impl FileStorageProvider for SmbAdapter {
    fn provider_name(&self) -> &'static str {
        "SmbAdapter"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    #[instrument(skip(self), level = "debug")]
    async fn connect(&self) -> Result<(), StorageError> {
        if self.is_connected() {
            return Ok(());
        }
        let config = Arc::clone(&self.config);
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let client = open_session(&config)?;
            pool.open(client);
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Protocol(format!("SMB connect task failed: {}", e)))?
    }

    #[instrument(skip(self), level = "debug")]
    async fn disconnect(&self) -> Result<(), StorageError> {
        let sessions = self.pool.close();
        if sessions.is_empty() {
            return Ok(());
        }
        let host = self.config.host.clone();
        let count = sessions.len();
        let closed = tokio::task::spawn_blocking(move || {
            sessions
                .into_iter()
                .filter_map(|client| client.logoff().err())
                .collect::<Vec<_>>()
        })
        .await;
        match closed {
            Ok(errors) if errors.is_empty() => {
                info!("Disconnected {} SMB session(s) from {}", count, host)
            }
            Ok(errors) => {
                for e in errors {
                    warn!("SMB logoff from {} failed: {}", host, e);
                }
            }
            Err(e) => warn!("SMB logoff task failed: {}", e),
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_files(
        &self,
        path: &str,
        pattern: Option<&str>,
        recursive: bool,
    ) -> Result<Vec<FileInfo>, StorageError> {
        let (relative, wire) = self.resolve(path)?;
        let requested = path.to_string();
        let pattern = pattern.map(str::to_string);

        let files = self
            .with_client(move |client| {
                let mut files = Vec::new();
                walk(client, &relative, &wire, pattern.as_deref(), recursive, &mut files).map_err(
                    |e| match e.into_storage(&requested) {
                        StorageError::NotFound(_) => StorageError::NotFound(format!(
                            "Directory not found: {}",
                            requested
                        )),
                        other => other,
                    },
                )?;
                Ok(files)
            })
            .await?;

        debug!("Listed {} files in {}", files.len(), path);
        Ok(files)
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let (_, wire) = self.resolve(path)?;
        let requested = path.to_string();
        let data = self
            .with_client(move |client| client.read_file(&wire).map_err(|e| e.into_storage(&requested)))
            .await?;
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
        let (relative, wire) = self.resolve(path)?;
        if relative.is_empty() {
            return Err(StorageError::IsADirectory(path.to_string()));
        }
        let requested = path.to_string();
        let data = data.to_vec();
        let size = data.len() as u64;
        let create_dirs = self.config.create_dirs;

        let outcome = self
            .with_client(move |client| {
                if let Some(existing) = lookup(client, &wire, &requested)? {
                    if existing.is_directory() {
                        return Err(StorageError::IsADirectory(requested));
                    }
                    if !overwrite {
                        return Err(StorageError::AlreadyExists(requested));
                    }
                }
                if create_dirs {
                    ensure_parent(client, &wire, &requested)?;
                }
                let disposition = if overwrite {
                    CreateDisposition::OverwriteIf
                } else {
                    CreateDisposition::Create
                };
                client
                    .write_file(&wire, &data, disposition)
                    .map_err(|e| e.into_storage(&requested))?;
                Ok(client.stat(&wire).ok())
            })
            .await;

        let entry = match outcome {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Write to {} failed: {}", path, e);
                return OperationResult::from_error(e);
            }
        };
        debug!("Wrote {} bytes to {}", size, path);
        Ok(written(
            format!("File written successfully: {}", path),
            &relative,
            size,
            entry,
        ))
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_file(&self, path: &str) -> Result<OperationResult, StorageError> {
        let (relative, wire) = self.resolve(path)?;
        if relative.is_empty() {
            return Err(StorageError::IsADirectory(path.to_string()));
        }
        let requested = path.to_string();

        let outcome = self
            .with_client(move |client| {
                client
                    .delete(&wire, false)
                    .map_err(|e| e.into_storage(&requested))
            })
            .await;
        if let Err(e) = outcome {
            return OperationResult::from_error(e);
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
        let (src_rel, src_wire) = self.resolve(source)?;
        let (dst_rel, dst_wire) = self.resolve(destination)?;
        if src_rel.is_empty() {
            return Err(StorageError::PermissionDenied(
                "Refusing to move the base directory".to_string(),
            ));
        }
        if dst_rel.is_empty() {
            return Err(StorageError::IsADirectory(destination.to_string()));
        }
        let (source_name, destination_name) = (source.to_string(), destination.to_string());
        let create_dirs = self.config.create_dirs;

        let outcome = self
            .with_client(move |client| {
                if lookup(client, &src_wire, &source_name)?.is_none() {
                    return Err(StorageError::NotFound(source_name));
                }
                if let Some(existing) = lookup(client, &dst_wire, &destination_name)? {
                    if existing.is_directory() {
                        return Err(StorageError::IsADirectory(destination_name));
                    }
                    if !overwrite {
                        return Err(StorageError::AlreadyExists(destination_name));
                    }
                    // Not atomic: a failure before the rename leaves the source
                    // in place and the destination gone.
                    client
                        .delete(&dst_wire, false)
                        .map_err(|e| e.into_storage(&destination_name))?;
                }
                if create_dirs {
                    ensure_parent(client, &dst_wire, &destination_name)?;
                }
                client
                    .rename(&src_wire, &dst_wire, false)
                    .map_err(|e| e.into_storage(&source_name))?;
                Ok(client.stat(&dst_wire).ok())
            })
            .await;

        let entry = match outcome {
            Ok(entry) => entry,
            Err(e) => return OperationResult::from_error(e),
        };
        debug!("Moved {} to {}", source, destination);
        let size = entry.as_ref().map_or(0, |e| e.end_of_file);
        Ok(written(
            format!("Moved {} to {}", source, destination),
            &dst_rel,
            size,
            entry,
        ))
    }

    #[instrument(skip(self), level = "debug")]
    async fn copy_file(
        &self,
        source: &str,
        destination: &str,
        overwrite: bool,
    ) -> Result<OperationResult, StorageError> {
        self.resolve(destination)?;
        let data = self.read_file(source).await?;
        let mut result = self.write_file(destination, &data, overwrite).await?;
        if result.success {
            debug!("Copied {} to {}", source, destination);
            result.message = format!("Copied {} to {}", source, destination);
        }
        Ok(result)
    }

    #[instrument(skip(self), level = "debug")]
    async fn mkdir(&self, path: &str, parents: bool) -> Result<OperationResult, StorageError> {
        let (relative, wire) = self.resolve(path)?;
        let requested = path.to_string();
        let is_base = relative.is_empty();

        let outcome = self
            .with_client(move |client| {
                let existing = if is_base {
                    None
                } else {
                    lookup(client, &wire, &requested)?
                };
                if is_base || existing.is_some() {
                    let is_dir = is_base || existing.as_ref().is_some_and(DirectoryEntry::is_directory);
                    if is_dir && parents {
                        return Ok(false);
                    }
                    return Err(StorageError::AlreadyExists(requested));
                }
                let created = if parents {
                    client.create_directory_all(&wire)
                } else {
                    client.create_directory(&wire)
                };
                created.map_err(|e| e.into_storage(&requested))?;
                Ok(true)
            })
            .await;

        match outcome {
            Ok(true) => {
                debug!("Created directory {}", path);
                Ok(OperationResult::ok(format!("Directory created: {}", path)).with_path(relative))
            }
            Ok(false) => Ok(
                OperationResult::ok(format!("Directory already exists: {}", path))
                    .with_path(relative),
            ),
            Err(e) => OperationResult::from_error(e),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn rmdir(&self, path: &str, recursive: bool) -> Result<OperationResult, StorageError> {
        let (relative, wire) = self.resolve(path)?;
        if relative.is_empty() {
            return Err(StorageError::PermissionDenied(
                "Refusing to remove the base directory".to_string(),
            ));
        }
        let requested = path.to_string();

        let outcome = self
            .with_client(move |client| {
                match lookup(client, &wire, &requested)? {
                    None => return Err(StorageError::NotFound(requested)),
                    Some(entry) if !entry.is_directory() => {
                        return Err(StorageError::NotADirectory(requested))
                    }
                    Some(_) => {}
                }
                let removed = if recursive {
                    client.delete_tree(&wire)
                } else {
                    client.delete(&wire, true)
                };
                removed.map_err(|e| e.into_storage(&requested))
            })
            .await;
        if let Err(e) = outcome {
            return OperationResult::from_error(e);
        }

        debug!("Removed directory {} (recursive={})", path, recursive);
        Ok(OperationResult::ok(format!("Directory removed: {}", path)).with_path(relative))
    }

    async fn file_exists(&self, path: &str) -> bool {
        let Ok((_, wire)) = self.resolve(path) else {
            return false;
        };
        self.probe(move |client| client.exists(&wire))
            .await
            .unwrap_or(false)
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_metadata(&self, path: &str) -> Result<FileInfo, StorageError> {
        let (relative, wire) = self.resolve(path)?;
        let requested = path.to_string();
        let entry = self
            .with_client(move |client| {
                lookup(client, &wire, &requested)?
                    .ok_or_else(|| StorageError::NotFound(format!("File not found: {}", requested)))
            })
            .await?;
        Ok(file_info(&relative, &entry))
    }

    async fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let mut errors = Vec::new();

        let connection = match self.connect().await {
            Ok(()) => true,
            Err(e) => {
                errors.push(e.to_string());
                false
            }
        };

        let share_access = if connection {
            match self.probe(|client| client.list_directory("").map(|_| true)).await {
                Ok(ok) => ok,
                Err(e) => {
                    errors.push(format!("Share listing failed: {}", e));
                    false
                }
            }
        } else {
            false
        };

        let base_path_access = if !share_access {
            false
        } else if self.base_segments.is_empty() {
            true
        } else {
            let base_wire = self.wire_path("");
            match self
                .probe(move |client| client.stat(&base_wire).map(|e| e.is_directory()))
                .await
            {
                Ok(true) => true,
                Ok(false) => {
                    errors.push(format!("Base path is not a directory: {}", self.config.base_path));
                    false
                }
                Err(e) => {
                    errors.push(format!("Base path not accessible: {}", e));
                    false
                }
            }
        };

        let healthy = connection && share_access && base_path_access;
        let message = if healthy {
            format!("SMB share \\\\{}\\{} accessible", self.config.host, self.config.share)
        } else {
            format!("SMB health check failed: {}", errors.join("; "))
        };

        let mut result = if healthy {
            HealthCheckResult::healthy(self.provider_name(), message)
        } else {
            HealthCheckResult::unhealthy(self.provider_name(), message)
        }
        .with_detail("host", self.config.host.clone())
        .with_detail("share", self.config.share.clone())
        .with_detail("port", self.config.port)
        .with_detail("base_path", self.config.base_path.clone())
        .with_detail("connection", connection)
        .with_detail("share_access", share_access)
        .with_detail("base_path_access", base_path_access);
        if !errors.is_empty() {
            result = result.with_detail("error", errors.join("; "));
        }
        result.latency_ms = Some(started.elapsed().as_secs_f64() * 1000.0);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smb::mock_server::{MockServer, USERNAME};
    use std::net::TcpListener;

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn adapter(base_path: &str) -> SmbAdapter {
        let config = ProviderConfig::new()
            .with("host", "127.0.0.1")
            .with("port", closed_port())
            .with("share", "documents")
            .with("username", "user")
            .with("password", "secret")
            .with("base_path", base_path)
            .with("timeout_seconds", 1.0);
        SmbAdapter::new(&config).unwrap()
    }

    #[test]
    fn test_wire_paths_under_base() {
        let smb = adapter("/tenants/acme/");
        let (relative, wire) = smb.resolve("/quotes/2024/q.xlsx").unwrap();
        assert_eq!(relative, "quotes/2024/q.xlsx");
        assert_eq!(wire, "tenants\\acme\\quotes\\2024\\q.xlsx");
        assert_eq!(smb.resolve("").unwrap().1, "tenants\\acme");
        assert_eq!(smb.resolve("a\\b.txt").unwrap().1, "tenants\\acme\\a\\b.txt");

        let root = adapter("/");
        assert_eq!(root.resolve("").unwrap().1, "");
        assert_eq!(root.resolve("x.txt").unwrap().1, "x.txt");
        assert_eq!(parent_wire("a\\b\\c"), Some("a\\b"));
        assert_eq!(parent_wire("c"), None);
    }

    #[tokio::test]
    async fn test_escape_rejected_before_connection_check() {
        let smb = adapter("/tenants/acme");
        let err = smb.read_file("../other/q.xlsx").await.unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));
        let err = smb.write_file("../../x", b"x", true).await.unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let smb = adapter("/");
        assert!(!smb.is_connected());
        let err = smb.read_file("a.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::NotConnected(_)));
        let err = smb.list_files("", None, false).await.unwrap_err();
        assert!(matches!(err, StorageError::NotConnected(_)));
        let err = smb.write_file("a.txt", b"hi", false).await.unwrap_err();
        assert!(matches!(err, StorageError::NotConnected(_)));
        assert!(!smb.file_exists("a.txt").await);
        smb.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_base_directory_protected() {
        let smb = adapter("/tenants/acme");
        let err = smb.rmdir("/", true).await.unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));
        let err = smb.write_file("", b"x", true).await.unwrap_err();
        assert!(matches!(err, StorageError::IsADirectory(_)));
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        let smb = adapter("/");
        let err = smb.connect().await.unwrap_err();
        assert!(matches!(err, StorageError::Connection { .. }), "{err}");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_health_check_unreachable_server() {
        let smb = adapter("/tenants/acme");
        let health = smb.health_check().await;
        assert!(!health.healthy);
        assert_eq!(health.provider, "SmbAdapter");
        assert_eq!(health.details["connection"], false);
        assert_eq!(health.details["share_access"], false);
        assert_eq!(health.details["base_path_access"], false);
        assert_eq!(health.details["share"], "documents");
        assert!(health.details.contains_key("error"));
        assert!(health.latency_ms.is_some());
    }

    #[test]
    fn test_file_info_from_entry() {
        let entry = DirectoryEntry {
            name: "q.xlsx".to_string(),
            creation_time: 116_444_736_000_000_000,
            last_write_time: 116_444_736_000_000_000 + 10_000_000,
            end_of_file: 42,
            file_attributes: 0x21,
        };
        let info = file_info("quotes/q.xlsx", &entry);
        assert_eq!(info.name, "q.xlsx");
        assert_eq!(info.size, 42);
        assert!(!info.is_directory);
        assert_eq!(info.modified.timestamp(), 1);
        let extra = info.metadata.unwrap();
        assert_eq!(extra["is_readonly"], true);
        assert_eq!(extra["is_archive"], true);
        assert_eq!(extra["is_hidden"], false);
    }

    fn loopback(server: &MockServer) -> ProviderConfig {
        server.mkdir("tenants\\acme");
        ProviderConfig::new()
            .with("host", "127.0.0.1")
            .with("port", server.port())
            .with("share", "documents")
            .with("username", USERNAME)
            .with("password", "secret")
            .with("base_path", "/tenants/acme")
            .with("timeout_seconds", 2.0)
    }

    #[tokio::test]
    async fn test_round_trip_against_loopback_server() {
        let server = MockServer::start();
        let smb = SmbAdapter::new(&loopback(&server)).unwrap();
        smb.connect().await.unwrap();
        assert!(smb.is_connected());

        let written = smb.write_file("quotes/2024/q.txt", b"quote", false).await.unwrap();
        assert!(written.success, "{}", written.message);
        assert_eq!(
            server.file("tenants\\acme\\quotes\\2024\\q.txt").unwrap(),
            b"quote"
        );
        assert_eq!(smb.read_file("/quotes/2024/q.txt").await.unwrap(), b"quote");

        let again = smb.write_file("quotes/2024/q.txt", b"x", false).await.unwrap_err();
        assert!(matches!(again, StorageError::AlreadyExists(_)));
        let replaced = smb.write_file("quotes/2024/q.txt", b"quote v2", true).await.unwrap();
        assert_eq!(replaced.size, Some(8));

        let files = smb.list_files("", None, true).await.unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["quotes", "quotes/2024", "quotes/2024/q.txt"]);
        assert_eq!(files[2].size, 8);
        let filtered = smb.list_files("quotes", Some("*.csv"), true).await.unwrap();
        assert!(filtered.iter().all(|f| f.is_directory));

        let copied = smb.copy_file("quotes/2024/q.txt", "archive/q.txt", false).await.unwrap();
        assert!(copied.success, "{}", copied.message);
        assert_eq!(smb.get_metadata("archive/q.txt").await.unwrap().size, 8);
        assert!(smb.file_exists("archive/q.txt").await);

        smb.delete_file("archive/q.txt").await.unwrap();
        assert!(!smb.file_exists("archive/q.txt").await);
        smb.rmdir("archive", false).await.unwrap();
        assert_eq!(server.node("tenants\\acme\\archive"), None);

        let health = smb.health_check().await;
        assert!(health.healthy, "{}", health.message);
        assert_eq!(health.details["base_path_access"], true);

        smb.disconnect().await.unwrap();
        assert!(!smb.is_connected());
        let err = smb.read_file("quotes/2024/q.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_move_replaces_files_but_not_directories() {
        let server = MockServer::start();
        let smb = SmbAdapter::new(&loopback(&server)).unwrap();
        server.put("tenants\\acme\\a.txt", b"new");
        server.put("tenants\\acme\\b.txt", b"old");
        server.put("tenants\\acme\\archive\\keep.txt", b"keep");
        smb.connect().await.unwrap();

        let err = smb.move_file("a.txt", "archive", true).await.unwrap_err();
        assert!(matches!(err, StorageError::IsADirectory(_)), "{err}");
        assert_eq!(server.file("tenants\\acme\\archive\\keep.txt").unwrap(), b"keep");
        assert_eq!(server.file("tenants\\acme\\a.txt").unwrap(), b"new");

        let err = smb.move_file("a.txt", "b.txt", false).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));

        let moved = smb.move_file("a.txt", "b.txt", true).await.unwrap();
        assert!(moved.success, "{}", moved.message);
        assert_eq!(moved.size, Some(3));
        assert_eq!(server.file("tenants\\acme\\b.txt").unwrap(), b"new");
        assert_eq!(server.node("tenants\\acme\\a.txt"), None);

        let moved = smb.move_file("b.txt", "2025/q1/b.txt", false).await.unwrap();
        assert_eq!(moved.path.as_deref(), Some("2025/q1/b.txt"));
        assert_eq!(server.file("tenants\\acme\\2025\\q1\\b.txt").unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_missing_parent_without_create_dirs() {
        let server = MockServer::start();
        let smb = SmbAdapter::new(&loopback(&server).with("create_dirs", false)).unwrap();
        server.put("tenants\\acme\\a.txt", b"a");
        smb.connect().await.unwrap();

        let err = smb.write_file("new/a.txt", b"x", false).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)), "{err}");
        let err = smb.move_file("a.txt", "new/a.txt", false).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)), "{err}");
        assert_eq!(server.node("tenants\\acme\\new"), None);

        smb.mkdir("new", false).await.unwrap();
        assert!(smb.write_file("new/a.txt", b"x", false).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_concurrent_reads_use_separate_sessions() {
        let server = MockServer::gated(2);
        let smb = SmbAdapter::new(&loopback(&server)).unwrap();
        server.put("tenants\\acme\\one.gate", b"one");
        server.put("tenants\\acme\\two.gate", b"two");
        smb.connect().await.unwrap();

        // Each read is held until the other one reaches the server.
        let (one, two) = tokio::join!(smb.read_file("one.gate"), smb.read_file("two.gate"));
        assert_eq!(one.unwrap(), b"one");
        assert_eq!(two.unwrap(), b"two");
        assert_eq!(server.sessions(), 2);

        smb.list_files("", None, false).await.unwrap();
        assert_eq!(server.sessions(), 2);
        smb.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_limit_is_respected() {
        let server = MockServer::start();
        let smb = SmbAdapter::new(&loopback(&server).with("max_sessions", 1)).unwrap();
        server.put("tenants\\acme\\a.txt", b"a");
        smb.connect().await.unwrap();

        let (a, b, c) = tokio::join!(
            smb.read_file("a.txt"),
            smb.read_file("a.txt"),
            smb.get_metadata("a.txt")
        );
        assert_eq!(a.unwrap(), b"a");
        assert_eq!(b.unwrap(), b"a");
        assert_eq!(c.unwrap().size, 1);
        assert_eq!(server.sessions(), 1);
    }
}
