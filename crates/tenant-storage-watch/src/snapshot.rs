use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tenant_storage_core::{FileInfo, FileStorageProvider, StorageError};

/// Change-detection fields of one listed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub modified: DateTime<Utc>,
    pub size: u64,
}

impl From<&FileInfo> for SnapshotEntry {
    fn from(info: &FileInfo) -> Self {
        Self {
            modified: info.modified,
            size: info.size,
        }
    }
}

/// Path to entry map of one listing.
pub type Snapshot = BTreeMap<String, SnapshotEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// A change detected between two polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangeEvent {
    pub kind: ChangeKind,
    pub path: String,
    /// Entry as of this poll; `None` for deletions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<SnapshotEntry>,
    /// Entry as of the previous poll; `None` for creations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<SnapshotEntry>,
}

pub fn snapshot_of(files: &[FileInfo]) -> Snapshot {
    files
        .iter()
        .map(|info| (info.path.clone(), SnapshotEntry::from(info)))
        .collect()
}

/// List `path` through the provider and snapshot the result.
pub async fn take_snapshot(
    provider: &dyn FileStorageProvider,
    path: &str,
    pattern: Option<&str>,
    recursive: bool,
) -> Result<Snapshot, StorageError> {
    let files = provider.list_files(path, pattern, recursive).await?;
    Ok(snapshot_of(&files))
}

/// Events turning `previous` into `current`: creations and modifications in
/// path order, then deletions in path order.
pub fn diff(previous: &Snapshot, current: &Snapshot) -> Vec<FileChangeEvent> {
    let mut events = Vec::new();

    for (path, entry) in current {
        match previous.get(path) {
            None => events.push(FileChangeEvent {
                kind: ChangeKind::Created,
                path: path.clone(),
                current: Some(*entry),
                previous: None,
            }),
            Some(before) if before != entry => events.push(FileChangeEvent {
                kind: ChangeKind::Modified,
                path: path.clone(),
                current: Some(*entry),
                previous: Some(*before),
            }),
            Some(_) => {}
        }
    }

    for (path, before) in previous {
        if !current.contains_key(path) {
            events.push(FileChangeEvent {
                kind: ChangeKind::Deleted,
                path: path.clone(),
                current: None,
                previous: Some(*before),
            });
        }
    }

    events
}
