//! Polling change detection for storage providers.
//!
//! Most network protocols have no change notification, so a [`Watcher`]
//! lists a directory at a fixed interval and diffs consecutive snapshots
//! on `modified` and `size`.

pub mod snapshot;
pub mod watcher;

pub use snapshot::{diff, snapshot_of, take_snapshot, ChangeKind, FileChangeEvent, Snapshot, SnapshotEntry};
pub use watcher::{
    SubscriberResult, SubscriptionId, WatchOptions, Watcher, WatcherState, DEFAULT_POLL_INTERVAL,
};
