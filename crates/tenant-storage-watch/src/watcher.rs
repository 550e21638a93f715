use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tenant_storage_core::{BoxError, FileStorageProvider, StorageError};
use tokio::sync::watch as tokio_watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::snapshot::{diff, take_snapshot, FileChangeEvent, Snapshot};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What to poll and how often. An empty `path` is the provider's base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    pub path: String,
    pub interval: Duration,
    pub recursive: bool,
    pub pattern: Option<String>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            path: String::new(),
            interval: DEFAULT_POLL_INTERVAL,
            recursive: true,
            pattern: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Idle,
    Running,
}

/// Handle returned by the `subscribe_*` methods.
pub type SubscriptionId = u64;

pub type SubscriberResult = Result<(), BoxError>;

type AsyncCallback = Arc<dyn Fn(FileChangeEvent) -> BoxFuture<'static, SubscriberResult> + Send + Sync>;
type BlockingCallback = Arc<dyn Fn(&FileChangeEvent) -> SubscriberResult + Send + Sync>;

#[derive(Clone)]
enum Subscriber {
    /// Awaited on the poll task.
    Async(AsyncCallback),
    /// Run on the blocking thread pool.
    Blocking(BlockingCallback),
}

struct Shared {
    provider: Arc<dyn FileStorageProvider>,
    options: WatchOptions,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
}

impl Shared {
    async fn snapshot(&self) -> Result<Snapshot, StorageError> {
        take_snapshot(
            self.provider.as_ref(),
            &self.options.path,
            self.options.pattern.as_deref(),
            self.options.recursive,
        )
        .await
    }

    /// Deliver `event` to every subscriber in subscription order. A failing
    /// or panicking subscriber is logged and skipped.
    async fn dispatch(&self, event: &FileChangeEvent) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, subscriber)| subscriber.clone())
            .collect();

        for subscriber in subscribers {
            let outcome = match subscriber {
                Subscriber::Async(callback) => {
                    match AssertUnwindSafe(callback(event.clone())).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => Err("subscriber panicked".into()),
                    }
                }
                Subscriber::Blocking(callback) => {
                    let event = event.clone();
                    match tokio::task::spawn_blocking(move || callback(&event)).await {
                        Ok(result) => result,
                        Err(e) => Err(format!("subscriber task failed: {}", e).into()),
                    }
                }
            };
            if let Err(e) = outcome {
                error!(
                    "Watcher subscriber failed on {} {}: {}",
                    event.kind.as_str(),
                    event.path,
                    e
                );
            }
        }
    }

    /// One poll cycle. `None` keeps the previous snapshot.
    async fn poll(&self, previous: &Snapshot) -> Option<Snapshot> {
        let current = match self.snapshot().await {
            Ok(current) => current,
            Err(e) => {
                error!("Watcher poll of {} failed: {}", self.options.path, e);
                return None;
            }
        };
        let events = diff(previous, &current);
        if !events.is_empty() {
            debug!("Watcher detected {} changes in {}", events.len(), self.options.path);
        }
        for event in &events {
            self.dispatch(event).await;
        }
        Some(current)
    }
}

struct Running {
    cancel: tokio_watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Polling change watcher over any storage provider.
///
/// `Idle` until [`Watcher::start`], `Running` until [`Watcher::stop`].
/// Starting a running watcher and stopping an idle one are no-ops.
pub struct Watcher {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Watcher {
    pub fn new(provider: Arc<dyn FileStorageProvider>, options: WatchOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                provider,
                options,
                subscribers: Mutex::new(Vec::new()),
            }),
            next_id: AtomicU64::new(1),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn options(&self) -> &WatchOptions {
        &self.shared.options
    }

    fn add(&self, subscriber: Subscriber) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, subscriber));
        id
    }

    /// Register an async callback, awaited for each event.
    pub fn subscribe_async<F, Fut>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(FileChangeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SubscriberResult> + Send + 'static,
    {
        self.add(Subscriber::Async(Arc::new(move |event| callback(event).boxed())))
    }

    /// Register a blocking callback, run off the async scheduler.
    pub fn subscribe_blocking<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&FileChangeEvent) -> SubscriberResult + Send + Sync + 'static,
    {
        self.add(Subscriber::Blocking(Arc::new(callback)))
    }

    /// Remove a subscription. Returns `false` for an unknown id.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub async fn state(&self) -> WatcherState {
        if self.running.lock().await.is_some() {
            WatcherState::Running
        } else {
            WatcherState::Idle
        }
    }

    /// Optionally connect the provider, take the initial snapshot and start
    /// polling. Fails, leaving the watcher idle, if either step fails or the
    /// interval is zero.
    #[instrument(skip(self), level = "debug")]
    pub async fn start(&self, connect: bool) -> Result<(), StorageError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Watcher already running");
            return Ok(());
        }
        if self.shared.options.interval.is_zero() {
            return Err(StorageError::Config(
                "Watch interval must be greater than zero".to_string(),
            ));
        }

        if connect {
            self.shared.provider.connect().await?;
        }
        let initial = self.shared.snapshot().await?;
        let tracked = initial.len();

        let (cancel, cancelled) = tokio_watch::channel(false);
        let handle = tokio::spawn(poll_loop(Arc::clone(&self.shared), initial, cancelled));
        *running = Some(Running { cancel, handle });

        info!(
            "Watcher started on {} ({} entries, every {:?})",
            self.shared.options.path, tracked, self.shared.options.interval
        );
        Ok(())
    }

    /// Cancel polling, wait for the task to finish, then optionally
    /// disconnect the provider.
    #[instrument(skip(self), level = "debug")]
    pub async fn stop(&self, disconnect: bool) {
        let running = self.running.lock().await.take();
        if let Some(Running { cancel, handle }) = running {
            let _ = cancel.send(true);
            if let Err(e) = handle.await {
                warn!("Watcher task ended abnormally: {}", e);
            }
            info!("Watcher stopped on {}", self.shared.options.path);
        }

        if disconnect {
            if let Err(e) = self.shared.provider.disconnect().await {
                warn!("Watcher disconnect failed: {}", e);
            }
        }
    }
}

async fn poll_loop(
    shared: Arc<Shared>,
    mut snapshot: Snapshot,
    mut cancelled: tokio_watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(shared.options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial snapshot covers it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancelled.changed() => break,
            _ = ticker.tick() => {}
        }

        let next = tokio::select! {
            biased;
            _ = cancelled.changed() => break,
            next = shared.poll(&snapshot) => next,
        };
        if let Some(next) = next {
            snapshot = next;
        }
    }
    debug!("Watcher poll loop exited");
}
