//! Durable, retrying delivery of writes to external systems.
//!
//! The queue knows nothing about transports. For every pending item it emits
//! a [`QueueEvent::Process`] carrying a [`ProcessRequest`]; a sync plugin
//! performs the delivery and resolves or rejects the request. Failed items are
//! retried with exponential backoff until `max_retries` is reached, then
//! dropped with a [`QueueEvent::Failed`].

mod config;
mod events;
mod item;
mod store;

pub use config::{backoff_delay, OfflineQueueConfig, StorageMode, STALL_THRESHOLD};
pub use events::{ProcessRequest, QueueEvent, QueueStats};
pub use item::{QueueItem, CLEAR_ALL_ID};
pub use store::{MemoryQueueStore, QueueStore};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::document::Document;
use crate::error::StoreError;
use crate::events::{ChangeKind, ListenerId, Listeners};

/// Error recorded when no listener answered a process request.
pub const NO_HANDLER_ERROR: &str = "no handler processed the queue item";

#[derive(Default)]
struct QueueState {
    items: HashMap<String, QueueItem>,
    next_revision: u64,
    stalled_since: Option<DateTime<Utc>>,
}

impl QueueState {
    fn bump(&mut self) -> u64 {
        self.next_revision += 1;
        self.next_revision
    }

    /// Pending items in insertion order.
    fn sorted(&self) -> Vec<QueueItem> {
        let mut items: Vec<QueueItem> = self.items.values().cloned().collect();
        items.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.revision.cmp(&b.revision))
        });
        items
    }

    fn is_current(&self, item: &QueueItem) -> bool {
        self.items
            .get(&item.id)
            .is_some_and(|current| current.revision == item.revision)
    }
}

enum FailureOutcome {
    /// The key was re-queued or removed while the attempt was in flight.
    Stale,
    Retry { delay: Duration, attempts: u32 },
    Dropped(QueueItem),
}

struct QueueInner {
    config: OfflineQueueConfig,
    store: Option<Arc<dyn QueueStore>>,
    state: Mutex<QueueState>,
    events: Listeners<QueueEvent>,
    connectivity: Mutex<Option<watch::Receiver<bool>>>,
    /// Held for the duration of a processing pass.
    pass_lock: tokio::sync::Mutex<()>,
    syncing: AtomicBool,
    rerun: AtomicBool,
    paused: AtomicBool,
    initialized: AtomicBool,
    destroyed: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
    persist_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_online(&self) -> bool {
        self.connectivity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map_or(true, |rx| *rx.borrow())
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn can_auto_process(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
            && !self.is_destroyed()
            && !self.paused.load(Ordering::Acquire)
            && self.is_online()
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Start a processing pass in the background if allowed.
    fn trigger(self: &Arc<Self>) {
        if !self.can_auto_process() {
            return;
        }
        tokio::spawn(Self::process(Arc::clone(self)));
    }

    /// Single-flight automatic processing.
    ///
    /// Every request raises `rerun` before trying the pass lock. Whoever
    /// holds the lock checks `rerun` again after releasing it, so a request
    /// that lost the race is served by one more pass.
    async fn process(self: Arc<Self>) {
        self.rerun.store(true, Ordering::Release);
        loop {
            let Ok(guard) = self.pass_lock.try_lock() else {
                return;
            };
            if self.is_destroyed() || !self.rerun.swap(false, Ordering::AcqRel) {
                return;
            }
            if self.can_auto_process() {
                self.locked_pass(false).await;
            }
            drop(guard);
        }
    }

    /// Run `pass` with `syncing` raised. The caller holds `pass_lock`.
    async fn locked_pass(self: &Arc<Self>, force: bool) {
        self.syncing.store(true, Ordering::Release);
        self.pass(force).await;
        self.syncing.store(false, Ordering::Release);
    }

    /// Deliver pending items once. A forced pass ignores pause, connectivity
    /// and backoff.
    async fn pass(self: &Arc<Self>, force: bool) {
        let now = Instant::now();
        let due: Vec<QueueItem> = self
            .state()
            .sorted()
            .into_iter()
            .filter(|item| force || item.is_due(now))
            .collect();

        if !due.is_empty() {
            debug!(due = due.len(), force, "Processing offline queue");
        }

        for item in due {
            if self.is_destroyed() {
                return;
            }
            if !force && !self.can_auto_process() {
                debug!("Offline queue paused or offline, stopping pass");
                break;
            }
            if !self.state().is_current(&item) {
                continue;
            }

            match self.dispatch(&item).await {
                Ok(()) => self.complete(item).await,
                Err(error) => self.fail(item, error).await,
            }
        }

        if !self.is_destroyed() {
            self.check_health();
        }
    }

    /// Ask listeners to deliver `item` and wait for their verdict.
    async fn dispatch(&self, item: &QueueItem) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        self.events
            .emit(&QueueEvent::Process(ProcessRequest::new(item.clone(), tx)));

        match tokio::time::timeout(self.config.handler_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => Err(NO_HANDLER_ERROR.to_string()),
        }
    }

    async fn complete(&self, item: QueueItem) {
        let removed = {
            let mut state = self.state();
            if state.is_current(&item) {
                state.items.remove(&item.id)
            } else {
                None
            }
        };

        if removed.is_some() {
            self.persist().await;
            debug!(item = %item.id, "Delivered queue item");
        } else {
            debug!(item = %item.id, "Delivered superseded payload, keeping newer item");
        }
        self.events.emit(&QueueEvent::Success(item));
    }

    async fn fail(self: &Arc<Self>, item: QueueItem, error: String) {
        let outcome = {
            let mut state = self.state();
            let attempts = match state.items.get_mut(&item.id) {
                Some(current) if current.revision == item.revision => {
                    current.attempts += 1;
                    current.last_error = Some(error.clone());
                    Some(current.attempts)
                }
                _ => None,
            };

            match attempts {
                None => FailureOutcome::Stale,
                Some(attempts) if attempts >= self.config.max_retries => state
                    .items
                    .remove(&item.id)
                    .map(FailureOutcome::Dropped)
                    .unwrap_or(FailureOutcome::Stale),
                Some(attempts) => {
                    let delay = backoff_delay(&self.config, attempts);
                    if let Some(current) = state.items.get_mut(&item.id) {
                        current.retry_at = Some(Instant::now() + delay);
                    }
                    FailureOutcome::Retry { delay, attempts }
                }
            }
        };

        match outcome {
            FailureOutcome::Stale => {
                debug!(item = %item.id, error = %error, "Failed attempt for superseded payload");
            }
            FailureOutcome::Retry { delay, attempts } => {
                self.persist().await;
                debug!(
                    item = %item.id,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Queue item failed, scheduling retry"
                );
                self.schedule_retry(delay);
            }
            FailureOutcome::Dropped(dropped) => {
                self.persist().await;
                warn!(
                    item = %dropped.id,
                    attempts = dropped.attempts,
                    error = %error,
                    "Queue item exhausted its retries"
                );
                let attempts = dropped.attempts;
                self.events.emit(&QueueEvent::Failed {
                    item: dropped,
                    error,
                    attempts,
                });
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.trigger();
            }
        });
        self.track(task);
    }

    /// Emit `drain` or `stalled` after a pass.
    fn check_health(&self) {
        let event = {
            let mut state = self.state();
            let oldest = state
                .items
                .values()
                .min_by(|a, b| {
                    a.timestamp
                        .cmp(&b.timestamp)
                        .then(a.revision.cmp(&b.revision))
                })
                .map(|item| (item.timestamp, item.has_failed()));

            match oldest {
                None => {
                    state.stalled_since = None;
                    Some(QueueEvent::Drain)
                }
                Some((timestamp, failed)) => {
                    let age = (Utc::now() - timestamp).to_std().unwrap_or_default();
                    if failed && age > STALL_THRESHOLD {
                        state.stalled_since.get_or_insert_with(Utc::now);
                        Some(QueueEvent::Stalled {
                            size: state.items.len(),
                            oldest_age: age,
                        })
                    } else {
                        state.stalled_since = None;
                        None
                    }
                }
            }
        };

        let Some(event) = event else {
            return;
        };
        if let QueueEvent::Stalled { size, oldest_age } = &event {
            warn!(
                size,
                oldest_age_secs = oldest_age.as_secs(),
                "Offline queue is stalled"
            );
        }
        self.events.emit(&event);
    }

    /// Mirror the pending items to the durable store.
    ///
    /// Snapshots are taken under `persist_lock`, so the newest state is always
    /// written last.
    async fn persist(&self) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if !self.initialized.load(Ordering::Acquire) {
            return;
        }

        let _guard = self.persist_lock.lock().await;
        let snapshot = self.state().sorted();
        if let Err(e) = store.save(&self.config.namespace, &snapshot).await {
            warn!(
                namespace = %self.config.namespace,
                backend = store.backend_name(),
                error = %e,
                "Failed to persist offline queue"
            );
        }
    }

    fn watch_connectivity(self: &Arc<Self>) {
        let receiver = self
            .connectivity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let Some(mut rx) = receiver else {
            return;
        };

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if online {
                    info!("Connectivity restored, resuming offline queue");
                    inner.trigger();
                } else {
                    debug!("Connectivity lost, offline queue waiting");
                }
            }
        });
        self.track(task);
    }
}

/// Queue of pending writes with retry, backoff and optional persistence.
///
/// Cloning returns another handle to the same queue.
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<QueueInner>,
}

impl fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("namespace", &self.inner.config.namespace)
            .field("size", &self.len())
            .finish_non_exhaustive()
    }
}

impl OfflineQueue {
    /// Create a queue. Durable storage needs [`OfflineQueue::with_store`].
    pub fn new(config: OfflineQueueConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a durable queue backed by `store`.
    pub fn with_store(mut config: OfflineQueueConfig, store: Arc<dyn QueueStore>) -> Self {
        config.storage = StorageMode::Durable;
        Self::build(config, Some(store))
    }

    fn build(config: OfflineQueueConfig, store: Option<Arc<dyn QueueStore>>) -> Self {
        let paused = !config.auto_start;
        Self {
            inner: Arc::new(QueueInner {
                config,
                store,
                state: Mutex::new(QueueState::default()),
                events: Listeners::new(),
                connectivity: Mutex::new(None),
                pass_lock: tokio::sync::Mutex::new(()),
                syncing: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                paused: AtomicBool::new(paused),
                initialized: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                init_lock: tokio::sync::Mutex::new(()),
                persist_lock: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Gate automatic processing on a connectivity signal (`true` = online).
    pub fn with_connectivity(self, connectivity: watch::Receiver<bool>) -> Self {
        *self
            .inner
            .connectivity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(connectivity);
        self
    }

    pub fn config(&self) -> &OfflineQueueConfig {
        &self.inner.config
    }

    /// Restore persisted items, emit `ready` and start processing.
    ///
    /// Nothing is processed before `init` completes. Calling it again is a
    /// no-op.
    pub async fn init(&self) -> Result<(), StoreError> {
        let inner = &self.inner;
        inner.config.validate()?;
        if inner.is_destroyed() {
            return Err(StoreError::Queue("queue has been destroyed".to_string()));
        }

        let _guard = inner.init_lock.lock().await;
        if inner.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        if inner.config.storage == StorageMode::Durable {
            let store = inner.store.as_ref().ok_or_else(|| {
                StoreError::Queue("durable storage requires a queue store".to_string())
            })?;
            let loaded = store.load(&inner.config.namespace).await?;
            let restored = {
                let mut state = inner.state();
                let mut restored = 0usize;
                for mut item in loaded {
                    if state.items.contains_key(&item.id) {
                        continue;
                    }
                    item.revision = state.bump();
                    item.retry_at = None;
                    state.items.insert(item.id.clone(), item);
                    restored += 1;
                }
                restored
            };
            info!(
                namespace = %inner.config.namespace,
                backend = store.backend_name(),
                restored,
                "Restored offline queue"
            );
        }

        inner.initialized.store(true, Ordering::Release);
        inner.persist().await;
        inner.watch_connectivity();

        let size = self.len();
        inner.events.emit(&QueueEvent::Ready { size });
        inner.trigger();
        Ok(())
    }

    /// Queue a write and return its identity key.
    ///
    /// A pending item with the same key is replaced. The id comes from
    /// `doc_id`, then from `doc`; a `clear` without either uses
    /// [`CLEAR_ALL_ID`]. Delivery failures never surface here.
    pub async fn add(
        &self,
        operation: ChangeKind,
        collection: &str,
        doc: Option<Document>,
        doc_id: Option<String>,
    ) -> Result<String, StoreError> {
        if self.inner.is_destroyed() {
            return Err(StoreError::Queue("queue has been destroyed".to_string()));
        }

        let mut item = QueueItem::new(operation, collection, doc, doc_id)?;
        let key = item.id.clone();

        let replaced = {
            let mut state = self.inner.state();
            item.revision = state.bump();
            state.items.insert(key.clone(), item.clone()).is_some()
        };

        debug!(item = %key, replaced, "Queued write");
        self.inner.persist().await;
        self.inner.events.emit(&QueueEvent::Add(item));
        self.inner.trigger();
        Ok(key)
    }

    /// Stop automatic processing.
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::AcqRel) {
            info!("Offline queue paused");
        }
        self.inner.events.emit(&QueueEvent::Pause);
    }

    /// Re-enable automatic processing and start a pass.
    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::AcqRel) {
            info!("Offline queue resumed");
        }
        self.inner.events.emit(&QueueEvent::Resume);
        self.inner.trigger();
    }

    /// Run one pass now over every pending item, ignoring pause,
    /// connectivity and backoff.
    ///
    /// Waits for a running pass to finish first.
    pub async fn flush(&self) {
        if self.inner.is_destroyed() || !self.inner.initialized.load(Ordering::Acquire) {
            return;
        }
        self.inner.events.emit(&QueueEvent::Flush);
        {
            let _guard = self.inner.pass_lock.lock().await;
            self.inner.locked_pass(true).await;
        }
        if self.inner.rerun.load(Ordering::Acquire) {
            self.inner.trigger();
        }
    }

    /// Stop timers and listeners. Durable items stay in the store.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            task.abort();
        }
        self.inner.events.clear();
        info!(
            namespace = %self.inner.config.namespace,
            pending = self.len(),
            "Destroyed offline queue"
        );
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn len(&self) -> usize {
        self.inner.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// True while a processing pass runs.
    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::Acquire)
    }

    pub fn is_online(&self) -> bool {
        self.inner.is_online()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// When the current stall was first detected.
    pub fn stalled_since(&self) -> Option<DateTime<Utc>> {
        self.inner.state().stalled_since
    }

    // =========================================================================
    // Management
    // =========================================================================

    /// Pending items in insertion order.
    pub fn get_items(&self) -> Vec<QueueItem> {
        self.inner.state().sorted()
    }

    pub fn get_item(&self, id: &str) -> Option<QueueItem> {
        self.inner.state().items.get(id).cloned()
    }

    pub fn get_items_by_collection(&self, collection: &str) -> Vec<QueueItem> {
        self.get_items()
            .into_iter()
            .filter(|item| item.collection == collection)
            .collect()
    }

    pub async fn remove_item(&self, id: &str) -> bool {
        let removed = self.inner.state().items.remove(id).is_some();
        if removed {
            debug!(item = %id, "Removed queue item");
            self.inner.persist().await;
        }
        removed
    }

    /// Reset an item's attempts and error, then start a pass.
    pub async fn retry_item(&self, id: &str) -> bool {
        let found = match self.inner.state().items.get_mut(id) {
            Some(item) => {
                item.reset();
                true
            }
            None => false,
        };
        if found {
            debug!(item = %id, "Retrying queue item");
            self.inner.persist().await;
            self.inner.trigger();
        }
        found
    }

    /// Reset every item's attempts and start a pass. Returns the item count.
    pub async fn retry_all(&self) -> usize {
        let count = {
            let mut state = self.inner.state();
            state.items.values_mut().for_each(QueueItem::reset);
            state.items.len()
        };
        debug!(count, "Retrying all queue items");
        self.inner.persist().await;
        self.inner.trigger();
        count
    }

    /// Drop every pending item.
    pub async fn clear(&self) {
        let dropped = {
            let mut state = self.inner.state();
            state.stalled_since = None;
            std::mem::take(&mut state.items).len()
        };
        if let Some(store) = self.inner.store.as_ref() {
            if self.inner.initialized.load(Ordering::Acquire) {
                let _guard = self.inner.persist_lock.lock().await;
                if let Err(e) = store.clear(&self.inner.config.namespace).await {
                    warn!(error = %e, "Failed to clear persisted offline queue");
                }
            }
        }
        info!(dropped, "Cleared offline queue");
        self.inner.events.emit(&QueueEvent::Clear);
    }

    pub fn get_stats(&self) -> QueueStats {
        let state = self.inner.state();
        let mut stats = QueueStats {
            size: state.items.len(),
            syncing: self.is_syncing(),
            paused: self.is_paused(),
            online: self.inner.is_online(),
            ..Default::default()
        };
        for item in state.items.values() {
            *stats
                .by_collection
                .entry(item.collection.clone())
                .or_default() += 1;
            *stats
                .by_operation
                .entry(item.operation.to_string())
                .or_default() += 1;
            if item.has_failed() {
                stats.failed += 1;
            }
        }
        stats
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.inner.events.add(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.remove(id)
    }

    /// Register an async delivery handler for every process request.
    ///
    /// `Ok` resolves the request and `Err(message)` rejects it.
    pub fn on_process<F, Fut>(&self, handler: F) -> ListenerId
    where
        F: Fn(QueueItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_event(move |event| {
            if let QueueEvent::Process(request) = event {
                let request = request.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    match (*handler)(request.item().clone()).await {
                        Ok(()) => request.resolve(),
                        Err(error) => request.reject(error),
                    };
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn fast_config() -> OfflineQueueConfig {
        OfflineQueueConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            handler_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn paused_config() -> OfflineQueueConfig {
        OfflineQueueConfig {
            auto_start: false,
            max_retries: 5,
            ..fast_config()
        }
    }

    /// Forward every event except process requests, which must not be kept
    /// alive by the recorder.
    fn record(queue: &OfflineQueue) -> mpsc::UnboundedReceiver<QueueEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        queue.on_event(move |event| {
            if !matches!(event, QueueEvent::Process(_)) {
                let _ = tx.send(event.clone());
            }
        });
        rx
    }

    async fn wait_for<P>(rx: &mut mpsc::UnboundedReceiver<QueueEvent>, predicate: P) -> QueueEvent
    where
        P: Fn(&QueueEvent) -> bool,
    {
        loop {
            let event = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for queue event")
                .expect("queue event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    }

    fn titled(id: &str, title: &str) -> Option<Document> {
        Some(Document::new(id).with("title", title))
    }

    #[tokio::test]
    async fn test_same_key_coalesces_to_latest_payload() {
        let queue = OfflineQueue::new(paused_config());
        queue.init().await.unwrap();

        let first = queue
            .add(ChangeKind::Put, "todos", titled("1", "A"), None)
            .await
            .unwrap();
        let second = queue
            .add(ChangeKind::Put, "todos", titled("1", "B"), None)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(queue.len(), 1);

        let pending = queue.get_item(&first).unwrap();
        assert_eq!(pending.doc.unwrap().get("title"), Some(&json!("B")));

        queue
            .add(ChangeKind::Delete, "todos", None, Some("1".to_string()))
            .await
            .unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_id_is_rejected() {
        let queue = OfflineQueue::new(paused_config());
        let err = queue
            .add(ChangeKind::Put, "todos", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        let key = queue
            .add(ChangeKind::Clear, "todos", None, None)
            .await
            .unwrap();
        assert_eq!(key, "todos:clear:*");
    }

    #[tokio::test]
    async fn test_delivery_removes_items_and_drains() {
        let queue = OfflineQueue::new(paused_config());
        let mut events = record(&queue);
        queue.on_process(|_item| async { Ok(()) });
        queue.init().await.unwrap();

        queue.add(ChangeKind::Put, "todos", titled("1", "A"), None).await.unwrap();
        queue.add(ChangeKind::Put, "todos", titled("2", "B"), None).await.unwrap();
        queue.resume();

        let mut delivered = 0;
        loop {
            match wait_for(&mut events, |e| {
                matches!(e, QueueEvent::Success(_) | QueueEvent::Drain)
            })
            .await
            {
                QueueEvent::Success(_) => delivered += 1,
                _ => break,
            }
        }
        assert_eq!(delivered, 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_rejecting_handler_exhausts_retries_once() {
        let queue = OfflineQueue::new(fast_config());
        let mut events = record(&queue);
        queue.on_process(|_item| async { Err("server unavailable".to_string()) });
        queue.init().await.unwrap();

        queue.add(ChangeKind::Put, "todos", titled("1", "A"), None).await.unwrap();

        let failed = wait_for(&mut events, |e| matches!(e, QueueEvent::Failed { .. })).await;
        match failed {
            QueueEvent::Failed {
                item,
                error,
                attempts,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(item.attempts, 3);
                assert_eq!(item.last_error.as_deref(), Some("server unavailable"));
                assert_eq!(error, "server unavailable");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, QueueEvent::Failed { .. }));
        }
    }

    #[tokio::test]
    async fn test_unanswered_request_fails_with_no_handler() {
        let config = OfflineQueueConfig {
            max_retries: 1,
            ..fast_config()
        };
        let queue = OfflineQueue::new(config);
        let mut events = record(&queue);
        queue.init().await.unwrap();

        queue.add(ChangeKind::Delete, "todos", None, Some("9".to_string())).await.unwrap();

        match wait_for(&mut events, |e| matches!(e, QueueEvent::Failed { .. })).await {
            QueueEvent::Failed { error, .. } => assert_eq!(error, NO_HANDLER_ERROR),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_schedule_is_recorded_on_item() {
        let queue = OfflineQueue::new(paused_config());
        queue.init().await.unwrap();
        let key = queue
            .add(ChangeKind::Put, "todos", titled("1", "A"), None)
            .await
            .unwrap();

        queue.flush().await;
        let item = queue.get_item(&key).unwrap();
        assert_eq!(item.attempts, 1);
        assert_eq!(item.last_error.as_deref(), Some(NO_HANDLER_ERROR));
        assert!(item.retry_at.is_some());

        assert!(queue.retry_item(&key).await);
        let item = queue.get_item(&key).unwrap();
        assert_eq!(item.attempts, 0);
        assert!(item.last_error.is_none());
        assert!(item.retry_at.is_none());
        assert!(!queue.retry_item("todos:put:missing").await);
    }

    #[tokio::test]
    async fn test_pause_blocks_processing_but_flush_forces_a_pass() {
        let queue = OfflineQueue::new(paused_config());
        queue.on_process(|_item| async { Ok(()) });
        queue.init().await.unwrap();

        queue.add(ChangeKind::Put, "todos", titled("1", "A"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.len(), 1);

        queue.flush().await;
        assert!(queue.is_empty());
        assert!(queue.is_paused());
    }

    #[tokio::test]
    async fn test_offline_defers_processing_until_reconnect() {
        let (online_tx, online_rx) = watch::channel(false);
        let queue = OfflineQueue::new(fast_config()).with_connectivity(online_rx);
        let mut events = record(&queue);
        queue.on_process(|_item| async { Ok(()) });
        queue.init().await.unwrap();

        queue.add(ChangeKind::Put, "todos", titled("1", "A"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(queue.len(), 1);
        assert!(!queue.get_stats().online);

        online_tx.send(true).unwrap();
        wait_for(&mut events, |e| matches!(e, QueueEvent::Drain)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_durable_items_survive_a_new_instance() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());

        let first = OfflineQueue::with_store(paused_config(), Arc::clone(&store));
        first.init().await.unwrap();
        first.add(ChangeKind::Put, "todos", titled("1", "A"), None).await.unwrap();
        first
            .add(ChangeKind::Delete, "notes", None, Some("n".to_string()))
            .await
            .unwrap();
        let before = first.get_items();
        first.destroy();

        let second = OfflineQueue::with_store(paused_config(), store);
        let mut events = record(&second);
        second.init().await.unwrap();

        match wait_for(&mut events, |e| matches!(e, QueueEvent::Ready { .. })).await {
            QueueEvent::Ready { size } => assert_eq!(size, 2),
            other => panic!("unexpected event {:?}", other),
        }
        let after = second.get_items();
        assert_eq!(after.len(), before.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.doc, b.doc);
            assert_eq!(a.doc_id, b.doc_id);
            assert_eq!(a.timestamp, b.timestamp);
            assert_eq!(a.attempts, b.attempts);
        }
    }

    #[tokio::test]
    async fn test_durable_mode_requires_store() {
        let config = OfflineQueueConfig {
            storage: StorageMode::Durable,
            ..paused_config()
        };
        let err = OfflineQueue::new(config).init().await.unwrap_err();
        assert!(matches!(err, StoreError::Queue(_)));
    }

    #[tokio::test]
    async fn test_old_failing_item_reports_stall() {
        let queue = OfflineQueue::new(paused_config());
        let mut events = record(&queue);
        queue.init().await.unwrap();
        queue.add(ChangeKind::Put, "todos", titled("1", "A"), None).await.unwrap();

        for item in queue.inner.state().items.values_mut() {
            item.timestamp = item.timestamp - chrono::Duration::minutes(10);
        }

        queue.flush().await;
        match wait_for(&mut events, |e| matches!(e, QueueEvent::Stalled { .. })).await {
            QueueEvent::Stalled { size, oldest_age } => {
                assert_eq!(size, 1);
                assert!(oldest_age > STALL_THRESHOLD);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(queue.stalled_since().is_some());

        queue.clear().await;
        assert!(queue.stalled_since().is_none());
    }

    #[tokio::test]
    async fn test_old_item_without_failures_is_not_stalled() {
        let queue = OfflineQueue::new(paused_config());
        let mut events = record(&queue);
        queue.init().await.unwrap();
        let key = queue
            .add(ChangeKind::Put, "todos", titled("1", "A"), None)
            .await
            .unwrap();

        if let Some(item) = queue.inner.state().items.get_mut(&key) {
            item.timestamp = item.timestamp - chrono::Duration::minutes(10);
        }

        queue.inner.check_health();
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, QueueEvent::Stalled { .. }), "{:?}", event);
        }
        assert!(queue.stalled_since().is_none());

        // The same age with one failed attempt does stall.
        if let Some(item) = queue.inner.state().items.get_mut(&key) {
            item.attempts = 1;
        }
        queue.inner.check_health();
        wait_for(&mut events, |e| matches!(e, QueueEvent::Stalled { .. })).await;
        assert!(queue.stalled_since().is_some());
    }

    #[tokio::test]
    async fn test_flush_delivers_items_waiting_out_backoff() {
        let config = OfflineQueueConfig {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            ..paused_config()
        };
        let queue = OfflineQueue::new(config);
        queue.init().await.unwrap();
        let key = queue
            .add(ChangeKind::Put, "todos", titled("1", "A"), None)
            .await
            .unwrap();

        queue.flush().await;
        let item = queue.get_item(&key).unwrap();
        assert_eq!(item.attempts, 1);
        assert!(!item.is_due(Instant::now()));

        queue.on_process(|_item| async { Ok(()) });
        queue.flush().await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_during_delivery_keeps_newer_payload() {
        let queue = OfflineQueue::new(fast_config());
        let (req_tx, mut req_rx) = mpsc::unbounded_channel::<ProcessRequest>();
        queue.on_event(move |event| {
            if let QueueEvent::Process(request) = event {
                let _ = req_tx.send(request.clone());
            }
        });
        queue.init().await.unwrap();

        let key = queue
            .add(ChangeKind::Put, "todos", titled("1", "A"), None)
            .await
            .unwrap();
        let first = timeout(Duration::from_secs(2), req_rx.recv()).await.unwrap().unwrap();

        queue.add(ChangeKind::Put, "todos", titled("1", "B"), None).await.unwrap();
        assert!(first.resolve());

        let second = timeout(Duration::from_secs(2), req_rx.recv()).await.unwrap().unwrap();
        let doc = second.item().doc.clone().unwrap();
        assert_eq!(doc.get("title"), Some(&json!("B")));
        assert!(queue.get_item(&key).is_some());

        assert!(second.resolve());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_stats_group_by_collection_and_operation() {
        let queue = OfflineQueue::new(paused_config());
        queue.init().await.unwrap();
        queue.add(ChangeKind::Put, "todos", titled("1", "a"), None).await.unwrap();
        queue.add(ChangeKind::Put, "todos", titled("2", "b"), None).await.unwrap();
        queue
            .add(ChangeKind::Delete, "todos", None, Some("3".to_string()))
            .await
            .unwrap();
        queue.add(ChangeKind::Put, "notes", titled("1", "c"), None).await.unwrap();

        let stats = queue.get_stats();
        assert_eq!(stats.size, 4);
        assert!(stats.paused);
        assert!(stats.online);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.by_collection.get("todos"), Some(&3));
        assert_eq!(stats.by_collection.get("notes"), Some(&1));
        assert_eq!(stats.by_operation.get("put"), Some(&3));
        assert_eq!(stats.by_operation.get("delete"), Some(&1));

        assert_eq!(queue.get_items_by_collection("todos").len(), 3);
        assert!(queue.remove_item("notes:put:1").await);
        assert!(!queue.remove_item("notes:put:1").await);
        assert_eq!(queue.retry_all().await, 3);

        queue.clear().await;
        assert!(queue.is_empty());
    }
}
