use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::collection::{Collection, TeardownError, WeakCollection};
use crate::error::StoreError;
use crate::events::{ChangeEvent, CollectionEvent};
use crate::plugin::Plugin;
use crate::queue::{OfflineQueue, OfflineQueueConfig};

/// Buffered change events per `events()` consumer before it starts lagging.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

static GLOBAL: Mutex<Option<Registry>> = Mutex::new(None);

/// Cheap view of the shared queue for status displays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub size: usize,
    pub syncing: bool,
    pub stalled_since: Option<DateTime<Utc>>,
}

struct RegistryInner {
    collections: DashMap<String, Collection>,
    /// Names whose collection is still installing.
    reserved: Mutex<HashSet<String>>,
    changes: broadcast::Sender<ChangeEvent>,
    online: watch::Sender<bool>,
    queue: Mutex<Option<OfflineQueue>>,
    queue_init: tokio::sync::Mutex<()>,
}

impl RegistryInner {
    fn reserved(&self) -> MutexGuard<'_, HashSet<String>> {
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queue(&self) -> MutexGuard<'_, Option<OfflineQueue>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop `name` from the map if it still points at `handle`.
    fn unregister(&self, name: &str, handle: &WeakCollection) {
        let removed = self.collections.remove_if(name, |_, current| {
            handle
                .upgrade()
                .is_some_and(|collection| collection.ptr_eq(current))
        });
        if removed.is_some() {
            debug!(collection = %name, "Unregistered closed collection");
        }
    }
}

/// Releases a name reservation if collection construction does not finish.
struct Reservation<'a> {
    inner: &'a RegistryInner,
    name: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.inner.reserved().remove(&self.name);
    }
}

/// Process-wide directory of collections, change events, connectivity and
/// the shared offline queue.
///
/// `Registry` is a cheap handle. Most hosts use [`Registry::global`]; tests
/// and embedders can build isolated instances with [`Registry::new`].
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("collections", &self.inner.collections.len())
            .field("online", &self.is_online())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (online, _) = watch::channel(true);
        Self {
            inner: Arc::new(RegistryInner {
                collections: DashMap::new(),
                reserved: Mutex::new(HashSet::new()),
                changes,
                online,
                queue: Mutex::new(None),
                queue_init: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// The process singleton, created on first use.
    pub fn global() -> Registry {
        GLOBAL
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_or_insert_with(Registry::new)
            .clone()
    }

    /// Close the singleton. The next [`Registry::global`] builds a new one.
    pub async fn shutdown_global() -> Vec<TeardownError> {
        let registry = GLOBAL
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match registry {
            Some(registry) => registry.close().await,
            None => Vec::new(),
        }
    }

    // =========================================================================
    // Collections
    // =========================================================================

    /// Open a collection and register it under `name`.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if the name is registered or
    /// still being installed. A failed install leaves the name free.
    pub async fn create(
        &self,
        name: impl Into<String>,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<Collection, StoreError> {
        let name = name.into();
        let reservation = self.reserve(&name)?;

        let collection = Collection::open(name.clone(), plugins).await?;

        let changes = self.inner.changes.clone();
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let handle = collection.downgrade();
        let key = name.clone();
        collection.on_event(move |event| match event {
            CollectionEvent::Change(change) => {
                // No receivers is fine.
                let _ = changes.send(change.clone());
            }
            CollectionEvent::Closed => {
                if let Some(inner) = registry.upgrade() {
                    inner.unregister(&key, &handle);
                }
            }
            CollectionEvent::Subscribers(_) => {}
        });

        self.inner.collections.insert(name.clone(), collection.clone());
        drop(reservation);

        info!(collection = %name, "Registered collection");
        Ok(collection)
    }

    fn reserve(&self, name: &str) -> Result<Reservation<'_>, StoreError> {
        let mut reserved = self.inner.reserved();
        if self.inner.collections.contains_key(name) || !reserved.insert(name.to_string()) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        Ok(Reservation {
            inner: &self.inner,
            name: name.to_string(),
        })
    }

    pub fn get(&self, name: &str) -> Option<Collection> {
        self.inner
            .collections
            .get(name)
            .map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<Collection> {
        let mut collections: Vec<Collection> = self
            .inner
            .collections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        collections.sort_by(|a, b| a.name().cmp(b.name()));
        collections
    }

    /// Close and unregister a collection. Returns `None` if no collection is
    /// registered under `name`.
    pub async fn remove(&self, name: &str) -> Option<Vec<TeardownError>> {
        let (_, collection) = self.inner.collections.remove(name)?;
        Some(collection.close().await)
    }

    /// Close every collection and destroy the shared queue.
    pub async fn close(&self) -> Vec<TeardownError> {
        let collections = self.all();
        let count = collections.len();

        let mut errors = Vec::new();
        for collection in collections {
            errors.extend(collection.close().await);
        }
        self.inner.collections.clear();

        let queue = self.inner.queue().take();
        if let Some(queue) = queue {
            queue.destroy();
        }

        info!(
            collections = count,
            teardown_errors = errors.len(),
            "Closed registry"
        );
        errors
    }

    // =========================================================================
    // Change events
    // =========================================================================

    /// Stream of change events from every registered collection.
    ///
    /// A consumer that falls more than the channel capacity behind skips the
    /// missed events and logs a warning.
    pub fn events(&self) -> impl Stream<Item = ChangeEvent> + Send + 'static {
        BroadcastStream::new(self.inner.changes.subscribe()).filter_map(|event| match event {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Change event consumer lagged");
                None
            }
        })
    }

    // =========================================================================
    // Connectivity
    // =========================================================================

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Record host connectivity. Going online wakes the shared queue.
    pub fn set_online(&self, online: bool) {
        let previous = self.inner.online.send_replace(online);
        if previous != online {
            info!(online, "Connectivity changed");
        }
    }

    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    // =========================================================================
    // Offline queue
    // =========================================================================

    /// The shared in-memory queue, created and initialised on first call.
    ///
    /// Later calls return the existing queue and ignore `config`.
    pub async fn queue(&self, config: OfflineQueueConfig) -> Result<OfflineQueue, StoreError> {
        let _guard = self.inner.queue_init.lock().await;
        if let Some(queue) = self.shared_queue() {
            return Ok(queue);
        }

        let queue = OfflineQueue::new(config).with_connectivity(self.connectivity());
        queue.init().await?;
        *self.inner.queue() = Some(queue.clone());
        debug!(namespace = %queue.config().namespace, "Initialised shared offline queue");
        Ok(queue)
    }

    /// The shared queue if one was created.
    pub fn shared_queue(&self) -> Option<OfflineQueue> {
        self.inner.queue().clone()
    }

    /// Size, activity and stall state of the shared queue. Never creates it.
    pub fn queue_status(&self) -> QueueStatus {
        match self.shared_queue() {
            Some(queue) => QueueStatus {
                size: queue.len(),
                syncing: queue.is_syncing(),
                stalled_since: queue.stalled_since(),
            },
            None => QueueStatus::default(),
        }
    }
}
