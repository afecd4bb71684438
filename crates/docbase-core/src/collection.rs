use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::chain::Chains;
use crate::document::{Document, SearchOptions, WriteOptions};
use crate::error::StoreError;
use crate::events::{ChangeEvent, ChangeKind, CollectionEvent, ListenerId, Listeners};
use crate::plugin::{Operation, Plugin};

/// Lifecycle of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionState {
    /// Install hooks are running
    Installing = 0,
    /// Operations are callable and events flow
    Active = 1,
    /// Destroy hooks are running
    Closing = 2,
    /// Terminal; operations fail fast
    Closed = 3,
}

impl CollectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CollectionState::Installing,
            1 => CollectionState::Active,
            2 => CollectionState::Closing,
            _ => CollectionState::Closed,
        }
    }
}

/// A plugin destroy failure collected during `close()`.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("plugin {plugin} failed to destroy: {error}")]
pub struct TeardownError {
    pub plugin: String,
    pub error: StoreError,
}

struct CollectionInner {
    name: String,
    plugins: Vec<Arc<dyn Plugin>>,
    chains: Chains,
    events: Listeners<CollectionEvent>,
    subscribers: AtomicUsize,
    state: AtomicU8,
}

/// A named set of documents served through plugin chains.
///
/// `Collection` is a cheap handle; clones share the same plugins, chains and
/// listeners. Plugins that need to keep a reference to their collection
/// should hold a [`WeakCollection`] to avoid a reference cycle.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

/// Non-owning handle to a collection.
#[derive(Clone, Debug)]
pub struct WeakCollection {
    inner: Weak<CollectionInner>,
}

impl WeakCollection {
    pub fn upgrade(&self) -> Option<Collection> {
        self.inner.upgrade().map(|inner| Collection { inner })
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Collection {
    /// Build chains and install every plugin, in order.
    ///
    /// The first install error aborts construction and is returned as is,
    /// after the plugins installed before it are destroyed, best effort.
    pub async fn open(
        name: impl Into<String>,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<Self, StoreError> {
        let name = name.into();
        if name.is_empty() {
            return Err(StoreError::InvalidArgument(
                "collection name must not be empty".to_string(),
            ));
        }

        let chains = Chains::build(&name, &plugins);
        let collection = Self {
            inner: Arc::new(CollectionInner {
                name,
                plugins,
                chains,
                events: Listeners::new(),
                subscribers: AtomicUsize::new(0),
                state: AtomicU8::new(CollectionState::Installing as u8),
            }),
        };

        for (index, plugin) in collection.inner.plugins.iter().enumerate() {
            debug!(
                collection = %collection.inner.name,
                plugin = plugin.name(),
                "Installing plugin"
            );
            if let Err(e) = plugin.install(&collection).await {
                warn!(
                    collection = %collection.inner.name,
                    plugin = plugin.name(),
                    error = %e,
                    "Plugin install failed, aborting collection"
                );
                collection.set_state(CollectionState::Closing);
                collection
                    .destroy_plugins(&collection.inner.plugins[..index])
                    .await;
                collection.set_state(CollectionState::Closed);
                collection.inner.events.clear();
                return Err(e);
            }
        }

        collection.set_state(CollectionState::Active);
        info!(
            collection = %collection.inner.name,
            plugins = collection.inner.plugins.len(),
            "Opened collection"
        );
        Ok(collection)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> CollectionState {
        CollectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.state(),
            CollectionState::Closing | CollectionState::Closed
        )
    }

    /// Whether any plugin implements `operation`.
    pub fn provides(&self, operation: Operation) -> bool {
        self.inner.chains.provides(operation)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.load(Ordering::Acquire)
    }

    pub fn downgrade(&self) -> WeakCollection {
        WeakCollection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// True when both handles refer to the same collection.
    pub(crate) fn ptr_eq(&self, other: &Collection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn set_state(&self, state: CollectionState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed(self.inner.name.clone()));
        }
        Ok(())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    #[instrument(skip(self), fields(collection = %self.inner.name), level = "debug")]
    pub async fn get(&self, id: &str) -> Result<Option<Document>, StoreError> {
        self.ensure_open()?;
        self.inner.chains.get.call(id.to_string()).await
    }

    #[instrument(skip(self), fields(collection = %self.inner.name), level = "debug")]
    pub async fn get_all(&self) -> Result<Vec<Document>, StoreError> {
        self.ensure_open()?;
        self.inner.chains.get_all.call(()).await
    }

    /// Write a document and return what the chain stored.
    ///
    /// Emits one `put` change event on success unless `opts.remote` is set.
    #[instrument(
        skip(self, doc),
        fields(collection = %self.inner.name, id = ?doc.id()),
        level = "debug"
    )]
    pub async fn put(&self, doc: Document, opts: WriteOptions) -> Result<Document, StoreError> {
        self.ensure_open()?;
        let remote = opts.remote;
        let source = opts.source.clone();
        let stored = self.inner.chains.put.call((doc, opts)).await?;

        if !remote {
            let mut event = ChangeEvent::new(&self.inner.name, ChangeKind::Put)
                .with_document(stored.clone());
            if let Some(id) = stored.id() {
                event = event.with_id(id);
            }
            event.source = source;
            self.emit_change(event);
        }
        Ok(stored)
    }

    /// Delete a document. Emits one `delete` change event on success unless
    /// `opts.remote` is set.
    #[instrument(skip(self), fields(collection = %self.inner.name), level = "debug")]
    pub async fn delete(&self, id: &str, opts: WriteOptions) -> Result<(), StoreError> {
        self.ensure_open()?;
        let remote = opts.remote;
        let source = opts.source.clone();
        self.inner
            .chains
            .delete
            .call((id.to_string(), opts))
            .await?;

        if !remote {
            let mut event = ChangeEvent::new(&self.inner.name, ChangeKind::Delete).with_id(id);
            event.source = source;
            self.emit_change(event);
        }
        Ok(())
    }

    /// Remove every document. Always emits a `clear` change event on success.
    #[instrument(skip(self), fields(collection = %self.inner.name), level = "debug")]
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.inner.chains.clear.call(()).await?;
        self.emit_change(ChangeEvent::new(&self.inner.name, ChangeKind::Clear));
        Ok(())
    }

    #[instrument(skip(self, opts), fields(collection = %self.inner.name), level = "debug")]
    pub async fn search(
        &self,
        query: &str,
        opts: SearchOptions,
    ) -> Result<Vec<Document>, StoreError> {
        self.ensure_open()?;
        self.inner
            .chains
            .search
            .call((query.to_string(), opts))
            .await
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Dispatch a change event to listeners and subscribers.
    ///
    /// Sync plugins call this after applying a remote write with
    /// `remote: true`, tagging the event with a `source`.
    pub fn emit_change(&self, event: ChangeEvent) {
        self.inner.events.emit(&CollectionEvent::Change(event));
    }

    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CollectionEvent) + Send + Sync + 'static,
    {
        self.inner.events.add(listener)
    }

    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.inner.events.add(move |event| {
            if let CollectionEvent::Change(change) = event {
                listener(change);
            }
        })
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.remove(id)
    }

    /// Receive the full `get_all()` snapshot now and after every change.
    ///
    /// Snapshots are fetched and delivered in order by a per-subscription
    /// task, so this must be called inside a Tokio runtime. Dropping or
    /// unsubscribing the returned guard stops future deliveries; a fetch
    /// already in flight still completes but is not delivered.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Vec<Document>) + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let active = Arc::new(AtomicBool::new(true));

        let weak = self.downgrade();
        let worker_active = Arc::clone(&active);
        let name = self.inner.name.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let Some(collection) = weak.upgrade() else {
                    break;
                };
                let snapshot = collection.get_all().await;
                if !worker_active.load(Ordering::Acquire) {
                    break;
                }
                match snapshot {
                    Ok(docs) => callback(docs),
                    Err(e) => warn!(collection = %name, error = %e, "Subscriber refresh failed"),
                }
            }
        });

        let listener_tx = tx.clone();
        let listener = self.inner.events.add(move |event| {
            if let CollectionEvent::Change(_) = event {
                let _ = listener_tx.send(());
            }
        });
        let _ = tx.send(());

        let count = self.inner.subscribers.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(collection = %self.inner.name, subscribers = count, "Subscribed");
        self.inner
            .events
            .emit(&CollectionEvent::Subscribers(count));

        Subscription {
            collection: self.downgrade(),
            listener,
            active,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Destroy every plugin in order, best effort.
    ///
    /// Destroy errors are logged and returned; they never stop the remaining
    /// plugins. Closing an already closed collection returns no errors.
    pub async fn close(&self) -> Vec<TeardownError> {
        let transition = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                match CollectionState::from_u8(state) {
                    CollectionState::Installing | CollectionState::Active => {
                        Some(CollectionState::Closing as u8)
                    }
                    _ => None,
                }
            });
        if transition.is_err() {
            debug!(collection = %self.inner.name, "Collection already closed");
            return Vec::new();
        }

        let errors = self.destroy_plugins(&self.inner.plugins).await;

        self.set_state(CollectionState::Closed);
        self.inner.events.emit(&CollectionEvent::Closed);
        self.inner.events.clear();

        info!(
            collection = %self.inner.name,
            teardown_errors = errors.len(),
            "Closed collection"
        );
        errors
    }

    async fn destroy_plugins(&self, plugins: &[Arc<dyn Plugin>]) -> Vec<TeardownError> {
        let mut errors = Vec::new();
        for plugin in plugins {
            if let Err(error) = plugin.destroy().await {
                warn!(
                    collection = %self.inner.name,
                    plugin = plugin.name(),
                    error = %error,
                    "Plugin destroy failed, continuing teardown"
                );
                errors.push(TeardownError {
                    plugin: plugin.name().to_string(),
                    error,
                });
            }
        }
        errors
    }
}

/// Guard for a [`Collection::subscribe`] registration.
#[must_use = "dropping a Subscription unsubscribes it"]
#[derive(Debug)]
pub struct Subscription {
    collection: WeakCollection,
    listener: ListenerId,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop receiving snapshots.
    pub fn unsubscribe(self) {
        drop(self);
    }

    fn release(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(collection) = self.collection.upgrade() else {
            return;
        };
        collection.inner.events.remove(self.listener);
        let count = collection
            .inner
            .subscribers
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        debug!(collection = %collection.inner.name, subscribers = count, "Unsubscribed");
        collection
            .inner
            .events
            .emit(&CollectionEvent::Subscribers(count));
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{
        ClearNext, DeleteNext, GetAllNext, GetNext, PutNext, STORAGE_OPERATIONS,
    };
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Minimal terminal store for exercising the collection.
    #[derive(Default)]
    struct MapStore {
        docs: Mutex<BTreeMap<String, Document>>,
    }

    #[async_trait]
    impl Plugin for MapStore {
        fn name(&self) -> &str {
            "map-store"
        }

        fn provides(&self) -> &[Operation] {
            STORAGE_OPERATIONS
        }

        async fn get(&self, _next: GetNext, id: String) -> Result<Option<Document>, StoreError> {
            Ok(self.docs.lock().unwrap().get(&id).cloned())
        }

        async fn get_all(&self, _next: GetAllNext) -> Result<Vec<Document>, StoreError> {
            Ok(self.docs.lock().unwrap().values().cloned().collect())
        }

        async fn put(
            &self,
            _next: PutNext,
            doc: Document,
            _opts: WriteOptions,
        ) -> Result<Document, StoreError> {
            let id = doc.require_id()?.to_string();
            self.docs.lock().unwrap().insert(id, doc.clone());
            Ok(doc)
        }

        async fn delete(
            &self,
            _next: DeleteNext,
            id: String,
            _opts: WriteOptions,
        ) -> Result<(), StoreError> {
            self.docs.lock().unwrap().remove(&id);
            Ok(())
        }

        async fn clear(&self, _next: ClearNext) -> Result<(), StoreError> {
            self.docs.lock().unwrap().clear();
            Ok(())
        }
    }

    /// Records install/destroy and can be told to fail.
    struct Lifecycle {
        name: &'static str,
        fail_install: bool,
        fail_destroy: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Plugin for Lifecycle {
        fn name(&self) -> &str {
            self.name
        }

        fn provides(&self) -> &[Operation] {
            &[]
        }

        async fn install(&self, _collection: &Collection) -> Result<(), StoreError> {
            self.log.lock().unwrap().push(format!("install:{}", self.name));
            if self.fail_install {
                return Err(StoreError::Plugin(format!("{} refused", self.name)));
            }
            Ok(())
        }

        async fn destroy(&self) -> Result<(), StoreError> {
            self.log.lock().unwrap().push(format!("destroy:{}", self.name));
            if self.fail_destroy {
                return Err(StoreError::Plugin(format!("{} stuck", self.name)));
            }
            Ok(())
        }
    }

    fn lifecycle(
        name: &'static str,
        fail_install: bool,
        fail_destroy: bool,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn Plugin> {
        Arc::new(Lifecycle {
            name,
            fail_install,
            fail_destroy,
            log: Arc::clone(log),
        })
    }

    async fn open_store(name: &str) -> Collection {
        Collection::open(name, vec![Arc::new(MapStore::default()) as Arc<dyn Plugin>])
            .await
            .unwrap()
    }

    fn record_changes(collection: &Collection) -> Arc<Mutex<Vec<ChangeEvent>>> {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        collection.on_change(move |event| sink.lock().unwrap().push(event.clone()));
        changes
    }

    #[tokio::test]
    async fn test_writes_emit_one_change_event_each() {
        let collection = open_store("todos").await;
        let changes = record_changes(&collection);

        collection
            .put(Document::new("1").with("title", "a"), WriteOptions::default())
            .await
            .unwrap();
        collection.delete("1", WriteOptions::default()).await.unwrap();
        collection.clear().await.unwrap();
        collection.get("1").await.unwrap();
        collection.get_all().await.unwrap();

        let changes = changes.lock().unwrap();
        let kinds: Vec<ChangeKind> = changes.iter().map(|c| c.operation).collect();
        assert_eq!(kinds, vec![ChangeKind::Put, ChangeKind::Delete, ChangeKind::Clear]);
        assert_eq!(changes[0].id.as_deref(), Some("1"));
        assert_eq!(changes[0].collection, "todos");
        assert!(changes[0].document.is_some());
        assert!(changes.iter().all(ChangeEvent::is_local));
    }

    #[tokio::test]
    async fn test_failed_and_remote_writes_emit_nothing() {
        let collection = open_store("todos").await;
        let changes = record_changes(&collection);

        // Missing id: the store rejects it.
        let err = collection
            .put(Document::default().with("title", "x"), WriteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        collection
            .put(Document::new("2"), WriteOptions::remote("broadcast"))
            .await
            .unwrap();
        collection
            .delete("2", WriteOptions::remote("broadcast"))
            .await
            .unwrap();

        assert!(changes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_operation_error() {
        let collection = open_store("notes").await;
        assert!(!collection.provides(Operation::Search));

        let err = collection
            .search("hello", SearchOptions::default())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("search"), "{}", message);
        assert!(message.contains("notes"), "{}", message);
    }

    #[tokio::test]
    async fn test_subscribe_delivers_full_snapshots() {
        let collection = open_store("todos").await;
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Document>>();
        let subscription = collection.subscribe(move |docs| {
            let _ = tx.send(docs);
        });

        let initial = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(initial.is_empty());

        collection.put(Document::new("a"), WriteOptions::default()).await.unwrap();
        let after_a = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(after_a.len(), 1);

        collection.put(Document::new("b"), WriteOptions::default()).await.unwrap();
        let after_b = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(after_b.len(), 2);

        subscription.unsubscribe();
        collection.put(Document::new("c"), WriteOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscriber_count_transitions_are_observable() {
        let collection = open_store("todos").await;
        let counts = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&counts);
        collection.on_event(move |event| {
            if let CollectionEvent::Subscribers(n) = event {
                sink.lock().unwrap().push(*n);
            }
        });

        let first = collection.subscribe(|_| {});
        let second = collection.subscribe(|_| {});
        assert_eq!(collection.subscriber_count(), 2);
        drop(first);
        second.unsubscribe();

        assert_eq!(*counts.lock().unwrap(), vec![1, 2, 1, 0]);
        assert_eq!(collection.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_install_runs_in_order_and_aborts_on_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let result = Collection::open(
            "broken",
            vec![
                lifecycle("first", false, false, &log),
                lifecycle("second", true, false, &log),
                lifecycle("third", false, false, &log),
            ],
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err, StoreError::Plugin("second refused".to_string()));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["install:first", "install:second", "destroy:first"]
        );
    }

    #[tokio::test]
    async fn test_failed_install_destroys_installed_plugins_best_effort() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let result = Collection::open(
            "broken",
            vec![
                lifecycle("a", false, true, &log),
                lifecycle("b", false, false, &log),
                lifecycle("c", true, false, &log),
                lifecycle("d", false, false, &log),
            ],
        )
        .await;

        assert_eq!(result.unwrap_err(), StoreError::Plugin("c refused".to_string()));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["install:a", "install:b", "install:c", "destroy:a", "destroy:b"]
        );
    }

    #[tokio::test]
    async fn test_close_is_best_effort() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let collection = Collection::open(
            "teardown",
            vec![
                lifecycle("a", false, true, &log),
                lifecycle("b", false, false, &log),
                Arc::new(MapStore::default()) as Arc<dyn Plugin>,
            ],
        )
        .await
        .unwrap();

        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        collection.on_event(move |event| {
            if matches!(event, CollectionEvent::Closed) {
                flag.store(true, Ordering::SeqCst);
            }
        });

        let errors = collection.close().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].plugin, "a");
        assert_eq!(
            *log.lock().unwrap(),
            vec!["install:a", "install:b", "destroy:a", "destroy:b"]
        );
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(collection.state(), CollectionState::Closed);

        let err = collection.get("x").await.unwrap_err();
        assert_eq!(err, StoreError::Closed("teardown".to_string()));

        // Second close is a no-op.
        assert!(collection.close().await.is_empty());
        assert_eq!(log.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_remote_apply_with_tagged_event() {
        let collection = open_store("todos").await;
        let changes = record_changes(&collection);

        collection
            .put(Document::new("r"), WriteOptions::remote("broadcast"))
            .await
            .unwrap();
        collection.emit_change(
            ChangeEvent::new("todos", ChangeKind::Put)
                .with_id("r")
                .with_source("broadcast"),
        );

        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].is_local());
        assert_eq!(changes[0].source.as_deref(), Some("broadcast"));
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let result = Collection::open("", Vec::new()).await;
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }
}
