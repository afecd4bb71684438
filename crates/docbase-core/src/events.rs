use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::Document;

/// Handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A set of synchronous event listeners.
///
/// `emit` snapshots the listener list before dispatching, so a listener may
/// register or remove listeners (including itself) while being called.
pub struct Listeners<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Callback<E>)>>,
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Callback<E>> =
            self.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for callback in snapshot {
            callback(event);
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Callback<E>)>> {
        // A panicking listener must not wedge the event surface.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of write recorded by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Put,
    Delete,
    Clear,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Put => write!(f, "put"),
            ChangeKind::Delete => write!(f, "delete"),
            ChangeKind::Clear => write!(f, "clear"),
        }
    }
}

/// Immutable record of one completed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Name of the collection the write happened in
    pub collection: String,
    /// Kind of write
    pub operation: ChangeKind,
    /// Affected document id (absent for `clear`)
    #[serde(default)]
    pub id: Option<String>,
    /// Resulting document (only for `put`)
    #[serde(default)]
    pub document: Option<Document>,
    /// When the write completed
    pub timestamp: DateTime<Utc>,
    /// Origin tag for events replayed from a remote source, e.g. `"broadcast"`
    #[serde(default)]
    pub source: Option<String>,
}

impl ChangeEvent {
    pub fn new(collection: impl Into<String>, operation: ChangeKind) -> Self {
        Self {
            collection: collection.into(),
            operation,
            id: None,
            document: None,
            timestamp: Utc::now(),
            source: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_document(mut self, document: Document) -> Self {
        self.document = Some(document);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// True when the write originated in this process.
    pub fn is_local(&self) -> bool {
        self.source.is_none()
    }
}

/// Events dispatched by a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent {
    /// A write completed.
    Change(ChangeEvent),
    /// The subscriber count changed; carries the new count.
    Subscribers(usize),
    /// The collection finished closing.
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_add_emit_remove() {
        let listeners: Listeners<u32> = Listeners::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_clone = Arc::clone(&seen);
        let id = listeners.add(move |v| {
            seen_clone.fetch_add(*v as usize, Ordering::SeqCst);
        });

        listeners.emit(&2);
        listeners.emit(&3);
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.emit(&10);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_listener_can_remove_itself_during_emit() {
        let listeners: Arc<Listeners<()>> = Arc::new(Listeners::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let l = Arc::clone(&listeners);
        let c = Arc::clone(&calls);
        let s = Arc::clone(&slot);
        let id = listeners.add(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *s.lock().unwrap() {
                l.remove(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        listeners.emit(&());
        listeners.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_change_event_locality() {
        let event = ChangeEvent::new("todos", ChangeKind::Put).with_id("1");
        assert!(event.is_local());
        assert!(!event.with_source("broadcast").is_local());
    }
}
