use async_trait::async_trait;
use dashmap::DashMap;

use super::item::QueueItem;
use crate::error::StoreError;

/// Durable backing for offline queue items.
///
/// The queue always writes a full snapshot of its pending items, ordered by
/// insertion time, so implementations only need whole-namespace semantics.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "file").
    fn backend_name(&self) -> &'static str;

    /// Load every item persisted under `namespace`.
    async fn load(&self, namespace: &str) -> Result<Vec<QueueItem>, StoreError>;

    /// Replace the persisted items of `namespace`.
    async fn save(&self, namespace: &str, items: &[QueueItem]) -> Result<(), StoreError>;

    /// Drop everything persisted under `namespace`.
    async fn clear(&self, namespace: &str) -> Result<(), StoreError>;
}

/// Process-local queue store.
///
/// Survives queue instances but not the process; useful for tests and for
/// hosts that handle durability elsewhere.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    namespaces: DashMap<String, Vec<QueueItem>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, namespace: &str) -> Result<Vec<QueueItem>, StoreError> {
        Ok(self
            .namespaces
            .get(namespace)
            .map(|items| items.clone())
            .unwrap_or_default())
    }

    async fn save(&self, namespace: &str, items: &[QueueItem]) -> Result<(), StoreError> {
        self.namespaces.insert(namespace.to_string(), items.to_vec());
        Ok(())
    }

    async fn clear(&self, namespace: &str) -> Result<(), StoreError> {
        self.namespaces.remove(namespace);
        Ok(())
    }
}
