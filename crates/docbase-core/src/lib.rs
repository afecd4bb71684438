//! Core types for docbase: plugin-composed document collections.
//!
//! This crate defines everything that is independent of a concrete store:
//! - `Plugin` and `Chains`: middleware chains built once per collection
//! - `Collection`: operations, change events, subscriptions and lifecycle
//! - `Registry`: named collections, the change event stream and connectivity
//! - `OfflineQueue`: retrying delivery of writes to external systems
//!
//! ```
//! # tokio_test::block_on(async {
//! use docbase_core::{ChangeKind, Document, OfflineQueue, OfflineQueueConfig};
//!
//! let queue = OfflineQueue::new(OfflineQueueConfig {
//!     auto_start: false,
//!     ..Default::default()
//! });
//! queue.init().await?;
//! queue.add(ChangeKind::Put, "todos", Some(Document::new("1")), None).await?;
//! queue.add(ChangeKind::Put, "todos", Some(Document::new("1")), None).await?;
//! assert_eq!(queue.len(), 1);
//! # Ok::<(), docbase_core::StoreError>(())
//! # }).unwrap();
//! ```

mod chain;
mod collection;
mod document;
mod error;
mod events;
mod plugin;
pub mod queue;
mod registry;

pub use chain::{Chains, Next};
pub use collection::{Collection, CollectionState, Subscription, TeardownError, WeakCollection};
pub use document::{Document, SearchOptions, WriteOptions, ID_FIELD};
pub use error::{Result, StoreError};
pub use events::{ChangeEvent, ChangeKind, CollectionEvent, ListenerId, Listeners};
pub use plugin::{
    ClearNext, DeleteNext, GetAllNext, GetNext, Operation, Plugin, PutNext, SearchNext,
    STORAGE_OPERATIONS,
};
pub use queue::{
    OfflineQueue, OfflineQueueConfig, ProcessRequest, QueueEvent, QueueItem, QueueStats,
    QueueStore, StorageMode,
};
pub use registry::{QueueStatus, Registry};
