//! In-process and filesystem plugins for docbase.
//!
//! - `MemoryStore` and `FileStore`: terminal storage plugins
//! - `Timestamps`: `createdAt` / `updatedAt` stamping
//! - `BroadcastPlugin`: mirrors writes between collections sharing a channel
//! - `FileQueueStore`: durable backing for the offline queue

mod broadcast;
mod file;
mod memory;
mod queue_store;
mod timestamps;

pub use broadcast::{BroadcastChannel, BroadcastMessage, BroadcastPlugin, BROADCAST_SOURCE};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use queue_store::FileQueueStore;
pub use timestamps::{Timestamps, CREATED_AT, UPDATED_AT};
