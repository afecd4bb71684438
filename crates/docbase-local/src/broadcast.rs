use std::sync::{LazyLock, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use docbase_core::{
    ChangeEvent, ChangeKind, Collection, ListenerId, Operation, Plugin, StoreError,
    WeakCollection, WriteOptions,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Source tag on change events applied from a broadcast channel.
pub const BROADCAST_SOURCE: &str = "broadcast";

const CHANNEL_CAPACITY: usize = 128;

static CHANNELS: LazyLock<DashMap<String, broadcast::Sender<BroadcastMessage>>> =
    LazyLock::new(DashMap::new);

/// One change published on a channel.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    /// Plugin instance that published the change
    pub origin: Uuid,
    pub event: ChangeEvent,
}

/// A named in-process channel shared by every handle opened with the same
/// name, standing in for a cross-process broadcast medium.
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    name: String,
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastChannel {
    pub fn open(name: impl Into<String>) -> Self {
        let name = name.into();
        let sender = CHANNELS
            .entry(name.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        Self { name, sender }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a message. Returns the number of handles that will see it.
    pub fn publish(&self, message: BroadcastMessage) -> usize {
        self.sender.send(message).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.sender.subscribe()
    }

    /// Forget the shared sender once nobody listens on it. The next `open`
    /// with this name starts a fresh channel.
    fn prune(&self) {
        let removed = CHANNELS.remove_if(&self.name, |_, sender| sender.receiver_count() == 0);
        if removed.is_some() {
            debug!(channel = %self.name, "Pruned idle broadcast channel");
        }
    }
}

struct Attachment {
    collection: WeakCollection,
    listener: ListenerId,
    task: JoinHandle<()>,
}

/// Mirrors a collection's writes across every collection attached to the same
/// channel.
///
/// Local change events go out tagged with this plugin's origin id. Inbound
/// changes for the same collection name are applied with `remote: true` and
/// re-emitted with `source = "broadcast"`. Events that already carry a source
/// are never published, so changes do not echo. Participates in no operation
/// chain.
pub struct BroadcastPlugin {
    channel: BroadcastChannel,
    origin: Uuid,
    attachment: Mutex<Option<Attachment>>,
}

impl BroadcastPlugin {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: BroadcastChannel::open(channel),
            origin: Uuid::new_v4(),
            attachment: Mutex::new(None),
        }
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }
}

/// Apply an inbound change to `collection` without emitting a local event.
async fn apply(collection: &Collection, event: &ChangeEvent) -> Result<(), StoreError> {
    let opts = WriteOptions::remote(BROADCAST_SOURCE);
    let mut replay =
        ChangeEvent::new(collection.name(), event.operation).with_source(BROADCAST_SOURCE);

    match event.operation {
        ChangeKind::Put => {
            let doc = event.document.clone().ok_or_else(|| {
                StoreError::Sync("broadcast put without a document".to_string())
            })?;
            let stored = collection.put(doc, opts).await?;
            if let Some(id) = stored.id() {
                replay = replay.with_id(id);
            }
            replay = replay.with_document(stored);
        }
        ChangeKind::Delete => {
            let id = event
                .id
                .as_deref()
                .ok_or_else(|| StoreError::Sync("broadcast delete without an id".to_string()))?;
            collection.delete(id, opts).await?;
            replay = replay.with_id(id);
        }
        ChangeKind::Clear => {
            // `clear` always emits a local event, so remove documents one by one.
            for doc in collection.get_all().await? {
                if let Some(id) = doc.id() {
                    collection.delete(id, opts.clone()).await?;
                }
            }
        }
    }

    collection.emit_change(replay);
    Ok(())
}

#[async_trait]
impl Plugin for BroadcastPlugin {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn provides(&self) -> &[Operation] {
        &[]
    }

    async fn install(&self, collection: &Collection) -> Result<(), StoreError> {
        let channel = self.channel.clone();
        let origin = self.origin;
        let listener = collection.on_change(move |event| {
            if event.is_local() {
                channel.publish(BroadcastMessage {
                    origin,
                    event: event.clone(),
                });
            }
        });

        let mut inbound = self.channel.subscribe();
        let weak = collection.downgrade();
        let name = collection.name().to_string();
        let task = tokio::spawn(async move {
            loop {
                let message = match inbound.recv().await {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(collection = %name, skipped, "Broadcast receiver lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if message.origin == origin || message.event.collection != name {
                    continue;
                }
                let Some(collection) = weak.upgrade() else {
                    break;
                };
                if collection.is_closed() {
                    break;
                }
                match apply(&collection, &message.event).await {
                    Ok(()) => debug!(
                        collection = %name,
                        operation = %message.event.operation,
                        "Applied broadcast change"
                    ),
                    Err(e) => warn!(
                        collection = %name,
                        operation = %message.event.operation,
                        error = %e,
                        "Failed to apply broadcast change"
                    ),
                }
            }
        });

        *self
            .attachment
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Attachment {
            collection: collection.downgrade(),
            listener,
            task,
        });
        info!(
            collection = %collection.name(),
            channel = %self.channel.name(),
            "Joined broadcast channel"
        );
        Ok(())
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        let attachment = self
            .attachment
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(attachment) = attachment {
            if let Some(collection) = attachment.collection.upgrade() {
                collection.off(attachment.listener);
            }
            attachment.task.abort();
            // Wait for the receiver to be dropped before pruning.
            let _ = attachment.task.await;
            self.channel.prune();
            debug!(channel = %self.channel.name(), "Left broadcast channel");
        }
        Ok(())
    }
}
