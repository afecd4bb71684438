use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use docbase_core::queue::{OfflineQueue, ProcessRequest, QueueEvent, QueueItem};
use docbase_core::{
    ChangeEvent, ChangeKind, Collection, Document, ListenerId, Operation, Plugin, StoreError,
    WeakCollection, WriteOptions,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::client::RestClient;
use crate::conflict::ConflictResolver;

/// Source tag on change events applied from the REST endpoint.
pub const REST_SOURCE: &str = "rest";

/// A local write waiting to be handed to the queue.
struct Outgoing {
    operation: ChangeKind,
    doc: Option<Document>,
    doc_id: Option<String>,
}

struct Attachment {
    name: String,
    collection: WeakCollection,
    change_listener: ListenerId,
    process_listener: ListenerId,
    forwarder: JoinHandle<()>,
}

/// Pushes local writes to a REST endpoint through the offline queue and pulls
/// remote state on demand.
///
/// Local `put` and `delete` events are queued in the order they happened.
/// Queued items of this collection are delivered by this plugin's `process`
/// handler. `clear` is not sent to the server. Pulled documents are written
/// with `remote: true` and announced with `source = "rest"`, so they are never
/// queued again. Participates in no operation chain.
pub struct RestSync {
    client: RestClient,
    queue: OfflineQueue,
    resolver: ConflictResolver,
    attachment: Mutex<Option<Attachment>>,
}

impl RestSync {
    pub fn new(client: RestClient, queue: OfflineQueue) -> Self {
        Self {
            client,
            queue,
            resolver: ConflictResolver::default(),
            attachment: Mutex::new(None),
        }
    }

    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    fn attached(&self) -> Result<(String, Collection), StoreError> {
        let attachment = self
            .attachment
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let attachment = attachment
            .as_ref()
            .ok_or_else(|| StoreError::Sync("rest sync is not installed".to_string()))?;
        let collection = attachment
            .collection
            .upgrade()
            .ok_or_else(|| StoreError::Closed(attachment.name.clone()))?;
        Ok((attachment.name.clone(), collection))
    }

    /// Fetch the remote collection and apply each document through the
    /// conflict resolver. Returns the number of documents written.
    #[instrument(skip(self), level = "debug")]
    pub async fn pull(&self) -> Result<usize, StoreError> {
        let (name, collection) = self.attached()?;
        let remote_docs = self.client.list(&name).await?;
        let can_read = collection.provides(Operation::Get);

        let mut applied = 0;
        for remote in remote_docs {
            let id = remote.require_id()?.to_string();
            let local = if can_read {
                collection.get(&id).await?
            } else {
                None
            };

            let Some(resolved) = self.resolver.resolve(local.as_ref(), &remote) else {
                continue;
            };
            if local.as_ref() == Some(&resolved) {
                continue;
            }

            let stored = collection
                .put(resolved, WriteOptions::remote(REST_SOURCE))
                .await?;
            collection.emit_change(
                ChangeEvent::new(&name, ChangeKind::Put)
                    .with_id(id)
                    .with_document(stored)
                    .with_source(REST_SOURCE),
            );
            applied += 1;
        }

        info!(collection = %name, applied, "Pulled remote documents");
        Ok(applied)
    }
}

async fn deliver(client: &RestClient, item: &QueueItem) -> Result<(), StoreError> {
    match item.operation {
        ChangeKind::Put => {
            let doc = item.doc.as_ref().ok_or_else(|| {
                StoreError::Sync(format!("queued put {} has no document", item.id))
            })?;
            client.put(&item.collection, doc).await
        }
        ChangeKind::Delete => {
            let id = item.document_id().ok_or_else(|| {
                StoreError::Sync(format!("queued delete {} has no id", item.id))
            })?;
            client.delete(&item.collection, id).await.map(|_| ())
        }
        ChangeKind::Clear => Ok(()),
    }
}

fn spawn_delivery(client: RestClient, request: ProcessRequest) {
    tokio::spawn(async move {
        let item = request.item();
        match deliver(&client, item).await {
            Ok(()) => {
                debug!(item = %item.id, "Delivered to REST endpoint");
                request.resolve();
            }
            Err(e) => {
                debug!(item = %item.id, error = %e, "REST delivery failed");
                request.reject(e.to_string());
            }
        }
    });
}

#[async_trait]
impl Plugin for RestSync {
    fn name(&self) -> &str {
        "rest-sync"
    }

    fn provides(&self) -> &[Operation] {
        &[]
    }

    async fn install(&self, collection: &Collection) -> Result<(), StoreError> {
        let name = collection.name().to_string();

        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        let queue = self.queue.clone();
        let forward_name = name.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(outgoing) = rx.recv().await {
                if let Err(e) = queue
                    .add(
                        outgoing.operation,
                        &forward_name,
                        outgoing.doc,
                        outgoing.doc_id,
                    )
                    .await
                {
                    warn!(collection = %forward_name, error = %e, "Failed to queue local change");
                }
            }
        });

        let listener_name = name.clone();
        let change_listener = collection.on_change(move |event| {
            if !event.is_local() {
                return;
            }
            let outgoing = match event.operation {
                ChangeKind::Put => Outgoing {
                    operation: ChangeKind::Put,
                    doc: event.document.clone(),
                    doc_id: event.id.clone(),
                },
                ChangeKind::Delete => Outgoing {
                    operation: ChangeKind::Delete,
                    doc: None,
                    doc_id: event.id.clone(),
                },
                ChangeKind::Clear => {
                    warn!(
                        collection = %listener_name,
                        "Clear is not propagated to the REST endpoint"
                    );
                    return;
                }
            };
            let _ = tx.send(outgoing);
        });

        let client = self.client.clone();
        let process_name = name.clone();
        let process_listener = self.queue.on_event(move |event| {
            if let QueueEvent::Process(request) = event {
                if request.item().collection == process_name {
                    spawn_delivery(client.clone(), request.clone());
                }
            }
        });

        *self
            .attachment
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Attachment {
            name: name.clone(),
            collection: collection.downgrade(),
            change_listener,
            process_listener,
            forwarder,
        });
        info!(
            collection = %name,
            endpoint = %self.client.config().base_url,
            "REST sync attached"
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
            attachment.forwarder.abort();
            self.queue.off(attachment.process_listener);
            if let Some(collection) = attachment.collection.upgrade() {
                collection.off(attachment.change_listener);
            }
            debug!(collection = %attachment.name, "REST sync detached");
        }
        Ok(())
    }
}
