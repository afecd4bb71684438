use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;

use super::item::QueueItem;

type Reply = oneshot::Sender<Result<(), String>>;

/// A delivery request for one queue item.
///
/// Clones share a single reply slot: the first `resolve` or `reject` wins and
/// later calls return `false`. If every clone is dropped without a reply the
/// attempt fails with a "no handler" error.
#[derive(Clone)]
pub struct ProcessRequest {
    item: QueueItem,
    reply: Arc<Mutex<Option<Reply>>>,
}

impl ProcessRequest {
    pub(crate) fn new(item: QueueItem, reply: Reply) -> Self {
        Self {
            item,
            reply: Arc::new(Mutex::new(Some(reply))),
        }
    }

    pub fn item(&self) -> &QueueItem {
        &self.item
    }

    /// Report successful delivery.
    pub fn resolve(&self) -> bool {
        self.respond(Ok(()))
    }

    /// Report failed delivery.
    pub fn reject(&self, error: impl Into<String>) -> bool {
        self.respond(Err(error.into()))
    }

    fn respond(&self, result: Result<(), String>) -> bool {
        let sender = self
            .reply
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for ProcessRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRequest")
            .field("item", &self.item.id)
            .finish_non_exhaustive()
    }
}

/// Events dispatched by the offline queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// An item was queued (or replaced a pending item with the same key).
    Add(QueueItem),
    /// A listener must deliver the item and resolve or reject the request.
    Process(ProcessRequest),
    /// An item was delivered and removed.
    Success(QueueItem),
    /// An item exhausted its retries and was dropped.
    Failed {
        item: QueueItem,
        error: String,
        attempts: u32,
    },
    /// A pass finished with nothing left to deliver.
    Drain,
    /// The oldest pending item is old and has failed at least once.
    Stalled { size: usize, oldest_age: Duration },
    Pause,
    Resume,
    /// Initialisation finished; carries the number of restored items.
    Ready { size: usize },
    Flush,
    Clear,
}

impl QueueEvent {
    /// Event name as exposed on the event surface, e.g. `queue:add`.
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::Add(_) => "queue:add",
            QueueEvent::Process(_) => "queue:process",
            QueueEvent::Success(_) => "queue:success",
            QueueEvent::Failed { .. } => "queue:failed",
            QueueEvent::Drain => "queue:drain",
            QueueEvent::Stalled { .. } => "queue:stalled",
            QueueEvent::Pause => "queue:pause",
            QueueEvent::Resume => "queue:resume",
            QueueEvent::Ready { .. } => "queue:ready",
            QueueEvent::Flush => "queue:flush",
            QueueEvent::Clear => "queue:clear",
        }
    }
}

/// Snapshot of queue state for dashboards and status bars.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub syncing: bool,
    pub paused: bool,
    pub online: bool,
    pub by_collection: BTreeMap<String, usize>,
    pub by_operation: BTreeMap<String, usize>,
    /// Items with at least one failed attempt
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeKind;
    use chrono::Utc;

    fn request() -> (ProcessRequest, oneshot::Receiver<Result<(), String>>) {
        let (tx, rx) = oneshot::channel();
        let item = QueueItem {
            id: "c:put:1".to_string(),
            operation: ChangeKind::Put,
            collection: "c".to_string(),
            doc: None,
            doc_id: Some("1".to_string()),
            timestamp: Utc::now(),
            attempts: 0,
            last_error: None,
            revision: 0,
            retry_at: None,
        };
        (ProcessRequest::new(item, tx), rx)
    }

    #[tokio::test]
    async fn test_first_reply_wins() {
        let (req, rx) = request();
        let clone = req.clone();
        assert!(clone.reject("boom"));
        assert!(!req.resolve());
        assert_eq!(rx.await.unwrap(), Err("boom".to_string()));
    }

    #[tokio::test]
    async fn test_dropped_request_closes_channel() {
        let (req, rx) = request();
        drop(req);
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(QueueEvent::Drain.name(), "queue:drain");
        assert_eq!(QueueEvent::Ready { size: 0 }.name(), "queue:ready");
    }
}
