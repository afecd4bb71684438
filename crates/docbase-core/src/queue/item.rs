use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::document::Document;
use crate::error::StoreError;
use crate::events::ChangeKind;

/// Id used in the identity key of a queued `clear`.
pub const CLEAR_ALL_ID: &str = "*";

/// One pending write destined for an external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Identity key: `{collection}:{operation}:{document id}`
    pub id: String,
    /// Write kind
    pub operation: ChangeKind,
    /// Collection the write belongs to
    pub collection: String,
    /// Payload for `put`
    #[serde(default)]
    pub doc: Option<Document>,
    /// Explicit document id (deletes)
    #[serde(default)]
    pub doc_id: Option<String>,
    /// When the item was queued
    pub timestamp: DateTime<Utc>,
    /// Failed delivery attempts so far
    #[serde(default)]
    pub attempts: u32,
    /// Message of the last failed attempt
    #[serde(default)]
    pub last_error: Option<String>,
    /// Bumped every time the key is re-queued; guards in-flight results
    #[serde(skip)]
    pub(crate) revision: u64,
    /// Earliest instant the next attempt may run
    #[serde(skip)]
    pub(crate) retry_at: Option<Instant>,
}

impl QueueItem {
    /// A fresh item queued now.
    ///
    /// The id comes from `doc_id`, then from `doc`; a `clear` without either
    /// targets [`CLEAR_ALL_ID`].
    pub fn new(
        operation: ChangeKind,
        collection: impl Into<String>,
        doc: Option<Document>,
        doc_id: Option<String>,
    ) -> Result<Self, StoreError> {
        let collection = collection.into();
        let document_id = doc_id
            .clone()
            .or_else(|| doc.as_ref().and_then(Document::id).map(str::to_string));
        let document_id = match (document_id, operation) {
            (Some(id), _) => id,
            (None, ChangeKind::Clear) => CLEAR_ALL_ID.to_string(),
            (None, _) => {
                return Err(StoreError::InvalidArgument(format!(
                    "cannot queue {} for {} without a document id",
                    operation, collection
                )))
            }
        };

        Ok(Self {
            id: Self::key(&collection, operation, &document_id),
            operation,
            collection,
            doc,
            doc_id,
            timestamp: Utc::now(),
            attempts: 0,
            last_error: None,
            revision: 0,
            retry_at: None,
        })
    }

    /// Identity key for a write.
    pub fn key(collection: &str, operation: ChangeKind, document_id: &str) -> String {
        format!("{}:{}:{}", collection, operation, document_id)
    }

    /// The targeted document id: explicit `doc_id` first, then the payload's id.
    pub fn document_id(&self) -> Option<&str> {
        self.doc_id
            .as_deref()
            .or_else(|| self.doc.as_ref().and_then(Document::id))
    }

    pub fn has_failed(&self) -> bool {
        self.attempts > 0
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| at <= now)
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
        self.last_error = None;
        self.retry_at = None;
    }
}
