use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use docbase_core::{
    Collection, Document, Operation, Plugin, PutNext, StoreError, WeakCollection, WriteOptions,
};
use serde_json::Value;
use tracing::instrument;

pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";

/// Stamps `createdAt` and `updatedAt` on every local `put`.
///
/// `createdAt` keeps the value already on the incoming document, then the
/// stored one (read through the collection's `get` chain), and is otherwise
/// set to now. `updatedAt` is RFC 3339 with millisecond precision and strictly
/// increases across writes made through this plugin. Remote writes pass
/// through untouched. Always calls `next`.
#[derive(Debug, Default)]
pub struct Timestamps {
    collection: OnceLock<WeakCollection>,
    last: Mutex<Option<DateTime<Utc>>>,
}

impl Timestamps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Now, bumped by a millisecond if the clock has not moved since the
    /// previous write.
    fn next_instant(&self) -> DateTime<Utc> {
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Utc::now();
        let next = match *last {
            Some(previous) if now <= previous => previous + Duration::milliseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }

    async fn stored_created_at(&self, id: &str) -> Result<Option<Value>, StoreError> {
        let Some(collection) = self.collection.get().and_then(WeakCollection::upgrade) else {
            return Ok(None);
        };
        if !collection.provides(Operation::Get) {
            return Ok(None);
        }
        Ok(collection
            .get(id)
            .await?
            .and_then(|stored| stored.get(CREATED_AT).cloned()))
    }
}

#[async_trait]
impl Plugin for Timestamps {
    fn name(&self) -> &str {
        "timestamps"
    }

    fn provides(&self) -> &[Operation] {
        &[Operation::Put]
    }

    async fn install(&self, collection: &Collection) -> Result<(), StoreError> {
        self.collection
            .set(collection.downgrade())
            .map_err(|_| StoreError::Plugin("timestamps plugin is already installed".to_string()))
    }

    #[instrument(skip(self, next, doc, opts), level = "debug", fields(id = ?doc.id()))]
    async fn put(
        &self,
        next: PutNext,
        mut doc: Document,
        opts: WriteOptions,
    ) -> Result<Document, StoreError> {
        if opts.remote {
            return next.call((doc, opts)).await;
        }

        let stamp = self.next_instant();
        let formatted = Value::String(stamp.to_rfc3339_opts(SecondsFormat::Millis, true));

        if !doc.contains_key(CREATED_AT) {
            let created = match self.stored_created_at(doc.require_id()?).await? {
                Some(existing) => existing,
                None => formatted.clone(),
            };
            doc.insert(CREATED_AT, created);
        }
        doc.insert(UPDATED_AT, formatted);

        next.call((doc, opts)).await
    }
}
