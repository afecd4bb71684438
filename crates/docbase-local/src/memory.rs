use async_trait::async_trait;
use dashmap::DashMap;
use docbase_core::{
    ClearNext, DeleteNext, Document, GetAllNext, GetNext, Operation, Plugin, PutNext,
    SearchNext, SearchOptions, StoreError, WriteOptions,
};
use serde_json::Value;
use tracing::{debug, instrument};

const OPERATIONS: &[Operation] = &[
    Operation::Get,
    Operation::GetAll,
    Operation::Put,
    Operation::Delete,
    Operation::Clear,
    Operation::Search,
];

/// Terminal in-memory store.
///
/// Documents are cloned on the way in and out, so callers can keep mutating
/// the values they passed. Never calls `next`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: DashMap<String, Document>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn sorted(&self) -> Vec<Document> {
        let mut docs: Vec<Document> = self.docs.iter().map(|e| e.value().clone()).collect();
        docs.sort_by(|a, b| a.id().cmp(&b.id()));
        docs
    }
}

/// Case-insensitive substring match over string fields.
fn contains_text(doc: &Document, needle: &str, fields: &[String]) -> bool {
    doc.fields()
        .iter()
        .filter(|(key, _)| fields.is_empty() || fields.iter().any(|f| f == *key))
        .any(|(_, value)| match value {
            Value::String(s) => s.to_lowercase().contains(needle),
            _ => false,
        })
}

#[async_trait]
impl Plugin for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn provides(&self) -> &[Operation] {
        OPERATIONS
    }

    #[instrument(skip(self, _next), level = "debug")]
    async fn get(&self, _next: GetNext, id: String) -> Result<Option<Document>, StoreError> {
        Ok(self.docs.get(&id).map(|doc| doc.value().clone()))
    }

    async fn get_all(&self, _next: GetAllNext) -> Result<Vec<Document>, StoreError> {
        Ok(self.sorted())
    }

    #[instrument(skip(self, _next, doc, _opts), level = "debug")]
    async fn put(
        &self,
        _next: PutNext,
        doc: Document,
        _opts: WriteOptions,
    ) -> Result<Document, StoreError> {
        let id = doc.require_id()?.to_string();
        self.docs.insert(id.clone(), doc.clone());
        debug!(id = %id, "Stored document in memory");
        Ok(doc)
    }

    #[instrument(skip(self, _next, _opts), level = "debug")]
    async fn delete(
        &self,
        _next: DeleteNext,
        id: String,
        _opts: WriteOptions,
    ) -> Result<(), StoreError> {
        self.docs.remove(&id);
        Ok(())
    }

    async fn clear(&self, _next: ClearNext) -> Result<(), StoreError> {
        self.docs.clear();
        Ok(())
    }

    #[instrument(skip(self, _next, opts), level = "debug")]
    async fn search(
        &self,
        _next: SearchNext,
        query: String,
        opts: SearchOptions,
    ) -> Result<Vec<Document>, StoreError> {
        let needle = query.to_lowercase();
        let hits = self
            .sorted()
            .into_iter()
            .filter(|doc| contains_text(doc, &needle, &opts.fields));
        Ok(match opts.limit {
            Some(limit) => hits.take(limit).collect(),
            None => hits.collect(),
        })
    }
}
