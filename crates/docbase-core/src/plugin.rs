use std::fmt;

use async_trait::async_trait;

use crate::chain::Next;
use crate::collection::Collection;
use crate::document::{Document, SearchOptions, WriteOptions};
use crate::error::StoreError;

/// The six chainable collection operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    GetAll,
    Put,
    Delete,
    Clear,
    Search,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Get,
        Operation::GetAll,
        Operation::Put,
        Operation::Delete,
        Operation::Clear,
        Operation::Search,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::GetAll => "getAll",
            Operation::Put => "put",
            Operation::Delete => "delete",
            Operation::Clear => "clear",
            Operation::Search => "search",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations a terminal storage plugin is expected to provide.
pub const STORAGE_OPERATIONS: &[Operation] = &[
    Operation::Get,
    Operation::GetAll,
    Operation::Put,
    Operation::Delete,
    Operation::Clear,
];

pub type GetNext = Next<String, Option<Document>>;
pub type GetAllNext = Next<(), Vec<Document>>;
pub type PutNext = Next<(Document, WriteOptions), Document>;
pub type DeleteNext = Next<(String, WriteOptions), ()>;
pub type ClearNext = Next<(), ()>;
pub type SearchNext = Next<(String, SearchOptions), Vec<Document>>;

/// A stage in a collection's operation chains.
///
/// A plugin declares the operations it handles through [`Plugin::provides`];
/// the chain builder only routes those operations to it. Each handler gets a
/// continuation into the rest of the chain as its first argument. Calling it
/// forwards (possibly rewritten) arguments downstream and returns the
/// downstream result, so code after `next.call(..).await` runs once every
/// later plugin has finished.
///
/// A terminal plugin (usually storage) must not call `next`; doing so fails
/// with [`StoreError::ChainExhausted`]. A non-terminal plugin that never calls
/// `next` short-circuits the chain. Each implementation documents which of the
/// two it is.
///
/// The default handler bodies pass straight through to `next`.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin identifier used in logs and teardown reports.
    fn name(&self) -> &str;

    /// Operations this plugin participates in.
    fn provides(&self) -> &[Operation];

    /// Called once, in plugin order, before the collection is handed out.
    /// An error aborts collection construction.
    async fn install(&self, _collection: &Collection) -> Result<(), StoreError> {
        Ok(())
    }

    /// Called once, in plugin order, when the collection closes.
    /// Errors are logged and do not stop the remaining plugins.
    async fn destroy(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, next: GetNext, id: String) -> Result<Option<Document>, StoreError> {
        next.call(id).await
    }

    async fn get_all(&self, next: GetAllNext) -> Result<Vec<Document>, StoreError> {
        next.call(()).await
    }

    async fn put(
        &self,
        next: PutNext,
        doc: Document,
        opts: WriteOptions,
    ) -> Result<Document, StoreError> {
        next.call((doc, opts)).await
    }

    async fn delete(
        &self,
        next: DeleteNext,
        id: String,
        opts: WriteOptions,
    ) -> Result<(), StoreError> {
        next.call((id, opts)).await
    }

    async fn clear(&self, next: ClearNext) -> Result<(), StoreError> {
        next.call(()).await
    }

    async fn search(
        &self,
        next: SearchNext,
        query: String,
        opts: SearchOptions,
    ) -> Result<Vec<Document>, StoreError> {
        next.call((query, opts)).await
    }
}
