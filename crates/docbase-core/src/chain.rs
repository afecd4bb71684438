use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::document::{Document, SearchOptions, WriteOptions};
use crate::error::StoreError;
use crate::plugin::{Operation, Plugin};

type Continuation<A, R> = dyn Fn(A) -> BoxFuture<'static, Result<R, StoreError>> + Send + Sync;

/// Continuation into the remainder of a chain.
///
/// Cloning is cheap; every clone invokes the same downstream pipeline.
pub struct Next<A, R> {
    f: Arc<Continuation<A, R>>,
}

impl<A, R> Clone for Next<A, R> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
        }
    }
}

impl<A, R> fmt::Debug for Next<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

impl<A, R> Next<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    /// Wrap an async function as a continuation.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, StoreError>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |args| -> BoxFuture<'static, Result<R, StoreError>> {
                Box::pin(f(args))
            }),
        }
    }

    /// A continuation that always fails with `error`.
    pub fn failing(error: StoreError) -> Self {
        Self::from_fn(move |_| {
            let error = error.clone();
            async move { Err(error) }
        })
    }

    /// Invoke the rest of the chain.
    pub async fn call(&self, args: A) -> Result<R, StoreError> {
        (self.f)(args).await
    }
}

type Invoke<A, R> =
    fn(Arc<dyn Plugin>, Next<A, R>, A) -> BoxFuture<'static, Result<R, StoreError>>;

/// Compose the handlers for `operation` into one callable pipeline.
///
/// Handlers are folded right to left: the last implementor is wrapped first
/// and every earlier one is wrapped around a continuation to the function
/// built so far. Execution therefore starts at the first implementor in list
/// order. Reversing the fold silently reverses plugin precedence.
fn compose<A, R>(
    collection: &str,
    operation: Operation,
    plugins: &[Arc<dyn Plugin>],
    invoke: Invoke<A, R>,
) -> Next<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    let handlers: Vec<Arc<dyn Plugin>> = plugins
        .iter()
        .filter(|plugin| plugin.provides().contains(&operation))
        .cloned()
        .collect();

    if handlers.is_empty() {
        return Next::failing(StoreError::MethodNotProvided {
            operation: operation.to_string(),
            collection: collection.to_string(),
        });
    }

    let exhausted = Next::failing(StoreError::ChainExhausted {
        operation: operation.to_string(),
        collection: collection.to_string(),
    });

    handlers
        .into_iter()
        .rev()
        .fold(exhausted, |downstream, plugin| Next {
            f: Arc::new(move |args| invoke(Arc::clone(&plugin), downstream.clone(), args)),
        })
}

/// The six precomputed chains of a collection.
///
/// Built once from a frozen plugin list and never modified.
#[derive(Debug, Clone)]
pub struct Chains {
    pub get: Next<String, Option<Document>>,
    pub get_all: Next<(), Vec<Document>>,
    pub put: Next<(Document, WriteOptions), Document>,
    pub delete: Next<(String, WriteOptions), ()>,
    pub clear: Next<(), ()>,
    pub search: Next<(String, SearchOptions), Vec<Document>>,
    provided: Vec<Operation>,
}

impl Chains {
    pub fn build(collection: &str, plugins: &[Arc<dyn Plugin>]) -> Self {
        let provided = Operation::ALL
            .into_iter()
            .filter(|op| plugins.iter().any(|p| p.provides().contains(op)))
            .collect();

        Self {
            get: compose(collection, Operation::Get, plugins, |plugin, next, id| {
                Box::pin(async move { plugin.get(next, id).await })
            }),
            get_all: compose(collection, Operation::GetAll, plugins, |plugin, next, ()| {
                Box::pin(async move { plugin.get_all(next).await })
            }),
            put: compose(collection, Operation::Put, plugins, |plugin, next, (doc, opts)| {
                Box::pin(async move { plugin.put(next, doc, opts).await })
            }),
            delete: compose(collection, Operation::Delete, plugins, |plugin, next, (id, opts)| {
                Box::pin(async move { plugin.delete(next, id, opts).await })
            }),
            clear: compose(collection, Operation::Clear, plugins, |plugin, next, ()| {
                Box::pin(async move { plugin.clear(next).await })
            }),
            search: compose(
                collection,
                Operation::Search,
                plugins,
                |plugin, next, (query, opts)| {
                    Box::pin(async move { plugin.search(next, query, opts).await })
                },
            ),
            provided,
        }
    }

    /// Whether at least one plugin implements `operation`.
    pub fn provides(&self, operation: Operation) -> bool {
        self.provided.contains(&operation)
    }
}
