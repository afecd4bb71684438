use std::fmt;
use std::sync::Arc;

use docbase_core::Document;

type ResolveFn = dyn Fn(Option<&Document>, &Document) -> Document + Send + Sync;

/// Decides what to store when a pulled remote document meets local state.
///
/// There is no built-in merge. A field-level merge is a [`ConflictResolver::Custom`]
/// supplied by the caller.
#[derive(Clone, Default)]
pub enum ConflictResolver {
    /// The remote document replaces the local one.
    #[default]
    RemoteWins,
    /// An existing local document is kept; unknown documents are taken.
    LocalWins,
    /// Caller-supplied policy receiving `(local, remote)`.
    Custom(Arc<ResolveFn>),
}

impl ConflictResolver {
    pub fn custom<F>(resolve: F) -> Self
    where
        F: Fn(Option<&Document>, &Document) -> Document + Send + Sync + 'static,
    {
        ConflictResolver::Custom(Arc::new(resolve))
    }

    /// The document to store, or `None` to keep local state untouched.
    pub fn resolve(&self, local: Option<&Document>, remote: &Document) -> Option<Document> {
        match self {
            ConflictResolver::RemoteWins => Some(remote.clone()),
            ConflictResolver::LocalWins => match local {
                Some(_) => None,
                None => Some(remote.clone()),
            },
            ConflictResolver::Custom(resolve) => Some(resolve(local, remote)),
        }
    }
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictResolver::RemoteWins => f.write_str("RemoteWins"),
            ConflictResolver::LocalWins => f.write_str("LocalWins"),
            ConflictResolver::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
