use thiserror::Error;

/// Errors that can occur in collections, chains and the offline queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Collection \"{0}\" already exists")]
    AlreadyExists(String),

    #[error("Method \"{operation}\" not provided by any plugin in collection \"{collection}\"")]
    MethodNotProvided {
        operation: String,
        collection: String,
    },

    #[error("Chain for \"{operation}\" in collection \"{collection}\" has no further plugin")]
    ChainExhausted {
        operation: String,
        collection: String,
    },

    #[error("Collection \"{0}\" is closed")]
    Closed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
