use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Field every document must carry.
pub const ID_FIELD: &str = "id";

/// A schema-free document with a mandatory string `id`.
///
/// Documents are plain JSON objects. Plugins may add, strip or rewrite
/// fields; only the `id` is required by the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Create a document holding only its id.
    pub fn new(id: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(ID_FIELD.to_string(), Value::String(id.into()));
        Self(fields)
    }

    /// Build a document from an arbitrary JSON value.
    ///
    /// Fails unless the value is an object with a non-empty string `id`.
    pub fn from_value(value: Value) -> Result<Self, StoreError> {
        match value {
            Value::Object(fields) => {
                let doc = Self(fields);
                doc.require_id()?;
                Ok(doc)
            }
            other => Err(StoreError::InvalidArgument(format!(
                "document must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// The document id, if present and a non-empty string.
    pub fn id(&self) -> Option<&str> {
        self.0
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    /// The document id, or an `InvalidArgument` error.
    pub fn require_id(&self) -> Result<&str, StoreError> {
        self.id().ok_or_else(|| {
            StoreError::InvalidArgument("document is missing a non-empty string id".to_string())
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.into_value()
    }
}

/// Options for `put` and `delete`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    /// The write mirrors an externally-originated change and must not emit
    /// a local change event.
    #[serde(default)]
    pub remote: bool,
    /// Origin tag carried by plugins that replay remote writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl WriteOptions {
    /// Options for applying a write that came from `source`.
    pub fn remote(source: impl Into<String>) -> Self {
        Self {
            remote: true,
            source: Some(source.into()),
        }
    }
}

/// Options for `search`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Restrict matching to these fields; empty means all fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}
