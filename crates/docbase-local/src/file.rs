use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use docbase_core::{
    ClearNext, Collection, DeleteNext, Document, GetAllNext, GetNext, Operation, Plugin,
    PutNext, StoreError, WriteOptions, STORAGE_OPERATIONS,
};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, instrument, warn};

/// Check that `name` is usable as a single directory or file name under a
/// base directory.
pub(crate) fn path_segment<'a>(kind: &str, name: &'a str) -> Result<&'a str, StoreError> {
    let escapes = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if escapes {
        return Err(StoreError::InvalidArgument(format!(
            "{} {:?} is not a valid path segment",
            kind, name
        )));
    }
    Ok(name)
}

/// Terminal store keeping one JSON file per document.
///
/// Layout:
/// ```text
/// {base_dir}/
///   {collection}/
///     {sha256(id)}.json
/// ```
/// Writes go to a temp file that is renamed into place. Never calls `next`.
#[derive(Debug)]
pub struct FileStore {
    base_dir: PathBuf,
    dir: OnceLock<PathBuf>,
}

impl FileStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            dir: OnceLock::new(),
        }
    }

    /// Directory of the installed collection.
    fn dir(&self) -> Result<&Path, StoreError> {
        self.dir
            .get()
            .map(PathBuf::as_path)
            .ok_or_else(|| StoreError::Internal("file store used before install".to_string()))
    }

    fn document_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        let name = hex::encode(Sha256::digest(id.as_bytes()));
        Ok(self.dir()?.join(format!("{}.json", name)))
    }

    async fn read_document(path: &Path) -> Result<Option<Document>, StoreError> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Paths of every stored document, skipping temp files.
    async fn document_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.dir()?;
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "Failed to read dir {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Io(format!("Failed to read entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

#[async_trait]
impl Plugin for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    fn provides(&self) -> &[Operation] {
        STORAGE_OPERATIONS
    }

    async fn install(&self, collection: &Collection) -> Result<(), StoreError> {
        let dir = self
            .base_dir
            .join(path_segment("collection name", collection.name())?);
        fs::create_dir_all(&dir).await.map_err(|e| {
            StoreError::Io(format!("Failed to create dir {}: {}", dir.display(), e))
        })?;
        debug!(dir = %dir.display(), "File store ready");
        self.dir
            .set(dir)
            .map_err(|_| StoreError::Plugin("file store is already installed".to_string()))
    }

    #[instrument(skip(self, _next), level = "debug")]
    async fn get(&self, _next: GetNext, id: String) -> Result<Option<Document>, StoreError> {
        let path = self.document_path(&id)?;
        Self::read_document(&path).await
    }

    #[instrument(skip(self, _next), level = "debug")]
    async fn get_all(&self, _next: GetAllNext) -> Result<Vec<Document>, StoreError> {
        let mut docs = Vec::new();
        for path in self.document_paths().await? {
            match Self::read_document(&path).await {
                Ok(Some(doc)) => docs.push(doc),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable document"),
            }
        }
        docs.sort_by(|a, b| a.id().cmp(&b.id()));
        Ok(docs)
    }

    #[instrument(skip(self, _next, doc, _opts), level = "debug", fields(id = ?doc.id()))]
    async fn put(
        &self,
        _next: PutNext,
        doc: Document,
        _opts: WriteOptions,
    ) -> Result<Document, StoreError> {
        let path = self.document_path(doc.require_id()?)?;
        let json = serde_json::to_string_pretty(&doc)?;

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &json).await.map_err(|e| {
            StoreError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            StoreError::Io(format!("Failed to rename to {}: {}", path.display(), e))
        })?;

        debug!(path = %path.display(), bytes = json.len(), "Saved document");
        Ok(doc)
    }

    #[instrument(skip(self, _next, _opts), level = "debug")]
    async fn delete(
        &self,
        _next: DeleteNext,
        id: String,
        _opts: WriteOptions,
    ) -> Result<(), StoreError> {
        let path = self.document_path(&id)?;
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(StoreError::Io(format!(
                    "Failed to delete {}: {}",
                    path.display(),
                    e
                )));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, _next), level = "debug")]
    async fn clear(&self, _next: ClearNext) -> Result<(), StoreError> {
        let paths = self.document_paths().await?;
        let count = paths.len();
        for path in paths {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(StoreError::Io(format!(
                        "Failed to delete {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }
        debug!(removed = count, "Cleared file store");
        Ok(())
    }
}
