use std::path::{Path, PathBuf};

use async_trait::async_trait;
use docbase_core::queue::{QueueItem, QueueStore};
use docbase_core::StoreError;

use crate::file::path_segment;
use tokio::fs;
use tracing::{debug, instrument};

/// Durable queue store writing one JSON file per namespace.
///
/// ```text
/// {base_dir}/{namespace}.queue.json
/// ```
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    base_dir: PathBuf,
}

impl FileQueueStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn queue_path(&self, namespace: &str) -> Result<PathBuf, StoreError> {
        let namespace = path_segment("queue namespace", namespace)?;
        Ok(self.base_dir.join(format!("{}.queue.json", namespace)))
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self), level = "debug")]
    async fn load(&self, namespace: &str) -> Result<Vec<QueueItem>, StoreError> {
        let path = self.queue_path(namespace)?;
        match fs::read_to_string(&path).await {
            Ok(content) => {
                let items: Vec<QueueItem> = serde_json::from_str(&content)?;
                debug!(path = %path.display(), items = items.len(), "Loaded queue file");
                Ok(items)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self, items), level = "debug", fields(items = items.len()))]
    async fn save(&self, namespace: &str, items: &[QueueItem]) -> Result<(), StoreError> {
        let path = self.queue_path(namespace)?;
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            StoreError::Io(format!(
                "Failed to create dir {}: {}",
                self.base_dir.display(),
                e
            ))
        })?;

        let json = serde_json::to_string_pretty(items)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &json).await.map_err(|e| {
            StoreError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            StoreError::Io(format!("Failed to rename queue file: {}", e))
        })?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn clear(&self, namespace: &str) -> Result<(), StoreError> {
        let path = self.queue_path(namespace)?;
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
}
