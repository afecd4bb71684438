use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Age after which a pending item with failed attempts marks the queue stalled.
pub const STALL_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Where pending items live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Items are lost on restart.
    #[default]
    Memory,
    /// Items are mirrored to a [`QueueStore`](super::QueueStore) under the namespace.
    Durable,
}

/// Configuration for an [`OfflineQueue`](super::OfflineQueue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineQueueConfig {
    /// Attempts before an item is dropped and reported as failed
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further failure
    pub base_delay: Duration,
    /// Upper bound for the retry delay
    pub max_delay: Duration,
    /// In-memory or durable storage
    pub storage: StorageMode,
    /// Durable store namespace
    pub namespace: String,
    /// Start processing as soon as the queue is initialised
    pub auto_start: bool,
    /// How long to wait for a `process` listener to resolve or reject
    pub handler_timeout: Duration,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            storage: StorageMode::Memory,
            namespace: "docbase-queue".to_string(),
            auto_start: true,
            handler_timeout: Duration::from_secs(30),
        }
    }
}

impl OfflineQueueConfig {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.max_retries == 0 {
            return Err(StoreError::InvalidArgument(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(StoreError::InvalidArgument(format!(
                "base_delay {:?} exceeds max_delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        if self.namespace.is_empty() {
            return Err(StoreError::InvalidArgument(
                "namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Delay before the next attempt after `attempts` failures:
/// `base_delay * 2^(attempts - 1)`, capped at `max_delay`.
pub fn backoff_delay(config: &OfflineQueueConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    config
        .base_delay
        .checked_mul(1u32 << exponent)
        .unwrap_or(config.max_delay)
        .min(config.max_delay)
}
