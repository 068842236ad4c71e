//! Contracts for the persisted cache tiers.

use async_trait::async_trait;
use thiserror::Error;

use super::entry::CacheEntry;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize stored entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// The durable, structured tier. Larger than the flat tier and survives
/// restarts; every operation may suspend.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError>;

    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;

    /// Number of stored entries, for diagnostics.
    async fn len(&self) -> Result<usize, StorageError>;
}

/// The flat, synchronous string store used as a last resort.
///
/// Implementations have a practical size ceiling and report
/// `StorageError::QuotaExceeded` instead of growing past it.
pub trait FlatStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    fn keys(&self) -> Result<Vec<String>, StorageError>;
}
