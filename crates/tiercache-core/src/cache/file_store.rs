//! File-backed implementations of the persisted tiers.
//!
//! `FileStore` keeps one pretty-printed JSON file per key in a directory and
//! is the durable tier. `FlatFileStore` keeps every item in one JSON object
//! file with a byte ceiling, standing in for a small key/value area.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::store::{DurableStore, FlatStore, StorageError};

/// Default ceiling for `FlatFileStore` (5 MB).
pub const DEFAULT_FLAT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

const ENTRY_EXTENSION: &str = "json";

/// Map a cache key onto a filesystem-safe, collision-free file stem.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

pub struct FileStore {
    cache_dir: PathBuf,
}

impl FileStore {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{}", encode_key(key), ENTRY_EXTENSION))
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        Ok(())
    }

    async fn entry_files(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut files = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(ENTRY_EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let path = self.cache_path(key);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: CacheEntry = serde_json::from_str(&contents)?;
        Ok(Some(entry))
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        self.ensure_dir().await?;
        let contents = serde_json::to_string_pretty(entry)?;
        tokio::fs::write(self.cache_path(&entry.key), contents).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.cache_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let files = self.entry_files().await?;
        debug!(count = files.len(), dir = ?self.cache_dir, "Clearing durable cache files");
        for path in files {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.entry_files().await?.len())
    }
}

pub struct FlatFileStore {
    path: PathBuf,
    quota_bytes: usize,
    items: Mutex<BTreeMap<String, String>>,
}

impl FlatFileStore {
    /// Open (or lazily create) the store file at `path`.
    ///
    /// A missing file starts empty; an unreadable one is logged and replaced
    /// on the next write.
    pub fn open(path: impl Into<PathBuf>, quota_bytes: usize) -> Self {
        let path = path.into();
        let items = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(error = %e, path = ?path, "Flat store file is corrupt, starting empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            quota_bytes,
            items: Mutex::new(items),
        }
    }

    pub fn used_bytes(&self) -> usize {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        Self::footprint(&items)
    }

    fn footprint(items: &BTreeMap<String, String>) -> usize {
        items.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    fn persist(&self, items: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string(items)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}

impl FlatStore for FlatFileStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let current = Self::footprint(&items)
            - items.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
        let needed = key.len() + value.len();
        if current + needed > self.quota_bytes {
            return Err(StorageError::QuotaExceeded {
                needed,
                available: self.quota_bytes.saturating_sub(current),
            });
        }
        items.insert(key.to_string(), value.to_string());
        self.persist(&items)
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if items.remove(key).is_some() {
            self.persist(&items)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        Ok(items.keys().cloned().collect())
    }
}
