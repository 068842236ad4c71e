use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::CacheConfig;

use super::entry::{CacheEntry, CacheStrategy, Freshness};
use super::lru::LruStore;
use super::store::{DurableStore, FlatStore, StorageError};

/// Per-write options; unset fields fall back to the configured defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub strategy: Option<CacheStrategy>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            strategy: None,
        }
    }

    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Memory,
    Durable,
    Flat,
}

/// A successful read, with where it came from and whether it is past TTL.
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup<T> {
    pub data: T,
    pub stale: bool,
    pub tier: Tier,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CacheStats {
    pub hit_rate: f64,
    /// Bytes held by the in-memory tier.
    pub size: usize,
    /// Entries held by the in-memory tier.
    pub entries: usize,
}

/// Coordinates reads and writes across the memory, durable and flat tiers.
///
/// Reads go memory -> durable -> flat and promote valid hits upward. Writes
/// go to every tier; persisted-tier failures are logged and skipped.
pub struct CacheManager {
    memory: Mutex<LruStore>,
    durable: Option<Arc<dyn DurableStore>>,
    flat: Option<Arc<dyn FlatStore>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheManager {
    /// A manager with only the in-memory tier. Attach persisted tiers with
    /// `with_durable` and `with_flat`.
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            memory: Mutex::new(LruStore::new(config.memory_capacity_bytes)),
            durable: None,
            flat: None,
            config,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_durable(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn with_flat(mut self, store: Arc<dyn FlatStore>) -> Self {
        self.flat = Some(store);
        self
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    fn memory(&self) -> MutexGuard<'_, LruStore> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flat_key(&self, key: &str) -> String {
        format!("{}{}", self.config.flat_key_prefix, key)
    }

    // ===== Reads =====

    /// Read a value, or `None` if no tier holds a valid entry for `key`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.lookup(key).await.map(|found| found.data)
    }

    /// Like `get`, but also reports the serving tier and staleness.
    pub async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<Lookup<T>> {
        let found = self.lookup_entry(key).await;
        let result = found.and_then(|(entry, freshness, tier)| {
            match serde_json::from_value::<T>(entry.data) {
                Ok(data) => Some(Lookup {
                    data,
                    stale: freshness == Freshness::Stale,
                    tier,
                }),
                Err(e) => {
                    debug!(key = %key, error = %e, "Cached value does not match requested type");
                    None
                }
            }
        });

        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn lookup_entry(&self, key: &str) -> Option<(CacheEntry, Freshness, Tier)> {
        let now = self.clock.now();
        let version = self.config.version.as_str();

        {
            let mut memory = self.memory();
            if let Some(entry) = memory.get(key, now) {
                let freshness = entry.freshness(now, version);
                if freshness.is_servable() {
                    return Some((entry.clone(), freshness, Tier::Memory));
                }
                debug!(key = %key, "Dropping invalid memory entry");
                memory.remove(key);
            }
        }

        if let Some(durable) = &self.durable {
            match durable.get(key).await {
                Ok(Some(mut entry)) => {
                    let freshness = entry.freshness(now, version);
                    if freshness.is_servable() {
                        debug!(key = %key, "Durable tier hit, promoting to memory");
                        entry.touch(now);
                        self.memory().set(key, entry.clone());
                        return Some((entry, freshness, Tier::Durable));
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Durable tier read failed"),
            }
        }

        if let Some(flat) = &self.flat {
            match self.read_flat(flat.as_ref(), key) {
                Ok(Some(mut entry)) => {
                    let freshness = entry.freshness(now, version);
                    if freshness.is_servable() {
                        debug!(key = %key, "Flat tier hit, promoting to memory and durable");
                        entry.touch(now);
                        self.memory().set(key, entry.clone());
                        self.write_durable(&entry).await;
                        return Some((entry, freshness, Tier::Flat));
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Flat tier read failed"),
            }
        }

        None
    }

    fn read_flat(&self, flat: &dyn FlatStore, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        match flat.get_item(&self.flat_key(key))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// True iff the memory tier holds a servable entry for `key`.
    pub fn is_valid(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.memory()
            .peek(key)
            .map(|entry| entry.is_valid(now, &self.config.version))
            .unwrap_or(false)
    }

    /// Time until the memory-tier entry for `key` passes its TTL; zero if absent.
    pub fn get_remaining_ttl(&self, key: &str) -> Duration {
        let now = self.clock.now();
        self.memory()
            .peek(key)
            .map(|entry| entry.remaining_ttl(now))
            .unwrap_or(Duration::ZERO)
    }

    pub fn get_stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let lru = self.memory().stats();
        CacheStats {
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            size: lru.total_size,
            entries: lru.entries,
        }
    }

    // ===== Writes =====

    /// Serialize `data` and write it through every tier.
    ///
    /// Only a serialization failure is reported; tier failures are logged.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        options: SetOptions,
    ) -> Result<(), StorageError> {
        let value = serde_json::to_value(data)?;
        self.set_json(key, value, options).await;
        Ok(())
    }

    pub async fn set_json(&self, key: &str, data: Value, options: SetOptions) {
        let entry = CacheEntry::new(
            key,
            data,
            options.ttl.unwrap_or(self.config.default_ttl),
            options.strategy.unwrap_or_default(),
            self.config.version.clone(),
            self.clock.now(),
        );

        self.memory().set(key, entry.clone());
        self.write_durable(&entry).await;
        self.write_flat(&entry);
    }

    async fn write_durable(&self, entry: &CacheEntry) {
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.put(entry).await {
                warn!(key = %entry.key, error = %e, "Durable tier write failed, skipping");
            }
        }
    }

    fn write_flat(&self, entry: &CacheEntry) {
        let Some(flat) = &self.flat else {
            return;
        };

        let serialized = match serde_json::to_string(entry) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "Failed to serialize entry for flat tier");
                return;
            }
        };

        if serialized.len() > self.config.flat_max_entry_bytes {
            warn!(
                key = %entry.key,
                size = serialized.len(),
                limit = self.config.flat_max_entry_bytes,
                "Entry too large for flat tier, skipping"
            );
            return;
        }

        if let Err(e) = flat.set_item(&self.flat_key(&entry.key), &serialized) {
            warn!(key = %entry.key, error = %e, "Flat tier write failed, skipping");
        }
    }

    /// Remove `key` from every tier.
    pub async fn remove(&self, key: &str) {
        self.memory().remove(key);
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.remove(key).await {
                warn!(key = %key, error = %e, "Durable tier remove failed");
            }
        }
        if let Some(flat) = &self.flat {
            if let Err(e) = flat.remove_item(&self.flat_key(key)) {
                warn!(key = %key, error = %e, "Flat tier remove failed");
            }
        }
    }

    /// Drop only the in-memory tier; persisted tiers keep serving.
    pub fn clear_memory(&self) {
        self.memory().clear();
    }

    pub async fn clear(&self) {
        self.clear_memory();

        if let Some(durable) = &self.durable {
            if let Err(e) = durable.clear().await {
                warn!(error = %e, "Failed to clear durable tier");
            }
        }

        if let Some(flat) = &self.flat {
            match flat.keys() {
                Ok(keys) => {
                    for key in keys
                        .iter()
                        .filter(|k| k.starts_with(&self.config.flat_key_prefix))
                    {
                        if let Err(e) = flat.remove_item(key) {
                            warn!(key = %key, error = %e, "Failed to clear flat tier item");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to list flat tier keys"),
            }
        }

        debug!("Cache cleared");
    }
}

// ============================================================================
// Tests
// ============================================================================
