//! Tiered caching of API payloads.
//!
//! This module provides the `CacheManager`, which reads and writes through
//! three tiers of decreasing speed and increasing durability:
//! - `LruStore`: bounded in-memory tier, strict LRU eviction
//! - `DurableStore`: async structured store that survives restarts
//!   (`FileStore` on disk, `MemoryDurableStore` in process)
//! - `FlatStore`: small synchronous fallback store
//!   (`FlatFileStore` on disk, `MemoryFlatStore` in process)
//!
//! Every entry carries a TTL, a strategy (cache-first or
//! stale-while-revalidate) and the version it was written under.

pub mod entry;
pub mod file_store;
pub mod lru;
pub mod manager;
pub mod memory_store;
pub mod store;

pub use entry::{CacheEntry, CacheStrategy, Freshness};
pub use file_store::{FileStore, FlatFileStore, DEFAULT_FLAT_QUOTA_BYTES};
pub use lru::{LruStats, LruStore};
pub use manager::{CacheManager, CacheStats, Lookup, SetOptions, Tier};
pub use memory_store::{MemoryDurableStore, MemoryFlatStore};
pub use store::{DurableStore, FlatStore, StorageError};
