//! Bounded in-memory tier with strict least-recently-used eviction.
//!
//! Entries live in a slot arena linked into a recency list by index
//! (`head` is most recently used, `tail` least). Freed slots are reused
//! through a free list, so `get`, `set` and eviction are all O(1).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::entry::CacheEntry;

#[derive(Debug)]
struct Node {
    entry: CacheEntry,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LruStats {
    pub entries: usize,
    pub total_size: usize,
}

#[derive(Debug)]
pub struct LruStore {
    capacity: usize,
    total_size: usize,
    index: HashMap<String, usize>,
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruStore {
    /// Create a store holding at most `capacity` bytes of entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            total_size: 0,
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn stats(&self) -> LruStats {
        LruStats {
            entries: self.index.len(),
            total_size: self.total_size,
        }
    }

    /// Look up an entry, marking it most recently used and counting the access.
    pub fn get(&mut self, key: &str, now: DateTime<Utc>) -> Option<&CacheEntry> {
        let idx = *self.index.get(key)?;
        self.move_to_front(idx);
        let node = self.slots[idx].as_mut()?;
        node.entry.touch(now);
        Some(&node.entry)
    }

    /// Look up an entry without touching recency or access counters.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        let idx = *self.index.get(key)?;
        self.slots[idx].as_ref().map(|node| &node.entry)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Insert or replace an entry, then evict from the cold end until the
    /// store fits its capacity again.
    ///
    /// Returns the keys evicted to make room. An entry larger than the whole
    /// capacity is not stored (any older value under that key is dropped).
    pub fn set(&mut self, key: &str, entry: CacheEntry) -> Vec<String> {
        if entry.size > self.capacity {
            debug!(key = %key, size = entry.size, capacity = self.capacity, "Entry exceeds LRU capacity, not stored");
            self.remove(key);
            return Vec::new();
        }

        if let Some(&idx) = self.index.get(key) {
            if let Some(node) = self.slots[idx].as_mut() {
                self.total_size = self.total_size - node.entry.size + entry.size;
                node.entry = entry;
            }
            self.move_to_front(idx);
        } else {
            self.total_size += entry.size;
            let node = Node {
                entry,
                prev: None,
                next: None,
            };
            let idx = match self.free.pop() {
                Some(idx) => {
                    self.slots[idx] = Some(node);
                    idx
                }
                None => {
                    self.slots.push(Some(node));
                    self.slots.len() - 1
                }
            };
            self.index.insert(key.to_string(), idx);
            self.push_front(idx);
        }

        let mut evicted = Vec::new();
        while self.total_size > self.capacity {
            match self.pop_back() {
                Some(entry) => evicted.push(entry.key),
                None => break,
            }
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), total_size = self.total_size, "Evicted least recently used entries");
        }
        evicted
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let idx = self.index.remove(key)?;
        self.unlink(idx);
        let node = self.slots[idx].take()?;
        self.free.push(idx);
        self.total_size -= node.entry.size;
        Some(node.entry)
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.total_size = 0;
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            match self.slots[idx].as_ref() {
                Some(node) => {
                    keys.push(node.entry.key.clone());
                    cursor = node.next;
                }
                None => break,
            }
        }
        keys
    }

    fn pop_back(&mut self) -> Option<CacheEntry> {
        let idx = self.tail?;
        let key = self.slots[idx].as_ref()?.entry.key.clone();
        self.remove(&key)
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.slots[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.slots[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.slots[idx].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.slots[idx].as_mut() {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.slots[h].as_mut() {
                node.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }
}
