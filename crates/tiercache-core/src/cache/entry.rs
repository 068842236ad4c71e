use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::elapsed_between;
use crate::utils::format_age;

/// How an entry may be served once its TTL has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// Never served past its TTL.
    #[default]
    CacheFirst,
    /// Served for up to twice its TTL, with a refresh expected meanwhile.
    StaleWhileRevalidate,
}

/// Result of checking an entry against the clock and the running version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Past TTL but still servable under stale-while-revalidate.
    Stale,
    Invalid,
}

impl Freshness {
    pub fn is_servable(self) -> bool {
        !matches!(self, Freshness::Invalid)
    }
}

/// The unit stored in every cache tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T = Value> {
    pub key: String,
    pub data: T,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "crate::utils::duration_ms")]
    pub ttl: Duration,
    /// Approximate size in bytes (length of the serialized payload).
    pub size: usize,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub version: String,
    pub strategy: CacheStrategy,
}

impl CacheEntry<Value> {
    pub fn new(
        key: impl Into<String>,
        data: Value,
        ttl: Duration,
        strategy: CacheStrategy,
        version: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let size = data.to_string().len();
        Self {
            key: key.into(),
            data,
            timestamp: now,
            ttl,
            size,
            access_count: 0,
            last_accessed: now,
            version: version.into(),
            strategy,
        }
    }
}

impl<T> CacheEntry<T> {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.timestamp, now)
    }

    pub fn freshness(&self, now: DateTime<Utc>, current_version: &str) -> Freshness {
        if self.version != current_version {
            return Freshness::Invalid;
        }

        let age = self.age(now);
        if age <= self.ttl {
            return Freshness::Fresh;
        }

        match self.strategy {
            CacheStrategy::CacheFirst => Freshness::Invalid,
            CacheStrategy::StaleWhileRevalidate => {
                if age < self.ttl.saturating_mul(2) {
                    Freshness::Stale
                } else {
                    Freshness::Invalid
                }
            }
        }
    }

    pub fn is_valid(&self, now: DateTime<Utc>, current_version: &str) -> bool {
        self.freshness(now, current_version).is_servable()
    }

    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        self.ttl.saturating_sub(self.age(now))
    }

    /// Record a read.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed = now;
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        format_age((now - self.timestamp).num_minutes())
    }
}
