use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheStrategy;

use super::CancelToken;

/// Dispatch priority. Batches run highest bucket first; `Critical` also
/// bypasses the batch window and the concurrency cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Background,
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Per-call knobs for `RequestScheduler::make_optimized_request`.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub priority: Priority,
    /// Cache and deduplication key; defaults to the endpoint.
    pub cache_key: Option<String>,
    /// Serve from cache when a valid entry exists.
    pub use_cache: bool,
    pub cache_ttl: Option<Duration>,
    pub strategy: Option<CacheStrategy>,
    /// Overrides the scheduler's configured retry count.
    pub max_retries: Option<u32>,
    /// Defer into the batch window. `false` dispatches immediately.
    pub batch: bool,
    pub headers: Vec<(String, String)>,
    pub cancel: Option<CancelToken>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            cache_key: None,
            use_cache: true,
            cache_ttl: None,
            strategy: None,
            max_retries: None,
            batch: true,
            headers: Vec::new(),
            cancel: None,
        }
    }
}

impl RequestOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn unbatched(mut self) -> Self {
        self.batch = false;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn key_for(&self, endpoint: &str) -> String {
        self.cache_key
            .clone()
            .unwrap_or_else(|| endpoint.to_string())
    }
}

/// One entry of `RequestScheduler::create_batch_request`.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub endpoint: String,
    pub options: RequestOptions,
}

impl RequestConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            options: RequestOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert!(Priority::Low > Priority::Background);
    }

    #[test]
    fn test_defaults_and_key() {
        let options = RequestOptions::default();
        assert!(options.use_cache);
        assert!(options.batch);
        assert_eq!(options.key_for("/dashboard"), "/dashboard");

        let options = options.with_cache_key("dash:main").without_cache().unbatched();
        assert_eq!(options.key_for("/dashboard"), "dash:main");
        assert!(!options.use_cache);
        assert!(!options.batch);
    }
}
