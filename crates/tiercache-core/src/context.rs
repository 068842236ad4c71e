//! Explicitly constructed wiring of every component.
//!
//! A `Context` owns one cache manager, circuit breaker, environment and
//! scheduler. Independent contexts share nothing, so tests can run several
//! side by side.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::api::{
    CircuitBreaker, HttpTransport, RequestScheduler, Transport, TransportError, TransportRequest,
    TransportResponse,
};
use crate::cache::{CacheManager, DurableStore, FileStore, FlatFileStore, FlatStore};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::environment::Environment;
use crate::fetch::FetchController;

/// Subdirectory of the cache dir holding one file per durable entry.
const ENTRIES_DIR: &str = "entries";

/// File holding the flat tier's key/value map.
const FLAT_FILE: &str = "flat.json";

pub struct Context {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub environment: Arc<Environment>,
    pub cache: Arc<CacheManager>,
    pub breaker: Arc<CircuitBreaker>,
    pub scheduler: RequestScheduler,
}

impl Context {
    pub fn builder(config: Config) -> ContextBuilder {
        ContextBuilder {
            config,
            clock: None,
            transport: None,
            durable: None,
            flat: None,
        }
    }

    /// Production wiring: HTTP transport to `config.base_url` with file-backed
    /// durable and flat tiers under the cache directory.
    pub fn from_config(config: Config) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .context("No base URL configured (set base_url or TIERCACHE_BASE_URL)")?;
        let transport = HttpTransport::new(base_url).context("Failed to build HTTP client")?;

        let (durable, flat) = open_persisted(&config)?;
        Ok(Self::builder(config)
            .transport(Arc::new(transport))
            .durable(durable)
            .flat(flat)
            .build())
    }

    /// File-backed tiers without a network; for inspecting or clearing.
    pub fn cache_only(config: Config) -> Result<Self> {
        let (durable, flat) = open_persisted(&config)?;
        Ok(Self::builder(config).durable(durable).flat(flat).build())
    }

    pub fn fetch_controller(&self) -> FetchController {
        FetchController::new(
            self.scheduler.clone(),
            self.clock.clone(),
            self.config.fetch.clone(),
        )
    }
}

/// Open the durable and flat file stores under the configured cache directory.
pub fn open_persisted(config: &Config) -> Result<(Arc<FileStore>, Arc<FlatFileStore>)> {
    let cache_dir = config.cache_dir()?;
    let durable = FileStore::new(cache_dir.join(ENTRIES_DIR));
    let flat = FlatFileStore::open(cache_dir.join(FLAT_FILE), config.cache.flat_quota_bytes);
    Ok((Arc::new(durable), Arc::new(flat)))
}

pub struct ContextBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    transport: Option<Arc<dyn Transport>>,
    durable: Option<Arc<dyn DurableStore>>,
    flat: Option<Arc<dyn FlatStore>>,
}

impl ContextBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn durable(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn flat(mut self, store: Arc<dyn FlatStore>) -> Self {
        self.flat = Some(store);
        self
    }

    /// Without a transport every network call fails with a connection error,
    /// leaving a cache-only context.
    pub fn build(self) -> Context {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let transport = self.transport.unwrap_or_else(|| Arc::new(Disconnected));

        let mut cache = CacheManager::new(self.config.cache.clone(), clock.clone());
        if let Some(durable) = self.durable {
            cache = cache.with_durable(durable);
        }
        if let Some(flat) = self.flat {
            cache = cache.with_flat(flat);
        }
        let cache = Arc::new(cache);

        let breaker = Arc::new(CircuitBreaker::new(self.config.breaker.clone(), clock.clone()));
        let environment = Arc::new(Environment::new(clock.clone()));
        let scheduler = RequestScheduler::new(
            transport,
            cache.clone(),
            breaker.clone(),
            environment.clone(),
            self.config.scheduler.clone(),
        );

        Context {
            config: self.config,
            clock,
            environment,
            cache,
            breaker,
            scheduler,
        }
    }
}

struct Disconnected;

#[async_trait]
impl Transport for Disconnected {
    async fn send(&self, _request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        Err(TransportError::Connection("no transport configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{RequestError, RequestOptions};
    use crate::cache::{MemoryDurableStore, SetOptions};
    use crate::clock::ManualClock;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    #[test]
    fn test_from_config_requires_base_url() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            cache_dir: Some(temp_dir.path().to_path_buf()),
            ..Config::default()
        };
        assert!(Context::from_config(config.clone()).is_err());
        assert!(Context::cache_only(config).is_ok());
    }

    #[tokio::test]
    async fn test_contexts_are_independent() {
        let clock = Arc::new(ManualClock::default());
        let a = Context::builder(Config::default()).clock(clock.clone()).build();
        let b = Context::builder(Config::default()).clock(clock).build();

        a.cache
            .set_json("k", json!(1), SetOptions::default())
            .await;
        assert_eq!(a.cache.get::<Value>("k").await, Some(json!(1)));
        assert!(b.cache.get::<Value>("k").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_only_context_serves_persisted_entries() {
        let durable = Arc::new(MemoryDurableStore::new());
        let clock = Arc::new(ManualClock::default());

        let first = Context::builder(Config::default())
            .clock(clock.clone())
            .durable(durable.clone())
            .build();
        first
            .cache
            .set_json("dash:main", json!({"total": 100}), SetOptions::default())
            .await;

        let second = Context::builder(Config::default())
            .clock(clock)
            .durable(durable)
            .build();
        let options = RequestOptions::default().with_cache_key("dash:main");
        let served = second
            .scheduler
            .make_optimized_request("/dashboard", options)
            .await
            .unwrap();
        assert_eq!(served, json!({"total": 100}));

        let missing = second
            .scheduler
            .make_optimized_request("/other", RequestOptions::default().with_max_retries(0))
            .await;
        assert!(matches!(missing, Err(RequestError::Network(_))));
    }
}
