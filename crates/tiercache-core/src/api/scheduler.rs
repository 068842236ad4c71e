//! Request scheduling on top of the transport.
//!
//! Every outbound call goes through `RequestScheduler::make_optimized_request`:
//! cache check, deduplication against in-flight calls for the same key,
//! an optional batching window with priority buckets, a global concurrency
//! cap, quality-scaled timeouts, retries and the per-endpoint circuit breaker.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt, Shared, WeakShared};
use serde_json::Value;
use tokio::sync::{oneshot, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::cache::{CacheManager, SetOptions};
use crate::config::SchedulerConfig;
use crate::environment::{Environment, NetworkQuality};

use super::{
    CircuitBreaker, Priority, RequestConfig, RequestError, RequestOptions, Transport,
    TransportRequest,
};

type FetchFuture = BoxFuture<'static, Result<Value, RequestError>>;
type SharedFetch = Shared<FetchFuture>;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SchedulerStats {
    pub average_latency: Duration,
    /// Network attempts made, retries included.
    pub request_count: u64,
    pub cache_hit_rate: f64,
}

/// A call deferred into the current batch window.
struct QueuedRequest {
    id: u64,
    endpoint: String,
    options: RequestOptions,
    responder: oneshot::Sender<Result<Value, RequestError>>,
    enqueued_at: Instant,
}

struct InFlight {
    id: u64,
    fetch: WeakShared<FetchFuture>,
}

/// Clears an in-flight slot when its fetch completes or every waiter is gone.
/// Only the slot it created is removed, never a successor's.
struct InFlightGuard {
    scheduler: RequestScheduler,
    key: String,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = self.scheduler.state();
        if state.in_flight.get(&self.key).is_some_and(|slot| slot.id == self.id) {
            state.in_flight.remove(&self.key);
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: Vec<QueuedRequest>,
    batch_scheduled: bool,
    in_flight: HashMap<String, InFlight>,
    next_id: u64,
    request_count: u64,
    total_latency: Duration,
    cache_hits: u64,
    cache_misses: u64,
}

struct SchedulerInner {
    transport: Arc<dyn Transport>,
    cache: Arc<CacheManager>,
    breaker: Arc<CircuitBreaker>,
    environment: Arc<Environment>,
    config: SchedulerConfig,
    permits: Semaphore,
    state: Mutex<SchedulerState>,
}

/// Clone is cheap: clones share queues, in-flight calls and statistics.
#[derive(Clone)]
pub struct RequestScheduler {
    inner: Arc<SchedulerInner>,
}

impl RequestScheduler {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<CacheManager>,
        breaker: Arc<CircuitBreaker>,
        environment: Arc<Environment>,
        config: SchedulerConfig,
    ) -> Self {
        let permits = Semaphore::new(config.max_concurrent.max(1));
        Self {
            inner: Arc::new(SchedulerInner {
                transport,
                cache,
                breaker,
                environment,
                config,
                permits,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.inner.cache
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.breaker
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.inner.environment
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetch `endpoint`, serving from cache when allowed.
    ///
    /// A stale stale-while-revalidate entry is returned immediately and
    /// refreshed in the background. Concurrent calls for the same key share
    /// one network call.
    pub async fn make_optimized_request(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Value, RequestError> {
        if options.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(RequestError::Cancelled);
        }

        let key = options.key_for(endpoint);

        if options.use_cache {
            if let Some(found) = self.inner.cache.lookup::<Value>(&key).await {
                self.state().cache_hits += 1;
                if found.stale {
                    self.revalidate(endpoint, &key, &options);
                }
                trace!(key = %key, tier = ?found.tier, "Served from cache");
                return Ok(found.data);
            }
            self.state().cache_misses += 1;
        }

        let cancel = options.cancel.clone();
        let fetch = self.join_or_start(endpoint, &key, options);

        match cancel {
            Some(token) => tokio::select! {
                result = fetch => result,
                _ = token.cancelled() => {
                    debug!(key = %key, "Request cancelled by caller");
                    Err(RequestError::Cancelled)
                }
            },
            None => fetch.await,
        }
    }

    /// Run every config concurrently. Each slot carries its own outcome.
    pub async fn create_batch_request(
        &self,
        configs: Vec<RequestConfig>,
    ) -> Vec<Result<Value, RequestError>> {
        join_all(configs.into_iter().map(|config| async move {
            self.make_optimized_request(&config.endpoint, config.options)
                .await
        }))
        .await
    }

    pub fn get_stats(&self) -> SchedulerStats {
        let state = self.state();
        let average_latency = if state.request_count == 0 {
            Duration::ZERO
        } else {
            state.total_latency / state.request_count as u32
        };
        let lookups = state.cache_hits + state.cache_misses;
        let cache_hit_rate = if lookups == 0 {
            0.0
        } else {
            state.cache_hits as f64 / lookups as f64
        };
        SchedulerStats {
            average_latency,
            request_count: state.request_count,
            cache_hit_rate,
        }
    }

    fn revalidate(&self, endpoint: &str, key: &str, options: &RequestOptions) {
        let mut options = options.clone();
        options.priority = Priority::Background;
        options.use_cache = false;
        options.cancel = None;

        debug!(key = %key, "Serving stale entry, revalidating in background");
        let fetch = self.join_or_start(endpoint, key, options);
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = fetch.await {
                debug!(key = %key, error = %e, "Background revalidation failed");
            }
        });
    }

    /// Join the in-flight call for `key`, or start one.
    fn join_or_start(&self, endpoint: &str, key: &str, options: RequestOptions) -> SharedFetch {
        let mut state = self.state();
        if let Some(existing) = state.in_flight.get(key).and_then(|slot| slot.fetch.upgrade()) {
            debug!(key = %key, "Joining in-flight request");
            return existing;
        }

        let id = state.next_id;
        state.next_id += 1;
        let guard = InFlightGuard {
            scheduler: self.clone(),
            key: key.to_string(),
            id,
        };

        let this = self.clone();
        let endpoint = endpoint.to_string();
        let owned_key = key.to_string();
        let fetch = async move {
            let _guard = guard;
            this.fetch_and_store(endpoint, owned_key, options).await
        }
        .boxed()
        .shared();
        if let Some(weak) = fetch.downgrade() {
            state.in_flight.insert(key.to_string(), InFlight { id, fetch: weak });
        }
        fetch
    }

    async fn fetch_and_store(
        self,
        endpoint: String,
        key: String,
        options: RequestOptions,
    ) -> Result<Value, RequestError> {
        let result = if options.batch && options.priority != Priority::Critical {
            self.enqueue(&endpoint, &options).await
        } else {
            self.execute(&endpoint, &options).await
        };

        if let Ok(data) = &result {
            let set = SetOptions {
                ttl: options.cache_ttl,
                strategy: options.strategy,
            };
            self.inner.cache.set_json(&key, data.clone(), set).await;
        }
        result
    }

    async fn enqueue(
        &self,
        endpoint: &str,
        options: &RequestOptions,
    ) -> Result<Value, RequestError> {
        let (tx, rx) = oneshot::channel();
        let start_batch = {
            let mut state = self.state();
            let id = state.next_id;
            state.next_id += 1;
            state.queue.push(QueuedRequest {
                id,
                endpoint: endpoint.to_string(),
                options: options.clone(),
                responder: tx,
                enqueued_at: Instant::now(),
            });
            !std::mem::replace(&mut state.batch_scheduled, true)
        };

        if start_batch {
            let this = self.clone();
            tokio::spawn(async move { this.run_batch().await });
        }

        // A dropped responder means the dispatcher went away mid-batch
        rx.await.unwrap_or(Err(RequestError::Cancelled))
    }

    async fn run_batch(self) {
        tokio::time::sleep(self.inner.config.batch_window).await;

        let queue = {
            let mut state = self.state();
            state.batch_scheduled = false;
            std::mem::take(&mut state.queue)
        };

        let mut buckets: BTreeMap<Priority, Vec<QueuedRequest>> = BTreeMap::new();
        for request in queue {
            buckets.entry(request.priority()).or_default().push(request);
        }

        for (priority, bucket) in buckets.into_iter().rev() {
            debug!(?priority, count = bucket.len(), "Dispatching batch bucket");
            join_all(bucket.into_iter().map(|request| self.dispatch(request))).await;
        }
    }

    async fn dispatch(&self, request: QueuedRequest) {
        let QueuedRequest {
            id,
            endpoint,
            options,
            mut responder,
            enqueued_at,
        } = request;
        trace!(id, endpoint = %endpoint, waited = ?enqueued_at.elapsed(), "Dispatching queued request");

        let result = tokio::select! {
            result = self.execute(&endpoint, &options) => result,
            _ = responder.closed() => {
                debug!(id, endpoint = %endpoint, "Queued request abandoned");
                return;
            }
        };
        let _ = responder.send(result);
    }

    /// Attempt the call, retrying retryable failures with a quality-scaled
    /// delay. A circuit that opens between attempts ends the loop with the
    /// last real error. Nothing is retried while offline.
    async fn execute(&self, endpoint: &str, options: &RequestOptions) -> Result<Value, RequestError> {
        let max_retries = options.max_retries.unwrap_or(self.inner.config.max_retries);
        let request = TransportRequest {
            endpoint: endpoint.to_string(),
            headers: options.headers.clone(),
        };

        let mut retries = 0;
        let mut last_error: Option<RequestError> = None;
        loop {
            let permit = match self.inner.breaker.try_acquire(endpoint) {
                Ok(permit) => permit,
                Err(open) => return Err(last_error.unwrap_or(open)),
            };

            let result = self.attempt(&request, options.priority).await;
            match &result {
                Ok(_) => permit.succeed(),
                Err(e) if e.counts_as_failure() => permit.fail(),
                Err(_) => drop(permit),
            }

            match result {
                Ok(data) => return Ok(data),
                Err(e) if e.is_retryable() && retries < max_retries && !self.is_offline() => {
                    retries += 1;
                    let delay = self.retry_delay();
                    warn!(
                        endpoint = %endpoint,
                        attempt = retries,
                        error = %e,
                        delay = ?delay,
                        "Request failed, retrying"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        request: &TransportRequest,
        priority: Priority,
    ) -> Result<Value, RequestError> {
        // Critical requests skip the concurrency cap
        let _slot = if priority == Priority::Critical {
            None
        } else {
            Some(
                self.inner
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| RequestError::Cancelled)?,
            )
        };

        let timeout = self.timeout();
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.inner.transport.send(request)).await;
        self.record_latency(started.elapsed());

        match outcome {
            Err(_) => Err(RequestError::Timeout(timeout)),
            Ok(Err(e)) => Err(RequestError::Network(e.to_string())),
            Ok(Ok(response)) if response.is_success() => Ok(response.json_or_text()),
            Ok(Ok(response)) => Err(RequestError::from_status(response.status, &response.body)),
        }
    }

    fn record_latency(&self, latency: Duration) {
        let mut state = self.state();
        state.request_count += 1;
        state.total_latency += latency;
    }

    fn timeout(&self) -> Duration {
        let base = self.inner.config.base_timeout;
        match self.inner.environment.network_quality() {
            NetworkQuality::Fast => base,
            NetworkQuality::Medium => base.mul_f64(1.5),
            NetworkQuality::Slow => base * 2,
            NetworkQuality::Offline => self.inner.config.offline_timeout,
        }
    }

    fn is_offline(&self) -> bool {
        self.inner.environment.network_quality() == NetworkQuality::Offline
    }

    fn retry_delay(&self) -> Duration {
        let config = &self.inner.config;
        match self.inner.environment.network_quality() {
            NetworkQuality::Fast => config.retry_delay_fast,
            NetworkQuality::Medium => config.retry_delay_medium,
            NetworkQuality::Slow | NetworkQuality::Offline => config.retry_delay_slow,
        }
    }
}

impl QueuedRequest {
    fn priority(&self) -> Priority {
        self.options.priority
    }
}
