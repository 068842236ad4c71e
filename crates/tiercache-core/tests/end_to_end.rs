//! Whole-stack behaviour through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use tiercache_core::api::{TransportError, TransportRequest, TransportResponse};
use tiercache_core::cache::{FileStore, FlatFileStore, SetOptions, Tier};
use tiercache_core::{
    CacheStrategy, CircuitStatus, Config, Context, FetchStrategy, FetchTarget, ManualClock,
    RequestError, RequestOptions, StartOptions, Transport,
};

/// Serves a counter-stamped payload, or a fixed status when set.
struct CountingTransport {
    calls: AtomicUsize,
    status: Mutex<u16>,
    delay: Duration,
}

impl CountingTransport {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            status: Mutex::new(200),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail_with(&self, status: u16) {
        *self.status.lock().unwrap() = status;
    }
}

#[async_trait]
impl Transport for CountingTransport {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let status = *self.status.lock().unwrap();
        let body = if status == 200 {
            json!({"endpoint": request.endpoint, "total": 100, "n": n}).to_string()
        } else {
            "unavailable".to_string()
        };
        Ok(TransportResponse {
            status,
            headers: Vec::new(),
            body,
        })
    }
}

fn context(transport: Arc<CountingTransport>, clock: Arc<ManualClock>, dir: &TempDir) -> Context {
    Context::builder(Config::default())
        .clock(clock)
        .transport(transport)
        .durable(Arc::new(FileStore::new(dir.path().join("entries"))))
        .flat(Arc::new(FlatFileStore::open(dir.path().join("flat.json"), 1024 * 1024)))
        .build()
}

#[tokio::test(start_paused = true)]
async fn test_dashboard_fetch_cache_and_expiry() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let transport = CountingTransport::new(Duration::ZERO);
    let ctx = context(transport.clone(), clock.clone(), &dir);

    let options = RequestOptions::default()
        .with_cache_key("dash:main")
        .with_ttl(Duration::from_secs(300));

    let first = ctx
        .scheduler
        .make_optimized_request("/dashboard", options.clone())
        .await
        .unwrap();
    assert_eq!(first["total"], json!(100));

    clock.advance(Duration::from_secs(120));
    let cached = ctx
        .scheduler
        .make_optimized_request("/dashboard", options.clone())
        .await
        .unwrap();
    assert_eq!(cached, first);
    assert_eq!(transport.calls(), 1);
    assert_eq!(ctx.cache.get_remaining_ttl("dash:main"), Duration::from_secs(180));

    // Cache-first entries are never served past their TTL
    clock.advance(Duration::from_secs(181));
    let refreshed = ctx
        .scheduler
        .make_optimized_request("/dashboard", options)
        .await
        .unwrap();
    assert_eq!(refreshed["n"], json!(2));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_memory_loss_falls_back_to_durable() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let transport = CountingTransport::new(Duration::ZERO);
    let ctx = context(transport.clone(), clock.clone(), &dir);

    ctx.cache
        .set(
            "dash:main",
            &json!({"total": 100}),
            SetOptions::ttl(Duration::from_millis(300_000)),
        )
        .await
        .unwrap();
    let hit = ctx.cache.lookup::<Value>("dash:main").await.unwrap();
    assert_eq!(hit.tier, Tier::Memory);
    assert_eq!(hit.data, json!({"total": 100}));

    ctx.cache.clear_memory();
    assert!(!ctx.cache.is_valid("dash:main"));
    let fallback = ctx.cache.lookup::<Value>("dash:main").await.unwrap();
    assert_eq!(fallback.tier, Tier::Durable);
    assert_eq!(fallback.data, json!({"total": 100}));
    assert!(ctx.cache.is_valid("dash:main"));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_persisted_tiers_survive_restart() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let transport = CountingTransport::new(Duration::ZERO);

    {
        let ctx = context(transport.clone(), clock.clone(), &dir);
        ctx.scheduler
            .make_optimized_request("/dashboard", RequestOptions::default().with_cache_key("dash:main"))
            .await
            .unwrap();
    }

    let restarted = context(transport.clone(), clock.clone(), &dir);
    let found = restarted
        .cache
        .lookup::<Value>("dash:main")
        .await
        .expect("entry should survive restart");
    assert_eq!(found.tier, Tier::Durable);
    assert_eq!(found.data["total"], json!(100));

    // Promoted into memory on the way up
    let again = restarted.cache.lookup::<Value>("dash:main").await.unwrap();
    assert_eq!(again.tier, Tier::Memory);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_while_revalidate_window() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let transport = CountingTransport::new(Duration::ZERO);
    let ctx = context(transport.clone(), clock.clone(), &dir);

    let options = RequestOptions::default()
        .with_cache_key("feed")
        .with_ttl(Duration::from_secs(60))
        .with_strategy(CacheStrategy::StaleWhileRevalidate)
        .with_max_retries(0);
    ctx.scheduler
        .make_optimized_request("/feed", options.clone())
        .await
        .unwrap();

    // Past TTL but inside 2 x TTL: the stale value is served and refreshed
    transport.fail_with(503);
    clock.advance(Duration::from_secs(90));
    let stale = ctx
        .scheduler
        .make_optimized_request("/feed", options.clone())
        .await
        .unwrap();
    assert_eq!(stale["n"], json!(1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.calls(), 2);

    // The failed refresh left the old entry; past 2 x TTL it is gone
    clock.advance(Duration::from_secs(31));
    assert!(ctx.cache.get::<Value>("feed").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_deduplicated_and_circuit_broken() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let transport = CountingTransport::new(Duration::from_millis(200));
    let ctx = context(transport.clone(), clock.clone(), &dir);

    let (a, b) = tokio::join!(
        ctx.scheduler.make_optimized_request("/items", RequestOptions::default()),
        ctx.scheduler.make_optimized_request("/items", RequestOptions::default()),
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(transport.calls(), 1);

    transport.fail_with(503);
    let no_retry = RequestOptions::default().without_cache().with_max_retries(0);
    for _ in 0..5 {
        let result = ctx
            .scheduler
            .make_optimized_request("/items", no_retry.clone())
            .await;
        assert!(matches!(result, Err(RequestError::Server { status: 503, .. })));
    }
    assert_eq!(ctx.breaker.status("/items"), CircuitStatus::Open);

    let result = ctx.scheduler.make_optimized_request("/items", no_retry.clone()).await;
    assert!(matches!(result, Err(RequestError::CircuitOpen { .. })));
    assert_eq!(transport.calls(), 6);

    clock.advance(Duration::from_secs(30));
    transport.fail_with(200);
    assert!(ctx.scheduler.make_optimized_request("/items", no_retry).await.is_ok());
    assert_eq!(ctx.breaker.status("/items"), CircuitStatus::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_controller_keeps_targets_fresh() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let transport = CountingTransport::new(Duration::ZERO);
    let ctx = context(transport.clone(), clock.clone(), &dir);
    let controller = ctx.fetch_controller();

    controller.start(StartOptions::new(vec![
        FetchTarget::new("/dashboard").with_cache_key("dash:main"),
        FetchTarget::new("/alerts"),
    ]));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(transport.calls(), 2);
    assert!(ctx.cache.get::<Value>("dash:main").await.is_some());
    assert!(ctx.cache.get::<Value>("/alerts").await.is_some());

    let stats = controller.get_stats();
    assert_eq!(stats.fetch_count, 1);
    assert_eq!(stats.strategy, FetchStrategy::Aggressive);

    ctx.environment.set_online(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.get_stats().strategy, FetchStrategy::Paused);

    controller.stop();
    assert!(!controller.get_stats().enabled);
}
