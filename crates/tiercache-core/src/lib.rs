//! Core library for tiercache.
//!
//! A client-side cache and network-resilience layer for JSON APIs:
//! - `cache`: three storage tiers (bounded LRU, durable store, flat store)
//!   behind the `CacheManager`
//! - `api`: transport abstraction, circuit breaker and the `RequestScheduler`
//! - `environment`: visibility, activity and connectivity signals
//! - `fetch`: the adaptive `FetchController`
//! - `context`: wires everything together from a `Config`

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod environment;
pub mod fetch;
pub mod utils;

pub use api::{
    CancelToken, CircuitBreaker, CircuitStatus, HttpTransport, Priority, RequestConfig,
    RequestError, RequestOptions, RequestScheduler, SchedulerStats, Transport,
};
pub use cache::{CacheEntry, CacheManager, CacheStats, CacheStrategy, SetOptions};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use context::Context;
pub use environment::{Environment, NetworkQuality, Signals};
pub use fetch::{FetchController, FetchStats, FetchStrategy, FetchTarget, StartOptions};
