//! Network-resilience layer between callers and the remote JSON API.
//!
//! The `RequestScheduler` owns every outbound call. It dispatches through a
//! `Transport` (HTTP via reqwest in production), guarded by a per-endpoint
//! `CircuitBreaker`, and writes successful responses through the cache.

pub mod cancel;
pub mod circuit;
pub mod error;
pub mod options;
pub mod scheduler;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use cancel::CancelToken;
pub use circuit::{CircuitBreaker, CircuitPermit, CircuitState, CircuitStatus};
pub use error::RequestError;
pub use options::{Priority, RequestConfig, RequestOptions};
pub use scheduler::{RequestScheduler, SchedulerStats};
pub use transport::{HttpTransport, Transport, TransportError, TransportRequest, TransportResponse};
