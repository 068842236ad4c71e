//! Adaptive background refresh.
//!
//! `FetchController` keeps a set of endpoints fresh in the cache, choosing
//! how often to poll from visibility, user activity, connectivity and
//! network quality, under a sliding-window rate limit.

pub mod controller;
pub mod rate_limit;
pub mod strategy;

pub use controller::{FetchController, FetchStats, FetchTarget, StartOptions};
pub use rate_limit::RateLimiter;
pub use strategy::{compute_interval, FetchOutcome, FetchStrategy, Observation};
