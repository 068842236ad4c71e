//! Per-endpoint circuit breaker.
//!
//! Closed circuits count consecutive failures and open at the threshold.
//! Open circuits reject calls without I/O until the cool-down has passed,
//! then let exactly one trial call through (half-open). The trial's outcome
//! closes or re-opens the circuit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{elapsed_between, Clock};
use crate::config::BreakerConfig;

use super::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl CircuitState {
    /// Decide whether a call may proceed, moving Open -> HalfOpen once the
    /// cool-down has elapsed. Returns whether the admitted call is the trial.
    fn admit(&mut self, now: DateTime<Utc>, config: &BreakerConfig) -> Option<bool> {
        match self.status {
            CircuitStatus::Closed => Some(false),
            CircuitStatus::Open => {
                let cooled = self
                    .last_failure_time
                    .map(|at| elapsed_between(at, now) >= config.cool_down)
                    .unwrap_or(true);
                if cooled {
                    self.status = CircuitStatus::HalfOpen;
                    self.trial_in_flight = true;
                    Some(true)
                } else {
                    None
                }
            }
            CircuitStatus::HalfOpen => {
                if self.trial_in_flight {
                    None
                } else {
                    self.trial_in_flight = true;
                    Some(true)
                }
            }
        }
    }

    fn on_success(&mut self) {
        match self.status {
            CircuitStatus::Closed | CircuitStatus::Open | CircuitStatus::HalfOpen => {
                self.status = CircuitStatus::Closed;
                self.failure_count = 0;
                self.trial_in_flight = false;
            }
        }
    }

    fn on_failure(&mut self, now: DateTime<Utc>, config: &BreakerConfig) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);
        match self.status {
            CircuitStatus::Closed => {
                if self.failure_count >= config.failure_threshold {
                    self.status = CircuitStatus::Open;
                }
            }
            CircuitStatus::HalfOpen => {
                self.status = CircuitStatus::Open;
                self.trial_in_flight = false;
            }
            // A straggler admitted before the circuit opened; the refreshed
            // failure time restarts the cool-down.
            CircuitStatus::Open => {}
        }
    }

    fn on_abandon(&mut self) {
        match self.status {
            CircuitStatus::HalfOpen => self.trial_in_flight = false,
            CircuitStatus::Closed | CircuitStatus::Open => {}
        }
    }
}

pub struct CircuitBreaker {
    states: Mutex<HashMap<String, CircuitState>>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, CircuitState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask to call `endpoint`. An open circuit yields `RequestError::CircuitOpen`.
    ///
    /// The permit must be settled with `succeed` or `fail`; dropping it
    /// unsettled (cancellation) releases a half-open trial slot without
    /// changing the circuit.
    pub fn try_acquire(&self, endpoint: &str) -> Result<CircuitPermit<'_>, RequestError> {
        let now = self.clock.now();
        let mut states = self.states();
        // States are created lazily on first failure
        let trial = match states.get_mut(endpoint) {
            Some(state) => {
                let before = state.status;
                let admitted = state.admit(now, &self.config);
                if before == CircuitStatus::Open && state.status == CircuitStatus::HalfOpen {
                    info!(endpoint = %endpoint, "Circuit half-open - allowing trial request");
                }
                admitted
            }
            None => Some(false),
        };

        match trial {
            Some(trial) => Ok(CircuitPermit {
                breaker: self,
                endpoint: endpoint.to_string(),
                trial,
                settled: false,
            }),
            None => {
                debug!(endpoint = %endpoint, "Circuit open - rejecting request");
                Err(RequestError::CircuitOpen {
                    endpoint: endpoint.to_string(),
                })
            }
        }
    }

    pub fn record_success(&self, endpoint: &str) {
        let mut states = self.states();
        if let Some(state) = states.get_mut(endpoint) {
            if state.status != CircuitStatus::Closed {
                info!(endpoint = %endpoint, "Circuit closed - normal operation resumed");
            }
            state.on_success();
        }
    }

    pub fn record_failure(&self, endpoint: &str) {
        let now = self.clock.now();
        let mut states = self.states();
        let state = states.entry(endpoint.to_string()).or_default();
        let before = state.status;
        state.on_failure(now, &self.config);
        if before != CircuitStatus::Open && state.status == CircuitStatus::Open {
            warn!(
                endpoint = %endpoint,
                failures = state.failure_count,
                "Circuit opened - failing fast"
            );
        }
    }

    fn release_trial(&self, endpoint: &str) {
        if let Some(state) = self.states().get_mut(endpoint) {
            state.on_abandon();
        }
    }

    pub fn status(&self, endpoint: &str) -> CircuitStatus {
        self.states()
            .get(endpoint)
            .map(|state| state.status)
            .unwrap_or_default()
    }

    pub fn state(&self, endpoint: &str) -> Option<CircuitState> {
        self.states().get(endpoint).cloned()
    }

    pub fn reset(&self, endpoint: &str) {
        self.states().remove(endpoint);
    }

    pub fn reset_all(&self) {
        self.states().clear();
    }
}

/// Admission to call an endpoint, to be settled with the call's outcome.
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    endpoint: String,
    trial: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(&self.endpoint);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(&self.endpoint);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            debug!(endpoint = %self.endpoint, "Trial request abandoned");
            self.breaker.release_trial(&self.endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (CircuitBreaker::new(BreakerConfig::default(), clock.clone()), clock)
    }

    fn fail_times(breaker: &CircuitBreaker, endpoint: &str, n: usize) {
        for _ in 0..n {
            breaker.try_acquire(endpoint).expect("should be admitted").fail();
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let (breaker, _clock) = breaker();
        fail_times(&breaker, "/a", 4);
        assert_eq!(breaker.status("/a"), CircuitStatus::Closed);
        fail_times(&breaker, "/a", 1);
        assert_eq!(breaker.status("/a"), CircuitStatus::Open);

        let err = breaker.try_acquire("/a").err().expect("circuit should reject");
        assert_eq!(err, RequestError::CircuitOpen { endpoint: "/a".into() });
        // Rejections are not failures
        assert_eq!(breaker.state("/a").unwrap().failure_count, 5);
        // Other endpoints are unaffected
        assert!(breaker.try_acquire("/b").is_ok());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let (breaker, _clock) = breaker();
        fail_times(&breaker, "/a", 4);
        breaker.try_acquire("/a").unwrap().succeed();
        fail_times(&breaker, "/a", 4);
        assert_eq!(breaker.status("/a"), CircuitStatus::Closed);
        assert_eq!(breaker.state("/a").unwrap().failure_count, 4);
    }

    #[test]
    fn test_half_open_after_cool_down() {
        let (breaker, clock) = breaker();
        fail_times(&breaker, "/a", 5);

        clock.advance(Duration::from_secs(29));
        assert!(breaker.try_acquire("/a").is_err());

        clock.advance(Duration::from_secs(1));
        let trial = breaker.try_acquire("/a").expect("trial allowed");
        assert!(trial.is_trial());
        assert_eq!(breaker.status("/a"), CircuitStatus::HalfOpen);

        // Exactly one trial at a time
        assert!(breaker.try_acquire("/a").is_err());

        trial.succeed();
        let state = breaker.state("/a").unwrap();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.failure_count, 0);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let (breaker, clock) = breaker();
        fail_times(&breaker, "/a", 5);
        clock.advance(Duration::from_secs(30));

        breaker.try_acquire("/a").unwrap().fail();
        let state = breaker.state("/a").unwrap();
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.last_failure_time, Some(clock.now()));

        // Cool-down restarts from the failed trial
        clock.advance(Duration::from_secs(10));
        assert!(breaker.try_acquire("/a").is_err());
    }

    #[test]
    fn test_abandoned_trial_releases_slot() {
        let (breaker, clock) = breaker();
        fail_times(&breaker, "/a", 5);
        clock.advance(Duration::from_secs(30));

        let trial = breaker.try_acquire("/a").unwrap();
        drop(trial);
        assert_eq!(breaker.status("/a"), CircuitStatus::HalfOpen);
        assert!(breaker.try_acquire("/a").is_ok());
    }

    #[test]
    fn test_reset() {
        let (breaker, _clock) = breaker();
        fail_times(&breaker, "/a", 5);
        fail_times(&breaker, "/b", 5);
        breaker.reset("/a");
        assert_eq!(breaker.status("/a"), CircuitStatus::Closed);
        assert_eq!(breaker.status("/b"), CircuitStatus::Open);
        breaker.reset_all();
        assert!(breaker.state("/b").is_none());
    }
}
