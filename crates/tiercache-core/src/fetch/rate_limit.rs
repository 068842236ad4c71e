use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::clock::elapsed_between;
use crate::config::FetchConfig;

/// Sliding-window limiter over scheduled fetches: a long window with a
/// fetch budget and a short burst window, both checked on every attempt.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    history: VecDeque<DateTime<Utc>>,
    window: std::time::Duration,
    max_in_window: usize,
    burst_window: std::time::Duration,
    max_burst: usize,
}

impl RateLimiter {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            history: VecDeque::new(),
            window: config.rate_window,
            max_in_window: config.max_fetches_per_window,
            burst_window: config.burst_window,
            max_burst: config.max_burst,
        }
    }

    /// Record a fetch at `now` if both windows allow it.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        while let Some(&oldest) = self.history.front() {
            if elapsed_between(oldest, now) >= self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }

        if self.history.len() >= self.max_in_window {
            return false;
        }

        let in_burst = self
            .history
            .iter()
            .filter(|&&at| elapsed_between(at, now) < self.burst_window)
            .count();
        if in_burst >= self.max_burst {
            return false;
        }

        self.history.push_back(now);
        true
    }

    pub fn recent(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_window_limit() {
        let mut limiter = RateLimiter::new(&FetchConfig::default());
        for secs in [0, 11, 22, 33] {
            assert!(limiter.try_acquire(at(secs)), "attempt at {}s", secs);
        }
        assert!(!limiter.try_acquire(at(44)));
        // The first fetch leaves the window at 60s
        assert!(limiter.try_acquire(at(60)));
    }

    #[test]
    fn test_burst_limit() {
        let mut limiter = RateLimiter::new(&FetchConfig::default());
        assert!(limiter.try_acquire(at(0)));
        assert!(limiter.try_acquire(at(1)));
        assert!(!limiter.try_acquire(at(2)));
        assert_eq!(limiter.recent(), 2);
        assert!(limiter.try_acquire(at(10)));
    }
}
