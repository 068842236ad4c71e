use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::FetchConfig;
use crate::environment::NetworkQuality;

/// How eagerly the controller refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStrategy {
    Aggressive,
    #[default]
    Normal,
    Conservative,
    Paused,
}

/// The environment inputs the strategy is derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Paused by the caller through `FetchController::pause`.
    pub paused: bool,
    pub online: bool,
    pub visible: bool,
    pub since_activity: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FetchOutcome {
    Succeeded { hit_rate: f64 },
    Failed,
}

impl FetchStrategy {
    /// Strategy implied by the environment. Rules apply in order; the first
    /// match wins.
    pub fn observe(observation: &Observation, config: &FetchConfig) -> Self {
        if observation.paused || !observation.online {
            FetchStrategy::Paused
        } else if !observation.visible {
            FetchStrategy::Conservative
        } else if observation.since_activity < config.active_threshold {
            FetchStrategy::Aggressive
        } else if observation.since_activity > config.idle_threshold {
            FetchStrategy::Conservative
        } else {
            FetchStrategy::Normal
        }
    }

    /// Adjustment after a fetch cycle completes.
    pub fn after_fetch(self, outcome: FetchOutcome, config: &FetchConfig) -> Self {
        match (self, outcome) {
            (FetchStrategy::Aggressive, FetchOutcome::Succeeded { hit_rate })
                if hit_rate > config.high_hit_rate =>
            {
                FetchStrategy::Normal
            }
            (strategy, FetchOutcome::Succeeded { .. }) => strategy,
            (FetchStrategy::Aggressive, FetchOutcome::Failed) => FetchStrategy::Normal,
            (FetchStrategy::Normal, FetchOutcome::Failed) => FetchStrategy::Conservative,
            (FetchStrategy::Conservative, FetchOutcome::Failed) => FetchStrategy::Conservative,
            (FetchStrategy::Paused, FetchOutcome::Failed) => FetchStrategy::Paused,
        }
    }

    pub fn interval_factor(self) -> f64 {
        match self {
            FetchStrategy::Aggressive => 0.5,
            FetchStrategy::Normal | FetchStrategy::Paused => 1.0,
            FetchStrategy::Conservative => 2.0,
        }
    }
}

/// Delay until the next scheduled fetch. `jitter_ms` is the random offset
/// already drawn from `[-jitter, +jitter]`.
pub fn compute_interval(
    config: &FetchConfig,
    base: Duration,
    strategy: FetchStrategy,
    quality: NetworkQuality,
    visible: bool,
    jitter_ms: i64,
) -> Duration {
    let quality_factor = match quality {
        NetworkQuality::Slow => 2.0,
        NetworkQuality::Fast | NetworkQuality::Medium | NetworkQuality::Offline => 1.0,
    };
    let mut interval = base.mul_f64(strategy.interval_factor() * quality_factor);

    if !visible {
        interval = interval.max(config.background_interval);
    }

    let jitter = Duration::from_millis(jitter_ms.unsigned_abs());
    interval = if jitter_ms >= 0 {
        interval.saturating_add(jitter)
    } else {
        interval.saturating_sub(jitter)
    };

    interval.clamp(config.min_interval, config.max_interval)
}
