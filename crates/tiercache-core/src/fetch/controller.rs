//! Background refresh loop.
//!
//! The controller owns one spawned task that sleeps until the next scheduled
//! cycle, wakes early on environment changes or control messages, and asks
//! the scheduler to refresh every target in one batch.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{Priority, RequestConfig, RequestError, RequestOptions, RequestScheduler};
use crate::cache::CacheStrategy;
use crate::clock::{elapsed_between, Clock};
use crate::config::FetchConfig;
use crate::environment::{Environment, NetworkQuality};

use super::rate_limit::RateLimiter;
use super::strategy::{compute_interval, FetchOutcome, FetchStrategy, Observation};

/// An endpoint kept fresh by the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTarget {
    pub endpoint: String,
    pub cache_key: Option<String>,
    pub ttl: Option<Duration>,
    pub strategy: Option<CacheStrategy>,
}

impl FetchTarget {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            cache_key: None,
            ttl: None,
            strategy: None,
        }
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Background refreshes always go to the network.
    fn request_config(&self) -> RequestConfig {
        let mut options = RequestOptions::default()
            .with_priority(Priority::Background)
            .without_cache();
        options.cache_key = self.cache_key.clone();
        options.cache_ttl = self.ttl;
        options.strategy = self.strategy;
        RequestConfig::new(self.endpoint.clone()).with_options(options)
    }
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub targets: Vec<FetchTarget>,
    /// Overrides `FetchConfig::base_interval`.
    pub base_interval: Option<Duration>,
    pub fetch_immediately: bool,
}

impl StartOptions {
    pub fn new(targets: Vec<FetchTarget>) -> Self {
        Self {
            targets,
            base_interval: None,
            fetch_immediately: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchStats {
    pub enabled: bool,
    pub strategy: FetchStrategy,
    #[serde(with = "crate::utils::duration_ms")]
    pub interval: Duration,
    pub fetch_count: u64,
    pub last_fetch_time: Option<DateTime<Utc>>,
    pub network_quality: NetworkQuality,
}

#[derive(Debug, Clone, Copy)]
enum Control {
    /// Run a cycle now (still rate limited).
    Trigger,
    /// Re-derive the strategy and reschedule.
    Reschedule,
}

struct ControllerState {
    enabled: bool,
    paused: bool,
    strategy: FetchStrategy,
    /// Last strategy the environment rules produced. Between input changes
    /// the rules re-apply only when this changes, so post-fetch adjustments
    /// last until the next signal.
    last_derived: Option<FetchStrategy>,
    interval: Duration,
    fetch_count: u64,
    last_fetch_time: Option<DateTime<Utc>>,
    limiter: RateLimiter,
    targets: Vec<FetchTarget>,
    base_interval: Duration,
}

struct ControllerInner {
    scheduler: RequestScheduler,
    environment: Arc<Environment>,
    clock: Arc<dyn Clock>,
    config: FetchConfig,
    state: Mutex<ControllerState>,
}

struct RunningTask {
    control: mpsc::Sender<Control>,
    handle: JoinHandle<()>,
}

pub struct FetchController {
    inner: Arc<ControllerInner>,
    task: Mutex<Option<RunningTask>>,
}

impl FetchController {
    pub fn new(scheduler: RequestScheduler, clock: Arc<dyn Clock>, config: FetchConfig) -> Self {
        let environment = scheduler.environment().clone();
        let state = ControllerState {
            enabled: false,
            paused: false,
            strategy: FetchStrategy::Normal,
            last_derived: None,
            interval: config.base_interval,
            fetch_count: 0,
            last_fetch_time: None,
            limiter: RateLimiter::new(&config),
            targets: Vec::new(),
            base_interval: config.base_interval,
        };
        Self {
            inner: Arc::new(ControllerInner {
                scheduler,
                environment,
                clock,
                config,
                state: Mutex::new(state),
            }),
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<RunningTask>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the refresh loop. Restarts it if already running.
    pub fn start(&self, options: StartOptions) {
        self.stop();

        {
            let mut state = self.inner.state();
            state.enabled = true;
            state.targets = options.targets;
            state.base_interval = options.base_interval.unwrap_or(self.inner.config.base_interval);
            state.last_derived = None;
        }
        self.inner.reevaluate(true);

        info!(
            targets = self.inner.state().targets.len(),
            "Starting adaptive fetch controller"
        );

        let (control, receiver) = mpsc::channel(8);
        let inner = self.inner.clone();
        let handle = tokio::spawn(inner.run(receiver, options.fetch_immediately));
        *self.task() = Some(RunningTask { control, handle });
    }

    /// Stop the loop, abandoning any cycle in progress.
    pub fn stop(&self) {
        if let Some(task) = self.task().take() {
            task.handle.abort();
            info!("Stopped adaptive fetch controller");
        }
        self.inner.state().enabled = false;
    }

    pub fn pause(&self) {
        self.inner.state().paused = true;
        self.inner.reevaluate(true);
        self.send(Control::Reschedule);
    }

    pub fn resume(&self) {
        self.inner.state().paused = false;
        self.inner.reevaluate(true);
        self.send(Control::Reschedule);
    }

    /// Ask for a cycle now. Still subject to pausing and rate limits.
    pub fn trigger(&self) {
        self.send(Control::Trigger);
    }

    fn send(&self, message: Control) {
        if let Some(task) = self.task().as_ref() {
            if task.control.try_send(message).is_err() {
                debug!(?message, "Control channel full, dropping message");
            }
        }
    }

    pub fn get_stats(&self) -> FetchStats {
        let state = self.inner.state();
        FetchStats {
            enabled: state.enabled,
            strategy: state.strategy,
            interval: state.interval,
            fetch_count: state.fetch_count,
            last_fetch_time: state.last_fetch_time,
            network_quality: self.inner.environment.network_quality(),
        }
    }
}

impl Drop for FetchController {
    fn drop(&mut self) {
        if let Some(task) = self.task().take() {
            task.handle.abort();
        }
    }
}

impl ControllerInner {
    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run(self: Arc<Self>, mut control: mpsc::Receiver<Control>, fetch_immediately: bool) {
        let mut signals = self.environment.subscribe();

        if fetch_immediately {
            self.run_cycle().await;
        }
        let mut last_cycle = Instant::now();
        let mut next_at = last_cycle + self.schedule_interval();

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_at) => {
                    self.run_cycle().await;
                    last_cycle = Instant::now();
                    next_at = last_cycle + self.schedule_interval();
                }
                changed = signals.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if self.reevaluate(true) {
                        // A past deadline fires immediately
                        next_at = last_cycle + self.schedule_interval();
                    }
                }
                message = control.recv() => match message {
                    Some(Control::Trigger) => {
                        self.run_cycle().await;
                        last_cycle = Instant::now();
                        next_at = last_cycle + self.schedule_interval();
                    }
                    Some(Control::Reschedule) => {
                        next_at = last_cycle + self.schedule_interval();
                    }
                    None => break,
                },
            }
        }
        debug!("Fetch loop exited");
    }

    /// Apply the environment rules. Returns whether the strategy changed.
    ///
    /// `input_changed` marks a fresh signal (activity, visibility, network,
    /// pause), which overrides any post-fetch adjustment. Otherwise the rules
    /// only apply when the passage of time alone changes their result.
    fn reevaluate(&self, input_changed: bool) -> bool {
        let signals = self.environment.snapshot();
        let now = self.clock.now();
        let mut state = self.state();

        let derived = FetchStrategy::observe(
            &Observation {
                paused: state.paused,
                online: signals.online,
                visible: signals.visible,
                since_activity: elapsed_between(signals.last_activity, now),
            },
            &self.config,
        );
        if !input_changed && state.last_derived == Some(derived) {
            return false;
        }
        state.last_derived = Some(derived);

        if state.strategy == derived {
            return false;
        }
        info!(from = ?state.strategy, to = ?derived, "Fetch strategy changed");
        state.strategy = derived;
        true
    }

    fn schedule_interval(&self) -> Duration {
        let jitter = self.config.jitter.as_millis() as i64;
        let jitter_ms = if jitter > 0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0
        };
        let signals = self.environment.snapshot();

        let mut state = self.state();
        let interval = compute_interval(
            &self.config,
            state.base_interval,
            state.strategy,
            signals.effective_quality(),
            signals.visible,
            jitter_ms,
        );
        state.interval = interval;
        debug!(interval = ?interval, strategy = ?state.strategy, "Next fetch scheduled");
        interval
    }

    async fn run_cycle(&self) {
        self.reevaluate(false);

        let (targets, strategy) = {
            let state = self.state();
            if !state.enabled {
                return;
            }
            (state.targets.clone(), state.strategy)
        };

        if strategy == FetchStrategy::Paused {
            debug!("Fetch cycle skipped - paused");
            return;
        }
        if targets.is_empty() {
            return;
        }

        let now = self.clock.now();
        let allowed = self.state().limiter.try_acquire(now);
        if !allowed {
            debug!("Fetch cycle skipped - rate limited");
            return;
        }

        let configs = targets.iter().map(FetchTarget::request_config).collect();
        let results = self.scheduler.create_batch_request(configs).await;

        let mut failed = false;
        for (target, result) in targets.iter().zip(&results) {
            match result {
                Ok(_) | Err(RequestError::Cancelled) => {}
                Err(e) => {
                    failed = true;
                    warn!(endpoint = %target.endpoint, error = %e, "Background fetch failed");
                }
            }
        }

        let outcome = if failed {
            FetchOutcome::Failed
        } else {
            FetchOutcome::Succeeded {
                hit_rate: self.scheduler.cache().get_stats().hit_rate,
            }
        };

        let mut state = self.state();
        state.fetch_count += 1;
        state.last_fetch_time = Some(self.clock.now());
        let next = state.strategy.after_fetch(outcome, &self.config);
        if next != state.strategy {
            info!(from = ?state.strategy, to = ?next, "Fetch strategy adjusted after fetch");
            state.strategy = next;
        }
        debug!(fetch_count = state.fetch_count, ?outcome, "Fetch cycle complete");
    }
}
