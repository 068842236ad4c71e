//! Environment signals observed by the scheduler and fetch controller.
//!
//! The host application feeds visibility, connectivity, user activity and
//! network estimates into an `Environment`; consumers read the latest
//! snapshot or subscribe to changes through a `watch` channel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::clock::Clock;

/// Downlink below this (Mbps) is treated as a slow connection.
const SLOW_DOWNLINK_MBPS: f64 = 0.5;

/// Downlink below this (Mbps) is treated as a medium connection.
const MEDIUM_DOWNLINK_MBPS: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    #[default]
    Fast,
    Medium,
    Slow,
    Offline,
}

impl NetworkQuality {
    /// Classify a connection from its effective type ("slow-2g", "2g",
    /// "3g", "4g") and downlink estimate in Mbps. The worse of the two wins.
    pub fn from_estimate(effective_type: &str, downlink_mbps: f64) -> Self {
        let by_type = match effective_type.to_ascii_lowercase().as_str() {
            "slow-2g" | "2g" => NetworkQuality::Slow,
            "3g" => NetworkQuality::Medium,
            _ => NetworkQuality::Fast,
        };
        let by_downlink = if downlink_mbps <= 0.0 {
            // Unknown downlink
            NetworkQuality::Fast
        } else if downlink_mbps < SLOW_DOWNLINK_MBPS {
            NetworkQuality::Slow
        } else if downlink_mbps < MEDIUM_DOWNLINK_MBPS {
            NetworkQuality::Medium
        } else {
            NetworkQuality::Fast
        };
        by_type.worse(by_downlink)
    }

    fn rank(self) -> u8 {
        match self {
            NetworkQuality::Fast => 0,
            NetworkQuality::Medium => 1,
            NetworkQuality::Slow => 2,
            NetworkQuality::Offline => 3,
        }
    }

    fn worse(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

/// Point-in-time view of every environment input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signals {
    pub visible: bool,
    pub online: bool,
    /// Estimated quality while online.
    pub quality: NetworkQuality,
    pub last_activity: DateTime<Utc>,
}

impl Signals {
    /// Quality as consumers should see it: offline overrides the estimate.
    pub fn effective_quality(&self) -> NetworkQuality {
        if self.online {
            self.quality
        } else {
            NetworkQuality::Offline
        }
    }
}

pub struct Environment {
    tx: watch::Sender<Signals>,
    clock: Arc<dyn Clock>,
}

impl Environment {
    /// Starts visible, online, fast, with activity "now".
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (tx, _rx) = watch::channel(Signals {
            visible: true,
            online: true,
            quality: NetworkQuality::Fast,
            last_activity: clock.now(),
        });
        Self { tx, clock }
    }

    pub fn snapshot(&self) -> Signals {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Signals> {
        self.tx.subscribe()
    }

    pub fn network_quality(&self) -> NetworkQuality {
        self.snapshot().effective_quality()
    }

    pub fn set_visible(&self, visible: bool) {
        let changed = self.tx.send_if_modified(|signals| {
            let changed = signals.visible != visible;
            signals.visible = visible;
            changed
        });
        if changed {
            debug!(visible, "Visibility changed");
        }
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|signals| {
            let changed = signals.online != online;
            signals.online = online;
            changed
        });
        if changed {
            info!(online, "Connectivity changed");
        }
    }

    /// Record a user interaction (pointer, keyboard, touch, scroll).
    pub fn record_activity(&self) {
        let now = self.clock.now();
        self.tx.send_modify(|signals| signals.last_activity = now);
    }

    pub fn set_network_quality(&self, quality: NetworkQuality) {
        let changed = self.tx.send_if_modified(|signals| {
            let changed = signals.quality != quality;
            signals.quality = quality;
            changed
        });
        if changed {
            debug!(?quality, "Network quality changed");
        }
    }

    pub fn set_network_estimate(&self, effective_type: &str, downlink_mbps: f64) {
        self.set_network_quality(NetworkQuality::from_estimate(effective_type, downlink_mbps));
    }
}
