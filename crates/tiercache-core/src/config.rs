//! Configuration management.
//!
//! All thresholds used by the cache, circuit breaker, request scheduler and
//! fetch controller live here as tunable defaults. Configuration is stored at
//! `~/.config/tiercache/config.json`; durations are written as milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "tiercache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte capacity of the in-memory LRU tier.
    pub memory_capacity_bytes: usize,
    #[serde(with = "crate::utils::duration_ms")]
    pub default_ttl: Duration,
    /// Entries written under any other version are ignored on read.
    pub version: String,
    /// Largest serialized entry the flat tier will accept.
    pub flat_max_entry_bytes: usize,
    /// Ceiling for the whole flat tier file.
    pub flat_quota_bytes: usize,
    pub flat_key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity_bytes: 50 * 1024 * 1024,
            default_ttl: Duration::from_secs(5 * 60),
            version: env!("CARGO_PKG_VERSION").to_string(),
            flat_max_entry_bytes: 1024 * 1024,
            flat_quota_bytes: crate::cache::DEFAULT_FLAT_QUOTA_BYTES,
            flat_key_prefix: "tiercache:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a trial.
    #[serde(with = "crate::utils::duration_ms")]
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Simultaneous in-flight requests (critical requests skip the wait).
    pub max_concurrent: usize,
    #[serde(with = "crate::utils::duration_ms")]
    pub batch_window: Duration,
    /// Timeout on a fast connection; scaled by network quality.
    #[serde(with = "crate::utils::duration_ms")]
    pub base_timeout: Duration,
    #[serde(with = "crate::utils::duration_ms")]
    pub offline_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "crate::utils::duration_ms")]
    pub retry_delay_fast: Duration,
    #[serde(with = "crate::utils::duration_ms")]
    pub retry_delay_medium: Duration,
    #[serde(with = "crate::utils::duration_ms")]
    pub retry_delay_slow: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            batch_window: Duration::from_millis(10),
            base_timeout: Duration::from_secs(10),
            offline_timeout: Duration::from_millis(1),
            max_retries: 3,
            retry_delay_fast: Duration::from_millis(100),
            retry_delay_medium: Duration::from_millis(300),
            retry_delay_slow: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    #[serde(with = "crate::utils::duration_ms")]
    pub base_interval: Duration,
    #[serde(with = "crate::utils::duration_ms")]
    pub min_interval: Duration,
    #[serde(with = "crate::utils::duration_ms")]
    pub max_interval: Duration,
    /// Floor for the interval while the application is hidden.
    #[serde(with = "crate::utils::duration_ms")]
    pub background_interval: Duration,
    /// Jitter is drawn uniformly from `[-jitter, +jitter]`.
    #[serde(with = "crate::utils::duration_ms")]
    pub jitter: Duration,
    /// Activity more recent than this means the user is active.
    #[serde(with = "crate::utils::duration_ms")]
    pub active_threshold: Duration,
    /// Activity older than this means the user is idle.
    #[serde(with = "crate::utils::duration_ms")]
    pub idle_threshold: Duration,
    /// Cache hit rate above which aggressive polling is toned down.
    pub high_hit_rate: f64,
    pub max_fetches_per_window: usize,
    #[serde(with = "crate::utils::duration_ms")]
    pub rate_window: Duration,
    pub max_burst: usize,
    #[serde(with = "crate::utils::duration_ms")]
    pub burst_window: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(60),
            min_interval: Duration::from_secs(15),
            max_interval: Duration::from_secs(10 * 60),
            background_interval: Duration::from_secs(5 * 60),
            jitter: Duration::from_secs(5),
            active_threshold: Duration::from_secs(10),
            idle_threshold: Duration::from_secs(180),
            high_hit_rate: 0.8,
            max_fetches_per_window: 4,
            rate_window: Duration::from_secs(60),
            max_burst: 2,
            burst_window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Base URL the HTTP transport prefixes to every endpoint.
    pub base_url: Option<String>,
    /// Overrides the platform cache directory for persisted tiers.
    pub cache_dir: Option<PathBuf>,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub scheduler: SchedulerConfig,
    pub fetch: FetchConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load from an explicit path; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_documented_thresholds() {
        let config = Config::default();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cool_down, Duration::from_secs(30));
        assert_eq!(config.scheduler.max_concurrent, 6);
        assert_eq!(config.scheduler.batch_window, Duration::from_millis(10));
        assert_eq!(config.fetch.max_fetches_per_window, 4);
        assert_eq!(config.fetch.rate_window, Duration::from_secs(60));
        assert_eq!(config.fetch.max_burst, 2);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"base_url": "https://api.example.com", "breaker": {"cool_down": 5000}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.breaker.cool_down, Duration::from_secs(5));
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.fetch.base_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.cache_dir = Some(temp_dir.path().join("cache"));
        config.fetch.jitter = Duration::from_millis(250);
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.fetch.jitter, Duration::from_millis(250));
        assert_eq!(loaded.cache_dir().unwrap(), temp_dir.path().join("cache"));
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = Config::load_from(&temp_dir.path().join("absent.json")).unwrap();
        assert!(config.base_url.is_none());
    }

    #[test]
    fn test_invalid_file_is_error() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
