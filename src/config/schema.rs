//! Configuration schema definitions
//!
//! Defines the structure of configuration files using serde for serialization.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::defaults::*;
use crate::controller::ControllerSettings;
use crate::executor::{ExecutorSettings, RetryPolicy};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Timeouts of blocking calls
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Backoff after a transient reconciliation failure
    #[serde(default)]
    pub retry: RetryDefaults,

    /// Fetched source cache
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub destination: DestinationConfig,

    /// Where applications, status and history are kept.
    /// Defaults to `<data dir>/state`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ControllerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Concurrent reads per observation pass
    #[serde(default = "default_max_concurrent_observations")]
    pub max_concurrent_observations: usize,

    /// Sync operations kept per application
    #[serde(default = "default_history_retention")]
    pub history_retention: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TimeoutsConfig {
    #[serde(default = "default_fetch_secs")]
    pub fetch_secs: u64,
    #[serde(default = "default_observe_secs")]
    pub observe_secs: u64,
    #[serde(default = "default_apply_secs")]
    pub apply_secs: u64,
    #[serde(default = "default_hook_secs")]
    pub hook_secs: u64,
    #[serde(default = "default_hook_poll_millis")]
    pub hook_poll_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryDefaults {
    /// Consecutive failures after which the delay stops growing
    #[serde(default = "default_retry_limit")]
    pub limit: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub factor: f64,
    #[serde(default = "default_retry_max_ms")]
    pub max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DestinationConfig {
    /// Server name applications use to target this cluster
    #[serde(default = "default_server")]
    pub server: String,

    /// Kubeconfig context; the current context when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// Kinds listed when looking for prune candidates (`group/Kind`)
    #[serde(default = "default_prune_kinds")]
    pub prune_kinds: Vec<String>,
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.controller.poll_interval_secs == 0 {
            return Err("controller.pollIntervalSecs must be at least 1".to_string());
        }
        if self.controller.max_concurrent_observations == 0 {
            return Err("controller.maxConcurrentObservations must be at least 1".to_string());
        }
        if self.controller.history_retention == 0 {
            return Err("controller.historyRetention must be at least 1".to_string());
        }
        if self.retry.limit == 0 {
            return Err("retry.limit must be at least 1".to_string());
        }
        if self.retry.factor < 1.0 {
            return Err("retry.factor must be >= 1".to_string());
        }
        if self.retry.base_ms > self.retry.max_ms {
            return Err("retry.baseMs must not exceed retry.maxMs".to_string());
        }
        if self.destination.server.trim().is_empty() {
            return Err("destination.server must not be empty".to_string());
        }
        if tracing_subscriber::EnvFilter::try_new(&self.log_level).is_err() {
            return Err(format!("logLevel '{}' is not a valid filter", self.log_level));
        }
        Ok(())
    }

    /// Controller timing derived from this configuration.
    pub fn controller_settings(&self) -> ControllerSettings {
        let timeouts = &self.timeouts;
        ControllerSettings {
            poll_interval: Duration::from_secs(self.controller.poll_interval_secs),
            fetch_timeout: Duration::from_secs(timeouts.fetch_secs),
            observe_timeout: Duration::from_secs(timeouts.observe_secs),
            max_concurrent_observations: self.controller.max_concurrent_observations,
            executor: ExecutorSettings {
                call_timeout: Duration::from_secs(timeouts.apply_secs),
                hook_timeout: Duration::from_secs(timeouts.hook_secs),
                hook_poll_interval: Duration::from_millis(timeouts.hook_poll_millis),
            },
            backoff: RetryPolicy::new(
                self.retry.limit,
                Duration::from_millis(self.retry.base_ms),
                self.retry.factor,
                Duration::from_millis(self.retry.max_ms),
            ),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            timeouts: TimeoutsConfig::default(),
            retry: RetryDefaults::default(),
            cache: CacheConfig::default(),
            destination: DestinationConfig::default(),
            state_dir: None,
            log_level: default_log_level(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_concurrent_observations: default_max_concurrent_observations(),
            history_retention: default_history_retention(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            fetch_secs: default_fetch_secs(),
            observe_secs: default_observe_secs(),
            apply_secs: default_apply_secs(),
            hook_secs: default_hook_secs(),
            hook_poll_millis: default_hook_poll_millis(),
        }
    }
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            limit: default_retry_limit(),
            base_ms: default_retry_base_ms(),
            factor: default_retry_factor(),
            max_ms: default_retry_max_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            context: None,
            prune_kinds: default_prune_kinds(),
        }
    }
}
