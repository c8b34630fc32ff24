//! Configuration loading and merging logic
//!
//! Handles loading configuration from multiple sources and merging them
//! according to precedence rules.

use super::{defaults, paths, schema::Config};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with all layers merged
    ///
    /// Precedence order (highest to lowest):
    /// 1. Environment variable overrides
    /// 2. Root config (`<config dir>/config.yaml`)
    /// 3. Built-in defaults
    pub fn load() -> Result<Config> {
        Self::load_from(&paths::root_config_path())
    }

    /// Same as [`ConfigLoader::load`] with an explicit root config path.
    pub fn load_from(path: &Path) -> Result<Config> {
        let mut config = Self::load_defaults();
        if path.exists() {
            config = Self::load_file(path)?;
        }
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load configuration from a file. Missing keys take their defaults.
    pub fn load_file(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration by loading and checking for errors
    ///
    /// This performs strict validation - it will fail on:
    /// - Invalid YAML syntax
    /// - Unknown configuration keys
    /// - Invalid value types or out-of-range values
    /// - File read errors
    pub fn validate() -> Result<Config> {
        let config = Self::load().context("Failed to load merged configuration")?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
        Ok(config)
    }

    /// Load default configuration
    pub fn load_defaults() -> Config {
        defaults::default_config()
    }

    /// Apply environment variable overrides
    ///
    /// `lookup` is `std::env::var` outside of tests.
    fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secs) = lookup("KUBESYNC_POLL_INTERVAL_SECS") {
            config.controller.poll_interval_secs = secs
                .trim()
                .parse()
                .context("KUBESYNC_POLL_INTERVAL_SECS must be a number of seconds")?;
        }

        if let Some(dir) = lookup("KUBESYNC_STATE_DIR") {
            config.state_dir = Some(PathBuf::from(dir));
        }

        if let Some(level) = lookup("KUBESYNC_LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(())
    }

    /// State directory, falling back to the platform data directory.
    pub fn state_dir(config: &Config) -> PathBuf {
        config
            .state_dir
            .clone()
            .unwrap_or_else(paths::default_state_dir)
    }

    /// Save configuration to a file
    pub fn save(config: &Config, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            paths::ensure_dir(parent)?;
        }

        let yaml =
            serde_yaml::to_string(config).context("Failed to serialize configuration to YAML")?;

        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Save root configuration
    pub fn save_root(config: &Config) -> Result<()> {
        Self::save(config, &paths::root_config_path())
    }
}
