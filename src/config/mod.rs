//! Configuration system for kubesync
//!
//! Layered YAML configuration: built-in defaults, the root config file, then
//! environment overrides.

mod defaults;
pub mod loader;
pub mod paths;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::Config;

use anyhow::{Context, anyhow};

/// Every key accepted by `config get` and `config set`.
pub const KEYS: &[&str] = &[
    "controller.pollIntervalSecs",
    "controller.maxConcurrentObservations",
    "controller.historyRetention",
    "timeouts.fetchSecs",
    "timeouts.observeSecs",
    "timeouts.applySecs",
    "timeouts.hookSecs",
    "timeouts.hookPollMillis",
    "retry.limit",
    "retry.baseMs",
    "retry.factor",
    "retry.maxMs",
    "cache.capacity",
    "cache.ttlSecs",
    "destination.server",
    "destination.context",
    "destination.pruneKinds",
    "stateDir",
    "logLevel",
];

/// Get a configuration value by key (dot notation)
pub fn get_config_value(config: &Config, key: &str) -> anyhow::Result<String> {
    let value = match key {
        "controller.pollIntervalSecs" => config.controller.poll_interval_secs.to_string(),
        "controller.maxConcurrentObservations" => {
            config.controller.max_concurrent_observations.to_string()
        }
        "controller.historyRetention" => config.controller.history_retention.to_string(),
        "timeouts.fetchSecs" => config.timeouts.fetch_secs.to_string(),
        "timeouts.observeSecs" => config.timeouts.observe_secs.to_string(),
        "timeouts.applySecs" => config.timeouts.apply_secs.to_string(),
        "timeouts.hookSecs" => config.timeouts.hook_secs.to_string(),
        "timeouts.hookPollMillis" => config.timeouts.hook_poll_millis.to_string(),
        "retry.limit" => config.retry.limit.to_string(),
        "retry.baseMs" => config.retry.base_ms.to_string(),
        "retry.factor" => config.retry.factor.to_string(),
        "retry.maxMs" => config.retry.max_ms.to_string(),
        "cache.capacity" => config.cache.capacity.to_string(),
        "cache.ttlSecs" => config.cache.ttl_secs.to_string(),
        "destination.server" => config.destination.server.clone(),
        "destination.context" => config.destination.context.clone().unwrap_or_default(),
        "destination.pruneKinds" => config.destination.prune_kinds.join(","),
        "stateDir" => ConfigLoader::state_dir(config).display().to_string(),
        "logLevel" => config.log_level.clone(),
        _ => return Err(anyhow!("Unknown configuration key: {}", key)),
    };
    Ok(value)
}

/// Set a configuration value by key (dot notation)
pub fn set_config_value(config: &mut Config, key: &str, value: &str) -> anyhow::Result<()> {
    match key {
        "controller.pollIntervalSecs" => {
            config.controller.poll_interval_secs = parse(key, value)?;
        }
        "controller.maxConcurrentObservations" => {
            config.controller.max_concurrent_observations = parse(key, value)?;
        }
        "controller.historyRetention" => {
            config.controller.history_retention = parse(key, value)?;
        }
        "timeouts.fetchSecs" => config.timeouts.fetch_secs = parse(key, value)?,
        "timeouts.observeSecs" => config.timeouts.observe_secs = parse(key, value)?,
        "timeouts.applySecs" => config.timeouts.apply_secs = parse(key, value)?,
        "timeouts.hookSecs" => config.timeouts.hook_secs = parse(key, value)?,
        "timeouts.hookPollMillis" => config.timeouts.hook_poll_millis = parse(key, value)?,
        "retry.limit" => config.retry.limit = parse(key, value)?,
        "retry.baseMs" => config.retry.base_ms = parse(key, value)?,
        "retry.factor" => config.retry.factor = parse(key, value)?,
        "retry.maxMs" => config.retry.max_ms = parse(key, value)?,
        "cache.capacity" => config.cache.capacity = parse(key, value)?,
        "cache.ttlSecs" => config.cache.ttl_secs = parse(key, value)?,
        "destination.server" => config.destination.server = value.to_string(),
        "destination.context" => {
            config.destination.context = (!value.is_empty()).then(|| value.to_string());
        }
        "destination.pruneKinds" => {
            // YAML array or comma-separated list
            config.destination.prune_kinds = if value.trim_start().starts_with('[') {
                serde_yaml::from_str(value).context(
                    "destination.pruneKinds must be a YAML array (e.g., ['ConfigMap', 'apps/Deployment'])",
                )?
            } else {
                value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            };
        }
        "stateDir" => {
            config.state_dir = (!value.is_empty()).then(|| value.into());
        }
        "logLevel" => config.log_level = value.to_string(),
        _ => return Err(anyhow!("Unknown configuration key: {}", key)),
    }

    config
        .validate()
        .map_err(|e| anyhow!("Invalid value for {}: {}", key, e))
}

fn parse<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{} must be a number", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_key_round_trips_through_get() {
        let config = Config::default();
        for key in KEYS {
            assert!(get_config_value(&config, key).is_ok(), "{}", key);
        }
        assert!(get_config_value(&config, "controller.unknownKey").is_err());
    }

    #[test]
    fn test_set_values() {
        let mut config = Config::default();
        set_config_value(&mut config, "controller.pollIntervalSecs", "60").unwrap();
        set_config_value(&mut config, "destination.pruneKinds", "ConfigMap, apps/Deployment")
            .unwrap();
        set_config_value(&mut config, "destination.context", "kind-dev").unwrap();

        assert_eq!(config.controller.poll_interval_secs, 60);
        assert_eq!(
            config.destination.prune_kinds,
            vec!["ConfigMap".to_string(), "apps/Deployment".to_string()]
        );
        assert_eq!(get_config_value(&config, "destination.context").unwrap(), "kind-dev");

        set_config_value(&mut config, "destination.context", "").unwrap();
        assert_eq!(config.destination.context, None);
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = Config::default();
        assert!(set_config_value(&mut config, "retry.limit", "many").is_err());
        assert!(set_config_value(&mut config, "controller.pollIntervalSecs", "0").is_err());
        assert!(set_config_value(&mut config, "readOnly", "true").is_err());
    }
}
