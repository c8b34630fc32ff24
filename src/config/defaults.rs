//! Default configuration values

use super::schema::Config;

/// Get the default configuration
pub fn default_config() -> Config {
    Config::default()
}

pub(super) fn default_poll_interval_secs() -> u64 {
    180
}

pub(super) fn default_max_concurrent_observations() -> usize {
    16
}

pub(super) fn default_history_retention() -> usize {
    10
}

pub(super) fn default_fetch_secs() -> u64 {
    60
}

pub(super) fn default_observe_secs() -> u64 {
    30
}

pub(super) fn default_apply_secs() -> u64 {
    30
}

pub(super) fn default_hook_secs() -> u64 {
    300
}

pub(super) fn default_hook_poll_millis() -> u64 {
    2_000
}

pub(super) fn default_retry_limit() -> u32 {
    5
}

pub(super) fn default_retry_base_ms() -> u64 {
    5_000
}

pub(super) fn default_retry_factor() -> f64 {
    2.0
}

pub(super) fn default_retry_max_ms() -> u64 {
    180_000
}

pub(super) fn default_cache_capacity() -> usize {
    32
}

pub(super) fn default_cache_ttl_secs() -> u64 {
    3_600
}

pub(super) fn default_server() -> String {
    "https://kubernetes.default.svc".to_string()
}

pub(super) fn default_prune_kinds() -> Vec<String> {
    [
        "ConfigMap",
        "Secret",
        "Service",
        "ServiceAccount",
        "PersistentVolumeClaim",
        "apps/Deployment",
        "apps/StatefulSet",
        "apps/DaemonSet",
        "batch/Job",
        "batch/CronJob",
        "networking.k8s.io/Ingress",
        "rbac.authorization.k8s.io/Role",
        "rbac.authorization.k8s.io/RoleBinding",
    ]
    .iter()
    .map(|kind| kind.to_string())
    .collect()
}

pub(super) fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = default_config();
        assert_eq!(config.timeouts.hook_secs, 300);
        assert!(
            config
                .destination
                .prune_kinds
                .iter()
                .any(|k| k == "apps/Deployment")
        );
    }
}
