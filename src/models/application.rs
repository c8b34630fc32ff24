//! Application declarations
//!
//! An Application binds one source to one destination under a sync policy.
//! The reconciliation loop only reads these; they change through operator
//! actions (`app add`, `app delete`) and nothing else.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::ResourceKey;

/// A named, durable declaration of what to deploy and where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub name: String,
    pub source: ApplicationSource,
    pub destination: ApplicationDestination,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
}

impl Application {
    /// Check the declaration is usable before it is stored.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
        {
            return Err(format!(
                "name '{}' may only contain alphanumerics, '-', '_' and '.'",
                self.name
            ));
        }
        if self.source.repo_url.trim().is_empty() {
            return Err("source.repoURL must not be empty".to_string());
        }
        if self.destination.server.trim().is_empty() {
            return Err("destination.server must not be empty".to_string());
        }
        if self.destination.namespace.trim().is_empty() {
            return Err("destination.namespace must not be empty".to_string());
        }
        self.sync_policy.retry.validate()?;
        Ok(())
    }
}

/// Where the desired state lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSource {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default = "default_revision")]
    pub target_revision: String,
    #[serde(default)]
    pub path: String,
    /// Parameters for templated (chart) sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartParameters>,
}

/// Overrides applied when the source path holds a chart.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    /// Value files relative to the chart directory, merged in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_files: Vec<String>,
    /// Dotted `a.b.c` paths to values; applied after value files.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Where the desired state is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDestination {
    pub server: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Sync automatically when the source moves to a new revision.
    #[serde(default)]
    pub automated: bool,
    /// Delete live resources no longer present in the desired state.
    #[serde(default)]
    pub prune: bool,
    /// Re-sync on drift even when the revision did not change.
    #[serde(default)]
    pub self_heal: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_differences: Vec<IgnoreDifference>,
    #[serde(default)]
    pub sync_options: SyncOptions,
}

/// Retry budget for a single action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_retry_limit")]
    pub limit: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.limit == 0 {
            return Err("syncPolicy.retry.limit must be at least 1".to_string());
        }
        if self.backoff.factor < 1.0 {
            return Err("syncPolicy.retry.backoff.factor must be >= 1".to_string());
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: default_retry_limit(),
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

impl BackoffConfig {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            factor: default_backoff_factor(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

/// Fields excluded from comparison for matching resources.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnoreDifference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// RFC 6901 pointers, e.g. `/spec/replicas`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub json_pointers: Vec<String>,
    /// Dotted paths, e.g. `.spec.template.spec.containers[].image`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_paths: Vec<String>,
}

impl IgnoreDifference {
    pub fn matches(&self, key: &ResourceKey) -> bool {
        if self.kind != key.kind {
            return false;
        }
        if let Some(group) = &self.group {
            if group != &key.group {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if name != &key.name {
                return false;
            }
        }
        if let Some(namespace) = &self.namespace {
            if namespace != &key.namespace {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    /// Run every prune after the last wave instead of within its own wave.
    #[serde(default)]
    pub prune_last: bool,
    #[serde(default)]
    pub prune_propagation_policy: PropagationPolicy,
    /// Keep live values of ignored fields when updating.
    #[serde(default)]
    pub respect_ignore_differences: bool,
}

/// Cascading behaviour of deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropagationPolicy {
    #[default]
    Foreground,
    Background,
    Orphan,
}

impl PropagationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropagationPolicy::Foreground => "Foreground",
            PropagationPolicy::Background => "Background",
            PropagationPolicy::Orphan => "Orphan",
        }
    }
}

fn default_revision() -> String {
    "HEAD".to_string()
}

fn default_retry_limit() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    5_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_backoff_max_ms() -> u64 {
    180_000
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUESTBOOK: &str = r#"
name: guestbook
source:
  repoURL: https://github.com/example/apps.git
  path: guestbook
destination:
  server: https://kubernetes.default.svc
  namespace: guestbook
syncPolicy:
  automated: true
  prune: true
  retry:
    limit: 3
    backoff:
      baseMs: 100
  ignoreDifferences:
    - group: apps
      kind: Deployment
      jsonPointers: ["/spec/replicas"]
  syncOptions:
    pruneLast: true
    prunePropagationPolicy: background
"#;

    #[test]
    fn test_application_deserialization() {
        let app: Application = serde_yaml::from_str(GUESTBOOK).unwrap();
        assert_eq!(app.name, "guestbook");
        assert_eq!(app.source.target_revision, "HEAD");
        assert!(app.sync_policy.automated);
        assert!(app.sync_policy.prune);
        assert!(!app.sync_policy.self_heal);
        assert_eq!(app.sync_policy.retry.limit, 3);
        assert_eq!(app.sync_policy.retry.backoff.base_ms, 100);
        assert_eq!(app.sync_policy.retry.backoff.factor, 2.0);
        assert!(app.sync_policy.sync_options.prune_last);
        assert_eq!(
            app.sync_policy.sync_options.prune_propagation_policy,
            PropagationPolicy::Background
        );
        assert!(app.validate().is_ok());
    }

    #[test]
    fn test_ignore_difference_matching() {
        let rule = IgnoreDifference {
            group: Some("apps".into()),
            kind: "Deployment".into(),
            ..Default::default()
        };
        assert!(rule.matches(&ResourceKey::new("apps", "Deployment", "ns", "web")));
        assert!(!rule.matches(&ResourceKey::new("", "ConfigMap", "ns", "web")));
        assert!(!rule.matches(&ResourceKey::new("extensions", "Deployment", "ns", "web")));
    }

    #[test]
    fn test_validation_rejects_zero_retry_limit() {
        let mut app: Application = serde_yaml::from_str(GUESTBOOK).unwrap();
        app.sync_policy.retry.limit = 0;
        assert!(app.validate().is_err());

        app.sync_policy.retry.limit = 1;
        app.name = "bad name".into();
        assert!(app.validate().is_err());
    }
}
