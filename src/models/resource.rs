//! Resource identity and manifest accessors
//!
//! A [`Manifest`] wraps one Kubernetes-style object as JSON. Desired manifests
//! come from the renderer, live ones from the destination; both use the same
//! accessors so the diff engine never needs to know where an object came from.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Annotation holding the integer sync wave of a resource.
pub const SYNC_WAVE_ANNOTATION: &str = "kubesync.io/sync-wave";
/// Annotation marking a resource as a hook bound to a sync phase.
pub const HOOK_ANNOTATION: &str = "kubesync.io/hook";
/// Annotation listing hook deletion policies.
pub const HOOK_DELETE_POLICY_ANNOTATION: &str = "kubesync.io/hook-delete-policy";
/// Annotation with per-resource sync options (`Prune=false`).
pub const SYNC_OPTIONS_ANNOTATION: &str = "kubesync.io/sync-options";
/// Label recording which Application manages a live resource.
pub const TRACKING_LABEL: &str = "app.kubesync.io/instance";

/// Identity of a resource at a destination: (group, kind, namespace, name).
///
/// Cluster-scoped resources use an empty namespace. The derived ordering is
/// used wherever output must be deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// `group/kind` for grouped APIs, `kind` for the core group.
    pub fn group_kind(&self) -> String {
        if self.group.is_empty() {
            self.kind.clone()
        } else {
            format!("{}/{}", self.group, self.kind)
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}:{}", self.group_kind(), self.name)
        } else {
            write!(f, "{}:{}/{}", self.group_kind(), self.namespace, self.name)
        }
    }
}

/// Hook phase a resource is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HookType {
    PreSync,
    Sync,
    PostSync,
    SyncFail,
}

impl HookType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::PreSync => "PreSync",
            HookType::Sync => "Sync",
            HookType::PostSync => "PostSync",
            HookType::SyncFail => "SyncFail",
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HookType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "PreSync" => Ok(HookType::PreSync),
            "Sync" => Ok(HookType::Sync),
            "PostSync" => Ok(HookType::PostSync),
            "SyncFail" => Ok(HookType::SyncFail),
            other => Err(format!("unknown hook type: {}", other)),
        }
    }
}

/// When a hook resource is removed. No policy means the hook is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookDeletePolicy {
    HookSucceeded,
    HookFailed,
    BeforeHookCreation,
}

impl FromStr for HookDeletePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "HookSucceeded" => Ok(HookDeletePolicy::HookSucceeded),
            "HookFailed" => Ok(HookDeletePolicy::HookFailed),
            "BeforeHookCreation" => Ok(HookDeletePolicy::BeforeHookCreation),
            other => Err(format!("unknown hook delete policy: {}", other)),
        }
    }
}

/// One Kubernetes-style object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(Value);

impl Manifest {
    /// Wrap an object, checking it carries `apiVersion`, `kind` and `metadata.name`.
    pub fn new(value: Value) -> Result<Self, String> {
        if !value.is_object() {
            return Err("manifest must be an object".to_string());
        }
        let manifest = Self(value);
        if manifest.api_version().is_empty() {
            return Err("missing apiVersion".to_string());
        }
        if manifest.kind().is_empty() {
            return Err("missing kind".to_string());
        }
        if manifest.name().is_empty() {
            return Err("missing metadata.name".to_string());
        }
        Ok(manifest)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn as_value_mut(&mut self) -> &mut Value {
        &mut self.0
    }

    pub fn api_version(&self) -> &str {
        self.0
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    pub fn kind(&self) -> &str {
        self.0.get("kind").and_then(|v| v.as_str()).unwrap_or_default()
    }

    /// API group from `apiVersion` (`apps/v1` -> `apps`, `v1` -> ``).
    pub fn group(&self) -> &str {
        match self.api_version().split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    pub fn name(&self) -> &str {
        self.metadata()
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata()
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .filter(|ns| !ns.is_empty())
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(
            self.group(),
            self.kind(),
            self.namespace().unwrap_or_default(),
            self.name(),
        )
    }

    pub fn metadata(&self) -> Option<&serde_json::Map<String, Value>> {
        self.0.get("metadata").and_then(|m| m.as_object())
    }

    pub fn spec(&self) -> Option<&Value> {
        self.0.get("spec")
    }

    pub fn status(&self) -> Option<&Value> {
        self.0.get("status")
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.string_map("labels")
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.string_map("annotations")
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata()
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.get(key))
            .and_then(|v| v.as_str())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata()
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(key))
            .and_then(|v| v.as_str())
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.metadata_mut()
            .insert("namespace".to_string(), Value::String(namespace.to_string()));
    }

    pub fn clear_namespace(&mut self) {
        self.metadata_mut().remove("namespace");
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        let metadata = self.metadata_mut();
        let labels = metadata
            .entry("labels")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !labels.is_object() {
            *labels = Value::Object(serde_json::Map::new());
        }
        if let Some(labels) = labels.as_object_mut() {
            labels.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    /// Sync wave from the annotation; 0 when absent.
    pub fn sync_wave(&self) -> Result<i32, String> {
        match self.annotation(SYNC_WAVE_ANNOTATION) {
            None => Ok(0),
            Some(raw) => raw
                .trim()
                .parse::<i32>()
                .map_err(|_| raw.to_string()),
        }
    }

    pub fn hook(&self) -> Result<Option<HookType>, String> {
        match self.annotation(HOOK_ANNOTATION) {
            None => Ok(None),
            Some(raw) => raw.parse::<HookType>().map(Some).map_err(|_| raw.to_string()),
        }
    }

    pub fn hook_delete_policies(&self) -> Result<Vec<HookDeletePolicy>, String> {
        match self.annotation(HOOK_DELETE_POLICY_ANNOTATION) {
            None => Ok(Vec::new()),
            Some(raw) => raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.parse::<HookDeletePolicy>().map_err(|_| raw.to_string()))
                .collect(),
        }
    }

    /// False when the resource opts out of pruning with `Prune=false`.
    pub fn prune_allowed(&self) -> bool {
        match self.annotation(SYNC_OPTIONS_ANNOTATION) {
            None => true,
            Some(raw) => !raw
                .split(',')
                .any(|opt| opt.trim().eq_ignore_ascii_case("Prune=false")),
        }
    }

    /// Application recorded in the tracking label, if any.
    pub fn tracked_by(&self) -> Option<&str> {
        self.label(TRACKING_LABEL)
    }

    fn string_map(&self, field: &str) -> BTreeMap<String, String> {
        self.metadata()
            .and_then(|m| m.get(field))
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn metadata_mut(&mut self) -> &mut serde_json::Map<String, Value> {
        if !self.0.is_object() {
            self.0 = Value::Object(serde_json::Map::new());
        }
        let root = match self.0.as_object_mut() {
            Some(root) => root,
            None => unreachable!("manifest root was just made an object"),
        };
        let metadata = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(serde_json::Map::new());
        }
        match metadata.as_object_mut() {
            Some(m) => m,
            None => unreachable!("metadata was just made an object"),
        }
    }
}

impl TryFrom<Value> for Manifest {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Manifest::new(value)
    }
}

/// Format a resource key the way log lines and status output show it.
pub fn resource_key(manifest: &Manifest) -> String {
    manifest.key().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> Manifest {
        Manifest::new(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "shop",
                "annotations": {
                    "kubesync.io/sync-wave": "2",
                    "kubesync.io/sync-options": "Prune=false"
                }
            },
            "spec": {"replicas": 2}
        }))
        .unwrap()
    }

    #[test]
    fn test_key_and_display() {
        let m = deployment();
        let key = m.key();
        assert_eq!(key, ResourceKey::new("apps", "Deployment", "shop", "web"));
        assert_eq!(key.to_string(), "apps/Deployment:shop/web");

        let ns = ResourceKey::new("", "Namespace", "", "shop");
        assert_eq!(ns.to_string(), "Namespace:shop");
    }

    #[test]
    fn test_annotations() {
        let m = deployment();
        assert_eq!(m.sync_wave(), Ok(2));
        assert_eq!(m.hook(), Ok(None));
        assert!(!m.prune_allowed());
    }

    #[test]
    fn test_invalid_wave_is_reported() {
        let m = Manifest::new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "c", "annotations": {"kubesync.io/sync-wave": "soon"}}
        }))
        .unwrap();
        assert_eq!(m.sync_wave(), Err("soon".to_string()));
    }

    #[test]
    fn test_hook_policies() {
        let m = Manifest::new(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": "migrate",
                "annotations": {
                    "kubesync.io/hook": "PreSync",
                    "kubesync.io/hook-delete-policy": "HookSucceeded, BeforeHookCreation"
                }
            }
        }))
        .unwrap();
        assert_eq!(m.hook(), Ok(Some(HookType::PreSync)));
        assert_eq!(
            m.hook_delete_policies(),
            Ok(vec![
                HookDeletePolicy::HookSucceeded,
                HookDeletePolicy::BeforeHookCreation
            ])
        );
    }

    #[test]
    fn test_set_label_creates_metadata_maps() {
        let mut m = Manifest::new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "c"}
        }))
        .unwrap();
        m.set_label(TRACKING_LABEL, "guestbook");
        m.set_namespace("default");
        assert_eq!(m.tracked_by(), Some("guestbook"));
        assert_eq!(m.namespace(), Some("default"));
    }

    #[test]
    fn test_manifest_requires_identity() {
        assert!(Manifest::new(json!({"kind": "ConfigMap"})).is_err());
        assert!(Manifest::new(json!("text")).is_err());
    }
}
