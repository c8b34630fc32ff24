//! Kind registry
//!
//! One table answers every per-kind question the engine has: is the kind
//! namespaced, which health rule applies, and how updates are applied.
//! To add built-in knowledge of a kind, add an entry to `BUILTIN_KINDS`.
//! Custom kinds can be registered at runtime with [`KindRegistry::register`].
//!
//! Kinds that are not registered are treated as namespaced, applied in place,
//! and evaluated with the generic condition rule.

use std::collections::HashMap;

use crate::health::{HealthRule, rules};
use crate::models::{ResourceKey, ResourceKind};

/// How an Update action reaches the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyStrategy {
    /// Server-side apply in place.
    #[default]
    Apply,
    /// Delete then apply. Used for kinds whose spec is immutable once created.
    Recreate,
}

/// Built-in registry entry
pub struct BuiltinKind {
    pub kind: ResourceKind,
    pub aliases: &'static [&'static str],
    pub namespaced: bool,
    pub health: Option<HealthRule>,
    pub apply: ApplyStrategy,
}

/// Kinds the engine knows about out of the box
pub const BUILTIN_KINDS: &[BuiltinKind] = &[
    // Core
    BuiltinKind {
        kind: ResourceKind::Namespace,
        aliases: &["namespace", "namespaces", "ns"],
        namespaced: false,
        health: None,
        apply: ApplyStrategy::Apply,
    },
    BuiltinKind {
        kind: ResourceKind::ConfigMap,
        aliases: &["configmap", "configmaps", "cm"],
        namespaced: true,
        health: None,
        apply: ApplyStrategy::Apply,
    },
    BuiltinKind {
        kind: ResourceKind::Secret,
        aliases: &["secret", "secrets"],
        namespaced: true,
        health: None,
        apply: ApplyStrategy::Apply,
    },
    BuiltinKind {
        kind: ResourceKind::Service,
        aliases: &["service", "services", "svc"],
        namespaced: true,
        health: Some(rules::service),
        apply: ApplyStrategy::Apply,
    },
    BuiltinKind {
        kind: ResourceKind::ServiceAccount,
        aliases: &["serviceaccount", "serviceaccounts", "sa"],
        namespaced: true,
        health: None,
        apply: ApplyStrategy::Apply,
    },
    BuiltinKind {
        kind: ResourceKind::Pod,
        aliases: &["pod", "pods", "po"],
        namespaced: true,
        health: Some(rules::pod),
        apply: ApplyStrategy::Recreate,
    },
    BuiltinKind {
        kind: ResourceKind::PersistentVolume,
        aliases: &["persistentvolume", "persistentvolumes", "pv"],
        namespaced: false,
        health: None,
        apply: ApplyStrategy::Apply,
    },
    BuiltinKind {
        kind: ResourceKind::PersistentVolumeClaim,
        aliases: &["persistentvolumeclaim", "persistentvolumeclaims", "pvc"],
        namespaced: true,
        health: Some(rules::persistent_volume_claim),
        apply: ApplyStrategy::Apply,
    },
    // apps
    BuiltinKind {
        kind: ResourceKind::Deployment,
        aliases: &["deployment", "deployments", "deploy"],
        namespaced: true,
        health: Some(rules::deployment),
        apply: ApplyStrategy::Apply,
    },
    BuiltinKind {
        kind: ResourceKind::StatefulSet,
        aliases: &["statefulset", "statefulsets", "sts"],
        namespaced: true,
        health: Some(rules::stateful_set),
        apply: ApplyStrategy::Apply,
    },
    BuiltinKind {
        kind: ResourceKind::DaemonSet,
        aliases: &["daemonset", "daemonsets", "ds"],
        namespaced: true,
        health: Some(rules::daemon_set),
        apply: ApplyStrategy::Apply,
    },
    BuiltinKind {
        kind: ResourceKind::ReplicaSet,
        aliases: &["replicaset", "replicasets", "rs"],
        namespaced: true,
        health: Some(rules::replica_set),
        apply: ApplyStrategy::Apply,
    },
    // batch
    BuiltinKind {
        kind: ResourceKind::Job,
        aliases: &["job", "jobs"],
        namespaced: true,
        health: Some(rules::job),
        apply: ApplyStrategy::Recreate,
    },
    BuiltinKind {
        kind: ResourceKind::CronJob,
        aliases: &["cronjob", "cronjobs", "cj"],
        namespaced: true,
        health: None,
        apply: ApplyStrategy::Apply,
    },
    // networking
    BuiltinKind {
        kind: ResourceKind::Ingress,
        aliases: &["ingress", "ingresses", "ing"],
        namespaced: true,
        health: Some(rules::ingress),
        apply: ApplyStrategy::Apply,
    },
    // rbac
    BuiltinKind {
        kind: ResourceKind::Role,
        aliases: &["role", "roles"],
        namespaced: true,
        health: None,
        apply: ApplyStrategy::Apply,
    },
    BuiltinKind {
        kind: ResourceKind::RoleBinding,
        aliases: &["rolebinding", "rolebindings"],
        namespaced: true,
        health: None,
        apply: ApplyStrategy::Apply,
    },
    BuiltinKind {
        kind: ResourceKind::ClusterRole,
        aliases: &["clusterrole", "clusterroles"],
        namespaced: false,
        health: None,
        apply: ApplyStrategy::Apply,
    },
    BuiltinKind {
        kind: ResourceKind::ClusterRoleBinding,
        aliases: &["clusterrolebinding", "clusterrolebindings"],
        namespaced: false,
        health: None,
        apply: ApplyStrategy::Apply,
    },
    BuiltinKind {
        kind: ResourceKind::CustomResourceDefinition,
        aliases: &["customresourcedefinition", "customresourcedefinitions", "crd", "crds"],
        namespaced: false,
        health: None,
        apply: ApplyStrategy::Apply,
    },
];

/// Resolved per-kind behaviour.
#[derive(Clone)]
pub struct KindEntry {
    pub group: String,
    pub kind: String,
    pub aliases: Vec<String>,
    pub namespaced: bool,
    pub health: Option<HealthRule>,
    pub apply: ApplyStrategy,
}

impl KindEntry {
    /// Entry for a kind with no built-in handling.
    pub fn custom(group: &str, kind: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
            aliases: vec![kind.to_lowercase()],
            namespaced,
            health: None,
            apply: ApplyStrategy::Apply,
        }
    }

    pub fn with_health(mut self, rule: HealthRule) -> Self {
        self.health = Some(rule);
        self
    }

    pub fn with_apply(mut self, apply: ApplyStrategy) -> Self {
        self.apply = apply;
        self
    }
}

impl std::fmt::Debug for KindEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindEntry")
            .field("group", &self.group)
            .field("kind", &self.kind)
            .field("namespaced", &self.namespaced)
            .field("has_health_rule", &self.health.is_some())
            .field("apply", &self.apply)
            .finish()
    }
}

impl From<&BuiltinKind> for KindEntry {
    fn from(builtin: &BuiltinKind) -> Self {
        Self {
            group: builtin.kind.group().to_string(),
            kind: builtin.kind.as_str().to_string(),
            aliases: builtin.aliases.iter().map(|a| a.to_string()).collect(),
            namespaced: builtin.namespaced,
            health: builtin.health,
            apply: builtin.apply,
        }
    }
}

/// Lookup table keyed by (group, kind).
#[derive(Debug, Clone)]
pub struct KindRegistry {
    entries: HashMap<(String, String), KindEntry>,
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl KindRegistry {
    /// Registry seeded with every built-in kind.
    pub fn builtin() -> Self {
        let entries = BUILTIN_KINDS
            .iter()
            .map(|b| {
                let entry = KindEntry::from(b);
                ((entry.group.clone(), entry.kind.clone()), entry)
            })
            .collect();
        Self { entries }
    }

    /// Add or replace an entry.
    pub fn register(&mut self, entry: KindEntry) {
        self.entries
            .insert((entry.group.clone(), entry.kind.clone()), entry);
    }

    pub fn get(&self, group: &str, kind: &str) -> Option<&KindEntry> {
        self.entries.get(&(group.to_string(), kind.to_string()))
    }

    pub fn for_key(&self, key: &ResourceKey) -> Option<&KindEntry> {
        self.get(&key.group, &key.kind)
    }

    /// Find an entry by kind name or alias (case-insensitive).
    pub fn find_by_alias(&self, alias: &str) -> Option<&KindEntry> {
        let needle = alias.to_lowercase();
        let mut matches: Vec<&KindEntry> = self
            .entries
            .values()
            .filter(|e| e.kind.to_lowercase() == needle || e.aliases.iter().any(|a| a == &needle))
            .collect();
        // Prefer the core group when the same name exists in several groups.
        matches.sort_by(|a, b| a.group.cmp(&b.group));
        matches.into_iter().next()
    }

    pub fn is_namespaced(&self, group: &str, kind: &str) -> bool {
        self.get(group, kind).map(|e| e.namespaced).unwrap_or(true)
    }

    pub fn apply_strategy(&self, group: &str, kind: &str) -> ApplyStrategy {
        self.get(group, kind).map(|e| e.apply).unwrap_or_default()
    }

    pub fn health_rule(&self, group: &str, kind: &str) -> Option<HealthRule> {
        self.get(group, kind).and_then(|e| e.health)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
