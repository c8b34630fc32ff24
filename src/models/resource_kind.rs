//! Built-in resource kind definitions
//!
//! Centralized enum for the Kubernetes kinds the engine has dedicated
//! knowledge of (health rules, scope, apply strategy). Anything else is
//! handled generically by group/kind strings.

use std::fmt;
use std::str::FromStr;

/// Kubernetes kinds with built-in handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    // Core
    Namespace,
    ConfigMap,
    Secret,
    Service,
    ServiceAccount,
    Pod,
    PersistentVolume,
    PersistentVolumeClaim,
    // apps
    Deployment,
    StatefulSet,
    DaemonSet,
    ReplicaSet,
    // batch
    Job,
    CronJob,
    // networking.k8s.io
    Ingress,
    // rbac.authorization.k8s.io
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
    // apiextensions.k8s.io
    CustomResourceDefinition,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::Service => "Service",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::Pod => "Pod",
            ResourceKind::PersistentVolume => "PersistentVolume",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::DaemonSet => "DaemonSet",
            ResourceKind::ReplicaSet => "ReplicaSet",
            ResourceKind::Job => "Job",
            ResourceKind::CronJob => "CronJob",
            ResourceKind::Ingress => "Ingress",
            ResourceKind::Role => "Role",
            ResourceKind::RoleBinding => "RoleBinding",
            ResourceKind::ClusterRole => "ClusterRole",
            ResourceKind::ClusterRoleBinding => "ClusterRoleBinding",
            ResourceKind::CustomResourceDefinition => "CustomResourceDefinition",
        }
    }

    /// API group the kind lives in (empty for core).
    pub fn group(&self) -> &'static str {
        match self {
            ResourceKind::Namespace
            | ResourceKind::ConfigMap
            | ResourceKind::Secret
            | ResourceKind::Service
            | ResourceKind::ServiceAccount
            | ResourceKind::Pod
            | ResourceKind::PersistentVolume
            | ResourceKind::PersistentVolumeClaim => "",
            ResourceKind::Deployment
            | ResourceKind::StatefulSet
            | ResourceKind::DaemonSet
            | ResourceKind::ReplicaSet => "apps",
            ResourceKind::Job | ResourceKind::CronJob => "batch",
            ResourceKind::Ingress => "networking.k8s.io",
            ResourceKind::Role
            | ResourceKind::RoleBinding
            | ResourceKind::ClusterRole
            | ResourceKind::ClusterRoleBinding => "rbac.authorization.k8s.io",
            ResourceKind::CustomResourceDefinition => "apiextensions.k8s.io",
        }
    }

    /// Try to parse a kind name, returning None if it has no built-in handling
    pub fn parse_optional(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Resolve a kind for a (group, kind) pair, rejecting same-named kinds in other groups.
    pub fn lookup(group: &str, kind: &str) -> Option<Self> {
        Self::parse_optional(kind).filter(|k| k.group() == group)
    }

    pub fn all() -> &'static [Self] {
        &[
            ResourceKind::Namespace,
            ResourceKind::ConfigMap,
            ResourceKind::Secret,
            ResourceKind::Service,
            ResourceKind::ServiceAccount,
            ResourceKind::Pod,
            ResourceKind::PersistentVolume,
            ResourceKind::PersistentVolumeClaim,
            ResourceKind::Deployment,
            ResourceKind::StatefulSet,
            ResourceKind::DaemonSet,
            ResourceKind::ReplicaSet,
            ResourceKind::Job,
            ResourceKind::CronJob,
            ResourceKind::Ingress,
            ResourceKind::Role,
            ResourceKind::RoleBinding,
            ResourceKind::ClusterRole,
            ResourceKind::ClusterRoleBinding,
            ResourceKind::CustomResourceDefinition,
        ]
    }

    /// Try to parse a string (case-insensitive, kubectl short names) into a ResourceKind
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "namespace" | "namespaces" | "ns" => Some(ResourceKind::Namespace),
            "configmap" | "configmaps" | "cm" => Some(ResourceKind::ConfigMap),
            "secret" | "secrets" => Some(ResourceKind::Secret),
            "service" | "services" | "svc" => Some(ResourceKind::Service),
            "serviceaccount" | "serviceaccounts" | "sa" => Some(ResourceKind::ServiceAccount),
            "pod" | "pods" | "po" => Some(ResourceKind::Pod),
            "persistentvolume" | "persistentvolumes" | "pv" => {
                Some(ResourceKind::PersistentVolume)
            }
            "persistentvolumeclaim" | "persistentvolumeclaims" | "pvc" => {
                Some(ResourceKind::PersistentVolumeClaim)
            }
            "deployment" | "deployments" | "deploy" => Some(ResourceKind::Deployment),
            "statefulset" | "statefulsets" | "sts" => Some(ResourceKind::StatefulSet),
            "daemonset" | "daemonsets" | "ds" => Some(ResourceKind::DaemonSet),
            "replicaset" | "replicasets" | "rs" => Some(ResourceKind::ReplicaSet),
            "job" | "jobs" => Some(ResourceKind::Job),
            "cronjob" | "cronjobs" | "cj" => Some(ResourceKind::CronJob),
            "ingress" | "ingresses" | "ing" => Some(ResourceKind::Ingress),
            "role" | "roles" => Some(ResourceKind::Role),
            "rolebinding" | "rolebindings" => Some(ResourceKind::RoleBinding),
            "clusterrole" | "clusterroles" => Some(ResourceKind::ClusterRole),
            "clusterrolebinding" | "clusterrolebindings" => {
                Some(ResourceKind::ClusterRoleBinding)
            }
            "customresourcedefinition" | "customresourcedefinitions" | "crd" | "crds" => {
                Some(ResourceKind::CustomResourceDefinition)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.as_str().to_string()
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::all()
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("Unknown resource kind: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_str() {
        assert_eq!(ResourceKind::Deployment.as_str(), "Deployment");
        assert_eq!(ResourceKind::ConfigMap.as_str(), "ConfigMap");
    }

    #[test]
    fn test_from_str() {
        assert_eq!(
            ResourceKind::parse_optional("StatefulSet"),
            Some(ResourceKind::StatefulSet)
        );
        assert_eq!(ResourceKind::parse_optional("GitRepository"), None);
    }

    #[test]
    fn test_lookup_checks_group() {
        assert_eq!(
            ResourceKind::lookup("apps", "Deployment"),
            Some(ResourceKind::Deployment)
        );
        assert_eq!(ResourceKind::lookup("example.com", "Deployment"), None);
        assert_eq!(ResourceKind::lookup("", "ConfigMap"), Some(ResourceKind::ConfigMap));
    }

    #[test]
    fn test_from_str_case_insensitive() {
        assert_eq!(
            ResourceKind::from_str_case_insensitive("deploy"),
            Some(ResourceKind::Deployment)
        );
        assert_eq!(
            ResourceKind::from_str_case_insensitive("PVC"),
            Some(ResourceKind::PersistentVolumeClaim)
        );
        assert_eq!(ResourceKind::from_str_case_insensitive("widget"), None);
    }

    #[test]
    fn test_into_string() {
        let s: String = ResourceKind::Job.into();
        assert_eq!(s, "Job");
    }
}
