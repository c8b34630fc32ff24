//! Kind registry tests
//!
//! Every kind the engine knows must resolve to one entry, and custom kinds
//! registered at runtime must take part in health evaluation.

use std::sync::Arc;

use kubesync::health::{HealthAssessment, HealthEvaluator};
use kubesync::models::{HealthStatus, Manifest, ResourceKind};
use kubesync::registry::{ApplyStrategy, KindEntry, KindRegistry};
use serde_json::json;

#[test]
fn test_every_resource_kind_is_registered() {
    let registry = KindRegistry::builtin();
    for kind in ResourceKind::all() {
        let entry = registry.get(kind.group(), kind.as_str());
        assert!(entry.is_some(), "{} is not registered", kind);
    }
    assert_eq!(registry.len(), ResourceKind::all().len());
}

#[test]
fn test_aliases_resolve() {
    let registry = KindRegistry::builtin();
    let deploy = registry.find_by_alias("deploy").expect("deploy alias");
    assert_eq!(deploy.kind, "Deployment");
    assert_eq!(deploy.group, "apps");

    let cm = registry.find_by_alias("ConfigMap").expect("kind name");
    assert_eq!(cm.group, "");

    assert!(registry.find_by_alias("widget").is_none());
}

#[test]
fn test_cluster_scoped_kinds() {
    let registry = KindRegistry::builtin();
    for (group, kind) in [
        ("", "Namespace"),
        ("rbac.authorization.k8s.io", "ClusterRole"),
        ("rbac.authorization.k8s.io", "ClusterRoleBinding"),
        ("apiextensions.k8s.io", "CustomResourceDefinition"),
    ] {
        assert!(!registry.is_namespaced(group, kind), "{} should be cluster scoped", kind);
    }
    assert!(registry.is_namespaced("", "ConfigMap"));
}

fn widget_health(manifest: &Manifest) -> HealthAssessment {
    match manifest.status().and_then(|s| s.get("state")).and_then(|s| s.as_str()) {
        Some("Ready") => HealthAssessment::healthy(),
        Some("Broken") => HealthAssessment::degraded("widget is broken"),
        _ => HealthAssessment::progressing("widget is starting"),
    }
}

#[test]
fn test_custom_kind_registration() {
    let mut registry = KindRegistry::builtin();
    registry.register(
        KindEntry::custom("example.com", "Widget", true)
            .with_health(widget_health)
            .with_apply(ApplyStrategy::Recreate),
    );

    assert_eq!(
        registry.apply_strategy("example.com", "Widget"),
        ApplyStrategy::Recreate
    );
    assert_eq!(registry.find_by_alias("widget").map(|e| e.kind.as_str()), Some("Widget"));

    let health = HealthEvaluator::new(Arc::new(registry));
    let widget = |state: &str| {
        Manifest::new(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "w", "namespace": "shop"},
            "status": {"state": state}
        }))
        .unwrap()
    };
    assert_eq!(health.evaluate(Some(&widget("Ready"))).status, HealthStatus::Healthy);
    assert_eq!(health.evaluate(Some(&widget("Broken"))).status, HealthStatus::Degraded);
    assert_eq!(
        health.evaluate(Some(&widget("Pending"))).status,
        HealthStatus::Progressing
    );
}

#[test]
fn test_unregistered_kind_defaults() {
    let registry = KindRegistry::builtin();
    assert!(registry.is_namespaced("example.com", "Gadget"));
    assert_eq!(
        registry.apply_strategy("example.com", "Gadget"),
        ApplyStrategy::Apply
    );
    assert!(registry.health_rule("example.com", "Gadget").is_none());
}
