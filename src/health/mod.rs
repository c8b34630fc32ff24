//! Health Evaluator
//!
//! Health is derived from live status fields only. The rule for a kind comes
//! from the [`KindRegistry`]; kinds without a dedicated rule fall back to the
//! generic `Ready`-condition rule.

pub mod rules;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::{HealthStatus, Manifest};
use crate::registry::KindRegistry;

/// Per-kind function from a live manifest to its health.
pub type HealthRule = fn(&Manifest) -> HealthAssessment;

/// Health of a single resource, with the reason behind it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthAssessment {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthAssessment {
    pub fn new(status: HealthStatus) -> Self {
        Self {
            status,
            message: None,
        }
    }

    pub fn with_message(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }

    pub fn healthy() -> Self {
        Self::new(HealthStatus::Healthy)
    }

    pub fn progressing(message: impl Into<String>) -> Self {
        Self::with_message(HealthStatus::Progressing, message)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_message(HealthStatus::Degraded, message)
    }

    pub fn suspended(message: impl Into<String>) -> Self {
        Self::with_message(HealthStatus::Suspended, message)
    }
}

/// Evaluates live resources against the registry's health rules.
#[derive(Debug, Clone)]
pub struct HealthEvaluator {
    registry: Arc<KindRegistry>,
}

impl HealthEvaluator {
    pub fn new(registry: Arc<KindRegistry>) -> Self {
        Self { registry }
    }

    /// Assess one resource. `None` means the resource is absent.
    pub fn evaluate(&self, live: Option<&Manifest>) -> HealthAssessment {
        let Some(live) = live else {
            return HealthAssessment::with_message(HealthStatus::Missing, "resource does not exist");
        };

        match self.registry.health_rule(live.group(), live.kind()) {
            Some(rule) => rule(live),
            None => rules::generic(live),
        }
    }

    /// Aggregate application health over non-hook resources.
    pub fn aggregate<'a, I>(&self, resources: I) -> HealthStatus
    where
        I: IntoIterator<Item = Option<&'a Manifest>>,
    {
        HealthStatus::aggregate(resources.into_iter().map(|m| self.evaluate(m).status))
    }
}

impl Default for HealthEvaluator {
    fn default() -> Self {
        Self::new(Arc::new(KindRegistry::builtin()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_is_missing() {
        let evaluator = HealthEvaluator::default();
        assert_eq!(evaluator.evaluate(None).status, HealthStatus::Missing);
    }

    #[test]
    fn test_unknown_kind_without_conditions_is_healthy() {
        let evaluator = HealthEvaluator::default();
        let widget = Manifest::new(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "w"}
        }))
        .unwrap();
        assert_eq!(evaluator.evaluate(Some(&widget)).status, HealthStatus::Healthy);
    }

    #[test]
    fn test_registered_rule_is_used() {
        let mut registry = KindRegistry::builtin();
        registry.register(
            crate::registry::KindEntry::custom("example.com", "Widget", true)
                .with_health(|_| HealthAssessment::degraded("always broken")),
        );
        let evaluator = HealthEvaluator::new(Arc::new(registry));
        let widget = Manifest::new(json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "w"}
        }))
        .unwrap();
        assert_eq!(evaluator.evaluate(Some(&widget)).status, HealthStatus::Degraded);
    }
}
