//! Status derivation from a diff report.

use crate::diff::{DiffReport, ResourceState};
use crate::health::HealthEvaluator;
use crate::models::{HealthStatus, ResourceStatus};

/// Per-resource status rows, in report order.
pub fn resource_statuses(report: &DiffReport, health: &HealthEvaluator) -> Vec<ResourceStatus> {
    report
        .resources
        .iter()
        .map(|entry| {
            let assessment = match entry.state {
                ResourceState::Unknown => None,
                _ => Some(health.evaluate(entry.live.as_ref())),
            };
            ResourceStatus {
                resource: entry.key.clone(),
                sync: entry.state.sync_status(),
                health: assessment
                    .as_ref()
                    .map(|a| a.status)
                    .unwrap_or(HealthStatus::Unknown),
                requires_pruning: entry.state == ResourceState::PruneCandidate,
                message: entry
                    .message
                    .clone()
                    .or_else(|| assessment.and_then(|a| a.message)),
            }
        })
        .collect()
}

/// Worst health over the desired resources. Prune candidates and hooks do
/// not count.
pub fn application_health(resources: &[ResourceStatus]) -> HealthStatus {
    HealthStatus::aggregate(
        resources
            .iter()
            .filter(|r| !r.requires_pruning)
            .map(|r| r.health),
    )
}
