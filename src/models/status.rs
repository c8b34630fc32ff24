//! Sync and health status shared by the diff engine, health evaluator,
//! controller and store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ResourceKey, SyncOperation};

/// Whether live state matches desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncStatus {
    Synced,
    OutOfSync,
    #[default]
    Unknown,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Synced => write!(f, "Synced"),
            SyncStatus::OutOfSync => write!(f, "OutOfSync"),
            SyncStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Health derived from live status fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
    Missing,
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Rank used for aggregation: the worst (highest) rank wins.
    pub fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Suspended => 1,
            HealthStatus::Progressing => 2,
            HealthStatus::Missing => 3,
            HealthStatus::Degraded => 4,
            HealthStatus::Unknown => 5,
        }
    }

    /// Combine many statuses into one. An empty set is Healthy.
    pub fn aggregate<I: IntoIterator<Item = HealthStatus>>(statuses: I) -> HealthStatus {
        statuses
            .into_iter()
            .max_by_key(|s| s.severity())
            .unwrap_or(HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Progressing => write!(f, "Progressing"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Suspended => write!(f, "Suspended"),
            HealthStatus::Missing => write!(f, "Missing"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Application-level lifecycle state.
///
/// `OutOfSync -> Syncing -> {Synced | Failed | Unknown}`, and back to
/// `OutOfSync` when a later pass detects drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AppPhase {
    OutOfSync,
    Syncing,
    Synced,
    Failed,
    #[default]
    Unknown,
}

impl fmt::Display for AppPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppPhase::OutOfSync => write!(f, "OutOfSync"),
            AppPhase::Syncing => write!(f, "Syncing"),
            AppPhase::Synced => write!(f, "Synced"),
            AppPhase::Failed => write!(f, "Failed"),
            AppPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Status of one managed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub resource: ResourceKey,
    pub sync: SyncStatus,
    pub health: HealthStatus,
    /// Live but no longer desired.
    #[serde(default)]
    pub requires_pruning: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Everything the status interface reports for one application.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    pub sync: SyncStatus,
    pub health: HealthStatus,
    pub phase: AppPhase,
    /// Revision seen by the last reconciliation pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Revision of the last successful sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<SyncOperation>,
    /// First fatal error of the last pass or operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Transient retries consumed by the last operation.
    #[serde(default)]
    pub retries_exhausted: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_aggregate_worst_wins() {
        assert_eq!(
            HealthStatus::aggregate([HealthStatus::Healthy, HealthStatus::Progressing]),
            HealthStatus::Progressing
        );
        assert_eq!(
            HealthStatus::aggregate([
                HealthStatus::Suspended,
                HealthStatus::Degraded,
                HealthStatus::Missing
            ]),
            HealthStatus::Degraded
        );
        assert_eq!(HealthStatus::aggregate([]), HealthStatus::Healthy);
    }
}
