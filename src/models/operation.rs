//! Sync operations and their action log

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ResourceKey;

/// What an action does to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Create,
    Update,
    Prune,
    HookRun,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Create => write!(f, "Create"),
            ActionKind::Update => write!(f, "Update"),
            ActionKind::Prune => write!(f, "Prune"),
            ActionKind::HookRun => write!(f, "HookRun"),
        }
    }
}

/// Position of an action inside its wave. Phases run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WavePhase {
    PreSync,
    Apply,
    Prune,
    Sync,
    PostSync,
    SyncFail,
}

impl fmt::Display for WavePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WavePhase::PreSync => write!(f, "PreSync"),
            WavePhase::Apply => write!(f, "Apply"),
            WavePhase::Prune => write!(f, "Prune"),
            WavePhase::Sync => write!(f, "Sync"),
            WavePhase::PostSync => write!(f, "PostSync"),
            WavePhase::SyncFail => write!(f, "SyncFail"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ActionResult {
    #[default]
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    /// Never started: the plan halted, was cancelled, or was a dry run.
    Skipped,
}

impl ActionResult {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionResult::Succeeded | ActionResult::Failed | ActionResult::Skipped
        )
    }
}

impl fmt::Display for ActionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionResult::Pending => "Pending",
            ActionResult::Running => "Running",
            ActionResult::Retrying => "Retrying",
            ActionResult::Succeeded => "Succeeded",
            ActionResult::Failed => "Failed",
            ActionResult::Skipped => "Skipped",
        };
        write!(f, "{}", s)
    }
}

/// One entry of an operation's action log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub resource: ResourceKey,
    pub kind: ActionKind,
    pub wave: i32,
    pub phase: WavePhase,
    pub result: ActionResult,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ActionRecord {
    pub fn pending(resource: ResourceKey, kind: ActionKind, wave: i32, phase: WavePhase) -> Self {
        Self {
            resource,
            kind,
            wave,
            phase,
            result: ActionResult::Pending,
            attempts: 0,
            message: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationPhase {
    Running,
    Succeeded,
    Failed,
    Terminating,
    Cancelled,
}

impl OperationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationPhase::Succeeded | OperationPhase::Failed | OperationPhase::Cancelled
        )
    }
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationPhase::Running => "Running",
            OperationPhase::Succeeded => "Succeeded",
            OperationPhase::Failed => "Failed",
            OperationPhase::Terminating => "Terminating",
            OperationPhase::Cancelled => "Cancelled",
        };
        write!(f, "{}", s)
    }
}

/// What started an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncTrigger {
    Manual,
    Automated,
    SelfHeal,
    Webhook,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncTrigger::Manual => "Manual",
            SyncTrigger::Automated => "Automated",
            SyncTrigger::SelfHeal => "SelfHeal",
            SyncTrigger::Webhook => "Webhook",
        };
        write!(f, "{}", s)
    }
}

/// One execution attempt of a plan against a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: Uuid,
    pub application: String,
    pub revision: String,
    pub trigger: SyncTrigger,
    #[serde(default)]
    pub dry_run: bool,
    pub phase: OperationPhase,
    pub actions: Vec<ActionRecord>,
    /// First fatal error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Transient retries consumed across all actions.
    #[serde(default)]
    pub retries_exhausted: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncOperation {
    pub fn new(application: &str, revision: &str, trigger: SyncTrigger, dry_run: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            application: application.to_string(),
            revision: revision.to_string(),
            trigger,
            dry_run,
            phase: OperationPhase::Running,
            actions: Vec::new(),
            message: None,
            retries_exhausted: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self, phase: OperationPhase) {
        self.phase = phase;
        self.finished_at = Some(Utc::now());
    }

    /// Record the first fatal error; later ones are kept on their actions only.
    pub fn record_error(&mut self, message: impl Into<String>) {
        if self.message.is_none() {
            self.message = Some(message.into());
        }
    }

    pub fn action(&self, resource: &ResourceKey, kind: ActionKind) -> Option<&ActionRecord> {
        self.actions
            .iter()
            .find(|a| &a.resource == resource && a.kind == kind)
    }

    pub fn count(&self, result: ActionResult) -> usize {
        self.actions.iter().filter(|a| a.result == result).count()
    }
}
