//! Durable state
//!
//! Application specs, last known status and a bounded history of sync
//! operations per application. [`FileStore`] persists to a state directory;
//! [`MemoryStore`] keeps everything in process.
//!
//! Loading repairs operations that were still running when the process
//! stopped: they are marked Failed with the message "interrupted".

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::models::{AppPhase, AppStatus, Application, OperationPhase, SyncOperation};

/// Message recorded on operations cut short by a restart.
pub const INTERRUPTED: &str = "interrupted";

/// Status and operation history of one application.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    #[serde(default)]
    pub status: AppStatus,
    /// Oldest first.
    #[serde(default)]
    pub history: Vec<SyncOperation>,
}

impl StatusRecord {
    /// Insert or replace `operation` by id, dropping the oldest entries
    /// beyond `retention`.
    pub fn push_operation(&mut self, operation: &SyncOperation, retention: usize) {
        match self.history.iter_mut().find(|op| op.id == operation.id) {
            Some(existing) => *existing = operation.clone(),
            None => self.history.push(operation.clone()),
        }
        let retention = retention.max(1);
        if self.history.len() > retention {
            let excess = self.history.len() - retention;
            self.history.drain(..excess);
        }
    }

    /// Mark non-terminal operations as failed. Returns whether anything changed.
    pub fn recover_interrupted(&mut self) -> bool {
        let mut changed = false;
        let operations = self
            .history
            .iter_mut()
            .chain(self.status.last_operation.as_mut());
        for op in operations {
            if !op.phase.is_terminal() {
                op.record_error(INTERRUPTED);
                op.finish(OperationPhase::Failed);
                changed = true;
            }
        }
        if self.status.phase == AppPhase::Syncing {
            self.status.phase = AppPhase::Failed;
            self.status.error.get_or_insert_with(|| INTERRUPTED.to_string());
            changed = true;
        }
        changed
    }
}

/// Everything loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub applications: BTreeMap<String, Application>,
    pub statuses: BTreeMap<String, StatusRecord>,
}

pub trait StateStore: Send + Sync {
    /// Load all state, repairing interrupted operations.
    fn load(&self) -> Result<PersistedState, StoreError>;

    fn save_application(&self, app: &Application) -> Result<(), StoreError>;

    /// Remove an application with its status and history.
    fn delete_application(&self, name: &str) -> Result<(), StoreError>;

    fn save_status(&self, name: &str, status: &AppStatus) -> Result<(), StoreError>;

    /// Insert or update one operation in the application's history.
    fn record_operation(&self, operation: &SyncOperation) -> Result<(), StoreError>;

    fn history(&self, name: &str) -> Result<Vec<SyncOperation>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncTrigger;

    #[test]
    fn test_history_is_bounded() {
        let mut record = StatusRecord::default();
        let ops: Vec<_> = (0..5)
            .map(|i| SyncOperation::new("guestbook", &format!("rev{}", i), SyncTrigger::Manual, false))
            .collect();
        for op in &ops {
            record.push_operation(op, 3);
        }
        let revisions: Vec<_> = record.history.iter().map(|o| o.revision.as_str()).collect();
        assert_eq!(revisions, vec!["rev2", "rev3", "rev4"]);

        let mut updated = ops[4].clone();
        updated.finish(OperationPhase::Succeeded);
        record.push_operation(&updated, 3);
        assert_eq!(record.history.len(), 3);
        assert_eq!(record.history[2].phase, OperationPhase::Succeeded);
    }

    #[test]
    fn test_running_operation_is_interrupted() {
        let mut record = StatusRecord::default();
        let op = SyncOperation::new("guestbook", "rev1", SyncTrigger::Automated, false);
        record.push_operation(&op, 10);
        record.status.last_operation = Some(op);
        record.status.phase = AppPhase::Syncing;

        assert!(record.recover_interrupted());
        assert_eq!(record.history[0].phase, OperationPhase::Failed);
        assert_eq!(record.history[0].message.as_deref(), Some(INTERRUPTED));
        assert_eq!(
            record.status.last_operation.as_ref().unwrap().phase,
            OperationPhase::Failed
        );
        assert_eq!(record.status.phase, AppPhase::Failed);
        assert!(!record.recover_interrupted());
    }
}
