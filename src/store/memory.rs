//! In-process store for tests and one-shot commands.

use std::sync::{Mutex, MutexGuard};

use super::{PersistedState, StateStore};
use crate::error::StoreError;
use crate::models::{AppStatus, Application, SyncOperation};

pub struct MemoryStore {
    state: Mutex<PersistedState>,
    retention: usize,
}

impl MemoryStore {
    pub fn new(retention: usize) -> Self {
        Self {
            state: Mutex::new(PersistedState::default()),
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PersistedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(10)
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<PersistedState, StoreError> {
        let mut state = self.lock();
        for record in state.statuses.values_mut() {
            record.recover_interrupted();
        }
        Ok(state.clone())
    }

    fn save_application(&self, app: &Application) -> Result<(), StoreError> {
        self.lock()
            .applications
            .insert(app.name.clone(), app.clone());
        Ok(())
    }

    fn delete_application(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.applications.remove(name);
        state.statuses.remove(name);
        Ok(())
    }

    fn save_status(&self, name: &str, status: &AppStatus) -> Result<(), StoreError> {
        self.lock()
            .statuses
            .entry(name.to_string())
            .or_default()
            .status = status.clone();
        Ok(())
    }

    fn record_operation(&self, operation: &SyncOperation) -> Result<(), StoreError> {
        let retention = self.retention;
        self.lock()
            .statuses
            .entry(operation.application.clone())
            .or_default()
            .push_operation(operation, retention);
        Ok(())
    }

    fn history(&self, name: &str) -> Result<Vec<SyncOperation>, StoreError> {
        Ok(self
            .lock()
            .statuses
            .get(name)
            .map(|r| r.history.clone())
            .unwrap_or_default())
    }
}
