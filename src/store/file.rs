//! File-backed store
//!
//! Layout under the state directory:
//! - `applications/<name>.yaml` - application spec
//! - `status/<name>.json` - last status plus operation history
//!
//! Every write goes to a temporary file in the same directory that is then
//! renamed over the target, so a crash never leaves a half-written file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;

use super::{PersistedState, StateStore, StatusRecord};
use crate::error::StoreError;
use crate::models::{AppStatus, Application, SyncOperation};

const APPLICATIONS_DIR: &str = "applications";
const STATUS_DIR: &str = "status";

pub struct FileStore {
    root: PathBuf,
    retention: usize,
    /// Serializes read-modify-write of status files.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            root: root.into(),
            retention,
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn application_path(&self, name: &str) -> PathBuf {
        self.root.join(APPLICATIONS_DIR).join(format!("{}.yaml", name))
    }

    fn status_path(&self, name: &str) -> PathBuf {
        self.root.join(STATUS_DIR).join(format!("{}.json", name))
    }

    fn read_status(&self, name: &str) -> Result<StatusRecord, StoreError> {
        let path = self.status_path(name);
        if !path.exists() {
            return Ok(StatusRecord::default());
        }
        let content = fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|e| StoreError::Encoding {
            path,
            message: e.to_string(),
        })
    }

    fn write_status(&self, name: &str, record: &StatusRecord) -> Result<(), StoreError> {
        let path = self.status_path(name);
        let content = serde_json::to_string_pretty(record).map_err(|e| StoreError::Encoding {
            path: path.clone(),
            message: e.to_string(),
        })?;
        write_atomic(&path, content.as_bytes())
    }

    fn update_status<F>(&self, name: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StatusRecord),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut record = self.read_status(name)?;
        f(&mut record);
        self.write_status(name, &record)
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(io_err)?;

    let mut file = NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(content).map_err(io_err)?;
    file.as_file().sync_all().map_err(io_err)?;
    file.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

impl StateStore for FileStore {
    fn load(&self) -> Result<PersistedState, StoreError> {
        let mut state = PersistedState::default();
        let dir = self.root.join(APPLICATIONS_DIR);
        if !dir.exists() {
            return Ok(state);
        }

        let entries = fs::read_dir(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let path = entry
                .map_err(|source| StoreError::Io {
                    path: dir.clone(),
                    source,
                })?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let content = fs::read_to_string(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let app: Application =
                serde_yaml::from_str(&content).map_err(|e| StoreError::Encoding {
                    path: path.clone(),
                    message: e.to_string(),
                })?;

            let mut record = self.read_status(&app.name)?;
            if record.recover_interrupted() {
                tracing::warn!(app = %app.name, "marking interrupted sync operation as failed");
                self.write_status(&app.name, &record)?;
            }
            state.statuses.insert(app.name.clone(), record);
            state.applications.insert(app.name.clone(), app);
        }

        tracing::debug!(
            path = %self.root.display(),
            applications = state.applications.len(),
            "loaded state"
        );
        Ok(state)
    }

    fn save_application(&self, app: &Application) -> Result<(), StoreError> {
        let path = self.application_path(&app.name);
        let content = serde_yaml::to_string(app).map_err(|e| StoreError::Encoding {
            path: path.clone(),
            message: e.to_string(),
        })?;
        write_atomic(&path, content.as_bytes())
    }

    fn delete_application(&self, name: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        remove_if_exists(&self.application_path(name))?;
        remove_if_exists(&self.status_path(name))
    }

    fn save_status(&self, name: &str, status: &AppStatus) -> Result<(), StoreError> {
        let status = status.clone();
        self.update_status(name, |record| record.status = status)
    }

    fn record_operation(&self, operation: &SyncOperation) -> Result<(), StoreError> {
        let retention = self.retention;
        self.update_status(&operation.application, |record| {
            record.push_operation(operation, retention)
        })
    }

    fn history(&self, name: &str) -> Result<Vec<SyncOperation>, StoreError> {
        Ok(self.read_status(name)?.history)
    }
}
