//! In-memory source

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{FetchedSource, Source, normalize_path};
use crate::error::SourceError;

#[derive(Debug, Default)]
struct Repository {
    /// revision -> (path -> content)
    revisions: HashMap<String, BTreeMap<String, String>>,
    /// ref name -> revision
    refs: HashMap<String, String>,
}

/// Repositories held in memory. Used by tests and for dry runs against
/// files that never reach a git server.
#[derive(Debug, Default)]
pub struct StaticSource {
    repos: Mutex<HashMap<String, Repository>>,
    failure: Mutex<Option<SourceError>>,
    fetches: AtomicUsize,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the full file set of a revision and point `HEAD` at it.
    pub fn add_revision(&self, repo_url: &str, revision: &str, files: BTreeMap<String, String>) {
        let mut repos = self.lock_repos();
        let repo = repos.entry(repo_url.to_string()).or_default();
        repo.revisions.insert(revision.to_string(), files);
        repo.refs.insert("HEAD".to_string(), revision.to_string());
    }

    /// Point a branch or tag at an existing revision.
    pub fn set_ref(&self, repo_url: &str, reference: &str, revision: &str) {
        let mut repos = self.lock_repos();
        let repo = repos.entry(repo_url.to_string()).or_default();
        repo.refs.insert(reference.to_string(), revision.to_string());
    }

    /// Make every call fail with `error` until [`clear_failure`](Self::clear_failure).
    pub fn fail_with(&self, error: SourceError) {
        *self.lock_failure() = Some(error);
    }

    pub fn clear_failure(&self) {
        *self.lock_failure() = None;
    }

    /// Number of successful and failed fetch calls so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn lock_repos(&self) -> std::sync::MutexGuard<'_, HashMap<String, Repository>> {
        self.repos.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_failure(&self) -> std::sync::MutexGuard<'_, Option<SourceError>> {
        self.failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn injected_failure(&self) -> Result<(), SourceError> {
        match self.lock_failure().as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Source for StaticSource {
    async fn fetch(
        &self,
        repo_url: &str,
        revision: &str,
        path: &str,
    ) -> Result<FetchedSource, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;

        let repos = self.lock_repos();
        let repo = repos.get(repo_url).ok_or_else(|| SourceError::Unreachable {
            repo_url: repo_url.to_string(),
            message: "repository does not exist".to_string(),
        })?;
        let files = repo
            .revisions
            .get(revision)
            .ok_or_else(|| SourceError::RevisionNotFound {
                repo_url: repo_url.to_string(),
                revision: revision.to_string(),
            })?;

        let prefix = normalize_path(path);
        let selected: BTreeMap<String, String> = if prefix.is_empty() {
            files.clone()
        } else {
            let dir = format!("{}/", prefix);
            files
                .iter()
                .filter_map(|(p, c)| p.strip_prefix(&dir).map(|rel| (rel.to_string(), c.clone())))
                .collect()
        };

        if selected.is_empty() && !prefix.is_empty() {
            return Err(SourceError::PathNotFound {
                path: prefix,
                revision: revision.to_string(),
            });
        }

        Ok(FetchedSource::from_files(revision, selected))
    }

    async fn resolve_revision(
        &self,
        repo_url: &str,
        reference: &str,
    ) -> Result<String, SourceError> {
        self.injected_failure()?;

        let repos = self.lock_repos();
        let repo = repos.get(repo_url).ok_or_else(|| SourceError::Unreachable {
            repo_url: repo_url.to_string(),
            message: "repository does not exist".to_string(),
        })?;

        if let Some(revision) = repo.refs.get(reference) {
            return Ok(revision.clone());
        }
        if repo.revisions.contains_key(reference) {
            return Ok(reference.to_string());
        }
        Err(SourceError::RevisionNotFound {
            repo_url: repo_url.to_string(),
            revision: reference.to_string(),
        })
    }
}
