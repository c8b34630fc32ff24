//! Git-backed source
//!
//! Local repositories (plain paths or `file://` URLs) are opened in place.
//! Remote repositories are mirrored as bare clones under
//! `<data dir>/repos/<hash of url>` and fetched before revisions are resolved.
//! All git2 calls run on the blocking pool, one at a time per repository.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use git2::{ErrorClass as GitErrorClass, ErrorCode, ObjectType, Repository, TreeWalkMode, TreeWalkResult};
use sha2::{Digest, Sha256};

use super::{FetchedSource, Source, normalize_path};
use crate::error::SourceError;

const FETCH_REFSPECS: &[&str] = &[
    "+refs/heads/*:refs/remotes/origin/*",
    "+refs/tags/*:refs/tags/*",
];

/// Source reading manifests from git repositories.
#[derive(Debug, Clone)]
pub struct GitSource {
    mirror_root: PathBuf,
    /// Serializes clone, fetch and reads per repository.
    locks: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl GitSource {
    /// `data_dir` holds the bare mirrors of remote repositories.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            mirror_root: data_dir.as_ref().join("repos"),
            locks: Arc::default(),
        }
    }

    fn repo_lock(&self, repo_url: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(self.mirror_path(repo_url))
            .or_default()
            .clone()
    }

    fn mirror_path(&self, repo_url: &str) -> PathBuf {
        let digest = Sha256::digest(repo_url.as_bytes());
        self.mirror_root.join(&hex::encode(digest)[..16])
    }

    async fn blocking<T, F>(&self, repo_url: &str, f: F) -> Result<T, SourceError>
    where
        T: Send + 'static,
        F: FnOnce(GitSource, String) -> Result<T, SourceError> + Send + 'static,
    {
        let this = self.clone();
        let url = repo_url.to_string();
        let lock = self.repo_lock(repo_url);
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            f(this, url)
        })
            .await
            .map_err(|e| SourceError::Unreachable {
                repo_url: repo_url.to_string(),
                message: format!("git task failed: {}", e),
            })?
    }

    /// Open the repository for `repo_url`, cloning a mirror on first use.
    fn open(&self, repo_url: &str) -> Result<Opened, SourceError> {
        if let Some(local) = local_path(repo_url) {
            let repo = Repository::open(&local).map_err(|e| SourceError::Invalid {
                repo_url: repo_url.to_string(),
                message: format!("cannot open {}: {}", local.display(), e.message()),
            })?;
            return Ok(Opened { repo, mirror: false });
        }

        let path = self.mirror_path(repo_url);
        if path.exists() {
            let repo = Repository::open_bare(&path).map_err(|e| map_git_error(repo_url, e))?;
            return Ok(Opened { repo, mirror: true });
        }

        std::fs::create_dir_all(&self.mirror_root).map_err(|e| SourceError::Invalid {
            repo_url: repo_url.to_string(),
            message: format!("cannot create {}: {}", self.mirror_root.display(), e),
        })?;
        tracing::info!(repo = %repo_url, path = %path.display(), "cloning repository mirror");
        // Clone next to the final location and rename, so an interrupted
        // clone never leaves a broken mirror behind
        let io_err = |e: std::io::Error| SourceError::Invalid {
            repo_url: repo_url.to_string(),
            message: format!("cannot prepare mirror {}: {}", path.display(), e),
        };
        let staging = tempfile::TempDir::new_in(&self.mirror_root).map_err(io_err)?;
        let cloned = staging.path().join("mirror");
        git2::build::RepoBuilder::new()
            .bare(true)
            .clone(repo_url, &cloned)
            .map_err(|e| map_git_error(repo_url, e))?;
        std::fs::rename(&cloned, &path).map_err(io_err)?;
        let repo = Repository::open_bare(&path).map_err(|e| map_git_error(repo_url, e))?;
        Ok(Opened { repo, mirror: true })
    }

    fn update_mirror(repo: &Repository, repo_url: &str) -> Result<(), SourceError> {
        tracing::debug!(repo = %repo_url, "fetching mirror");
        let mut remote = repo
            .find_remote("origin")
            .map_err(|e| map_git_error(repo_url, e))?;
        remote
            .fetch(FETCH_REFSPECS, None, None)
            .map_err(|e| map_git_error(repo_url, e))
    }

    fn resolve_blocking(&self, repo_url: &str, reference: &str) -> Result<String, SourceError> {
        let opened = self.open(repo_url)?;
        if opened.mirror {
            Self::update_mirror(&opened.repo, repo_url)?;
        }
        resolve_in(&opened, repo_url, reference)
    }

    fn fetch_blocking(
        &self,
        repo_url: &str,
        revision: &str,
        path: &str,
    ) -> Result<FetchedSource, SourceError> {
        let opened = self.open(repo_url)?;
        let commit_id = match resolve_in(&opened, repo_url, revision) {
            Ok(id) => id,
            Err(SourceError::RevisionNotFound { .. }) if opened.mirror => {
                Self::update_mirror(&opened.repo, repo_url)?;
                resolve_in(&opened, repo_url, revision)?
            }
            Err(e) => return Err(e),
        };

        let repo = &opened.repo;
        let oid = git2::Oid::from_str(&commit_id).map_err(|e| map_git_error(repo_url, e))?;
        let commit = repo.find_commit(oid).map_err(|e| map_git_error(repo_url, e))?;
        let root = commit.tree().map_err(|e| map_git_error(repo_url, e))?;

        let prefix = normalize_path(path);
        let tree = if prefix.is_empty() {
            root
        } else {
            let entry = root
                .get_path(Path::new(&prefix))
                .map_err(|_| SourceError::PathNotFound {
                    path: prefix.clone(),
                    revision: commit_id.clone(),
                })?;
            if entry.kind() != Some(ObjectType::Tree) {
                return Err(SourceError::PathNotFound {
                    path: prefix,
                    revision: commit_id,
                });
            }
            repo.find_tree(entry.id())
                .map_err(|e| map_git_error(repo_url, e))?
        };

        let mut files = BTreeMap::new();
        let mut walk_error = None;
        tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() != Some(ObjectType::Blob) {
                return TreeWalkResult::Ok;
            }
            let Some(name) = entry.name() else {
                return TreeWalkResult::Ok;
            };
            let rel = format!("{}{}", dir, name);
            match repo.find_blob(entry.id()) {
                Ok(blob) => match std::str::from_utf8(blob.content()) {
                    Ok(text) => {
                        files.insert(rel, text.to_string());
                    }
                    Err(_) => tracing::debug!(file = %rel, "skipping non-UTF-8 file"),
                },
                Err(e) => {
                    walk_error = Some(e);
                    return TreeWalkResult::Abort;
                }
            }
            TreeWalkResult::Ok
        })
        .map_err(|e| map_git_error(repo_url, e))?;

        if let Some(e) = walk_error {
            return Err(map_git_error(repo_url, e));
        }

        tracing::debug!(repo = %repo_url, revision = %commit_id, path = %prefix, files = files.len(), "fetched source tree");
        Ok(FetchedSource::from_files(&commit_id, files))
    }
}

struct Opened {
    repo: Repository,
    mirror: bool,
}

fn local_path(repo_url: &str) -> Option<PathBuf> {
    if let Some(rest) = repo_url.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if repo_url.contains("://") || repo_url.contains('@') {
        return None;
    }
    let path = PathBuf::from(repo_url);
    path.exists().then_some(path)
}

/// Candidate revspecs for a reference, most specific first.
fn candidates(opened: &Opened, reference: &str) -> Vec<String> {
    let reference = reference.trim();
    if !opened.mirror {
        return vec![reference.to_string(), format!("origin/{}", reference)];
    }
    if reference == "HEAD" {
        // A bare clone's HEAD names the remote default branch, which fetches
        // only update under refs/remotes/origin.
        let default_branch = opened
            .repo
            .find_reference("HEAD")
            .ok()
            .and_then(|r| r.symbolic_target().map(|t| t.to_string()))
            .and_then(|t| t.strip_prefix("refs/heads/").map(|b| b.to_string()));
        let mut out = Vec::new();
        if let Some(branch) = default_branch {
            out.push(format!("refs/remotes/origin/{}", branch));
        }
        out.push("HEAD".to_string());
        return out;
    }
    vec![
        format!("refs/remotes/origin/{}", reference),
        format!("refs/tags/{}", reference),
        reference.to_string(),
    ]
}

fn resolve_in(opened: &Opened, repo_url: &str, reference: &str) -> Result<String, SourceError> {
    for spec in candidates(opened, reference) {
        match opened.repo.revparse_single(&spec) {
            Ok(object) => {
                let commit = object
                    .peel_to_commit()
                    .map_err(|e| map_git_error(repo_url, e))?;
                return Ok(commit.id().to_string());
            }
            Err(e) if e.code() == ErrorCode::NotFound || e.class() == GitErrorClass::Reference => {
                continue;
            }
            Err(e) if e.code() == ErrorCode::Ambiguous || e.code() == ErrorCode::InvalidSpec => {
                continue;
            }
            Err(e) => return Err(map_git_error(repo_url, e)),
        }
    }
    Err(SourceError::RevisionNotFound {
        repo_url: repo_url.to_string(),
        revision: reference.to_string(),
    })
}

fn map_git_error(repo_url: &str, e: git2::Error) -> SourceError {
    match e.class() {
        GitErrorClass::Net | GitErrorClass::Http | GitErrorClass::Ssh | GitErrorClass::Ssl => {
            SourceError::Unreachable {
                repo_url: repo_url.to_string(),
                message: e.message().to_string(),
            }
        }
        // Credentials may be rotated and locks released by another process
        _ if e.code() == ErrorCode::Auth || e.code() == ErrorCode::Locked => {
            SourceError::Unreachable {
                repo_url: repo_url.to_string(),
                message: e.message().to_string(),
            }
        }
        _ if e.code() == ErrorCode::Certificate => SourceError::Invalid {
            repo_url: repo_url.to_string(),
            message: e.message().to_string(),
        },
        _ if e.code() == ErrorCode::NotFound => SourceError::RevisionNotFound {
            repo_url: repo_url.to_string(),
            revision: e.message().to_string(),
        },
        _ => SourceError::Invalid {
            repo_url: repo_url.to_string(),
            message: e.message().to_string(),
        },
    }
}

#[async_trait]
impl Source for GitSource {
    async fn fetch(
        &self,
        repo_url: &str,
        revision: &str,
        path: &str,
    ) -> Result<FetchedSource, SourceError> {
        let revision = revision.to_string();
        let path = path.to_string();
        self.blocking(repo_url, move |this, url| {
            this.fetch_blocking(&url, &revision, &path)
        })
        .await
    }

    async fn resolve_revision(
        &self,
        repo_url: &str,
        reference: &str,
    ) -> Result<String, SourceError> {
        let reference = reference.to_string();
        self.blocking(repo_url, move |this, url| {
            this.resolve_blocking(&url, &reference)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_path_detection() {
        assert_eq!(
            local_path("file:///srv/git/apps"),
            Some(PathBuf::from("/srv/git/apps"))
        );
        assert_eq!(local_path("https://github.com/example/apps.git"), None);
        assert_eq!(local_path("git@github.com:example/apps.git"), None);
    }

    #[test]
    fn test_mirror_path_is_stable() {
        let source = GitSource::new("/var/lib/kubesync");
        let a = source.mirror_path("https://github.com/example/apps.git");
        let b = source.mirror_path("https://github.com/example/apps.git");
        assert_eq!(a, b);
        assert!(a.starts_with("/var/lib/kubesync/repos"));
    }

    #[test]
    fn test_one_lock_per_repository() {
        let source = GitSource::new("/var/lib/kubesync");
        let shared = source.clone();
        let a = source.repo_lock("https://github.com/example/apps.git");
        let b = shared.repo_lock("https://github.com/example/apps.git");
        let other = source.repo_lock("https://github.com/example/infra.git");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn test_auth_and_lock_failures_are_retryable() {
        let url = "https://github.com/example/apps.git";
        let auth = map_git_error(
            url,
            git2::Error::new(ErrorCode::Auth, GitErrorClass::Callback, "authentication required"),
        );
        assert!(matches!(auth, SourceError::Unreachable { .. }));
        assert!(auth.is_retryable());

        let locked = map_git_error(
            url,
            git2::Error::new(ErrorCode::Locked, GitErrorClass::Reference, "failed to lock ref"),
        );
        assert!(locked.is_retryable());

        let certificate = map_git_error(
            url,
            git2::Error::new(ErrorCode::Certificate, GitErrorClass::Callback, "bad certificate"),
        );
        assert!(matches!(certificate, SourceError::Invalid { .. }));
    }
}
