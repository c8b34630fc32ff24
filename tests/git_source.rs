//! Git source tests against a repository created on the fly
//!
//! The repository lives in a temporary directory and is addressed by its
//! local path, so no network access is needed.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use git2::{Commit, IndexAddOption, Oid, Repository, RepositoryInitOptions, Signature};
use kubesync::error::SourceError;
use kubesync::source::{CachedSource, FetchedSource, GitSource, Source};
use tempfile::TempDir;

const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n";
const CONFIGMAP: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n";

struct Fixture {
    _repo_dir: TempDir,
    data_dir: TempDir,
    repo: Repository,
    url: String,
}

impl Fixture {
    fn new() -> Self {
        let repo_dir = TempDir::new().unwrap();
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(repo_dir.path(), &opts).unwrap();
        let url = repo_dir.path().to_string_lossy().into_owned();
        Self {
            _repo_dir: repo_dir,
            data_dir: TempDir::new().unwrap(),
            repo,
            url,
        }
    }

    fn source(&self) -> GitSource {
        GitSource::new(self.data_dir.path())
    }

    /// Write `files` into the work tree and commit everything on HEAD
    fn commit(&self, files: &[(&str, &str)], message: &str) -> Oid {
        let workdir = self.repo.workdir().unwrap();
        for (path, content) in files {
            let full = workdir.join(path);
            fs::create_dir_all(full.parent().unwrap_or(Path::new("."))).unwrap();
            fs::write(&full, content).unwrap();
        }

        let mut index = self.repo.index().unwrap();
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = self.repo.find_tree(index.write_tree().unwrap()).unwrap();

        let signature = Signature::now("kubesync", "kubesync@example.com").unwrap();
        let parent = self.repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&Commit> = parent.iter().collect();
        self.repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
            .unwrap()
    }
}

fn file_names(fetched: &FetchedSource) -> Vec<&str> {
    fetched.files().keys().map(String::as_str).collect()
}

#[tokio::test]
async fn test_resolve_branches_tags_and_commits() {
    let fixture = Fixture::new();
    let first = fixture.commit(&[("apps/web/deployment.yaml", DEPLOYMENT)], "first");
    let second = fixture.commit(&[("apps/web/settings.yaml", CONFIGMAP)], "second");

    let first_commit = fixture.repo.find_commit(first).unwrap();
    fixture.repo.branch("release", &first_commit, false).unwrap();
    fixture
        .repo
        .tag_lightweight("v1.0", first_commit.as_object(), false)
        .unwrap();

    let source = fixture.source();
    let url = &fixture.url;
    assert_eq!(source.resolve_revision(url, "HEAD").await.unwrap(), second.to_string());
    assert_eq!(source.resolve_revision(url, "main").await.unwrap(), second.to_string());
    assert_eq!(source.resolve_revision(url, "release").await.unwrap(), first.to_string());
    assert_eq!(source.resolve_revision(url, "v1.0").await.unwrap(), first.to_string());

    let short = &first.to_string()[..10];
    assert_eq!(source.resolve_revision(url, short).await.unwrap(), first.to_string());

    let missing = source.resolve_revision(url, "no-such-branch").await;
    assert!(matches!(missing, Err(SourceError::RevisionNotFound { .. })));
}

#[tokio::test]
async fn test_fetch_selects_path_at_revision() {
    let fixture = Fixture::new();
    let first = fixture.commit(
        &[
            ("apps/web/deployment.yaml", DEPLOYMENT),
            ("apps/web/README.md", "# web"),
            ("apps/db/settings.yaml", CONFIGMAP),
        ],
        "first",
    );
    let second = fixture.commit(&[("apps/web/nested/settings.yaml", CONFIGMAP)], "second");

    let source = fixture.source();
    let old = source
        .fetch(&fixture.url, &first.to_string(), "apps/web")
        .await
        .unwrap();
    assert_eq!(old.revision(), first.to_string());
    assert_eq!(file_names(&old), vec!["deployment.yaml"]);

    let new = source
        .fetch(&fixture.url, &second.to_string(), "/apps/web/")
        .await
        .unwrap();
    assert_eq!(file_names(&new), vec!["deployment.yaml", "nested/settings.yaml"]);
    assert_eq!(new.files()["deployment.yaml"], DEPLOYMENT);
}

#[tokio::test]
async fn test_fetch_errors() {
    let fixture = Fixture::new();
    let head = fixture.commit(&[("apps/web/deployment.yaml", DEPLOYMENT)], "first");
    let source = fixture.source();

    let missing_dir = source
        .fetch(&fixture.url, &head.to_string(), "apps/cache")
        .await;
    assert!(matches!(missing_dir, Err(SourceError::PathNotFound { .. })));

    let file_not_dir = source
        .fetch(&fixture.url, &head.to_string(), "apps/web/deployment.yaml")
        .await;
    assert!(matches!(file_not_dir, Err(SourceError::PathNotFound { .. })));

    let bad_revision = source
        .fetch(&fixture.url, "0123456789012345678901234567890123456789", "apps/web")
        .await;
    assert!(matches!(bad_revision, Err(SourceError::RevisionNotFound { .. })));

    let nowhere = source
        .resolve_revision("file:///nonexistent/kubesync/repo", "HEAD")
        .await;
    assert!(matches!(nowhere, Err(SourceError::Invalid { .. })));
}

#[tokio::test]
async fn test_cache_serves_repeated_fetches() {
    let fixture = Fixture::new();
    let head = fixture.commit(&[("apps/web/deployment.yaml", DEPLOYMENT)], "first");

    let cached = CachedSource::new(Arc::new(fixture.source()), 8, Duration::from_secs(60));
    let revision = head.to_string();
    let a = cached.fetch(&fixture.url, &revision, "apps/web").await.unwrap();
    let b = cached.fetch(&fixture.url, &revision, "apps/web").await.unwrap();
    assert_eq!(a, b);

    let stats = cached.stats().await;
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.total_entries, 1);
}

#[tokio::test]
async fn test_cache_never_pins_a_branch() {
    let fixture = Fixture::new();
    fixture.commit(&[("apps/web/deployment.yaml", DEPLOYMENT)], "first");
    let cached = CachedSource::new(Arc::new(fixture.source()), 8, Duration::from_secs(60));

    let before = cached.fetch(&fixture.url, "main", "apps/web").await.unwrap();
    let second = fixture.commit(&[("apps/web/settings.yaml", CONFIGMAP)], "second");
    let after = cached.fetch(&fixture.url, "main", "apps/web").await.unwrap();

    assert_ne!(before, after);
    assert_eq!(after.revision(), second.to_string());
    assert_eq!(file_names(&after), vec!["deployment.yaml", "settings.yaml"]);

    let stats = cached.stats().await;
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.total_entries, 0);
}

#[tokio::test]
async fn test_concurrent_reads_of_one_repository() {
    let fixture = Fixture::new();
    let head = fixture.commit(&[("apps/web/deployment.yaml", DEPLOYMENT)], "first");
    let source = Arc::new(fixture.source());

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..8 {
        let source = source.clone();
        let url = fixture.url.clone();
        tasks.spawn(async move {
            if i % 2 == 0 {
                source.resolve_revision(&url, "main").await
            } else {
                source
                    .fetch(&url, "main", "apps/web")
                    .await
                    .map(|fetched| fetched.revision().to_string())
            }
        });
    }

    while let Some(result) = tasks.join_next().await {
        assert_eq!(result.unwrap().unwrap(), head.to_string());
    }
}
