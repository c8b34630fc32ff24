//! Source Fetcher
//!
//! A [`Source`] turns `(repoURL, revision, path)` into a versioned set of
//! manifest files. Implementations:
//! - [`GitSource`] - git repositories, local or mirrored from a remote
//! - [`StaticSource`] - in-memory repositories for tests and dry runs
//! - [`CachedSource`] - LRU/TTL cache in front of any other source

pub mod cache;
pub mod git;
pub mod memory;

pub use cache::{CacheStats, CachedSource};
pub use git::GitSource;
pub use memory::StaticSource;

use std::collections::BTreeMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::SourceError;

/// File that marks a source path as a templated chart.
pub const CHART_FILE: &str = "Chart.yaml";

/// Plain manifest files at one revision. Keys are paths relative to the
/// source path, using `/` separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestTree {
    pub revision: String,
    pub files: BTreeMap<String, String>,
}

/// A templated chart at one revision: `Chart.yaml`, `values.yaml`,
/// `templates/**` and any extra value files, keyed by relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartSource {
    pub revision: String,
    pub files: BTreeMap<String, String>,
}

impl ChartSource {
    pub fn chart_yaml(&self) -> Option<&str> {
        self.files.get(CHART_FILE).map(|s| s.as_str())
    }

    pub fn values_yaml(&self) -> Option<&str> {
        self.files.get("values.yaml").map(|s| s.as_str())
    }

    pub fn file(&self, path: &str) -> Option<&str> {
        self.files
            .get(path.trim_start_matches("./"))
            .map(|s| s.as_str())
    }

    /// Template files in path order.
    pub fn templates(&self) -> impl Iterator<Item = (&String, &String)> {
        self.files
            .iter()
            .filter(|(path, _)| path.starts_with("templates/") && is_manifest_file(path))
    }
}

/// Result of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedSource {
    Directory(ManifestTree),
    Chart(ChartSource),
}

impl FetchedSource {
    pub fn revision(&self) -> &str {
        match self {
            FetchedSource::Directory(tree) => &tree.revision,
            FetchedSource::Chart(chart) => &chart.revision,
        }
    }

    pub fn files(&self) -> &BTreeMap<String, String> {
        match self {
            FetchedSource::Directory(tree) => &tree.files,
            FetchedSource::Chart(chart) => &chart.files,
        }
    }

    /// SHA-256 over revision, paths and contents, in path order.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.revision().as_bytes());
        for (path, content) in self.files() {
            hasher.update([0u8]);
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(content.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Build a fetch result from every file found under the source path.
    ///
    /// A `Chart.yaml` at the root makes the whole directory a chart; otherwise
    /// only manifest files (`.yaml`, `.yml`, `.json`) are kept.
    pub fn from_files(revision: &str, files: BTreeMap<String, String>) -> Self {
        if files.contains_key(CHART_FILE) {
            FetchedSource::Chart(ChartSource {
                revision: revision.to_string(),
                files,
            })
        } else {
            FetchedSource::Directory(ManifestTree {
                revision: revision.to_string(),
                files: files
                    .into_iter()
                    .filter(|(path, _)| is_manifest_file(path))
                    .collect(),
            })
        }
    }
}

pub fn is_manifest_file(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.ends_with(".yaml") || lower.ends_with(".yml") || lower.ends_with(".json")
}

/// Normalise a source path: no leading `./` or `/`, no trailing `/`, `.` is the root.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_start_matches("./").trim_matches('/');
    if trimmed == "." {
        String::new()
    } else {
        trimmed.to_string()
    }
}

/// Source collaborator.
#[async_trait]
pub trait Source: Send + Sync {
    /// Fetch the files under `path` at `revision`.
    async fn fetch(
        &self,
        repo_url: &str,
        revision: &str,
        path: &str,
    ) -> Result<FetchedSource, SourceError>;

    /// Resolve a branch, tag or `HEAD` to an immutable revision id.
    async fn resolve_revision(&self, repo_url: &str, reference: &str)
    -> Result<String, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    #[test]
    fn test_directory_keeps_only_manifests() {
        let fetched = FetchedSource::from_files(
            "abc",
            files(&[("a.yaml", "x"), ("README.md", "docs"), ("b.json", "{}")]),
        );
        match fetched {
            FetchedSource::Directory(tree) => {
                assert_eq!(tree.files.keys().collect::<Vec<_>>(), vec!["a.yaml", "b.json"]);
            }
            FetchedSource::Chart(_) => panic!("expected a directory"),
        }
    }

    #[test]
    fn test_chart_detection() {
        let fetched = FetchedSource::from_files(
            "abc",
            files(&[
                ("Chart.yaml", "name: web"),
                ("values.yaml", "replicas: 1"),
                ("templates/deploy.yaml", "kind: Deployment"),
                ("templates/NOTES.txt", "hello"),
            ]),
        );
        let FetchedSource::Chart(chart) = fetched else {
            panic!("expected a chart");
        };
        assert_eq!(chart.values_yaml(), Some("replicas: 1"));
        assert_eq!(chart.templates().count(), 1);
    }

    #[test]
    fn test_content_hash_changes_with_content() {
        let a = FetchedSource::from_files("r1", files(&[("a.yaml", "x")]));
        let b = FetchedSource::from_files("r1", files(&[("a.yaml", "y")]));
        assert_ne!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash(), a.clone().content_hash());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./apps/web/"), "apps/web");
        assert_eq!(normalize_path("."), "");
        assert_eq!(normalize_path(""), "");
    }
}
