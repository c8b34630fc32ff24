//! Fetch cache with LRU eviction and TTL expiry
//!
//! Entries are keyed by `(repoURL, revision, path)`. Only content pinned by
//! its key is cached: the fetched tree must report the requested revision, so
//! a fetch by branch or tag name always goes to the inner source. Every entry
//! also keeps the content hash taken at insertion and is re-verified on each
//! hit. Nothing outside the cache can change an entry; the hash only catches
//! corruption of the cached copy itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{FetchedSource, Source};
use crate::error::SourceError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    repo_url: String,
    revision: String,
    path: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    data: FetchedSource,
    hash: String,
    inserted: Instant,
    last_used: Instant,
}

impl CacheEntry {
    fn new(data: FetchedSource) -> Self {
        let now = Instant::now();
        Self {
            hash: data.content_hash(),
            data,
            inserted: now,
            last_used: now,
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted.elapsed() >= ttl
    }

    /// The entry still holds what was fetched for `key`.
    fn is_intact(&self, key: &CacheKey) -> bool {
        self.data.revision() == key.revision && self.data.content_hash() == self.hash
    }
}

/// Caching wrapper around any [`Source`].
pub struct CachedSource {
    inner: Arc<dyn Source>,
    capacity: usize,
    ttl: Duration,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedSource {
    pub fn new(inner: Arc<dyn Source>, capacity: usize, ttl: Duration) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            ttl,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    async fn lookup(&self, key: &CacheKey) -> Option<FetchedSource> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(key)?;

        if entry.is_expired(self.ttl) {
            tracing::debug!(repo = %key.repo_url, revision = %key.revision, "cache entry expired");
            entries.remove(key);
            return None;
        }
        if !entry.is_intact(key) {
            tracing::warn!(
                repo = %key.repo_url,
                revision = %key.revision,
                "cache entry failed content verification, refetching"
            );
            entries.remove(key);
            return None;
        }

        entry.last_used = Instant::now();
        Some(entry.data.clone())
    }

    async fn insert(&self, key: CacheKey, data: FetchedSource) {
        let mut entries = self.entries.write().await;

        while entries.len() >= self.capacity && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(oldest) => {
                    tracing::debug!(repo = %oldest.repo_url, revision = %oldest.revision, "evicting cache entry");
                    entries.remove(&oldest);
                }
                None => break,
            }
        }

        entries.insert(key, CacheEntry::new(data));
    }

    /// Drop every cached entry.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let total_entries = entries.len();
        let expired_entries = entries.values().filter(|e| e.is_expired(self.ttl)).count();

        CacheStats {
            total_entries,
            expired_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Source for CachedSource {
    async fn fetch(
        &self,
        repo_url: &str,
        revision: &str,
        path: &str,
    ) -> Result<FetchedSource, SourceError> {
        let key = CacheKey {
            repo_url: repo_url.to_string(),
            revision: revision.to_string(),
            path: super::normalize_path(path),
        };

        if let Some(hit) = self.lookup(&key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(repo = %repo_url, revision = %revision, path = %path, "source cache hit");
            return Ok(hit);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let fetched = self.inner.fetch(repo_url, revision, path).await?;
        if fetched.revision() == revision {
            self.insert(key, fetched.clone()).await;
        } else {
            tracing::debug!(repo = %repo_url, revision = %revision, resolved = %fetched.revision(), "not caching a movable reference");
        }
        Ok(fetched)
    }

    async fn resolve_revision(
        &self,
        repo_url: &str,
        reference: &str,
    ) -> Result<String, SourceError> {
        // Refs move; only fetched content is cached.
        self.inner.resolve_revision(repo_url, reference).await
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub hits: u64,
    pub misses: u64,
}
