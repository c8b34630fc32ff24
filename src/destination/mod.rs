//! Destination collaborator
//!
//! The engine only talks to a live environment through [`Destination`].
//! Implementations:
//! - [`KubeDestination`] - a Kubernetes cluster via kube-rs dynamic objects
//! - [`InMemoryDestination`] - in-process state with failure injection and a
//!   call log, used by tests and dry runs

pub mod cluster;
pub mod memory;

pub use cluster::{KubeDestination, create_client};
pub use memory::{
    CallKind, DestinationCall, FailureRule, InMemoryDestination, StatusFn, simulated_status,
};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DestinationError;
use crate::models::{Manifest, PropagationPolicy, ResourceKey, TRACKING_LABEL};

/// Equality label selector (`key=value`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelSelector {
    pub key: String,
    pub value: String,
}

impl LabelSelector {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Selector for every live object managed by `app`.
    pub fn tracking(app: &str) -> Self {
        Self::new(TRACKING_LABEL, app)
    }

    pub fn matches(&self, manifest: &Manifest) -> bool {
        manifest.label(&self.key) == Some(self.value.as_str())
    }

    /// Wire form used in list queries.
    pub fn to_query(&self) -> String {
        format!("{}={}", self.key, self.value)
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_query())
    }
}

/// Live environment operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Destination: Send + Sync {
    /// Read one object. `Ok(None)` when it does not exist.
    async fn get(&self, key: &ResourceKey) -> Result<Option<Manifest>, DestinationError>;

    /// Create or update an object, returning the stored result.
    async fn apply(&self, manifest: &Manifest) -> Result<Manifest, DestinationError>;

    /// Delete an object. Deleting an absent object succeeds.
    async fn delete(
        &self,
        key: &ResourceKey,
        propagation: PropagationPolicy,
    ) -> Result<(), DestinationError>;

    /// List objects carrying the selector's label.
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<Manifest>, DestinationError>;

    /// Scope of a kind as the destination serves it. `Ok(None)` when the
    /// destination does not know the kind.
    async fn is_namespaced(&self, group: &str, kind: &str)
    -> Result<Option<bool>, DestinationError>;
}

/// Run a destination call with a deadline. Expiry is a transient error.
pub async fn with_timeout<T, F>(after: Duration, call: F) -> Result<T, DestinationError>
where
    F: Future<Output = Result<T, DestinationError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(DestinationError::Timeout(after)),
    }
}

/// Destinations by server URL.
#[derive(Clone, Default)]
pub struct DestinationRegistry {
    destinations: HashMap<String, Arc<dyn Destination>>,
}

impl DestinationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, server: impl Into<String>, destination: Arc<dyn Destination>) {
        self.destinations.insert(server.into(), destination);
    }

    pub fn with(mut self, server: impl Into<String>, destination: Arc<dyn Destination>) -> Self {
        self.register(server, destination);
        self
    }

    pub fn resolve(&self, server: &str) -> Option<Arc<dyn Destination>> {
        self.destinations.get(server).cloned()
    }

    pub fn servers(&self) -> impl Iterator<Item = &String> {
        self.destinations.keys()
    }
}

impl std::fmt::Debug for DestinationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationRegistry")
            .field("servers", &self.destinations.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tracking_selector() {
        let selector = LabelSelector::tracking("guestbook");
        assert_eq!(selector.to_query(), "app.kubesync.io/instance=guestbook");

        let mut cm = Manifest::new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "c"}
        }))
        .unwrap();
        assert!(!selector.matches(&cm));
        cm.set_label(TRACKING_LABEL, "guestbook");
        assert!(selector.matches(&cm));
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let result: Result<(), DestinationError> =
            with_timeout(Duration::from_millis(5), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert!(err.is_retryable());
    }
}
