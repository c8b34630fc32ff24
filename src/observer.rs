//! Live-State Observer
//!
//! Builds one [`ClusterSnapshot`] per reconciliation pass. The snapshot holds
//! every object carrying the application's tracking label (for prune
//! discovery) plus a fresh read of every desired key. It is rebuilt each pass
//! and handed to the diff engine by value; nothing is cached between passes.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};

use crate::destination::{Destination, LabelSelector, with_timeout};
use crate::error::{DestinationError, ObserveError};
use crate::models::{Application, Manifest, ResourceKey};

/// What the observer saw for one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    Present(Manifest),
    Absent,
    /// The object could not be read this pass.
    Error(String),
}

impl Observed {
    pub fn manifest(&self) -> Option<&Manifest> {
        match self {
            Observed::Present(manifest) => Some(manifest),
            _ => None,
        }
    }
}

/// Live state of one application at one point in time.
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub application: String,
    pub server: String,
    pub taken_at: DateTime<Utc>,
    pub entries: BTreeMap<ResourceKey, Observed>,
}

impl ClusterSnapshot {
    pub fn new(application: &str, server: &str) -> Self {
        Self {
            application: application.to_string(),
            server: server.to_string(),
            taken_at: Utc::now(),
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&Observed> {
        self.entries.get(key)
    }

    pub fn live(&self, key: &ResourceKey) -> Option<&Manifest> {
        self.entries.get(key).and_then(|o| o.manifest())
    }

    pub fn present(&self) -> impl Iterator<Item = (&ResourceKey, &Manifest)> {
        self.entries
            .iter()
            .filter_map(|(k, o)| o.manifest().map(|m| (k, m)))
    }

    pub fn errors(&self) -> impl Iterator<Item = (&ResourceKey, &str)> {
        self.entries.iter().filter_map(|(k, o)| match o {
            Observed::Error(message) => Some((k, message.as_str())),
            _ => None,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.errors().next().is_none()
    }
}

/// Reads live state with bounded concurrency and a deadline per call.
#[derive(Debug, Clone)]
pub struct LiveStateObserver {
    max_concurrency: usize,
    call_timeout: Duration,
}

impl LiveStateObserver {
    pub fn new(max_concurrency: usize, call_timeout: Duration) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            call_timeout,
        }
    }

    /// Observe the tracked objects of `app` and each of `keys`.
    ///
    /// Throttling, timeouts and per-object failures land in the affected
    /// entry. A lost connection or a permission error fails the whole pass.
    pub async fn observe(
        &self,
        destination: &dyn Destination,
        app: &Application,
        keys: &[ResourceKey],
    ) -> Result<ClusterSnapshot, ObserveError> {
        let mut snapshot = ClusterSnapshot::new(&app.name, &app.destination.server);
        let selector = LabelSelector::tracking(&app.name);

        let tracked = with_timeout(self.call_timeout, destination.list(&selector))
            .await
            .map_err(|e| pass_error(&app.name, e))?;
        for manifest in tracked {
            snapshot
                .entries
                .insert(manifest.key(), Observed::Present(manifest));
        }

        let timeout = self.call_timeout;
        let mut reads = stream::iter(keys.iter().cloned())
            .map(|key| async move {
                let result = with_timeout(timeout, destination.get(&key)).await;
                (key, result)
            })
            .buffer_unordered(self.max_concurrency);

        while let Some((key, result)) = reads.next().await {
            let observed = match result {
                Ok(Some(manifest)) => Observed::Present(manifest),
                Ok(None) => Observed::Absent,
                Err(e @ DestinationError::Unreachable(_))
                | Err(e @ DestinationError::PermissionDenied(_)) => {
                    return Err(pass_error(&app.name, e));
                }
                Err(e) => {
                    tracing::warn!(app = %app.name, resource = %key, error = %e, "failed to observe resource");
                    Observed::Error(e.to_string())
                }
            };
            snapshot.entries.insert(key, observed);
        }

        tracing::debug!(
            app = %app.name,
            entries = snapshot.entries.len(),
            errors = snapshot.errors().count(),
            "observed live state"
        );
        Ok(snapshot)
    }
}

fn pass_error(app: &str, err: DestinationError) -> ObserveError {
    tracing::warn!(app = %app, error = %err, "observation failed");
    match err {
        DestinationError::PermissionDenied(message) => ObserveError::PermissionDenied(message),
        other => ObserveError::DestinationUnreachable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{CallKind, FailureRule, InMemoryDestination};
    use crate::models::TRACKING_LABEL;
    use serde_json::json;

    fn app() -> Application {
        serde_yaml::from_str(
            r#"
name: guestbook
source:
  repoURL: https://git.example.com/apps.git
destination:
  server: https://kubernetes.default.svc
  namespace: shop
"#,
        )
        .unwrap()
    }

    fn config_map(name: &str, owner: Option<&str>) -> Manifest {
        let mut cm = Manifest::new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "shop"},
            "data": {"k": "v"}
        }))
        .unwrap();
        if let Some(owner) = owner {
            cm.set_label(TRACKING_LABEL, owner);
        }
        cm
    }

    fn observer() -> LiveStateObserver {
        LiveStateObserver::new(4, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_snapshot_includes_tracked_and_desired() {
        let dest = InMemoryDestination::new();
        dest.insert(config_map("old", Some("guestbook")));
        dest.insert(config_map("current", Some("guestbook")));

        let keys = vec![
            config_map("current", None).key(),
            config_map("new", None).key(),
        ];
        let snapshot = observer().observe(&dest, &app(), &keys).await.unwrap();

        assert!(snapshot.live(&config_map("old", None).key()).is_some());
        assert!(snapshot.live(&keys[0]).is_some());
        assert_eq!(snapshot.get(&keys[1]), Some(&Observed::Absent));
        assert!(snapshot.is_complete());
    }

    #[tokio::test]
    async fn test_partial_failure_is_recorded_per_resource() {
        let dest = InMemoryDestination::new();
        let throttled = config_map("a", None).key();
        let fine = config_map("b", None).key();
        dest.fail(
            FailureRule::new(DestinationError::Throttled("slow down".into()))
                .on(CallKind::Get)
                .for_key(throttled.clone()),
        );

        let snapshot = observer()
            .observe(&dest, &app(), &[throttled.clone(), fine.clone()])
            .await
            .unwrap();
        assert!(matches!(snapshot.get(&throttled), Some(Observed::Error(_))));
        assert_eq!(snapshot.get(&fine), Some(&Observed::Absent));
        assert!(!snapshot.is_complete());
    }

    #[tokio::test]
    async fn test_unreachable_fails_the_pass() {
        let dest = InMemoryDestination::new();
        dest.fail(FailureRule::new(DestinationError::Unreachable("refused".into())).on(CallKind::List));
        let err = observer().observe(&dest, &app(), &[]).await.unwrap_err();
        assert!(err.is_retryable());

        let dest = InMemoryDestination::new();
        dest.fail(FailureRule::new(DestinationError::PermissionDenied("forbidden".into())).on(CallKind::Get));
        let err = observer()
            .observe(&dest, &app(), &[config_map("a", None).key()])
            .await
            .unwrap_err();
        assert!(matches!(err, ObserveError::PermissionDenied(_)));
    }
}
