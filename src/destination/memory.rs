//! In-process destination
//!
//! Keeps objects in a map keyed by [`ResourceKey`], records every call, and
//! can inject failures per operation and per key. Optionally fills in a
//! simulated `status` on apply so rollouts read as finished.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use super::{Destination, LabelSelector};
use crate::error::DestinationError;
use crate::models::{Manifest, PropagationPolicy, ResourceKey};

/// Destination operation, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Get,
    Apply,
    Delete,
    List,
}

#[derive(Debug, Clone)]
pub struct DestinationCall {
    pub seq: u64,
    pub op: CallKind,
    /// `None` for list calls.
    pub key: Option<ResourceKey>,
    pub at: Instant,
    pub ok: bool,
}

/// Injected failure. Matches every call unless narrowed with
/// [`on`](Self::on) / [`for_key`](Self::for_key); fires forever unless
/// limited with [`times`](Self::times).
#[derive(Debug, Clone)]
pub struct FailureRule {
    error: DestinationError,
    op: Option<CallKind>,
    key: Option<ResourceKey>,
    remaining: Option<u32>,
}

impl FailureRule {
    pub fn new(error: DestinationError) -> Self {
        Self {
            error,
            op: None,
            key: None,
            remaining: None,
        }
    }

    pub fn on(mut self, op: CallKind) -> Self {
        self.op = Some(op);
        self
    }

    pub fn for_key(mut self, key: ResourceKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, op: CallKind, key: Option<&ResourceKey>) -> bool {
        if self.remaining == Some(0) {
            return false;
        }
        if self.op.is_some_and(|o| o != op) {
            return false;
        }
        match (&self.key, key) {
            (Some(expected), Some(actual)) => expected == actual,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

pub type StatusFn = fn(&Manifest) -> Option<Value>;

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceKey, Manifest>,
    calls: Vec<DestinationCall>,
    failures: Vec<FailureRule>,
    seq: u64,
    resource_version: u64,
}

impl State {
    fn take_failure(&mut self, op: CallKind, key: Option<&ResourceKey>) -> Option<DestinationError> {
        let rule = self.failures.iter_mut().find(|r| r.matches(op, key))?;
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(rule.error.clone())
    }

    fn record(&mut self, op: CallKind, key: Option<&ResourceKey>, ok: bool) {
        self.seq += 1;
        self.calls.push(DestinationCall {
            seq: self.seq,
            op,
            key: key.cloned(),
            at: Instant::now(),
            ok,
        });
    }
}

/// Destination held entirely in memory.
#[derive(Default)]
pub struct InMemoryDestination {
    state: Mutex<State>,
    latency: Option<Duration>,
    status: Option<StatusFn>,
    /// (group, kind) served without namespaces.
    cluster_kinds: BTreeSet<(String, String)>,
}

impl InMemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, to make concurrency observable in tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Generate `status` on apply with [`simulated_status`].
    pub fn with_simulated_status(mut self) -> Self {
        self.status = Some(simulated_status);
        self
    }

    pub fn with_status_fn(mut self, status: StatusFn) -> Self {
        self.status = Some(status);
        self
    }

    /// Serve `group`/`kind` cluster-scoped: applied objects lose their
    /// namespace, as an API server would store them.
    pub fn with_cluster_scoped(mut self, group: &str, kind: &str) -> Self {
        self.cluster_kinds
            .insert((group.to_string(), kind.to_string()));
        self
    }

    fn is_cluster_scoped(&self, group: &str, kind: &str) -> bool {
        self.cluster_kinds
            .contains(&(group.to_string(), kind.to_string()))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail(&self, rule: FailureRule) {
        self.lock().failures.push(rule);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Store an object as-is, bypassing apply bookkeeping.
    pub fn insert(&self, manifest: Manifest) {
        self.lock().objects.insert(manifest.key(), manifest);
    }

    pub fn remove(&self, key: &ResourceKey) -> Option<Manifest> {
        self.lock().objects.remove(key)
    }

    pub fn object(&self, key: &ResourceKey) -> Option<Manifest> {
        self.lock().objects.get(key).cloned()
    }

    pub fn objects(&self) -> Vec<Manifest> {
        self.lock().objects.values().cloned().collect()
    }

    /// Modify a stored object in place, e.g. to simulate drift.
    pub fn mutate<F>(&self, key: &ResourceKey, f: F) -> bool
    where
        F: FnOnce(&mut Value),
    {
        let mut state = self.lock();
        match state.objects.get_mut(key) {
            Some(manifest) => {
                f(manifest.as_value_mut());
                true
            }
            None => false,
        }
    }

    pub fn calls(&self) -> Vec<DestinationCall> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, op: CallKind) -> Vec<DestinationCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn stored(&self, state: &mut State, manifest: &Manifest) -> Manifest {
        state.resource_version += 1;
        let key = manifest.key();
        let existing = state.objects.get(&key);

        let (uid, generation) = match existing {
            Some(live) => {
                let uid = meta_str(live, "uid").unwrap_or_default().to_string();
                let generation = meta_int(live, "generation").unwrap_or(1);
                let bumped = if live.spec() != manifest.spec() {
                    generation + 1
                } else {
                    generation
                };
                (uid, bumped)
            }
            None => (Uuid::new_v4().to_string(), 1),
        };

        let mut value = manifest.as_value().clone();
        if let Some(metadata) = value.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            metadata.insert("uid".to_string(), json!(uid));
            metadata.insert(
                "resourceVersion".to_string(),
                json!(state.resource_version.to_string()),
            );
            metadata.insert("generation".to_string(), json!(generation));
        }

        let status = match self.status {
            Some(status_fn) => Manifest::new(value.clone()).ok().and_then(|m| status_fn(&m)),
            None => existing.and_then(|live| live.status().cloned()),
        };
        if let (Some(status), Some(root)) = (status, value.as_object_mut()) {
            root.insert("status".to_string(), status);
        }

        // `value` came from a valid manifest and only gained fields.
        Manifest::new(value).unwrap_or_else(|_| manifest.clone())
    }
}

fn meta_str<'a>(manifest: &'a Manifest, field: &str) -> Option<&'a str> {
    manifest.metadata()?.get(field)?.as_str()
}

fn meta_int(manifest: &Manifest, field: &str) -> Option<i64> {
    manifest.metadata()?.get(field)?.as_i64()
}

/// Status a well-behaved cluster would report once an object settles.
///
/// Workloads report every replica ready at the current generation, Jobs
/// complete, Pods run with ready containers, claims are bound and load
/// balancers get an address. Other kinds get no status.
pub fn simulated_status(manifest: &Manifest) -> Option<Value> {
    let generation = meta_int(manifest, "generation").unwrap_or(1);
    let replicas = manifest
        .spec()
        .and_then(|s| s.get("replicas"))
        .and_then(|r| r.as_i64())
        .unwrap_or(1);

    match (manifest.group(), manifest.kind()) {
        ("apps", "Deployment") | ("apps", "ReplicaSet") => Some(json!({
            "observedGeneration": generation,
            "replicas": replicas,
            "updatedReplicas": replicas,
            "readyReplicas": replicas,
            "availableReplicas": replicas,
        })),
        ("apps", "StatefulSet") => Some(json!({
            "observedGeneration": generation,
            "replicas": replicas,
            "readyReplicas": replicas,
            "currentReplicas": replicas,
            "updatedReplicas": replicas,
            "currentRevision": format!("{}-{}", manifest.name(), generation),
            "updateRevision": format!("{}-{}", manifest.name(), generation),
        })),
        ("apps", "DaemonSet") => Some(json!({
            "observedGeneration": generation,
            "desiredNumberScheduled": 1,
            "updatedNumberScheduled": 1,
            "numberAvailable": 1,
            "numberReady": 1,
        })),
        ("batch", "Job") => Some(json!({
            "succeeded": 1,
            "conditions": [{"type": "Complete", "status": "True"}],
        })),
        ("", "Pod") => Some(json!({
            "phase": "Running",
            "containerStatuses": [{"name": "main", "ready": true}],
        })),
        ("", "PersistentVolumeClaim") => Some(json!({"phase": "Bound"})),
        ("", "Service")
            if manifest.spec().and_then(|s| s.get("type")).and_then(|t| t.as_str())
                == Some("LoadBalancer") =>
        {
            Some(json!({"loadBalancer": {"ingress": [{"ip": "192.0.2.10"}]}}))
        }
        ("networking.k8s.io", "Ingress") => {
            Some(json!({"loadBalancer": {"ingress": [{"ip": "192.0.2.20"}]}}))
        }
        _ => None,
    }
}

#[async_trait]
impl Destination for InMemoryDestination {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Manifest>, DestinationError> {
        self.delay().await;
        let mut state = self.lock();
        if let Some(err) = state.take_failure(CallKind::Get, Some(key)) {
            state.record(CallKind::Get, Some(key), false);
            return Err(err);
        }
        state.record(CallKind::Get, Some(key), true);
        Ok(state.objects.get(key).cloned())
    }

    async fn apply(&self, manifest: &Manifest) -> Result<Manifest, DestinationError> {
        self.delay().await;
        let mut manifest = manifest.clone();
        if self.is_cluster_scoped(manifest.group(), manifest.kind()) {
            manifest.clear_namespace();
        }
        let key = manifest.key();
        let mut state = self.lock();
        if let Some(err) = state.take_failure(CallKind::Apply, Some(&key)) {
            state.record(CallKind::Apply, Some(&key), false);
            return Err(err);
        }
        let stored = self.stored(&mut state, &manifest);
        state.objects.insert(key.clone(), stored.clone());
        state.record(CallKind::Apply, Some(&key), true);
        Ok(stored)
    }

    async fn delete(
        &self,
        key: &ResourceKey,
        _propagation: PropagationPolicy,
    ) -> Result<(), DestinationError> {
        self.delay().await;
        let mut state = self.lock();
        if let Some(err) = state.take_failure(CallKind::Delete, Some(key)) {
            state.record(CallKind::Delete, Some(key), false);
            return Err(err);
        }
        state.objects.remove(key);
        state.record(CallKind::Delete, Some(key), true);
        Ok(())
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<Manifest>, DestinationError> {
        self.delay().await;
        let mut state = self.lock();
        if let Some(err) = state.take_failure(CallKind::List, None) {
            state.record(CallKind::List, None, false);
            return Err(err);
        }
        let found = state
            .objects
            .values()
            .filter(|m| selector.matches(m))
            .cloned()
            .collect();
        state.record(CallKind::List, None, true);
        Ok(found)
    }

    async fn is_namespaced(
        &self,
        group: &str,
        kind: &str,
    ) -> Result<Option<bool>, DestinationError> {
        Ok(self.is_cluster_scoped(group, kind).then_some(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TRACKING_LABEL;

    fn deployment(replicas: i64) -> Manifest {
        Manifest::new(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "shop",
                "labels": {TRACKING_LABEL: "guestbook"}
            },
            "spec": {"replicas": replicas}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_apply_tracks_generation() {
        let dest = InMemoryDestination::new().with_simulated_status();
        let first = dest.apply(&deployment(1)).await.unwrap();
        assert_eq!(meta_int(&first, "generation"), Some(1));
        assert_eq!(first.status().unwrap()["readyReplicas"], json!(1));

        let same = dest.apply(&deployment(1)).await.unwrap();
        assert_eq!(meta_int(&same, "generation"), Some(1));
        assert_eq!(meta_str(&same, "uid"), meta_str(&first, "uid"));

        let scaled = dest.apply(&deployment(3)).await.unwrap();
        assert_eq!(meta_int(&scaled, "generation"), Some(2));
        assert_eq!(scaled.status().unwrap()["observedGeneration"], json!(2));
    }

    #[tokio::test]
    async fn test_failure_rules_are_scoped_and_counted() {
        let dest = InMemoryDestination::new();
        let key = deployment(1).key();
        dest.fail(
            FailureRule::new(DestinationError::Throttled("busy".into()))
                .on(CallKind::Apply)
                .for_key(key.clone())
                .times(2),
        );

        assert!(dest.apply(&deployment(1)).await.is_err());
        assert!(dest.get(&key).await.is_ok());
        assert!(dest.apply(&deployment(1)).await.is_err());
        assert!(dest.apply(&deployment(1)).await.is_ok());

        let applies = dest.calls_of(CallKind::Apply);
        assert_eq!(applies.len(), 3);
        assert_eq!(applies.iter().filter(|c| !c.ok).count(), 2);
    }

    #[tokio::test]
    async fn test_delete_absent_succeeds_and_list_filters() {
        let dest = InMemoryDestination::new();
        let key = deployment(1).key();
        dest.delete(&key, PropagationPolicy::Foreground).await.unwrap();

        dest.insert(deployment(1));
        let mut other = deployment(1);
        other.as_value_mut()["metadata"]["name"] = json!("other");
        other.set_label(TRACKING_LABEL, "someone-else");
        dest.insert(other);

        let listed = dest.list(&LabelSelector::tracking("guestbook")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name(), "web");
    }

    #[test]
    fn test_simulated_status_is_healthy_for_jobs() {
        let job = Manifest::new(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "migrate"}
        }))
        .unwrap();
        let status = simulated_status(&job).unwrap();
        assert_eq!(status["conditions"][0]["type"], json!("Complete"));

        let cm = Manifest::new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "c"}
        }))
        .unwrap();
        assert!(simulated_status(&cm).is_none());
    }
}
