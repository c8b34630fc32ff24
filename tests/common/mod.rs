//! Shared fixtures: an in-memory repository, cluster and store wired into a
//! controller.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kubesync::destination::{DestinationRegistry, InMemoryDestination};
use kubesync::executor::{ExecutorSettings, RetryPolicy};
use kubesync::models::{Application, ResourceKey};
use kubesync::registry::KindRegistry;
use kubesync::source::StaticSource;
use kubesync::store::{MemoryStore, StateStore};
use kubesync::{Controller, ControllerSettings};

pub const REPO: &str = "https://git.example.com/platform/shop.git";
pub const SERVER: &str = "https://kubernetes.default.svc";

pub const SETTINGS_CM: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  color: blue
"#;

pub const LEGACY_CM: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: legacy
  annotations:
    kubesync.io/sync-options: Prune=false
data:
  keep: "true"
"#;

pub const DEPLOYMENT: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  annotations:
    kubesync.io/sync-wave: "1"
spec:
  replicas: 2
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: web
          image: nginx:1.27
"#;

pub const SERVICE: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: web-svc
  annotations:
    kubesync.io/sync-wave: "2"
spec:
  selector:
    app: web
  ports:
    - port: 80
"#;

pub const MIGRATION_HOOK: &str = r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: migrate
  annotations:
    kubesync.io/hook: PreSync
    kubesync.io/hook-delete-policy: HookSucceeded
spec:
  template:
    spec:
      restartPolicy: Never
      containers:
        - name: migrate
          image: shop/migrate:1
"#;

pub fn settings_key() -> ResourceKey {
    ResourceKey::new("", "ConfigMap", "shop", "settings")
}

pub fn legacy_key() -> ResourceKey {
    ResourceKey::new("", "ConfigMap", "shop", "legacy")
}

pub fn deployment_key() -> ResourceKey {
    ResourceKey::new("apps", "Deployment", "shop", "web")
}

pub fn service_key() -> ResourceKey {
    ResourceKey::new("", "Service", "shop", "web-svc")
}

pub fn hook_key() -> ResourceKey {
    ResourceKey::new("batch", "Job", "shop", "migrate")
}

/// Files of one revision, placed under the application's `shop/` path
pub fn files(manifests: &[(&str, &str)]) -> BTreeMap<String, String> {
    manifests
        .iter()
        .map(|(name, content)| (format!("shop/{}", name), content.to_string()))
        .collect()
}

pub fn standard_files() -> BTreeMap<String, String> {
    files(&[
        ("settings.yaml", SETTINGS_CM),
        ("deployment.yaml", DEPLOYMENT),
        ("service.yaml", SERVICE),
    ])
}

/// A manual application with a fast retry budget of three attempts
pub fn application(name: &str) -> Application {
    let yaml = format!(
        r#"
name: {}
source:
  repoURL: {}
  path: shop
destination:
  server: {}
  namespace: shop
syncPolicy:
  retry:
    limit: 3
    backoff:
      baseMs: 1
      maxMs: 5
"#,
        name, REPO, SERVER
    );
    serde_yaml::from_str(&yaml).unwrap()
}

pub fn settings() -> ControllerSettings {
    ControllerSettings {
        poll_interval: Duration::from_millis(50),
        executor: ExecutorSettings {
            call_timeout: Duration::from_secs(2),
            hook_timeout: Duration::from_secs(5),
            hook_poll_interval: Duration::from_millis(10),
        },
        backoff: RetryPolicy::new(3, Duration::from_millis(10), 2.0, Duration::from_millis(40)),
        ..Default::default()
    }
}

pub struct Fixture {
    pub controller: Controller,
    pub source: Arc<StaticSource>,
    pub destination: Arc<InMemoryDestination>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_parts(
            InMemoryDestination::new().with_simulated_status(),
            Arc::new(MemoryStore::default()),
        )
    }

    pub fn with_parts(destination: InMemoryDestination, store: Arc<dyn StateStore>) -> Self {
        Self::build(destination, store, settings())
    }

    pub fn build(
        destination: InMemoryDestination,
        store: Arc<dyn StateStore>,
        settings: ControllerSettings,
    ) -> Self {
        let source = Arc::new(StaticSource::new());
        let destination = Arc::new(destination);
        let controller = Controller::new(
            source.clone(),
            DestinationRegistry::new().with(SERVER, destination.clone()),
            Arc::new(KindRegistry::builtin()),
            store,
            settings,
        )
        .unwrap();
        Self {
            controller,
            source,
            destination,
        }
    }

    /// Publish a new revision and point `HEAD` at it
    pub fn publish(&self, revision: &str, files: BTreeMap<String, String>) {
        self.source.add_revision(REPO, revision, files);
    }
}
