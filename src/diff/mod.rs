//! Diff Engine
//!
//! Compares the rendered desired state against a [`ClusterSnapshot`].
//! Comparison is one-directional: only fields set in the desired manifest
//! are checked, so server-defaulted fields never read as drift. Hooks are
//! carried through untouched and never affect sync status.

pub mod normalize;

use std::collections::BTreeSet;
use std::fmt;

use serde_json::Value;

use crate::models::{
    Application, HOOK_ANNOTATION, Manifest, ResourceKey, SyncStatus,
};
use crate::observer::{ClusterSnapshot, Observed};
use crate::render::DesiredResource;

pub use normalize::{FieldPath, ignored_paths, validate_rules};

/// Per-resource comparison outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Synced,
    OutOfSync,
    /// Desired but absent live.
    Missing,
    /// Live and tracked, but no longer desired.
    PruneCandidate,
    /// Live state could not be read.
    Unknown,
    /// Live object is tracked by another application.
    Conflict,
}

impl ResourceState {
    pub fn sync_status(&self) -> SyncStatus {
        match self {
            ResourceState::Synced => SyncStatus::Synced,
            ResourceState::Unknown => SyncStatus::Unknown,
            _ => SyncStatus::OutOfSync,
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::Synced => "Synced",
            ResourceState::OutOfSync => "OutOfSync",
            ResourceState::Missing => "Missing",
            ResourceState::PruneCandidate => "PruneCandidate",
            ResourceState::Unknown => "Unknown",
            ResourceState::Conflict => "Conflict",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDiff {
    pub key: ResourceKey,
    pub state: ResourceState,
    /// JSON pointers of differing fields (OutOfSync only).
    pub differences: Vec<String>,
    pub desired: Option<Manifest>,
    pub live: Option<Manifest>,
    /// Desired wave, or the live object's wave for prune candidates.
    pub sync_wave: i32,
    pub prune_allowed: bool,
    pub message: Option<String>,
}

/// Diff of one application for one pass.
#[derive(Debug, Clone)]
pub struct DiffReport {
    pub application: String,
    pub resources: Vec<ResourceDiff>,
    /// Hook resources, passed on to the planner.
    pub hooks: Vec<DesiredResource>,
}

impl DiffReport {
    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceDiff> {
        self.resources.iter().find(|r| &r.key == key)
    }

    pub fn with_state(&self, state: ResourceState) -> impl Iterator<Item = &ResourceDiff> {
        self.resources.iter().filter(move |r| r.state == state)
    }

    /// Aggregate status. Prune candidates count only when `prune` is on and
    /// the object allows pruning.
    pub fn sync_status(&self, prune: bool) -> SyncStatus {
        if self.resources.iter().any(|r| r.state == ResourceState::Unknown) {
            return SyncStatus::Unknown;
        }
        let out_of_sync = self.resources.iter().any(|r| match r.state {
            ResourceState::OutOfSync | ResourceState::Missing | ResourceState::Conflict => true,
            ResourceState::PruneCandidate => prune && r.prune_allowed,
            ResourceState::Synced | ResourceState::Unknown => false,
        });
        if out_of_sync {
            SyncStatus::OutOfSync
        } else {
            SyncStatus::Synced
        }
    }

    /// True when live state has moved away from desired. Self-heal reacts
    /// to this. Prune candidates count under the same rule as
    /// [`DiffReport::sync_status`].
    pub fn has_drift(&self, prune: bool) -> bool {
        self.resources.iter().any(|r| match r.state {
            ResourceState::OutOfSync | ResourceState::Missing => true,
            ResourceState::PruneCandidate => prune && r.prune_allowed,
            _ => false,
        })
    }
}

/// Diff `desired` against `snapshot` under `app`'s ignore rules.
pub fn diff(app: &Application, desired: &[DesiredResource], snapshot: &ClusterSnapshot) -> DiffReport {
    let mut resources = Vec::new();
    let mut hooks = Vec::new();
    let mut desired_keys = BTreeSet::new();

    for resource in desired {
        desired_keys.insert(resource.key.clone());
        if resource.is_hook() {
            hooks.push(resource.clone());
            continue;
        }
        resources.push(diff_resource(app, resource, snapshot.get(&resource.key)));
    }

    for (key, live) in snapshot.present() {
        if desired_keys.contains(key) || live.annotation(HOOK_ANNOTATION).is_some() {
            continue;
        }
        if live.tracked_by() != Some(app.name.as_str()) {
            continue;
        }
        resources.push(ResourceDiff {
            key: key.clone(),
            state: ResourceState::PruneCandidate,
            differences: Vec::new(),
            desired: None,
            live: Some(live.clone()),
            sync_wave: live.sync_wave().unwrap_or(0),
            prune_allowed: live.prune_allowed(),
            message: None,
        });
    }

    let report = DiffReport {
        application: app.name.clone(),
        resources,
        hooks,
    };
    tracing::debug!(
        app = %app.name,
        resources = report.resources.len(),
        status = %report.sync_status(app.sync_policy.prune),
        "computed diff"
    );
    report
}

fn diff_resource(
    app: &Application,
    resource: &DesiredResource,
    observed: Option<&Observed>,
) -> ResourceDiff {
    let mut result = ResourceDiff {
        key: resource.key.clone(),
        state: ResourceState::Unknown,
        differences: Vec::new(),
        desired: Some(resource.manifest.clone()),
        live: None,
        sync_wave: resource.sync_wave,
        prune_allowed: resource.prune_allowed,
        message: None,
    };

    let live = match observed {
        None => {
            result.message = Some("not observed".to_string());
            return result;
        }
        Some(Observed::Error(message)) => {
            result.message = Some(message.clone());
            return result;
        }
        Some(Observed::Absent) => {
            result.state = ResourceState::Missing;
            return result;
        }
        Some(Observed::Present(live)) => live,
    };
    result.live = Some(live.clone());

    if let Some(owner) = live.tracked_by() {
        if owner != app.name {
            result.state = ResourceState::Conflict;
            result.message = Some(format!("resource is managed by application '{}'", owner));
            return result;
        }
    }

    let paths = ignored_paths(app, &resource.key);
    let desired = normalize::normalize(resource.manifest.as_value(), &paths);
    let live = normalize::normalize(live.as_value(), &paths);
    compare(&desired, &live, &mut String::new(), &mut result.differences);

    result.state = if result.differences.is_empty() {
        ResourceState::Synced
    } else {
        ResourceState::OutOfSync
    };
    result
}

fn escape(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Walk `desired`, recording the pointer of every field that differs in `live`.
fn compare(desired: &Value, live: &Value, path: &mut String, out: &mut Vec<String>) {
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => {
            for (key, want_value) in want {
                let len = path.len();
                path.push('/');
                path.push_str(&escape(key));
                match have.get(key) {
                    Some(have_value) => compare(want_value, have_value, path, out),
                    None if want_value.is_null() => {}
                    None => out.push(path.clone()),
                }
                path.truncate(len);
            }
        }
        (Value::Array(want), Value::Array(have)) => {
            if want.len() != have.len() {
                out.push(pointer(path));
                return;
            }
            for (i, (want_item, have_item)) in want.iter().zip(have).enumerate() {
                let len = path.len();
                path.push('/');
                path.push_str(&i.to_string());
                compare(want_item, have_item, path, out);
                path.truncate(len);
            }
        }
        (Value::Number(want), Value::Number(have)) => {
            if want.as_f64() != have.as_f64() {
                out.push(pointer(path));
            }
        }
        (want, have) => {
            if want != have {
                out.push(pointer(path));
            }
        }
    }
}

fn pointer(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}
