//! Sync Planner
//!
//! Turns a [`DiffReport`] into an ordered [`SyncPlan`]:
//! - waves run in ascending order
//! - within a wave: PreSync hooks, creates/updates, prunes, Sync hooks,
//!   PostSync hooks, each phase a barrier
//! - SyncFail hooks are kept aside and only run after a halt
//!
//! With `pruneLast` every prune moves into one trailing step after the last
//! wave.

use std::collections::BTreeMap;
use std::fmt;

use crate::diff::{DiffReport, ResourceState, ignored_paths, normalize};
use crate::models::{
    ActionKind, ActionRecord, Application, HookDeletePolicy, HookType, Manifest, ResourceKey,
    WavePhase,
};

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAction {
    pub key: ResourceKey,
    pub kind: ActionKind,
    /// Payload for creates, updates and hooks; `None` for prunes.
    pub manifest: Option<Manifest>,
    pub wave: i32,
    pub phase: WavePhase,
    pub hook: Option<HookType>,
    pub delete_policies: Vec<HookDeletePolicy>,
}

impl PlannedAction {
    pub fn record(&self) -> ActionRecord {
        ActionRecord::pending(self.key.clone(), self.kind, self.wave, self.phase)
    }
}

/// Actions of one phase; they may run concurrently.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseStep {
    pub phase: WavePhase,
    pub actions: Vec<PlannedAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Wave {
    pub number: i32,
    pub steps: Vec<PhaseStep>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncPlan {
    pub waves: Vec<Wave>,
    pub sync_fail_hooks: Vec<PlannedAction>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    /// Every action in execution order, SyncFail hooks excluded.
    pub fn actions(&self) -> impl Iterator<Item = &PlannedAction> {
        self.waves
            .iter()
            .flat_map(|w| w.steps.iter())
            .flat_map(|s| s.actions.iter())
    }

    pub fn action_count(&self) -> usize {
        self.actions().count()
    }

    /// Pending action log for a new operation.
    pub fn records(&self) -> Vec<ActionRecord> {
        self.actions().map(PlannedAction::record).collect()
    }
}

impl fmt::Display for SyncPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for wave in &self.waves {
            writeln!(f, "wave {}", wave.number)?;
            for step in &wave.steps {
                writeln!(f, "  {}", step.phase)?;
                for action in &step.actions {
                    writeln!(f, "    {} {}", action.kind, action.key)?;
                }
            }
        }
        if !self.sync_fail_hooks.is_empty() {
            writeln!(f, "on failure")?;
            for action in &self.sync_fail_hooks {
                writeln!(f, "    {} {}", action.kind, action.key)?;
            }
        }
        Ok(())
    }
}

/// Per-request planning switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    /// Prune even if the application's policy does not.
    pub prune: bool,
}

pub fn plan(app: &Application, report: &DiffReport, options: PlanOptions) -> SyncPlan {
    let prune_enabled = app.sync_policy.prune || options.prune;
    let sync_options = &app.sync_policy.sync_options;

    let mut waves: BTreeMap<i32, BTreeMap<WavePhase, Vec<PlannedAction>>> = BTreeMap::new();
    let mut trailing_prunes = Vec::new();
    let mut push = |action: PlannedAction| {
        waves
            .entry(action.wave)
            .or_default()
            .entry(action.phase)
            .or_default()
            .push(action);
    };

    for resource in &report.resources {
        let action = match resource.state {
            ResourceState::Missing => resource.desired.clone().map(|manifest| PlannedAction {
                key: resource.key.clone(),
                kind: ActionKind::Create,
                manifest: Some(manifest),
                wave: resource.sync_wave,
                phase: WavePhase::Apply,
                hook: None,
                delete_policies: Vec::new(),
            }),
            ResourceState::OutOfSync => resource.desired.as_ref().map(|desired| {
                let mut manifest = desired.clone();
                if sync_options.respect_ignore_differences {
                    if let Some(live) = &resource.live {
                        for path in ignored_paths(app, &resource.key) {
                            normalize::overlay_path(manifest.as_value_mut(), live.as_value(), &path);
                        }
                    }
                }
                PlannedAction {
                    key: resource.key.clone(),
                    kind: ActionKind::Update,
                    manifest: Some(manifest),
                    wave: resource.sync_wave,
                    phase: WavePhase::Apply,
                    hook: None,
                    delete_policies: Vec::new(),
                }
            }),
            ResourceState::PruneCandidate if prune_enabled && resource.prune_allowed => {
                Some(PlannedAction {
                    key: resource.key.clone(),
                    kind: ActionKind::Prune,
                    manifest: None,
                    wave: resource.sync_wave,
                    phase: WavePhase::Prune,
                    hook: None,
                    delete_policies: Vec::new(),
                })
            }
            _ => None,
        };

        match action {
            Some(action) if action.kind == ActionKind::Prune && sync_options.prune_last => {
                trailing_prunes.push(action)
            }
            Some(action) => push(action),
            None => {}
        }
    }

    let mut sync_fail_hooks = Vec::new();
    for hook in &report.hooks {
        let Some(hook_type) = hook.hook else {
            continue;
        };
        let phase = match hook_type {
            HookType::PreSync => WavePhase::PreSync,
            HookType::Sync => WavePhase::Sync,
            HookType::PostSync => WavePhase::PostSync,
            HookType::SyncFail => WavePhase::SyncFail,
        };
        let action = PlannedAction {
            key: hook.key.clone(),
            kind: ActionKind::HookRun,
            manifest: Some(hook.manifest.clone()),
            wave: hook.sync_wave,
            phase,
            hook: Some(hook_type),
            delete_policies: hook.delete_policies.clone(),
        };
        if hook_type == HookType::SyncFail {
            sync_fail_hooks.push(action);
        } else {
            push(action);
        }
    }

    let mut plan = SyncPlan {
        waves: waves
            .into_iter()
            .map(|(number, phases)| Wave {
                number,
                steps: phases
                    .into_iter()
                    .map(|(phase, mut actions)| {
                        actions.sort_by(|a, b| a.key.cmp(&b.key));
                        PhaseStep { phase, actions }
                    })
                    .collect(),
            })
            .collect(),
        sync_fail_hooks,
    };
    plan.sync_fail_hooks
        .sort_by(|a, b| a.wave.cmp(&b.wave).then_with(|| a.key.cmp(&b.key)));

    if !trailing_prunes.is_empty() {
        trailing_prunes.sort_by(|a, b| a.key.cmp(&b.key));
        let number = plan.waves.last().map(|w| w.number).unwrap_or(0);
        plan.waves.push(Wave {
            number,
            steps: vec![PhaseStep {
                phase: WavePhase::Prune,
                actions: trailing_prunes,
            }],
        });
    }

    tracing::debug!(
        app = %app.name,
        waves = plan.waves.len(),
        actions = plan.action_count(),
        "planned sync"
    );
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ResourceDiff;
    use crate::render::DesiredResource;
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

    fn manifest(kind: &str, name: &str, annotations: serde_json::Value) -> Manifest {
        let api_version = match kind {
            "Deployment" => "apps/v1",
            "Job" => "batch/v1",
            _ => "v1",
        };
        Manifest::new(json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": {"name": name, "namespace": "shop", "annotations": annotations}
        }))
        .unwrap()
    }

    fn entry(state: ResourceState, m: Manifest) -> ResourceDiff {
        ResourceDiff {
            key: m.key(),
            state,
            differences: Vec::new(),
            sync_wave: m.sync_wave().unwrap(),
            prune_allowed: m.prune_allowed(),
            desired: (state != ResourceState::PruneCandidate).then(|| m.clone()),
            live: (state != ResourceState::Missing).then(|| m.clone()),
            message: None,
        }
    }

    fn hook(name: &str, annotations: serde_json::Value) -> DesiredResource {
        let m = manifest("Job", name, annotations);
        DesiredResource {
            key: m.key(),
            sync_wave: m.sync_wave().unwrap(),
            hook: m.hook().unwrap(),
            delete_policies: m.hook_delete_policies().unwrap(),
            prune_allowed: true,
            manifest: m,
            source_file: "hooks.yaml".into(),
        }
    }

    fn report() -> DiffReport {
        DiffReport {
            application: "guestbook".into(),
            resources: vec![
                entry(
                    ResourceState::Missing,
                    manifest("ConfigMap", "settings", json!({})),
                ),
                entry(
                    ResourceState::OutOfSync,
                    manifest("Deployment", "web", json!({"kubesync.io/sync-wave": "1"})),
                ),
                entry(
                    ResourceState::Synced,
                    manifest("Service", "web", json!({})),
                ),
                entry(
                    ResourceState::PruneCandidate,
                    manifest("ConfigMap", "legacy", json!({})),
                ),
                entry(
                    ResourceState::Conflict,
                    manifest("ConfigMap", "shared", json!({})),
                ),
            ],
            hooks: vec![
                hook("migrate", json!({"kubesync.io/hook": "PreSync"})),
                hook(
                    "smoke-test",
                    json!({"kubesync.io/hook": "PostSync", "kubesync.io/sync-wave": "1", "kubesync.io/hook-delete-policy": "HookSucceeded"}),
                ),
                hook("notify", json!({"kubesync.io/hook": "SyncFail"})),
            ],
        }
    }

    #[test]
    fn test_plan_orders_waves_and_phases() {
        let plan = plan(&app(), &report(), PlanOptions::default());
        insta::assert_snapshot!(plan.to_string().trim_end(), @r"
        wave 0
          PreSync
            HookRun batch/Job:shop/migrate
          Apply
            Create ConfigMap:shop/settings
        wave 1
          Apply
            Update apps/Deployment:shop/web
          PostSync
            HookRun batch/Job:shop/smoke-test
        on failure
            HookRun batch/Job:shop/notify
        ");
        let smoke = plan.actions().find(|a| a.key.name == "smoke-test").unwrap();
        assert_eq!(smoke.delete_policies, vec![HookDeletePolicy::HookSucceeded]);
    }

    #[test]
    fn test_prune_from_request_and_prune_last() {
        let with_prune = plan(&app(), &report(), PlanOptions { prune: true });
        let prune = with_prune
            .actions()
            .find(|a| a.kind == ActionKind::Prune)
            .unwrap();
        assert_eq!(prune.wave, 0);
        assert_eq!(with_prune.waves[0].steps[2].phase, WavePhase::Prune);

        let mut last = app();
        last.sync_policy.prune = true;
        last.sync_policy.sync_options.prune_last = true;
        let plan = plan(&last, &report(), PlanOptions::default());
        let trailing = plan.waves.last().unwrap();
        assert_eq!(trailing.steps.len(), 1);
        assert_eq!(trailing.steps[0].actions[0].kind, ActionKind::Prune);
        assert_eq!(plan.action_count(), 5);
    }

    #[test]
    fn test_respect_ignore_differences_keeps_live_value() {
        let mut app = app();
        app.sync_policy.sync_options.respect_ignore_differences = true;
        app.sync_policy.ignore_differences.push(crate::models::IgnoreDifference {
            kind: "Deployment".into(),
            json_pointers: vec!["/spec/replicas".into()],
            ..Default::default()
        });

        let mut desired = manifest("Deployment", "web", json!({}));
        desired.as_value_mut()["spec"] = json!({"replicas": 1, "paused": false});
        let mut live = desired.clone();
        live.as_value_mut()["spec"] = json!({"replicas": 4, "paused": true});

        let mut diff = entry(ResourceState::OutOfSync, desired);
        diff.live = Some(live);
        let report = DiffReport {
            application: "guestbook".into(),
            resources: vec![diff],
            hooks: Vec::new(),
        };

        let plan = plan(&app, &report, PlanOptions::default());
        let payload = plan.waves[0].steps[0].actions[0].manifest.as_ref().unwrap();
        assert_eq!(payload.spec().unwrap(), &json!({"replicas": 4, "paused": false}));
    }
}
