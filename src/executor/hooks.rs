//! Hook lifecycle: optional delete of the previous instance, create, wait
//! for a terminal health, then delete according to policy.

use tokio::time::Instant;

use super::{Run, SyncExecutor};
use crate::destination::with_timeout;
use crate::models::{HealthStatus, HookDeletePolicy};
use crate::planner::PlannedAction;

impl SyncExecutor {
    pub(super) async fn run_hook(&self, run: &Run<'_>, action: &PlannedAction) -> Result<(), String> {
        let manifest = action
            .manifest
            .as_ref()
            .ok_or_else(|| "hook has no manifest".to_string())?;
        let policy = run.app.sync_policy.sync_options.prune_propagation_policy;

        if action
            .delete_policies
            .contains(&HookDeletePolicy::BeforeHookCreation)
        {
            self.call(run, action, "delete previous hook", || {
                self.destination.delete(&action.key, policy)
            })
            .await?;
        }

        self.call(run, action, "create hook", || self.destination.apply(manifest))
            .await?;

        let result = self.wait_for_hook(run, action).await;

        let cleanup = match result {
            Ok(()) => HookDeletePolicy::HookSucceeded,
            Err(_) => HookDeletePolicy::HookFailed,
        };
        if action.delete_policies.contains(&cleanup) {
            // A leftover hook does not change the hook's own result.
            if let Err(message) = self
                .call(run, action, "delete hook", || {
                    self.destination.delete(&action.key, policy)
                })
                .await
            {
                tracing::warn!(app = %run.app.name, resource = %action.key, "{}", message);
            }
        }
        result
    }

    /// Poll the hook until it is Healthy (success), Degraded or Missing
    /// (failure), or the hook timeout passes.
    async fn wait_for_hook(&self, run: &Run<'_>, action: &PlannedAction) -> Result<(), String> {
        let deadline = Instant::now() + self.settings.hook_timeout;
        loop {
            match with_timeout(self.settings.call_timeout, self.destination.get(&action.key)).await {
                Ok(live) => {
                    let assessment = self.health.evaluate(live.as_ref());
                    let detail = assessment.message.unwrap_or_default();
                    match assessment.status {
                        HealthStatus::Healthy => {
                            tracing::debug!(app = %run.app.name, resource = %action.key, "hook completed");
                            return Ok(());
                        }
                        HealthStatus::Degraded | HealthStatus::Missing => {
                            return Err(format!("hook {}: {}", assessment.status, detail));
                        }
                        status => {
                            tracing::debug!(app = %run.app.name, resource = %action.key, status = %status, "waiting for hook");
                        }
                    }
                }
                Err(err) if err.is_retryable() => {
                    tracing::debug!(app = %run.app.name, resource = %action.key, error = %err, "hook status unavailable");
                }
                Err(err) => return Err(format!("failed to read hook status: {}", err)),
            }

            if Instant::now() >= deadline {
                return Err(format!(
                    "hook did not complete within {:?}",
                    self.settings.hook_timeout
                ));
            }
            tokio::time::sleep(self.settings.hook_poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::RwLock;

    use super::super::{CancelToken, EventBus, ExecutorSettings, SharedOperation};
    use super::*;
    use crate::destination::{CallKind, InMemoryDestination};
    use crate::models::{
        ActionKind, ActionResult, Application, HookType, Manifest, OperationPhase, SyncOperation,
        SyncTrigger, WavePhase,
    };
    use crate::planner::{PhaseStep, SyncPlan, Wave};
    use crate::registry::KindRegistry;

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

    fn job_hook(policies: Vec<HookDeletePolicy>) -> PlannedAction {
        let manifest = Manifest::new(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "migrate", "namespace": "shop"}
        }))
        .unwrap();
        PlannedAction {
            key: manifest.key(),
            kind: ActionKind::HookRun,
            manifest: Some(manifest),
            wave: 0,
            phase: WavePhase::PreSync,
            hook: Some(HookType::PreSync),
            delete_policies: policies,
        }
    }

    fn plan(action: PlannedAction) -> SyncPlan {
        SyncPlan {
            waves: vec![Wave {
                number: 0,
                steps: vec![PhaseStep {
                    phase: WavePhase::PreSync,
                    actions: vec![action],
                }],
            }],
            sync_fail_hooks: Vec::new(),
        }
    }

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            call_timeout: Duration::from_secs(1),
            hook_timeout: Duration::from_millis(50),
            hook_poll_interval: Duration::from_millis(5),
        }
    }

    fn operation() -> SharedOperation {
        Arc::new(RwLock::new(SyncOperation::new(
            "guestbook",
            "abc123",
            SyncTrigger::Manual,
            false,
        )))
    }

    #[tokio::test]
    async fn test_successful_hook_is_deleted_on_success() {
        let destination = Arc::new(InMemoryDestination::new().with_simulated_status());
        let executor = SyncExecutor::new(
            destination.clone(),
            Arc::new(KindRegistry::builtin()),
            EventBus::default(),
            settings(),
        );
        let action = job_hook(vec![
            HookDeletePolicy::BeforeHookCreation,
            HookDeletePolicy::HookSucceeded,
        ]);
        let key = action.key.clone();

        let op = operation();
        let phase = executor
            .execute(&app(), &plan(action), &op, &CancelToken::new())
            .await;

        assert_eq!(phase, OperationPhase::Succeeded);
        assert!(destination.object(&key).is_none());
        assert_eq!(destination.calls_of(CallKind::Delete).len(), 2);
    }

    #[tokio::test]
    async fn test_hook_that_never_completes_times_out() {
        // No simulated status: the Job stays Progressing.
        let destination = Arc::new(InMemoryDestination::new());
        let executor = SyncExecutor::new(
            destination.clone(),
            Arc::new(KindRegistry::builtin()),
            EventBus::default(),
            settings(),
        );
        let action = job_hook(Vec::new());
        let key = action.key.clone();

        let op = operation();
        let phase = executor
            .execute(&app(), &plan(action), &op, &CancelToken::new())
            .await;

        assert_eq!(phase, OperationPhase::Failed);
        let op = op.read().await;
        assert_eq!(op.actions[0].result, ActionResult::Failed);
        assert!(op.actions[0].message.as_deref().unwrap().contains("did not complete"));
        // Kept for inspection.
        assert!(destination.object(&key).is_some());
    }
}
