//! Sync Executor
//!
//! Runs a [`SyncPlan`] against one destination and keeps the operation's
//! action log current while doing so.
//!
//! - Waves run strictly in order. Within a wave each phase step is a
//!   barrier, and the actions of one step run concurrently.
//! - Each destination call carries a timeout. Transient errors are retried
//!   with the application's backoff until the attempt limit is reached;
//!   anything else fails the action at once.
//! - The first failed step halts the plan: remaining actions are Skipped and
//!   SyncFail hooks run once.
//! - Cancellation is checked at wave boundaries.

pub mod events;
mod hooks;
pub mod retry;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::destination::{Destination, with_timeout};
use crate::error::DestinationError;
use crate::health::HealthEvaluator;
use crate::models::{
    ActionKind, ActionRecord, ActionResult, Application, OperationPhase, SyncOperation,
};
use crate::planner::{PlannedAction, SyncPlan};
use crate::registry::{ApplyStrategy, KindRegistry};

pub use events::{ActionEvent, EventBus};
pub use retry::RetryPolicy;

/// Operation shared between the executor and status readers.
pub type SharedOperation = Arc<RwLock<SyncOperation>>;

/// Operator cancellation request, observed at the next wave boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Deadline of each destination call.
    pub call_timeout: Duration,
    /// How long a hook may take to become healthy.
    pub hook_timeout: Duration,
    pub hook_poll_interval: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            hook_timeout: Duration::from_secs(300),
            hook_poll_interval: Duration::from_secs(2),
        }
    }
}

/// State of one execution, passed to every action.
struct Run<'a> {
    app: &'a Application,
    operation: &'a SharedOperation,
    operation_id: Uuid,
    retry: RetryPolicy,
}

pub struct SyncExecutor {
    destination: Arc<dyn Destination>,
    registry: Arc<KindRegistry>,
    health: HealthEvaluator,
    events: EventBus,
    settings: ExecutorSettings,
}

impl SyncExecutor {
    pub fn new(
        destination: Arc<dyn Destination>,
        registry: Arc<KindRegistry>,
        events: EventBus,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            destination,
            health: HealthEvaluator::new(registry.clone()),
            registry,
            events,
            settings,
        }
    }

    /// Execute `plan` and return the operation's terminal phase.
    ///
    /// The operation's action log is seeded from the plan when empty.
    pub async fn execute(
        &self,
        app: &Application,
        plan: &SyncPlan,
        operation: &SharedOperation,
        cancel: &CancelToken,
    ) -> OperationPhase {
        let (operation_id, dry_run) = {
            let mut op = operation.write().await;
            if op.actions.is_empty() {
                op.actions = plan.records();
            }
            (op.id, op.dry_run)
        };

        if dry_run {
            self.skip_pending(operation, "dry run").await;
            return self.finish(app, operation, OperationPhase::Succeeded).await;
        }

        let run = Run {
            app,
            operation,
            operation_id,
            retry: RetryPolicy::from(&app.sync_policy.retry),
        };

        let mut halted = false;
        for wave in &plan.waves {
            if cancel.is_cancelled() {
                tracing::info!(app = %app.name, wave = wave.number, "sync cancelled at wave boundary");
                operation.write().await.phase = OperationPhase::Terminating;
                self.skip_pending(operation, "operation cancelled").await;
                return self.finish(app, operation, OperationPhase::Cancelled).await;
            }

            tracing::info!(app = %app.name, wave = wave.number, "starting wave");
            for step in &wave.steps {
                let results =
                    join_all(step.actions.iter().map(|action| self.run_action(&run, action))).await;
                if results.iter().any(|ok| !ok) {
                    halted = true;
                    break;
                }
            }
            if halted {
                tracing::warn!(app = %app.name, wave = wave.number, "halting sync after failure");
                break;
            }
        }

        if !halted {
            return self.finish(app, operation, OperationPhase::Succeeded).await;
        }

        self.skip_pending(operation, "not started: sync halted after a failure")
            .await;
        for hook in &plan.sync_fail_hooks {
            operation.write().await.actions.push(hook.record());
            self.run_action(&run, hook).await;
        }
        self.finish(app, operation, OperationPhase::Failed).await
    }

    async fn finish(
        &self,
        app: &Application,
        operation: &SharedOperation,
        phase: OperationPhase,
    ) -> OperationPhase {
        let mut op = operation.write().await;
        op.finish(phase);
        tracing::info!(
            app = %app.name,
            operation = %op.id,
            phase = %phase,
            succeeded = op.count(ActionResult::Succeeded),
            failed = op.count(ActionResult::Failed),
            skipped = op.count(ActionResult::Skipped),
            "sync operation finished"
        );
        phase
    }

    async fn skip_pending(&self, operation: &SharedOperation, reason: &str) {
        let mut op = operation.write().await;
        for record in op.actions.iter_mut().filter(|r| r.result == ActionResult::Pending) {
            record.result = ActionResult::Skipped;
            record.message = Some(reason.to_string());
        }
    }

    async fn update<F>(&self, run: &Run<'_>, action: &PlannedAction, f: F)
    where
        F: FnOnce(&mut ActionRecord),
    {
        let mut op = run.operation.write().await;
        if let Some(record) = op.actions.iter_mut().rev().find(|r| {
            r.resource == action.key && r.kind == action.kind && r.phase == action.phase
        }) {
            f(record);
        }
    }

    /// Run one action to a terminal result. Returns whether it succeeded.
    async fn run_action(&self, run: &Run<'_>, action: &PlannedAction) -> bool {
        self.update(run, action, |r| {
            r.result = ActionResult::Running;
            r.started_at = Some(Utc::now());
        })
        .await;

        let outcome = match action.kind {
            ActionKind::Create | ActionKind::Update => self.apply_resource(run, action).await,
            ActionKind::Prune => {
                let policy = run.app.sync_policy.sync_options.prune_propagation_policy;
                self.call(run, action, "delete", || {
                    self.destination.delete(&action.key, policy)
                })
                .await
            }
            ActionKind::HookRun => self.run_hook(run, action).await,
        };

        match outcome {
            Ok(()) => {
                self.update(run, action, |r| {
                    r.result = ActionResult::Succeeded;
                    r.message = None;
                    r.finished_at = Some(Utc::now());
                })
                .await;
                true
            }
            Err(message) => {
                {
                    let mut op = run.operation.write().await;
                    op.record_error(format!("{} {}: {}", action.kind, action.key, message));
                }
                self.update(run, action, |r| {
                    r.result = ActionResult::Failed;
                    r.message = Some(message);
                    r.finished_at = Some(Utc::now());
                })
                .await;
                false
            }
        }
    }

    async fn apply_resource(&self, run: &Run<'_>, action: &PlannedAction) -> Result<(), String> {
        let manifest = action
            .manifest
            .as_ref()
            .ok_or_else(|| "no manifest to apply".to_string())?;

        let strategy = self.registry.apply_strategy(&action.key.group, &action.key.kind);
        if action.kind == ActionKind::Update && strategy == ApplyStrategy::Recreate {
            let policy = run.app.sync_policy.sync_options.prune_propagation_policy;
            self.call(run, action, "delete for recreate", || {
                self.destination.delete(&action.key, policy)
            })
            .await?;
        }

        self.call(run, action, "apply", || self.destination.apply(manifest))
            .await
            .map(|_| ())
    }

    /// One destination call with timeout and retry. Every attempt is counted
    /// on the action record and emitted as an event.
    async fn call<T, F, Fut>(
        &self,
        run: &Run<'_>,
        action: &PlannedAction,
        step: &str,
        mut f: F,
    ) -> Result<T, String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DestinationError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = with_timeout(self.settings.call_timeout, f()).await;

            let mut total = 0;
            self.update(run, action, |r| {
                r.attempts += 1;
                total = r.attempts;
            })
            .await;

            match result {
                Ok(value) => {
                    self.emit(run, action, total, ActionResult::Succeeded, None);
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && run.retry.allows(attempt) => {
                    let delay = run.retry.delay(attempt);
                    let message = format!("{} failed: {}; retrying in {:?}", step, err, delay);
                    run.operation.write().await.retries_exhausted += 1;
                    self.update(run, action, |r| {
                        r.result = ActionResult::Retrying;
                        r.message = Some(message.clone());
                    })
                    .await;
                    self.emit(run, action, total, ActionResult::Retrying, Some(message));
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    let message = if err.is_retryable() {
                        format!("{} failed after {} attempts: {}", step, attempt, err)
                    } else {
                        format!("{} failed: {}", step, err)
                    };
                    self.emit(run, action, total, ActionResult::Failed, Some(message.clone()));
                    return Err(message);
                }
            }
        }
    }

    fn emit(
        &self,
        run: &Run<'_>,
        action: &PlannedAction,
        attempt: u32,
        outcome: ActionResult,
        message: Option<String>,
    ) {
        self.events.emit(ActionEvent {
            operation_id: run.operation_id,
            application: run.app.name.clone(),
            action: action.kind,
            resource: action.key.clone(),
            wave: action.wave,
            phase: action.phase,
            attempt,
            outcome,
            message,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::MockDestination;
    use crate::models::{Manifest, SyncTrigger, WavePhase};
    use crate::planner::{PhaseStep, Wave};
    use serde_json::json;

    fn app(limit: u32) -> Application {
        let mut app: Application = serde_yaml::from_str(
            r#"
name: guestbook
source:
  repoURL: https://git.example.com/apps.git
destination:
  server: https://kubernetes.default.svc
  namespace: shop
syncPolicy:
  retry:
    backoff:
      baseMs: 1
      factor: 2
      maxMs: 4
"#,
        )
        .unwrap();
        app.sync_policy.retry.limit = limit;
        app
    }

    fn config_map(name: &str) -> Manifest {
        Manifest::new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "shop"}
        }))
        .unwrap()
    }

    fn create(name: &str, wave: i32) -> PlannedAction {
        let manifest = config_map(name);
        PlannedAction {
            key: manifest.key(),
            kind: ActionKind::Create,
            manifest: Some(manifest),
            wave,
            phase: WavePhase::Apply,
            hook: None,
            delete_policies: Vec::new(),
        }
    }

    fn plan_of(waves: Vec<Vec<PlannedAction>>) -> SyncPlan {
        SyncPlan {
            waves: waves
                .into_iter()
                .enumerate()
                .map(|(i, actions)| Wave {
                    number: i as i32,
                    steps: vec![PhaseStep {
                        phase: WavePhase::Apply,
                        actions,
                    }],
                })
                .collect(),
            sync_fail_hooks: Vec::new(),
        }
    }

    fn executor(destination: MockDestination) -> SyncExecutor {
        SyncExecutor::new(
            Arc::new(destination),
            Arc::new(KindRegistry::builtin()),
            EventBus::default(),
            ExecutorSettings::default(),
        )
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
    async fn test_retry_cap_counts_total_attempts() {
        let mut destination = MockDestination::new();
        destination
            .expect_apply()
            .times(3)
            .returning(|_| Err(DestinationError::Throttled("slow down".into())));

        let op = operation();
        let phase = executor(destination)
            .execute(&app(3), &plan_of(vec![vec![create("a", 0)]]), &op, &CancelToken::new())
            .await;

        assert_eq!(phase, OperationPhase::Failed);
        let op = op.read().await;
        assert_eq!(op.actions[0].result, ActionResult::Failed);
        assert_eq!(op.actions[0].attempts, 3);
        assert_eq!(op.retries_exhausted, 2);
        assert!(op.message.as_deref().unwrap().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_fatal_error_does_not_retry_and_halts() {
        let mut destination = MockDestination::new();
        destination
            .expect_apply()
            .times(1)
            .returning(|_| Err(DestinationError::Rejected("field is immutable".into())));

        let op = operation();
        let plan = plan_of(vec![vec![create("a", 0)], vec![create("b", 1)]]);
        let phase = executor(destination)
            .execute(&app(5), &plan, &op, &CancelToken::new())
            .await;

        assert_eq!(phase, OperationPhase::Failed);
        let op = op.read().await;
        assert_eq!(op.actions[0].attempts, 1);
        assert_eq!(op.actions[1].result, ActionResult::Skipped);
        assert_eq!(op.retries_exhausted, 0);
    }

    #[tokio::test]
    async fn test_transient_error_recovers() {
        let mut destination = MockDestination::new();
        let mut calls = 0;
        destination.expect_apply().times(2).returning(move |m| {
            calls += 1;
            if calls == 1 {
                Err(DestinationError::WriteConflict("stale".into()))
            } else {
                Ok(m.clone())
            }
        });

        let op = operation();
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let executor = SyncExecutor::new(
            Arc::new(destination),
            Arc::new(KindRegistry::builtin()),
            events,
            ExecutorSettings::default(),
        );
        let phase = executor
            .execute(&app(5), &plan_of(vec![vec![create("a", 0)]]), &op, &CancelToken::new())
            .await;

        assert_eq!(phase, OperationPhase::Succeeded);
        assert_eq!(rx.recv().await.unwrap().outcome, ActionResult::Retrying);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.outcome, ActionResult::Succeeded);
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn test_cancel_before_next_wave() {
        let destination = MockDestination::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let op = operation();
        let phase = executor(destination)
            .execute(&app(5), &plan_of(vec![vec![create("a", 0)]]), &op, &cancel)
            .await;
        assert_eq!(phase, OperationPhase::Cancelled);
        assert_eq!(op.read().await.actions[0].result, ActionResult::Skipped);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let destination = MockDestination::new();
        let op = Arc::new(RwLock::new(SyncOperation::new(
            "guestbook",
            "abc123",
            SyncTrigger::Manual,
            true,
        )));
        let phase = executor(destination)
            .execute(&app(5), &plan_of(vec![vec![create("a", 0)]]), &op, &CancelToken::new())
            .await;
        assert_eq!(phase, OperationPhase::Succeeded);
        assert_eq!(op.read().await.actions[0].message.as_deref(), Some("dry run"));
    }
}
