//! One reconciliation pass: resolve, fetch, render, observe, diff, then
//! decide whether to sync.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use super::status::{application_health, resource_statuses};
use super::{AppSlot, Controller, SyncRequest, Trigger};
use crate::destination::{Destination, with_timeout};
use crate::diff::{DiffReport, diff};
use crate::error::{ControllerError, SourceError};
use crate::executor::{CancelToken, SyncExecutor};
use crate::models::{
    AppPhase, AppStatus, Application, OperationPhase, SyncOperation, SyncStatus, SyncTrigger,
};
use crate::planner::{PlanOptions, plan};
use crate::render::DesiredResource;
use crate::source::FetchedSource;

/// Desired and live state of one Application at one revision.
pub(super) struct Comparison {
    pub revision: String,
    pub destination: Arc<dyn Destination>,
    pub desired: Vec<DesiredResource>,
    pub report: DiffReport,
}

impl Controller {
    pub(super) async fn compare(&self, app: &Application) -> Result<Comparison, ControllerError> {
        let destination = self.destination_for(app)?;
        let revision = self.resolve_revision(app).await?;
        let fetched = self.fetch(app, &revision).await?;
        let mut desired = self.inner.renderer.render(app, &fetched)?;
        self.settle_scopes(app, destination.as_ref(), &mut desired).await;
        let report = self.observe_and_diff(app, destination.as_ref(), &desired).await?;
        Ok(Comparison {
            revision,
            destination,
            desired,
            report,
        })
    }

    /// Kinds the registry does not know were rendered as namespaced. Ask the
    /// destination and strip the namespace from those it serves
    /// cluster-scoped, so desired keys match what the destination stores.
    async fn settle_scopes(
        &self,
        app: &Application,
        destination: &dyn Destination,
        desired: &mut [DesiredResource],
    ) {
        let mut scopes: HashMap<(String, String), Option<bool>> = HashMap::new();
        for resource in desired.iter_mut() {
            let (group, kind) = (resource.key.group.clone(), resource.key.kind.clone());
            if self.inner.registry.get(&group, &kind).is_some() {
                continue;
            }
            let namespaced = match scopes.get(&(group.clone(), kind.clone())) {
                Some(known) => *known,
                None => {
                    let lookup = with_timeout(
                        self.inner.settings.observe_timeout,
                        destination.is_namespaced(&group, &kind),
                    )
                    .await;
                    // Lookup failures leave the rendered namespace; observation
                    // reports the underlying problem.
                    let found = lookup.unwrap_or_else(|e| {
                        tracing::debug!(app = %app.name, group = %group, kind = %kind, error = %e, "scope lookup failed");
                        None
                    });
                    scopes.insert((group, kind), found);
                    found
                }
            };
            if namespaced == Some(false) {
                resource.make_cluster_scoped();
            }
        }
    }

    async fn observe_and_diff(
        &self,
        app: &Application,
        destination: &dyn Destination,
        desired: &[DesiredResource],
    ) -> Result<DiffReport, ControllerError> {
        let keys: Vec<_> = desired.iter().map(|d| d.key.clone()).collect();
        let snapshot = self.inner.observer.observe(destination, app, &keys).await?;
        Ok(diff(app, desired, &snapshot))
    }

    async fn resolve_revision(&self, app: &Application) -> Result<String, SourceError> {
        let source = &app.source;
        let after = self.inner.settings.fetch_timeout;
        tokio::time::timeout(
            after,
            self.inner
                .source
                .resolve_revision(&source.repo_url, &source.target_revision),
        )
        .await
        .map_err(|_| SourceError::Timeout {
            repo_url: source.repo_url.clone(),
            after,
        })?
    }

    async fn fetch(&self, app: &Application, revision: &str) -> Result<FetchedSource, SourceError> {
        let source = &app.source;
        let after = self.inner.settings.fetch_timeout;
        tokio::time::timeout(
            after,
            self.inner
                .source
                .fetch(&source.repo_url, revision, &source.path),
        )
        .await
        .map_err(|_| SourceError::Timeout {
            repo_url: source.repo_url.clone(),
            after,
        })?
    }

    pub(super) async fn reconcile(
        &self,
        slot: &AppSlot,
        trigger: &Trigger,
    ) -> Result<Option<SyncOperation>, ControllerError> {
        let app = slot.app.read().await.clone();
        tracing::debug!(app = %app.name, trigger = ?trigger, "starting pass");

        let comparison = match self.compare(&app).await {
            Ok(comparison) => comparison,
            Err(e) => {
                self.record_pass_error(slot, &app, &e).await;
                return Err(e);
            }
        };

        let status = {
            let mut status = slot.status.write().await;
            self.apply_report(&mut status, &app, &comparison.report);
            let revision = comparison.revision.clone();
            if status.sync == SyncStatus::Synced {
                status.synced_revision = Some(revision.clone());
            }
            let failed_here = last_failed_at(&status, &revision);
            status.phase = match status.sync {
                SyncStatus::Synced => AppPhase::Synced,
                SyncStatus::OutOfSync if failed_here => AppPhase::Failed,
                SyncStatus::OutOfSync => AppPhase::OutOfSync,
                SyncStatus::Unknown => AppPhase::Unknown,
            };
            status.error = if failed_here {
                status.last_operation.as_ref().and_then(|op| op.message.clone())
            } else {
                None
            };
            status.revision = Some(revision);
            self.persist_status(&app.name, &status);
            status.clone()
        };
        tracing::info!(
            app = %app.name,
            revision = %comparison.revision,
            sync = %status.sync,
            health = %status.health,
            "reconciled"
        );

        let Some((kind, request)) = decide(
            &app,
            &status,
            comparison.report.has_drift(app.sync_policy.prune),
            &comparison.revision,
            trigger,
        ) else {
            return Ok(None);
        };
        let operation = self.sync(slot, &app, comparison, kind, request).await;
        Ok(Some(operation))
    }

    async fn sync(
        &self,
        slot: &AppSlot,
        app: &Application,
        comparison: Comparison,
        trigger: SyncTrigger,
        request: SyncRequest,
    ) -> SyncOperation {
        let Comparison {
            revision,
            destination,
            desired,
            report,
        } = comparison;

        let plan = plan(app, &report, PlanOptions { prune: request.prune });
        let mut operation = SyncOperation::new(&app.name, &revision, trigger, request.dry_run);
        operation.actions = plan.records();
        tracing::info!(
            app = %app.name,
            revision = %revision,
            trigger = %trigger,
            actions = plan.action_count(),
            dry_run = request.dry_run,
            "starting sync"
        );
        tracing::debug!(app = %app.name, "sync plan:\n{}", plan);

        self.persist_operation(&operation);
        {
            let mut status = slot.status.write().await;
            status.phase = AppPhase::Syncing;
            status.last_operation = Some(operation.clone());
            self.persist_status(&app.name, &status);
        }

        let shared = Arc::new(RwLock::new(operation));
        let cancel = CancelToken::new();
        *slot.current.write().await = Some((shared.clone(), cancel.clone()));

        let executor = SyncExecutor::new(
            destination.clone(),
            self.inner.registry.clone(),
            self.inner.events.clone(),
            self.inner.settings.executor.clone(),
        );
        let phase = executor.execute(app, &plan, &shared, &cancel).await;
        let operation = shared.read().await.clone();
        *slot.current.write().await = None;
        self.persist_operation(&operation);

        let after = if operation.dry_run {
            None
        } else {
            match self
                .observe_and_diff(app, destination.as_ref(), &desired)
                .await
            {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::warn!(app = %app.name, error = %e, "failed to observe state after sync");
                    None
                }
            }
        };

        let mut status = slot.status.write().await;
        if let Some(report) = &after {
            self.apply_report(&mut status, app, report);
        }
        status.last_operation = Some(operation.clone());
        status.retries_exhausted = operation.retries_exhausted;
        status.phase = match phase {
            OperationPhase::Succeeded => {
                status.error = None;
                if !operation.dry_run {
                    status.synced_revision = Some(revision.clone());
                }
                match status.sync {
                    SyncStatus::Synced => AppPhase::Synced,
                    SyncStatus::OutOfSync => AppPhase::OutOfSync,
                    SyncStatus::Unknown => AppPhase::Unknown,
                }
            }
            _ => {
                status.error = Some(
                    operation
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("sync {}", phase.to_string().to_lowercase())),
                );
                AppPhase::Failed
            }
        };
        self.persist_status(&app.name, &status);

        match phase {
            OperationPhase::Succeeded => tracing::info!(
                app = %app.name,
                revision = %revision,
                retries = operation.retries_exhausted,
                "sync succeeded"
            ),
            _ => tracing::error!(
                app = %app.name,
                revision = %revision,
                phase = %phase,
                error = status.error.as_deref().unwrap_or_default(),
                "sync did not succeed"
            ),
        }
        operation
    }

    fn apply_report(&self, status: &mut AppStatus, app: &Application, report: &DiffReport) {
        let resources = resource_statuses(report, &self.inner.health);
        status.sync = report.sync_status(app.sync_policy.prune);
        status.health = application_health(&resources);
        status.resources = resources;
        status.reconciled_at = Some(Utc::now());
    }

    async fn record_pass_error(&self, slot: &AppSlot, app: &Application, err: &ControllerError) {
        let mut status = slot.status.write().await;
        status.sync = SyncStatus::Unknown;
        status.phase = AppPhase::Unknown;
        status.error = Some(err.to_string());
        status.reconciled_at = Some(Utc::now());
        self.persist_status(&app.name, &status);
    }

    fn persist_status(&self, name: &str, status: &AppStatus) {
        if let Err(e) = self.inner.store.save_status(name, status) {
            tracing::error!(app = %name, error = %e, "failed to persist status");
        }
    }

    fn persist_operation(&self, operation: &SyncOperation) {
        if let Err(e) = self.inner.store.record_operation(operation) {
            tracing::error!(app = %operation.application, error = %e, "failed to persist operation");
        }
    }
}

/// The last operation ran at `revision` and did not succeed.
fn last_failed_at(status: &AppStatus, revision: &str) -> bool {
    status.last_operation.as_ref().is_some_and(|op| {
        op.revision == revision
            && matches!(op.phase, OperationPhase::Failed | OperationPhase::Cancelled)
    })
}

/// Whether this pass should sync, and how.
///
/// Manual requests always sync. Automated Applications sync when out of sync
/// at a revision other than the last synced one, and with self-heal also on
/// drift at the same revision. A revision whose sync failed is not retried
/// automatically; a new revision or a manual sync is needed.
fn decide(
    app: &Application,
    status: &AppStatus,
    drift: bool,
    revision: &str,
    trigger: &Trigger,
) -> Option<(SyncTrigger, SyncRequest)> {
    if let Trigger::Sync { request, .. } = trigger {
        return Some((SyncTrigger::Manual, *request));
    }
    let policy = &app.sync_policy;
    if !policy.automated || status.sync != SyncStatus::OutOfSync {
        return None;
    }
    if last_failed_at(status, revision) {
        tracing::debug!(app = %app.name, revision, "not retrying failed revision automatically");
        return None;
    }

    let request = SyncRequest::default();
    if status.synced_revision.as_deref() != Some(revision) {
        let kind = match trigger {
            Trigger::SourceChanged { .. } => SyncTrigger::Webhook,
            _ => SyncTrigger::Automated,
        };
        return Some((kind, request));
    }
    if policy.self_heal && drift {
        return Some((SyncTrigger::SelfHeal, request));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(automated: bool, self_heal: bool) -> Application {
        let mut app: Application = serde_yaml::from_str(
            r#"
name: guestbook
source:
  repoURL: https://git.example.com/apps.git
destination:
  server: https://kubernetes.default.svc
  namespace: shop
"#,
        )
        .unwrap();
        app.sync_policy.automated = automated;
        app.sync_policy.self_heal = self_heal;
        app
    }

    fn out_of_sync(synced_revision: Option<&str>) -> AppStatus {
        AppStatus {
            sync: SyncStatus::OutOfSync,
            synced_revision: synced_revision.map(String::from),
            ..Default::default()
        }
    }

    fn refresh() -> Trigger {
        Trigger::Refresh {
            application: "guestbook".into(),
        }
    }

    #[test]
    fn test_manual_app_only_syncs_on_request() {
        let status = out_of_sync(None);
        assert_eq!(decide(&app(false, false), &status, true, "rev2", &refresh()), None);

        let request = SyncRequest {
            dry_run: true,
            prune: true,
        };
        let trigger = Trigger::Sync {
            application: "guestbook".into(),
            request,
        };
        assert_eq!(
            decide(&app(false, false), &status, true, "rev2", &trigger),
            Some((SyncTrigger::Manual, request))
        );
    }

    #[test]
    fn test_automated_syncs_new_revision() {
        let status = out_of_sync(Some("rev1"));
        assert_eq!(
            decide(&app(true, false), &status, true, "rev2", &refresh()).map(|d| d.0),
            Some(SyncTrigger::Automated)
        );
        let webhook = Trigger::SourceChanged {
            application: "guestbook".into(),
            revision: None,
        };
        assert_eq!(
            decide(&app(true, false), &status, true, "rev2", &webhook).map(|d| d.0),
            Some(SyncTrigger::Webhook)
        );
    }

    #[test]
    fn test_drift_at_same_revision_needs_self_heal() {
        let status = out_of_sync(Some("rev1"));
        assert_eq!(decide(&app(true, false), &status, true, "rev1", &refresh()), None);
        assert_eq!(
            decide(&app(true, true), &status, true, "rev1", &refresh()).map(|d| d.0),
            Some(SyncTrigger::SelfHeal)
        );
    }

    #[test]
    fn test_failed_revision_is_not_retried() {
        let mut status = out_of_sync(Some("rev1"));
        let mut op = SyncOperation::new("guestbook", "rev2", SyncTrigger::Automated, false);
        op.finish(OperationPhase::Failed);
        status.last_operation = Some(op);

        assert_eq!(decide(&app(true, true), &status, true, "rev2", &refresh()), None);
        assert!(decide(&app(true, true), &status, true, "rev3", &refresh()).is_some());
    }
}
