//! Controller
//!
//! Owns the registered Applications and drives their reconciliation.
//! Poll ticks, webhook notifications and operator requests all end up in
//! [`Controller::dispatch`]. At most one pass runs per Application at a
//! time. A sync request made while a sync operation runs is refused with
//! [`ControllerError::SyncInProgress`]; one made during a read-only pass
//! waits for it. Other triggers are coalesced into one follow-up pass.

pub mod status;
pub mod trigger;
mod worker;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::destination::{Destination, DestinationRegistry, LabelSelector, with_timeout};
use crate::diff::{DiffReport, validate_rules};
use crate::error::{ControllerError, ErrorClass};
use crate::executor::{
    ActionEvent, CancelToken, EventBus, ExecutorSettings, RetryPolicy, SharedOperation,
};
use crate::health::HealthEvaluator;
use crate::models::{AppStatus, Application, SyncOperation};
use crate::observer::LiveStateObserver;
use crate::registry::KindRegistry;
use crate::render::Renderer;
use crate::source::Source;
use crate::store::StateStore;

pub use trigger::{SourceChangedEvent, SyncRequest, Trigger, same_repository};

/// Timing and concurrency knobs of the controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub observe_timeout: Duration,
    pub max_concurrent_observations: usize,
    pub executor: ExecutorSettings,
    /// Delay before the next poll after a transient pass failure.
    pub backoff: RetryPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(180),
            fetch_timeout: Duration::from_secs(60),
            observe_timeout: Duration::from_secs(30),
            max_concurrent_observations: 16,
            executor: ExecutorSettings::default(),
            backoff: RetryPolicy::new(
                5,
                Duration::from_secs(5),
                2.0,
                Duration::from_secs(180),
            ),
        }
    }
}

#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    next_attempt: Option<Instant>,
}

/// Runtime state of one Application.
struct AppSlot {
    app: RwLock<Application>,
    status: RwLock<AppStatus>,
    /// Held for the duration of a pass.
    pass_lock: Mutex<()>,
    /// Operation in flight, if any.
    current: RwLock<Option<(SharedOperation, CancelToken)>>,
    /// A trigger arrived while a pass was running.
    requeue: AtomicBool,
    /// A manual sync has been accepted and not finished yet.
    sync_claimed: AtomicBool,
    backoff: std::sync::Mutex<Backoff>,
}

impl AppSlot {
    fn new(app: Application, status: AppStatus) -> Self {
        Self {
            app: RwLock::new(app),
            status: RwLock::new(status),
            pass_lock: Mutex::new(()),
            current: RwLock::new(None),
            requeue: AtomicBool::new(false),
            sync_claimed: AtomicBool::new(false),
            backoff: std::sync::Mutex::new(Backoff::default()),
        }
    }

    fn backoff(&self) -> std::sync::MutexGuard<'_, Backoff> {
        self.backoff.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the right to run a manual sync. Refused while a sync
    /// operation runs or another manual sync holds the claim.
    async fn claim_sync(&self, name: &str) -> Result<SyncClaim<'_>, ControllerError> {
        if self.current.read().await.is_some()
            || self
                .sync_claimed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return Err(ControllerError::SyncInProgress(name.to_string()));
        }
        Ok(SyncClaim(&self.sync_claimed))
    }

    fn is_due(&self) -> bool {
        self.backoff()
            .next_attempt
            .is_none_or(|next| Instant::now() >= next)
    }
}

/// Released when the manual sync pass ends.
struct SyncClaim<'a>(&'a AtomicBool);

impl Drop for SyncClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Inner {
    source: Arc<dyn Source>,
    destinations: DestinationRegistry,
    registry: Arc<KindRegistry>,
    store: Arc<dyn StateStore>,
    renderer: Renderer,
    observer: LiveStateObserver,
    health: HealthEvaluator,
    events: EventBus,
    settings: ControllerSettings,
    apps: RwLock<BTreeMap<String, Arc<AppSlot>>>,
    queue: mpsc::UnboundedSender<Trigger>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Trigger>>>,
}

#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    /// Build a controller and load persisted Applications from `store`.
    pub fn new(
        source: Arc<dyn Source>,
        destinations: DestinationRegistry,
        registry: Arc<KindRegistry>,
        store: Arc<dyn StateStore>,
        settings: ControllerSettings,
    ) -> Result<Self, ControllerError> {
        let state = store.load()?;
        let mut apps = BTreeMap::new();
        for (name, app) in state.applications {
            let status = state
                .statuses
                .get(&name)
                .map(|record| record.status.clone())
                .unwrap_or_default();
            apps.insert(name, Arc::new(AppSlot::new(app, status)));
        }
        tracing::info!(applications = apps.len(), "controller initialized");

        let (queue, receiver) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(Inner {
                source,
                destinations,
                renderer: Renderer::new(registry.clone()),
                observer: LiveStateObserver::new(
                    settings.max_concurrent_observations,
                    settings.observe_timeout,
                ),
                health: HealthEvaluator::new(registry.clone()),
                registry,
                store,
                events: EventBus::default(),
                settings,
                apps: RwLock::new(apps),
                queue,
                receiver: Mutex::new(Some(receiver)),
            }),
        })
    }

    /// Subscribe to per-action events of every sync operation.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ActionEvent> {
        self.inner.events.subscribe()
    }

    pub async fn applications(&self) -> Vec<Application> {
        let apps = self.inner.apps.read().await;
        let mut out = Vec::with_capacity(apps.len());
        for slot in apps.values() {
            out.push(slot.app.read().await.clone());
        }
        out
    }

    pub async fn application(&self, name: &str) -> Result<Application, ControllerError> {
        Ok(self.slot(name).await?.app.read().await.clone())
    }

    /// Register a new Application and queue its first pass.
    pub async fn add_application(&self, app: Application) -> Result<(), ControllerError> {
        self.validate(&app)?;
        {
            let mut apps = self.inner.apps.write().await;
            if apps.contains_key(&app.name) {
                return Err(ControllerError::AlreadyExists(app.name.clone()));
            }
            self.inner.store.save_application(&app)?;
            apps.insert(
                app.name.clone(),
                Arc::new(AppSlot::new(app.clone(), AppStatus::default())),
            );
        }
        tracing::info!(app = %app.name, server = %app.destination.server, "application added");
        self.enqueue(Trigger::Refresh {
            application: app.name,
        });
        Ok(())
    }

    /// Replace the spec of an existing Application. Takes effect on the next
    /// pass.
    pub async fn update_application(&self, app: Application) -> Result<(), ControllerError> {
        self.validate(&app)?;
        let slot = self.slot(&app.name).await?;
        self.inner.store.save_application(&app)?;
        *slot.app.write().await = app.clone();
        tracing::info!(app = %app.name, "application updated");
        self.enqueue(Trigger::Refresh {
            application: app.name,
        });
        Ok(())
    }

    /// Remove an Application. With `cascade`, its tracked live objects are
    /// deleted first; a failed delete keeps the Application registered.
    pub async fn delete_application(&self, name: &str, cascade: bool) -> Result<(), ControllerError> {
        let slot = self.slot(name).await?;
        if let Some((_, cancel)) = slot.current.read().await.as_ref() {
            cancel.cancel();
        }
        let _pass = slot.pass_lock.lock().await;

        if cascade {
            let app = slot.app.read().await.clone();
            let destination = self.destination_for(&app)?;
            self.delete_tracked(destination.as_ref(), &app).await?;
        }

        self.inner.store.delete_application(name)?;
        self.inner.apps.write().await.remove(name);
        tracing::info!(app = %name, cascade, "application deleted");
        Ok(())
    }

    async fn delete_tracked(
        &self,
        destination: &dyn Destination,
        app: &Application,
    ) -> Result<(), ControllerError> {
        let timeout = self.inner.settings.executor.call_timeout;
        let policy = app.sync_policy.sync_options.prune_propagation_policy;
        let tracked =
            with_timeout(timeout, destination.list(&LabelSelector::tracking(&app.name))).await?;
        for manifest in tracked {
            let key = manifest.key();
            with_timeout(timeout, destination.delete(&key, policy)).await?;
            tracing::info!(app = %app.name, resource = %key, "deleted managed resource");
        }
        Ok(())
    }

    /// Run one reconciliation pass that syncs regardless of the
    /// automation policy. Returns the finished operation.
    pub async fn trigger_sync(
        &self,
        name: &str,
        request: SyncRequest,
    ) -> Result<SyncOperation, ControllerError> {
        let trigger = Trigger::Sync {
            application: name.to_string(),
            request,
        };
        match self.dispatch(trigger).await? {
            Some(operation) => Ok(operation),
            // A Sync trigger always produces an operation or an error.
            None => Err(ControllerError::SyncInProgress(name.to_string())),
        }
    }

    /// Run one reconciliation pass now and return the resulting status.
    pub async fn refresh(&self, name: &str) -> Result<AppStatus, ControllerError> {
        self.dispatch(Trigger::Refresh {
            application: name.to_string(),
        })
        .await?;
        self.status(name).await
    }

    /// Queue a pass for every Application sourced from the notified
    /// repository. Returns the names of the matched Applications.
    pub async fn handle_webhook(&self, event: SourceChangedEvent) -> Vec<String> {
        let mut matched = Vec::new();
        {
            let apps = self.inner.apps.read().await;
            for (name, slot) in apps.iter() {
                let app = slot.app.read().await;
                if same_repository(&app.source.repo_url, &event.repo_url)
                    && trigger::tracks_revision(&app.source.target_revision, event.revision.as_deref())
                {
                    matched.push(name.clone());
                }
            }
        }
        tracing::info!(
            repo = %event.repo_url,
            revision = event.revision.as_deref().unwrap_or("-"),
            matched = matched.len(),
            "source change notification"
        );
        for name in &matched {
            self.enqueue(Trigger::SourceChanged {
                application: name.clone(),
                revision: event.revision.clone(),
            });
        }
        matched
    }

    /// Request cancellation of the running operation. It stops at the next
    /// wave boundary. Returns false when nothing is running.
    pub async fn cancel_operation(&self, name: &str) -> Result<bool, ControllerError> {
        let slot = self.slot(name).await?;
        let current = slot.current.read().await;
        match current.as_ref() {
            Some((_, cancel)) => {
                cancel.cancel();
                tracing::info!(app = %name, "cancellation requested");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Current status. While an operation runs, its live action log is
    /// reported.
    pub async fn status(&self, name: &str) -> Result<AppStatus, ControllerError> {
        let slot = self.slot(name).await?;
        let mut status = slot.status.read().await.clone();
        if let Some((operation, _)) = slot.current.read().await.as_ref() {
            status.last_operation = Some(operation.read().await.clone());
        }
        Ok(status)
    }

    /// Operation history, oldest first.
    pub async fn history(&self, name: &str) -> Result<Vec<SyncOperation>, ControllerError> {
        self.slot(name).await?;
        Ok(self.inner.store.history(name)?)
    }

    /// Compare desired and live state without changing anything.
    pub async fn diff(&self, name: &str) -> Result<DiffReport, ControllerError> {
        let slot = self.slot(name).await?;
        let app = slot.app.read().await.clone();
        Ok(self.compare(&app).await?.report)
    }

    /// Single entry point for every trigger.
    ///
    /// Returns the sync operation the pass ran, if any.
    pub async fn dispatch(&self, trigger: Trigger) -> Result<Option<SyncOperation>, ControllerError> {
        let slot = self.slot(trigger.application()).await?;
        let claim = match &trigger {
            Trigger::Sync { application, .. } => Some(slot.claim_sync(application).await?),
            _ => None,
        };
        let guard = match slot.pass_lock.try_lock() {
            Ok(guard) => guard,
            // A read-only pass holds the lock; the sync runs right after it
            Err(_) if claim.is_some() => {
                tracing::debug!(app = %trigger.application(), "waiting for running pass before syncing");
                slot.pass_lock.lock().await
            }
            Err(_) => {
                tracing::debug!(app = %trigger.application(), "pass already running, coalescing trigger");
                slot.requeue.store(true, Ordering::SeqCst);
                return Ok(None);
            }
        };

        let result = self.reconcile(&slot, &trigger).await;
        match &result {
            Err(e) if e.class() == ErrorClass::Transient => self.back_off(&slot, trigger.application()),
            _ => *slot.backoff() = Backoff::default(),
        }
        drop(guard);
        drop(claim);

        if slot.requeue.swap(false, Ordering::SeqCst) {
            self.enqueue(Trigger::Refresh {
                application: trigger.application().to_string(),
            });
        }
        result
    }

    /// Process triggers until `shutdown` resolves.
    ///
    /// Every Application is refreshed once per poll interval unless it is
    /// backing off after a transient failure. On shutdown, running
    /// operations are cancelled at their next wave boundary and awaited.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), ControllerError>
    where
        F: Future<Output = ()>,
    {
        let mut receiver = self
            .inner
            .receiver
            .lock()
            .await
            .take()
            .ok_or(ControllerError::AlreadyRunning)?;
        tokio::pin!(shutdown);

        let mut ticker = tokio::time::interval(self.inner.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut passes = JoinSet::new();

        tracing::info!(
            poll_interval = ?self.inner.settings.poll_interval,
            "controller loop started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.enqueue_due().await,
                Some(trigger) = receiver.recv() => {
                    let controller = self.clone();
                    passes.spawn(async move { controller.dispatch_logged(trigger).await });
                }
                Some(_) = passes.join_next(), if !passes.is_empty() => {}
            }
        }

        tracing::info!(running = passes.len(), "controller shutting down");
        for slot in self.inner.apps.read().await.values() {
            if let Some((_, cancel)) = slot.current.read().await.as_ref() {
                cancel.cancel();
            }
        }
        while passes.join_next().await.is_some() {}

        *self.inner.receiver.lock().await = Some(receiver);
        Ok(())
    }

    async fn dispatch_logged(&self, trigger: Trigger) {
        let name = trigger.application().to_string();
        match self.dispatch(trigger).await {
            Ok(Some(operation)) => {
                tracing::info!(app = %name, phase = %operation.phase, "sync finished")
            }
            Ok(None) => {}
            Err(e) => match e.class() {
                ErrorClass::Conflict => tracing::debug!(app = %name, error = %e, "pass skipped"),
                ErrorClass::Transient => tracing::warn!(app = %name, error = %e, "pass failed"),
                ErrorClass::Fatal => tracing::error!(app = %name, error = %e, "pass failed"),
            },
        }
    }

    async fn enqueue_due(&self) {
        let apps = self.inner.apps.read().await;
        for (name, slot) in apps.iter() {
            if slot.is_due() {
                self.enqueue(Trigger::Refresh {
                    application: name.clone(),
                });
            } else {
                tracing::debug!(app = %name, "backing off, skipping poll");
            }
        }
    }

    fn enqueue(&self, trigger: Trigger) {
        if self.inner.queue.send(trigger).is_err() {
            tracing::warn!("trigger queue closed");
        }
    }

    fn back_off(&self, slot: &AppSlot, name: &str) {
        let mut backoff = slot.backoff();
        backoff.failures = backoff.failures.saturating_add(1);
        let policy = &self.inner.settings.backoff;
        let delay = policy.delay(backoff.failures.min(policy.limit));
        backoff.next_attempt = Some(Instant::now() + delay);
        tracing::debug!(app = %name, failures = backoff.failures, delay = ?delay, "backing off");
    }

    async fn slot(&self, name: &str) -> Result<Arc<AppSlot>, ControllerError> {
        self.inner
            .apps
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownApplication(name.to_string()))
    }

    fn validate(&self, app: &Application) -> Result<(), ControllerError> {
        app.validate()
            .and_then(|_| validate_rules(app))
            .map_err(ControllerError::InvalidApplication)?;
        self.destination_for(app)?;
        Ok(())
    }

    fn destination_for(&self, app: &Application) -> Result<Arc<dyn Destination>, ControllerError> {
        self.inner
            .destinations
            .resolve(&app.destination.server)
            .ok_or_else(|| ControllerError::UnknownDestination(app.destination.server.clone()))
    }
}
