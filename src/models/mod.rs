//! Model layer
//!
//! Structure:
//! - `application.rs` - Application declarations and sync policy
//! - `resource.rs` - Resource identity, manifest accessors, annotations
//! - `resource_kind.rs` - Kinds with built-in handling
//! - `status.rs` - Sync/health status and the per-application status report
//! - `operation.rs` - Sync operations and action log

pub mod application;
pub mod operation;
pub mod resource;
pub mod resource_kind;
pub mod status;

pub use application::{
    Application, ApplicationDestination, ApplicationSource, BackoffConfig, ChartParameters,
    IgnoreDifference, PropagationPolicy, RetryConfig, SyncOptions, SyncPolicy,
};
pub use operation::{
    ActionKind, ActionRecord, ActionResult, OperationPhase, SyncOperation, SyncTrigger, WavePhase,
};
pub use resource::{
    HOOK_ANNOTATION, HOOK_DELETE_POLICY_ANNOTATION, HookDeletePolicy, HookType, Manifest,
    ResourceKey, SYNC_OPTIONS_ANNOTATION, SYNC_WAVE_ANNOTATION, TRACKING_LABEL, resource_key,
};
pub use resource_kind::ResourceKind;
pub use status::{AppPhase, AppStatus, HealthStatus, ResourceStatus, SyncStatus};
