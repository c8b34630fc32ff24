//! kubesync library
//!
//! GitOps reconciliation: fetch manifests from a source, render them into
//! desired state, compare with what is live in the cluster and converge the
//! two. The binary is a thin CLI over [`controller::Controller`]; everything
//! is usable as a library for embedding and testing.
//!
//! Pipeline of one pass:
//! `source` -> `render` -> `observer` -> `diff` -> `planner` -> `executor`,
//! with `health` assessing live objects and `store` persisting the outcome.

pub mod cli;
pub mod config;
pub mod controller;
pub mod destination;
pub mod diff;
pub mod error;
pub mod executor;
pub mod health;
pub mod models;
pub mod observer;
pub mod planner;
pub mod registry;
pub mod render;
pub mod source;
pub mod store;

// Re-export commonly used types for convenience
pub use controller::{Controller, ControllerSettings, SourceChangedEvent, SyncRequest, Trigger};
pub use error::{ControllerError, ErrorClass};
pub use models::{AppStatus, Application, SyncOperation};
