//! Error taxonomy
//!
//! Every component returns its own `thiserror` enum. Each of them maps onto
//! one [`ErrorClass`], which is what retry and halt decisions are based on.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// How an error should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network, throttling, timeout. Retried with backoff.
    Transient,
    /// Bad revision, render error, permission denied. Needs a spec or credential fix.
    Fatal,
    /// Concurrent ownership or concurrent sync. The caller retries the whole trigger later.
    Conflict,
}

/// Errors from the Source Fetcher.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("source {repo_url} unreachable: {message}")]
    Unreachable { repo_url: String, message: String },

    #[error("revision '{revision}' not found in {repo_url}")]
    RevisionNotFound { repo_url: String, revision: String },

    #[error("path '{path}' not found at revision {revision}")]
    PathNotFound { path: String, revision: String },

    #[error("invalid source {repo_url}: {message}")]
    Invalid { repo_url: String, message: String },

    #[error("fetch from {repo_url} timed out after {after:?}")]
    Timeout { repo_url: String, after: Duration },
}

impl SourceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SourceError::Unreachable { .. } | SourceError::Timeout { .. } => ErrorClass::Transient,
            SourceError::RevisionNotFound { .. }
            | SourceError::PathNotFound { .. }
            | SourceError::Invalid { .. } => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Errors from the Manifest Renderer. Always fatal for the current attempt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RenderError {
    #[error("{file}: template syntax error: {message}")]
    Syntax { file: String, message: String },

    #[error("{file}: {message}")]
    MissingValue { file: String, message: String },

    #[error("{file}: invalid manifest: {message}")]
    InvalidManifest { file: String, message: String },

    #[error("invalid value '{value}' for annotation {annotation} on {resource}")]
    InvalidAnnotation {
        resource: String,
        annotation: String,
        value: String,
    },

    #[error("resource {0} is declared more than once")]
    DuplicateResource(String),
}

impl RenderError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Fatal
    }
}

/// Errors returned by a destination collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DestinationError {
    #[error("destination unreachable: {0}")]
    Unreachable(String),

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Optimistic concurrency conflict (stale resourceVersion and similar).
    #[error("write conflict: {0}")]
    WriteConflict(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The destination refused the object (schema validation, immutable field).
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The API server does not serve the kind (yet). A CRD applied in an
    /// earlier wave may still be getting established.
    #[error("kind not served: {0}")]
    KindNotServed(String),

    #[error("{0}")]
    Other(String),
}

impl DestinationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DestinationError::Unreachable(_)
            | DestinationError::Throttled(_)
            | DestinationError::Timeout(_)
            | DestinationError::WriteConflict(_)
            | DestinationError::KindNotServed(_) => ErrorClass::Transient,
            DestinationError::PermissionDenied(_)
            | DestinationError::Rejected(_)
            | DestinationError::NotFound(_)
            | DestinationError::Other(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Whole-pass failures of the Live-State Observer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ObserveError {
    #[error("destination unreachable: {0}")]
    DestinationUnreachable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl ObserveError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ObserveError::DestinationUnreachable(_) => ErrorClass::Transient,
            ObserveError::PermissionDenied(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Errors from the durable state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode or decode {path}: {message}")]
    Encoding { path: PathBuf, message: String },
}

/// Errors surfaced by the controller's trigger and management interfaces.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("application '{0}' not found")]
    UnknownApplication(String),

    #[error("application '{0}' already exists")]
    AlreadyExists(String),

    #[error("invalid application: {0}")]
    InvalidApplication(String),

    #[error("a sync operation is already running for application '{0}'")]
    SyncInProgress(String),

    #[error("no destination configured for server '{0}'")]
    UnknownDestination(String),

    #[error("the controller loop is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Observe(#[from] ObserveError),

    #[error(transparent)]
    Destination(#[from] DestinationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ControllerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ControllerError::SyncInProgress(_)
            | ControllerError::AlreadyExists(_)
            | ControllerError::AlreadyRunning => ErrorClass::Conflict,
            ControllerError::Source(e) => e.class(),
            ControllerError::Render(e) => e.class(),
            ControllerError::Observe(e) => e.class(),
            ControllerError::Destination(e) => e.class(),
            ControllerError::UnknownApplication(_)
            | ControllerError::InvalidApplication(_)
            | ControllerError::UnknownDestination(_)
            | ControllerError::Store(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_error_classes() {
        assert!(DestinationError::Throttled("429".into()).is_retryable());
        assert!(DestinationError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(DestinationError::WriteConflict("stale".into()).is_retryable());
        assert!(!DestinationError::Rejected("bad spec".into()).is_retryable());
        assert!(!DestinationError::PermissionDenied("forbidden".into()).is_retryable());
    }

    #[test]
    fn test_source_error_classes() {
        let unreachable = SourceError::Unreachable {
            repo_url: "https://example.com/repo.git".into(),
            message: "connection refused".into(),
        };
        assert!(unreachable.is_retryable());

        let missing = SourceError::RevisionNotFound {
            repo_url: "https://example.com/repo.git".into(),
            revision: "v9".into(),
        };
        assert_eq!(missing.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_controller_conflict() {
        let err = ControllerError::SyncInProgress("guestbook".into());
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert!(!err.is_retryable());
    }
}
