//! Trigger messages
//!
//! Poll ticks, operator requests and webhook notifications all become a
//! [`Trigger`] and go through `Controller::dispatch`.

use serde::{Deserialize, Serialize};

/// Options of a manual sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default)]
    pub dry_run: bool,
    /// Prune even when the application's policy does not.
    #[serde(default)]
    pub prune: bool,
}

/// Notification that a source repository changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceChangedEvent {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Reconcile one application; auto-sync decides whether to sync.
    Refresh { application: String },
    /// Reconcile after a source change notification.
    SourceChanged {
        application: String,
        revision: Option<String>,
    },
    /// Operator-requested sync.
    Sync {
        application: String,
        request: SyncRequest,
    },
}

impl Trigger {
    pub fn application(&self) -> &str {
        match self {
            Trigger::Refresh { application }
            | Trigger::SourceChanged { application, .. }
            | Trigger::Sync { application, .. } => application,
        }
    }
}

/// Repository URLs compare equal regardless of case, trailing slash or
/// `.git` suffix.
pub fn same_repository(a: &str, b: &str) -> bool {
    normalize_repo_url(a) == normalize_repo_url(b)
}

/// Whether an Application following `target` cares about a change to
/// `changed`. Commit ids and unnamed changes always match.
pub fn tracks_revision(target: &str, changed: Option<&str>) -> bool {
    let Some(changed) = changed else {
        return true;
    };
    if target == "HEAD" || is_commit_id(changed) {
        return true;
    }
    short_ref(target) == short_ref(changed)
}

fn short_ref(reference: &str) -> &str {
    reference
        .strip_prefix("refs/heads/")
        .or_else(|| reference.strip_prefix("refs/tags/"))
        .unwrap_or(reference)
}

fn is_commit_id(revision: &str) -> bool {
    revision.len() == 40 && revision.chars().all(|c| c.is_ascii_hexdigit())
}

fn normalize_repo_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    trimmed.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_repository() {
        assert!(same_repository(
            "https://git.example.com/Team/Apps.git",
            "https://git.example.com/team/apps/"
        ));
        assert!(!same_repository(
            "https://git.example.com/team/apps",
            "https://git.example.com/team/apps-staging"
        ));
    }

    #[test]
    fn test_tracks_revision() {
        assert!(tracks_revision("HEAD", Some("refs/heads/feature")));
        assert!(tracks_revision("main", Some("refs/heads/main")));
        assert!(tracks_revision("main", None));
        assert!(!tracks_revision("main", Some("refs/heads/feature")));
        assert!(tracks_revision(
            "v1.2.0",
            Some("0123456789abcdef0123456789abcdef01234567")
        ));
    }

    #[test]
    fn test_webhook_payload() {
        let event: SourceChangedEvent =
            serde_json::from_str(r#"{"repoURL": "https://git.example.com/apps.git"}"#).unwrap();
        assert_eq!(event.revision, None);
    }
}
