//! Per-attempt action events
//!
//! Every attempt is logged through `tracing` and published on a broadcast
//! channel. Subscribers that fall behind lose the oldest events; the
//! operation's action log stays authoritative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{ActionKind, ActionResult, ResourceKey, WavePhase};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEvent {
    pub operation_id: Uuid,
    pub application: String,
    pub action: ActionKind,
    pub resource: ResourceKey,
    pub wave: i32,
    pub phase: WavePhase,
    pub attempt: u32,
    pub outcome: ActionResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ActionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ActionEvent) {
        match event.outcome {
            ActionResult::Failed => tracing::warn!(
                app = %event.application,
                resource = %event.resource,
                action = %event.action,
                wave = event.wave,
                attempt = event.attempt,
                detail = event.message.as_deref().unwrap_or_default(),
                "action failed"
            ),
            ActionResult::Retrying => tracing::warn!(
                app = %event.application,
                resource = %event.resource,
                action = %event.action,
                wave = event.wave,
                attempt = event.attempt,
                detail = event.message.as_deref().unwrap_or_default(),
                "action attempt failed, retrying"
            ),
            outcome => tracing::info!(
                app = %event.application,
                resource = %event.resource,
                action = %event.action,
                wave = event.wave,
                attempt = event.attempt,
                outcome = %outcome,
                "action attempt"
            ),
        }
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(ActionEvent {
            operation_id: Uuid::new_v4(),
            application: "guestbook".into(),
            action: ActionKind::Create,
            resource: ResourceKey::new("", "ConfigMap", "shop", "settings"),
            wave: 0,
            phase: WavePhase::Apply,
            attempt: 1,
            outcome: ActionResult::Succeeded,
            message: None,
            at: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.attempt, 1);
        assert_eq!(event.outcome, ActionResult::Succeeded);
    }
}
