//! Controller notifications
//!
//! Workers publish these on a broadcast channel. Subscribers that fall behind
//! lose the oldest notifications; nothing here is needed for correctness.

use librudder_core::{ApplicationState, SyncStatus};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Notifications emitted by the controller
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A worker moved between reconciliation states
    StateChanged {
        application: String,
        from: ApplicationState,
        to: ApplicationState,
    },

    /// A pass reached a terminal state and was recorded
    PassCompleted {
        application: String,
        pass_id: Uuid,
        status: SyncStatus,
        commit: Option<String>,
        superseded: bool,
    },

    /// Live state diverged from the last synced snapshot
    DriftDetected {
        application: String,
        /// Resources that would change (`Kind/ns/name`)
        resources: Vec<String>,
        /// Whether a self-heal pass was started
        self_heal: bool,
    },

    WorkerStarted {
        application: String,
    },

    WorkerStopped {
        application: String,
    },
}

impl Notification {
    /// Get the notification type as a string (for filtering)
    pub fn notification_type(&self) -> &'static str {
        match self {
            Notification::StateChanged { .. } => "StateChanged",
            Notification::PassCompleted { .. } => "PassCompleted",
            Notification::DriftDetected { .. } => "DriftDetected",
            Notification::WorkerStarted { .. } => "WorkerStarted",
            Notification::WorkerStopped { .. } => "WorkerStopped",
        }
    }

    pub fn application(&self) -> &str {
        match self {
            Notification::StateChanged { application, .. }
            | Notification::PassCompleted { application, .. }
            | Notification::DriftDetected { application, .. }
            | Notification::WorkerStarted { application }
            | Notification::WorkerStopped { application } => application,
        }
    }

    pub fn state_changed(application: &str, from: ApplicationState, to: ApplicationState) -> Self {
        Notification::StateChanged {
            application: application.to_string(),
            from,
            to,
        }
    }

    pub fn worker_started(application: &str) -> Self {
        Notification::WorkerStarted {
            application: application.to_string(),
        }
    }

    pub fn worker_stopped(application: &str) -> Self {
        Notification::WorkerStopped {
            application: application.to_string(),
        }
    }
}

/// Fan-out point for notifications
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to current subscribers; dropped if there are none
    pub fn publish(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let notifier = Notifier::default();
        let mut rx = notifier.subscribe();

        notifier.publish(Notification::state_changed(
            "guestbook",
            ApplicationState::Idle,
            ApplicationState::Polling,
        ));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.notification_type(), "StateChanged");
        assert_eq!(received.application(), "guestbook");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let notifier = Notifier::default();
        notifier.publish(Notification::worker_started("guestbook"));
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(Notification::worker_stopped("guestbook")).unwrap();
        assert_eq!(json["type"], "worker_stopped");
        assert_eq!(json["application"], "guestbook");
    }
}
