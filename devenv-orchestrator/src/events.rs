//! Lifecycle event fan-out.
//!
//! Every persisted state change is published here after the registry write.
//! Subscribers that fall behind lose the oldest events rather than blocking
//! the state machine.

use crate::environment::EnvironmentState;
use chrono::{DateTime, Utc};
use devenv_core::ErrorSummary;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub environment_id: String,
    pub old_state: EnvironmentState,
    pub new_state: EnvironmentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
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

    pub fn publish(&self, event: LifecycleEvent) {
        trace!(
            environment_id = %event.environment_id,
            from = %event.old_state,
            to = %event.new_state,
            "publishing lifecycle event"
        );
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    fn event(n: usize) -> LifecycleEvent {
        LifecycleEvent {
            environment_id: format!("env-{n}"),
            old_state: EnvironmentState::Absent,
            new_state: EnvironmentState::Provisioning,
            error: None,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(event(1));
        bus.publish(event(2));
        assert_eq!(rx.recv().await.unwrap().environment_id, "env-1");
        assert_eq!(rx.recv().await.unwrap().environment_id, "env-2");
    }

    #[tokio::test]
    async fn test_slow_subscriber_loses_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for n in 0..5 {
            bus.publish(event(n));
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap().environment_id, "env-3");
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::default().publish(event(0));
    }
}
