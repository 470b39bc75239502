//! Broadcast event bus for distributing [`EngineEvent`] to subscribers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op; the durable audit trail is written separately by the runner.

use strand_types::event::EngineEvent;
use tokio::sync::broadcast;

/// Multi-consumer event bus for engine events.
///
/// Cloning the bus clones the sender, allowing multiple producers.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; silently dropped when nobody listens.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::RunStarted {
            run_id: Uuid::now_v7(),
            workflow_name: "wf".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::RunStarted { .. }));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(16);
        bus.publish(EngineEvent::BreakerStateChanged {
            name: "llm".to_string(),
            state: "open".to_string(),
        });
        // Nothing to assert beyond "did not panic"; a later subscriber only
        // sees events published after subscription.
        let mut rx = bus.subscribe();
        assert!(rx.try_recv().is_err());
    }
}
