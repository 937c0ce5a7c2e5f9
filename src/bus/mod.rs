//! Event bus for inter-component communication
//!
//! Uses tokio::sync::broadcast for pub/sub pattern.
//! Sources publish change notifications, the arbitrator publishes
//! transitions, discovery publishes devices.

mod events;

pub use events::*;

use std::sync::Arc;
use tokio::sync::broadcast;

/// Event bus handle for publishing and subscribing
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: BusEvent) {
        tracing::trace!(event = event.event_type(), "bus publish");
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    /// Default capacity (256 events)
    fn default() -> Self {
        Self::new(256)
    }
}

/// Shared event bus wrapped in Arc for thread-safe sharing
pub type SharedBus = Arc<EventBus>;

/// Create a new shared event bus
pub fn create_bus() -> SharedBus {
    Arc::new(EventBus::default())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pubsub() {
        let bus = create_bus();
        let mut rx = bus.subscribe();

        bus.publish(BusEvent::SourceChanged {
            source: SourceKind::Remote,
        });

        match rx.recv().await.unwrap() {
            BusEvent::SourceChanged { source } => assert_eq!(source, SourceKind::Remote),
            _ => panic!("Wrong event type"),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = create_bus();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(BusEvent::ShuttingDown { reason: None });

        assert!(matches!(rx1.recv().await.unwrap(), BusEvent::ShuttingDown { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), BusEvent::ShuttingDown { .. }));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = create_bus();
        bus.publish(BusEvent::DiscoveryFinished { device_count: 0 });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
