use tokio::sync::broadcast;

use flex_types::event::FlexEvent;

/// Broadcast bus for `FlexEvent`s. The SSE gateway subscribes one
/// receiver per connected client; publishers (the coordinator, the
/// engine, the HITL service) never block on slow subscribers — a lagged
/// receiver just misses the backlog and keeps reading from where it
/// catches up.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FlexEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlexEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: FlexEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flex_types::event::FlexEventType;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(FlexEvent::new(FlexEventType::Start, "run-1", FlexEvent::empty_payload()));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.run_id, "run-1");
        assert!(matches!(received.event_type, FlexEventType::Start));
    }

    #[tokio::test]
    async fn a_lagged_subscriber_does_not_block_publishers() {
        let bus = EventBus::new();
        let _rx = bus.subscribe();
        for _ in 0..4096 {
            bus.publish(FlexEvent::new(FlexEventType::Log, "run-1", FlexEvent::empty_payload()));
        }
    }
}
