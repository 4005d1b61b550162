use tokio::sync::broadcast;

use magsag_types::RuntimeEvent;

/// In-process broadcast bus. Publishing never blocks; listeners that fall
/// behind lose the oldest events, which is acceptable for observation-only
/// consumers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: RuntimeEvent) {
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
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(RuntimeEvent::new("run.started", json!({"run_id": "r1"})));
        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type, "run.started");
        assert_eq!(event.properties["run_id"], json!("r1"));
    }
}
