use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Lifecycle notifications for observer clients on `/ws`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ReceivedAlert,
    FleetReady,
    Teardown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObserverEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// Bounded, lossy broadcast of lifecycle events.
///
/// Subscribers that fall behind skip the oldest messages (the broadcast
/// channel's lag semantics); producers never block. No subscribers is fine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ObserverEvent>,
}

const BUS_CAPACITY: usize = 64;

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, kind: EventKind, data: serde_json::Value) {
        let event = ObserverEvent {
            kind,
            timestamp: Utc::now(),
            data,
        };
        // send only errors when there are no receivers; events are advisory
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.tx.subscribe()
    }
}
