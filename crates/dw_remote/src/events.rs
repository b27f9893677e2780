//! Change notifications published after a host sync

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// What changed in the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    InventoryUpdated {
        host_id: String,
        containers: usize,
        at: DateTime<Utc>,
    },
    FactsUpdated {
        host_id: String,
        at: DateTime<Utc>,
    },
}

impl ChangeEvent {
    #[must_use]
    pub fn host_id(&self) -> &str {
        match self {
            Self::InventoryUpdated { host_id, .. } | Self::FactsUpdated { host_id, .. } => host_id,
        }
    }
}

/// Fire-and-forget event publication
pub trait EventSink: Send + Sync {
    fn publish(&self, event: ChangeEvent);
}

/// Fans events out to any number of subscribers; publishing never blocks.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ChangeEvent>,
}

impl BroadcastSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: ChangeEvent) {
        trace!(host_id = %event.host_id(), ?event, "Publishing change event");
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_without_subscribers() {
        let sink = BroadcastSink::default();
        sink.publish(ChangeEvent::FactsUpdated {
            host_id: "web-1".to_string(),
            at: Utc::now(),
        });
    }

    #[test]
    fn test_broadcast_delivers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.publish(ChangeEvent::InventoryUpdated {
            host_id: "web-1".to_string(),
            containers: 3,
            at: Utc::now(),
        });
        let event = rx.try_recv().unwrap();
        assert_eq!(event.host_id(), "web-1");
        assert!(matches!(
            event,
            ChangeEvent::InventoryUpdated { containers: 3, .. }
        ));
    }

    #[test]
    fn test_event_json_shape() {
        let event = ChangeEvent::FactsUpdated {
            host_id: "web-1".to_string(),
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "facts_updated");
        assert_eq!(json["host_id"], "web-1");
    }
}
