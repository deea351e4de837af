//! State-change notifications.
//!
//! Interested collaborators (audit log, telemetry, admin channel) call
//! [`EventBus::subscribe`] and receive every [`ResilienceEvent`] published after
//! that point. Publishing never blocks; a receiver that falls behind observes
//! `RecvError::Lagged` and skips the oldest events.

use crate::degradation::DegradationMode;
use crate::resilience::CircuitStateKind;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResilienceEvent {
    CircuitStateChanged {
        dependency: String,
        from: CircuitStateKind,
        to: CircuitStateKind,
    },
    ModeChanged {
        from: DegradationMode,
        to: DegradationMode,
        reason: String,
    },
    MaintenanceChanged {
        enabled: bool,
    },
    ConfigReloaded,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ResilienceEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: ResilienceEvent) {
        // No subscribers is the common case and not an error.
        if self.tx.send(event).is_err() {
            trace!("resilience event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
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

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(ResilienceEvent::ConfigReloaded);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(ResilienceEvent::MaintenanceChanged { enabled: true });
        bus.publish(ResilienceEvent::ConfigReloaded);
        assert_eq!(
            rx.recv().await.unwrap(),
            ResilienceEvent::MaintenanceChanged { enabled: true }
        );
        assert_eq!(rx.recv().await.unwrap(), ResilienceEvent::ConfigReloaded);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let ev = ResilienceEvent::CircuitStateChanged {
            dependency: "gateway".into(),
            from: CircuitStateKind::Closed,
            to: CircuitStateKind::Open,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "circuit_state_changed");
        assert_eq!(json["to"], "open");
    }
}
