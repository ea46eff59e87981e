//! Diagnostic Event Bus
//!
//! Process-wide broadcast stream of timestamped diagnostic records. The
//! orchestrator and the dataset store publish; the live observer feed (and
//! any number of other subscribers) drain independently. Publishing never
//! blocks: with no subscribers the event is dropped, and a subscriber that
//! falls behind loses the oldest events (broadcast lag) rather than stalling
//! producers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A single timestamped diagnostic record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub timestamp: DateTime<Utc>,
    /// Originating stage or component ("ingest", "executing", ...).
    pub stage: String,
    pub message: String,
}

impl DiagnosticEvent {
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Many-producer broadcast bus for diagnostic events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DiagnosticEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Emitted synchronously with the state change that
    /// produced it so subscribers see progress live.
    pub fn publish(&self, stage: &str, message: impl Into<String>) {
        let event = DiagnosticEvent::new(stage, message);
        tracing::debug!(stage = %event.stage, "{}", event.message);
        // No subscribers is fine; delivery is best-effort.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_block() {
        let bus = EventBus::new(4);
        for i in 0..100 {
            bus.publish("test", format!("event {}", i));
        }
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish("a", "first");
        bus.publish("b", "second");

        let e1 = rx.recv().await.unwrap();
        let e2 = rx.recv().await.unwrap();
        assert_eq!(e1.stage, "a");
        assert_eq!(e1.message, "first");
        assert_eq!(e2.stage, "b");
        assert!(e1.timestamp <= e2.timestamp);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..10 {
            bus.publish("test", format!("event {}", i));
        }
        // The oldest events were dropped for this receiver.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {:?}", other),
        }
    }
}
