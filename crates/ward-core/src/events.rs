//! Bounded event queue.
//!
//! Producers (external collaborators, the codec) hold an [`EventPublisher`]
//! and never block: a full queue drops the event with a warning. The
//! listener owns the single [`EventQueue`] consumer and drains it once per
//! loop iteration.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

/// One event as published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Event {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// Cloneable producer handle.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<Event>,
}

impl EventPublisher {
    /// Queue an event. Returns `false` if it was dropped.
    pub fn publish(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(ev)) => {
                warn!(kind = %ev.kind, "event queue full, event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Consumer side of the queue.
pub struct EventQueue {
    rx: mpsc::Receiver<Event>,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` pending events.
    pub fn bounded(capacity: usize) -> (EventPublisher, EventQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (EventPublisher { tx }, EventQueue { rx })
    }

    /// Take every event currently queued, without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(ev) = self.rx.try_recv() {
            events.push(ev);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn drain_returns_in_order() {
        let (publisher, mut queue) = EventQueue::bounded(8);
        assert!(publisher.publish(Event::new("a", json!(1))));
        assert!(publisher.publish(Event::new("b", Value::Null)));

        let events = queue.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "a");
        assert_eq!(events[1].kind, "b");
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn full_queue_drops() {
        let (publisher, mut queue) = EventQueue::bounded(1);
        assert!(publisher.publish(Event::new("a", Value::Null)));
        assert!(!publisher.publish(Event::new("b", Value::Null)));
        assert_eq!(queue.drain().len(), 1);
    }

    #[test]
    fn null_data_is_omitted() {
        let json = serde_json::to_string(&Event::new("ping", Value::Null)).unwrap();
        assert_eq!(json, r#"{"kind":"ping"}"#);
    }
}
