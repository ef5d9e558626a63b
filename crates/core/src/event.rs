//! Domain event system — decoupled observation of what connections and
//! sessions are doing.
//!
//! Events are published when something interesting happens in the system.
//! Other components can subscribe to react without tight coupling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A connection authenticated
    ConnectionOpened {
        connection_id: String,
        owner_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A connection went away
    ConnectionClosed {
        connection_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A focus session was started
    SessionStarted {
        session_id: String,
        owner_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A focus session left the active state
    SessionEnded {
        session_id: String,
        status: String,
        timestamp: DateTime<Utc>,
    },

    /// A user turn was persisted and generation is about to begin
    TurnAccepted {
        session_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A streamed reply was persisted and delivered
    ReplyCompleted {
        session_id: String,
        chars: usize,
        tokens_used: u32,
        timestamp: DateTime<Utc>,
    },

    /// A stream was abandoned because its connection closed
    ReplyDiscarded {
        session_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Generation failed for a turn
    GenerationFailed {
        session_id: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionOpened { .. } => "connection_opened",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::SessionStarted { .. } => "session_started",
            Self::SessionEnded { .. } => "session_ended",
            Self::TurnAccepted { .. } => "turn_accepted",
            Self::ReplyCompleted { .. } => "reply_completed",
            Self::ReplyDiscarded { .. } => "reply_discarded",
            Self::GenerationFailed { .. } => "generation_failed",
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::TurnAccepted {
            session_id: "s1".into(),
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::TurnAccepted { session_id, .. } => assert_eq!(session_id, "s1"),
            other => panic!("Expected TurnAccepted, got {}", other.name()),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::ConnectionClosed {
            connection_id: "c1".into(),
            timestamp: Utc::now(),
        });
    }
}
