//! Event emission system.
//!
//! Events are pushed from the daemon to UI subscribers via JSON-RPC
//! notifications. Each subscriber has an independent buffer with
//! backpressure at 1000 events. This is the application-layer bridge
//! from the collaborator-trait callbacks (`EventListener`,
//! `MediatorListener`, `PeerStateListener`, `ResolverReceiver` in
//! `mimir-types::traits`) to a transport-agnostic notification the UI
//! can subscribe to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// An event emitted by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event type name (e.g. "ClientConnected", "ChatMessage").
    pub event_type: String,
    /// Unix timestamp.
    pub timestamp: u64,
    /// Type-specific payload.
    pub payload: serde_json::Value,
}

/// Filter for event subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFilter {
    /// Category filter: "session", "group", "directory", "system".
    pub categories: Option<Vec<String>>,
    /// Filter to specific chat ids (as decimal strings).
    pub chat_ids: Option<Vec<String>>,
}

/// A subscription handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

/// Event bus for broadcasting events to subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: Event) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Get the current sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl EventFilter {
    /// Check if an event matches this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref categories) = self.categories {
            let event_category = categorize_event(&event.event_type);
            if !categories.contains(&event_category) {
                return false;
            }
        }

        if let Some(ref chat_ids) = self.chat_ids {
            if let Some(cid) = event.payload.get("chat_id").and_then(|v| v.as_u64()) {
                if !chat_ids.iter().any(|id| id == &cid.to_string()) {
                    return false;
                }
            }
        }

        true
    }
}

/// Categorize an event type into a category.
fn categorize_event(event_type: &str) -> String {
    match event_type {
        "ClientConnected" | "ConnectionClosed" | "MessageDelivered" | "MessageReceived" => {
            "session".to_string()
        }
        "ChatMessage" | "SystemEvent" | "InviteReceived" | "ChatReconnected" | "MediatorDisconnected" => {
            "group".to_string()
        }
        "TrackerAnnounced" | "TrackerError" | "PeerStateChanged" => "directory".to_string(),
        _ => "system".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bus_emit_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(Event {
            event_type: "DaemonStarted".to_string(),
            timestamp: 1000,
            payload: serde_json::json!({"version": "0.1.0"}),
        });

        let event = rx.try_recv().expect("receive event");
        assert_eq!(event.event_type, "DaemonStarted");
        assert_eq!(bus.sequence(), 1);
    }

    #[test]
    fn test_event_filter_categories() {
        let filter = EventFilter {
            categories: Some(vec!["session".to_string()]),
            chat_ids: None,
        };

        let session_event = Event {
            event_type: "ClientConnected".to_string(),
            timestamp: 1000,
            payload: serde_json::json!({}),
        };
        assert!(filter.matches(&session_event));

        let group_event = Event {
            event_type: "ChatMessage".to_string(),
            timestamp: 1000,
            payload: serde_json::json!({}),
        };
        assert!(!filter.matches(&group_event));
    }

    #[test]
    fn test_event_filter_chat_ids() {
        let filter = EventFilter {
            categories: None,
            chat_ids: Some(vec!["77".to_string()]),
        };
        let matching = Event {
            event_type: "ChatMessage".to_string(),
            timestamp: 1000,
            payload: serde_json::json!({"chat_id": 77}),
        };
        let other = Event {
            event_type: "ChatMessage".to_string(),
            timestamp: 1000,
            payload: serde_json::json!({"chat_id": 78}),
        };
        assert!(filter.matches(&matching));
        assert!(!filter.matches(&other));
    }

    #[test]
    fn test_categorize_event() {
        assert_eq!(categorize_event("ClientConnected"), "session");
        assert_eq!(categorize_event("ChatMessage"), "group");
        assert_eq!(categorize_event("TrackerAnnounced"), "directory");
        assert_eq!(categorize_event("DaemonStarted"), "system");
    }
}
