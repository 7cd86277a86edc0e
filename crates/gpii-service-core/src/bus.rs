//! In-process named-event dispatch.
//!
//! The bus is the only object shared between components: the service shell
//! publishes lifecycle events into it, the supervisor consumes them, and
//! inbound child messages are republished on it for whoever cares. Wiring
//! happens once at startup; at runtime the bus is read-mostly fan-out.

use serde_json::Value;
use tokio::sync::broadcast;

/// Default capacity of the broadcast queue; publishes are never awaited, so
/// slow subscribers see lag errors rather than backpressure.
const CAPACITY: usize = 256;

/// A named event with an arbitrary JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Dotted event name, e.g. `service.start` or `gpii.message.hello`.
    pub name: String,
    /// Event payload; `Null` when the name alone carries the meaning.
    pub payload: Value,
}

impl Event {
    /// Build an event.
    #[must_use]
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Whether the event name equals `pattern` or sits under it as a dotted
    /// prefix (`service` matches `service.start` but not `servicex`).
    #[must_use]
    pub fn matches(&self, pattern: &str) -> bool {
        self.name == pattern
            || (self.name.len() > pattern.len()
                && self.name.starts_with(pattern)
                && self.name.as_bytes()[pattern.len()] == b'.')
    }
}

/// Broadcast event bus.
///
/// Cloning is cheap and shares the underlying channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Publishing with no subscribers is not an error; the event is simply
    /// dropped.
    pub fn publish(&self, name: impl Into<String>, payload: Value) {
        let _ = self.tx.send(Event::new(name, payload));
    }

    /// Subscribe to every event published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
