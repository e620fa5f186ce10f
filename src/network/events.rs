//! Operator Event Stream
//!
//! Every operator-visible occurrence (joins, refusals, chat, countdowns,
//! bans) becomes a timestamped [`ServerEvent`]. Events are emitted through
//! `tracing` and published on a broadcast channel so front ends can render
//! them without touching engine state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

/// One log line with its UTC timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerEvent {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Human-readable text.
    pub message: String,
}

impl ServerEvent {
    /// Stamp a message with the current time.
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%FT%TZ"), self.message)
    }
}

/// Publisher side of the event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventSink {
    /// Create a sink buffering up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Record an event. Having no subscribers is not an error.
    pub fn emit(&self, message: impl Into<String>) {
        let event = ServerEvent::now(message);
        info!(target: "ghost_server::events", "{}", event.message);
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}
