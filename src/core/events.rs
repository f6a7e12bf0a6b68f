//! In-process diagnostic event bus
//!
//! Broadcast fan-out of request/response/error/fault events to any number of
//! observers (GUI panels, REPLs, log sinks). Delivery is best-effort: each
//! subscriber owns a bounded queue, and a slow subscriber loses the oldest
//! events rather than back-pressuring the producer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event category tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Request,
    Response,
    Error,
    FaultInjected,
    Connection,
    Lifecycle,
    Script,
}

/// One diagnostic event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Structured payload; shape depends on `kind`
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }
}

const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast channel for diagnostic events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Never blocks; with no subscribers the event is
    /// dropped silently.
    pub fn publish(&self, kind: EventKind, payload: serde_json::Value) {
        let _ = self.tx.send(Event::new(kind, payload));
    }

    /// Publish a pre-built event.
    pub fn publish_event(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Register an observer.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    /// Current number of attached observers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A subscriber handle. Events arrive in publish order; when the bounded
/// queue overflows, the oldest events are discarded and [`EventStream::dropped`]
/// grows by the number lost.
#[derive(Debug)]
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
    dropped: u64,
}

impl EventStream {
    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll for the next queued event.
    pub fn try_next(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                    continue;
                }
                Err(_) => return None,
            }
        }
    }

    /// Events lost to queue overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
