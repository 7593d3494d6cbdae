//! Server-Sent Events model shared by the HTTP carriers
//!
//! Events carry a monotonically increasing decimal id assigned under the
//! store lock, an optional event type, and a text payload. The store is a
//! circular buffer: writing at capacity evicts the oldest event, so a
//! reconnecting client can replay at most the last `capacity` events.
//!
//! Wire rendering follows the `text/event-stream` framing exactly:
//! `id:` line, optional `event:` line, one `data:` line per payload line,
//! blank-line terminator. Heartbeats are SSE comments and invisible to
//! well-behaved parsers.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::SystemTime;

/// One stored event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    /// Decimal rendering of the assigned id.
    pub id: String,
    /// Optional `event:` type.
    pub event_type: Option<String>,
    /// Payload text.
    pub data: String,
    /// Wall-clock storage time.
    pub timestamp: SystemTime,
}

struct StoreInner {
    events: VecDeque<SseEvent>,
    next_id: u64,
}

/// Circular replay store with monotonic ids.
pub struct EventStore {
    inner: Mutex<StoreInner>,
    capacity: usize,
}

impl EventStore {
    /// Create a store holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                events: VecDeque::with_capacity(capacity.min(1024)),
                next_id: 1,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Append an event with an auto-assigned id; returns the stored event.
    ///
    /// At capacity the head is evicted. Ids strictly increase for the
    /// lifetime of the store.
    pub fn store(&self, event_type: Option<&str>, data: &str) -> SseEvent {
        let mut inner = self.inner.lock().expect("event store lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        let event = SseEvent {
            id: id.to_string(),
            event_type: event_type.map(str::to_string),
            data: data.to_string(),
            timestamp: SystemTime::now(),
        };
        if inner.events.len() >= self.capacity {
            inner.events.pop_front();
        }
        inner.events.push_back(event.clone());
        event
    }

    /// Append an event with a caller-supplied id.
    ///
    /// The auto-id counter is advanced past numeric ids so later
    /// auto-assigned ids stay strictly monotonic.
    pub fn store_with_id(&self, id: &str, event_type: Option<&str>, data: &str) -> SseEvent {
        let mut inner = self.inner.lock().expect("event store lock poisoned");
        if let Ok(numeric) = id.parse::<u64>() {
            if numeric >= inner.next_id {
                inner.next_id = numeric + 1;
            }
        }
        let event = SseEvent {
            id: id.to_string(),
            event_type: event_type.map(str::to_string),
            data: data.to_string(),
            timestamp: SystemTime::now(),
        };
        if inner.events.len() >= self.capacity {
            inner.events.pop_front();
        }
        inner.events.push_back(event.clone());
        event
    }

    /// Events to replay for a client resuming after `last_id`.
    ///
    /// `None` replays everything currently stored. When `last_id` matches
    /// a stored event, replay starts strictly after it; an id no longer
    /// (or never) in the store yields nothing, because everything before
    /// the miss has been skipped.
    pub fn replay_after(&self, last_id: Option<&str>) -> Vec<SseEvent> {
        let inner = self.inner.lock().expect("event store lock poisoned");
        match last_id {
            None => inner.events.iter().cloned().collect(),
            Some(marker) => {
                let mut found = false;
                let mut out = Vec::new();
                for event in &inner.events {
                    if found {
                        out.push(event.clone());
                    } else if event.id == marker {
                        found = true;
                    }
                }
                out
            }
        }
    }

    /// Number of events currently stored.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("event store lock poisoned").events.len()
    }

    /// Whether the store holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Render an event as a `text/event-stream` frame.
///
/// Multi-line payloads become one `data:` field per line so the client
/// parser reassembles them with `\n`, matching how they were published.
pub fn render_event(event: &SseEvent) -> String {
    let mut out = String::with_capacity(event.data.len() + 32);
    out.push_str("id: ");
    out.push_str(&event.id);
    out.push('\n');
    if let Some(event_type) = &event.event_type {
        out.push_str("event: ");
        out.push_str(event_type);
        out.push('\n');
    }
    for line in event.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Render the periodic heartbeat comment.
pub fn render_heartbeat(counter: u64) -> String {
    format!(": heartbeat {}\n\n", counter)
}
