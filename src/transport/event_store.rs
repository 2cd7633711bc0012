//! Append-only per-stream event log for SSE replay (§3 "StoredEvent", §4.3
//! "Event store", §8 invariant 3 "Replay law").

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::model::Message;

pub type StreamId = String;
pub type EventId = u64;

/// `{streamId, eventId, message}` (§3).
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub stream_id: StreamId,
    pub event_id: EventId,
    pub message: Message,
}

/// An append-only per-stream event log. Implementations decide retention;
/// the only contract the core relies on is the replay law: a replay after
/// cursor `c` yields exactly the events stored after `c`, in order, with no
/// gaps and no duplicates (§3 invariant 3).
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Append `message` to `stream_id` and return its freshly minted event
    /// id, guaranteed greater than every id previously returned for that
    /// stream.
    async fn store_event(&self, stream_id: &StreamId, message: Message) -> EventId;

    /// Replay every event in the store with `event_id > last_event_id`, in
    /// ascending order, for whichever stream owns `last_event_id`. Returns
    /// the id of that stream together with the events, so the caller can
    /// resume live delivery on the same stream.
    async fn replay_events_after(
        &self,
        last_event_id: EventId,
    ) -> Option<(StreamId, Vec<StoredEvent>)>;
}

/// In-memory [`EventStore`]. Retention is unbounded — the spec explicitly
/// leaves retention policy to the embedder (§9 Open Questions) — so a long
/// running process using this store should periodically drop old streams
/// itself.
#[derive(Default)]
pub struct InMemoryEventStore {
    state: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    next_id: EventId,
    // kept in insertion order per stream; event ids are strictly increasing
    // globally, which makes "who owns last_event_id" a simple linear scan.
    events: HashMap<StreamId, Vec<StoredEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(&self, stream_id: &StreamId, message: Message) -> EventId {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let event_id = state.next_id;
        state
            .events
            .entry(stream_id.clone())
            .or_default()
            .push(StoredEvent {
                stream_id: stream_id.clone(),
                event_id,
                message,
            });
        event_id
    }

    async fn replay_events_after(
        &self,
        last_event_id: EventId,
    ) -> Option<(StreamId, Vec<StoredEvent>)> {
        let state = self.state.lock().unwrap();
        for (stream_id, events) in state.events.iter() {
            if events.iter().any(|e| e.event_id == last_event_id) {
                let tail: Vec<StoredEvent> = events
                    .iter()
                    .filter(|e| e.event_id > last_event_id)
                    .cloned()
                    .collect();
                return Some((stream_id.clone(), tail));
            }
        }
        None
    }
}
