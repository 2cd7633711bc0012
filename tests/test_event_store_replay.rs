//! The replay law (§3 invariant 3, §8): resuming after a cursor yields
//! exactly the events stored after it, in order, with no gaps or duplicates.
//! Exercised through `SessionTransport`'s standalone stream rather than the
//! bare store, so the event ids under test are the ones a real GET replay
//! would actually see.

use std::sync::Arc;

use mcp_protocol_core::transport::event_store::{EventStore, InMemoryEventStore};
use mcp_protocol_core::transport::streamable_http_server::{SessionTransport, SseFrame};
use mcp_protocol_core::transport::{SendOptions, Transport};
use tokio::sync::mpsc;

#[tokio::test]
async fn replay_after_a_cursor_returns_exactly_the_later_events_in_order() {
    let event_store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
    let session = SessionTransport::new("session-1".to_string(), Some(event_store.clone()));

    let (tx, mut rx) = mpsc::channel(16);
    let stream_id = session
        .open_standalone(tx)
        .expect("first standalone stream should succeed");

    for n in 0..4u64 {
        session
            .send(
                mcp_protocol_core::model::Message::notification(
                    "notifications/progress",
                    Some(serde_json::json!({"n": n})),
                ),
                SendOptions::default(),
            )
            .await
            .unwrap();
    }

    let mut seen_ids = Vec::new();
    for _ in 0..4 {
        match rx.recv().await.unwrap() {
            SseFrame::Data(Some(id), _text) => seen_ids.push(id),
            other => panic!("expected a data frame with an event id, got {other:?}"),
        }
    }
    assert_eq!(seen_ids.len(), 4);
    assert!(seen_ids.windows(2).all(|w| w[0] < w[1]));

    let cursor = seen_ids[1];
    let (owner, tail) = event_store.replay_events_after(cursor).await.unwrap();
    assert_eq!(owner, stream_id);
    assert_eq!(tail.len(), 2);
    assert!(tail.iter().all(|e| e.event_id > cursor));
    assert!(tail[0].event_id < tail[1].event_id);

    assert!(event_store.replay_events_after(seen_ids[3]).await.unwrap().1.is_empty());
}
