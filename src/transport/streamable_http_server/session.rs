//! Per-session transport state: which outbound channel a message belongs on
//! (§4.3, grounded on the routing logic of a now-superseded typed-model
//! session implementation that this crate's generic `Message` model made
//! moot — see DESIGN.md).
//!
//! A `SessionTransport` is the [`Transport`] a `Protocol` instance is given
//! for exactly one streamable-HTTP session. Outbound frames are routed to
//! one of: the per-POST-batch stream that is still waiting on the request
//! they answer, the standalone GET stream, or dropped if neither is open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::ServiceError;
use crate::model::{Message, RequestId};
use crate::transport::event_store::{EventId, EventStore, StreamId};
use crate::transport::session_store::SessionId;
use crate::transport::{InboundMessage, SendOptions, Transport};

/// One chunk handed to an HTTP handler's SSE stream, or the signal that the
/// stream has nothing further to send and should close.
#[derive(Debug, Clone)]
pub enum SseFrame {
    Data(Option<EventId>, String),
    End,
}

/// Shared by every request id in one POST batch's response stream. Closes
/// the stream once every id it was opened for has produced a final
/// response (§4.3 "Close the stream once every request in the batch has
/// produced a final response").
struct RequestStreamState {
    stream_id: StreamId,
    tx: mpsc::Sender<SseFrame>,
    remaining: AtomicUsize,
}

impl RequestStreamState {
    async fn emit(&self, event_id: Option<EventId>, text: String) {
        let _ = self.tx.send(SseFrame::Data(event_id, text)).await;
    }

    async fn resolve_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.tx.send(SseFrame::End).await;
        }
    }
}

/// The [`Transport`] backing one streamable-HTTP session (§4.3).
pub struct SessionTransport {
    session_id: SessionId,
    event_store: Option<Arc<dyn EventStore>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: AsyncMutex<mpsc::Receiver<InboundMessage>>,
    request_streams: Mutex<HashMap<RequestId, Arc<RequestStreamState>>>,
    standalone: Mutex<Option<(StreamId, mpsc::Sender<SseFrame>)>>,
    closed: AtomicBool,
}

impl SessionTransport {
    pub fn new(session_id: SessionId, event_store: Option<Arc<dyn EventStore>>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        Arc::new(Self {
            session_id,
            event_store,
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            request_streams: Mutex::new(HashMap::new()),
            standalone: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Hand a message parsed off a POST body (or a GET/DELETE side effect)
    /// to the protocol engine's `receive` loop.
    pub fn feed(&self, message: InboundMessage) -> Result<(), ServiceError> {
        self.inbound_tx
            .try_send(message)
            .map_err(|e| ServiceError::TransportSend(e.to_string()))
    }

    /// Claim the response stream for every request id in one POST batch.
    pub fn register_call_stream(
        &self,
        ids: Vec<RequestId>,
        tx: mpsc::Sender<SseFrame>,
    ) -> StreamId {
        let stream_id = uuid::Uuid::new_v4().to_string();
        let state = Arc::new(RequestStreamState {
            stream_id: stream_id.clone(),
            tx,
            remaining: AtomicUsize::new(ids.len()),
        });
        let mut router = self.request_streams.lock().unwrap();
        for id in ids {
            router.insert(id, state.clone());
        }
        stream_id
    }

    /// Open the standalone GET stream. Fails if one is already open (§4.3:
    /// "At most one standalone stream per session; a second opens yield
    /// 409").
    pub fn open_standalone(&self, tx: mpsc::Sender<SseFrame>) -> Result<StreamId, ()> {
        let mut standalone = self.standalone.lock().unwrap();
        if standalone.is_some() {
            return Err(());
        }
        let stream_id = uuid::Uuid::new_v4().to_string();
        *standalone = Some((stream_id.clone(), tx));
        Ok(stream_id)
    }

    pub fn close_standalone(&self) {
        self.standalone.lock().unwrap().take();
    }

    pub fn session_id_str(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl Transport for SessionTransport {
    async fn send(&self, message: Message, options: SendOptions) -> Result<(), ServiceError> {
        let text = serde_json::to_string(&message)
            .map_err(|e| ServiceError::TransportSend(e.to_string()))?;

        if message.is_final_response() {
            if let Some(id) = message.request_id().cloned() {
                let state = self.request_streams.lock().unwrap().remove(&id);
                if let Some(state) = state {
                    let event_id = match &self.event_store {
                        Some(store) => Some(store.store_event(&state.stream_id, message).await),
                        None => None,
                    };
                    state.emit(event_id, text).await;
                    state.resolve_one().await;
                    return Ok(());
                }
            }
        } else if message.is_notification() {
            if let Some(related) = &options.related_request_id {
                let state = self.request_streams.lock().unwrap().get(related).cloned();
                if let Some(state) = state {
                    let event_id = match &self.event_store {
                        Some(store) => Some(store.store_event(&state.stream_id, message).await),
                        None => None,
                    };
                    state.emit(event_id, text).await;
                    return Ok(());
                }
            }
        }

        let standalone = self.standalone.lock().unwrap().clone();
        if let Some((stream_id, tx)) = standalone {
            let event_id = match &self.event_store {
                Some(store) => Some(store.store_event(&stream_id, message).await),
                None => None,
            };
            let _ = tx.send(SseFrame::Data(event_id, text)).await;
            return Ok(());
        }

        tracing::debug!(method = ?message.method(), "no open stream for outbound message; dropped");
        Ok(())
    }

    async fn receive(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.request_streams.lock().unwrap().clear();
        self.standalone.lock().unwrap().take();
    }

    fn session_id(&self) -> Option<String> {
        Some(self.session_id.clone())
    }
}
