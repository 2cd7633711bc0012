//! The streamable HTTP server transport (§4.3): a single axum route
//! speaking POST (batched JSON-RPC), GET (standalone SSE), DELETE (session
//! termination).
//!
//! The SSE encoding (`sse_stream_response`, the `TokioTimer` keep-alive
//! shim) is carried over from the teacher's own `server_side_http.rs`
//! almost unchanged; axum replaces actix-web as the HTTP framework (see
//! DESIGN.md) and the session/routing layer is rebuilt against this
//! crate's generic `Message` model rather than typed client/server
//! message enums.

mod session;

pub use session::{SessionTransport, SseFrame};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body as AxumBody, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::Value;
use sse_stream::{KeepAlive, Sse, SseBody, Timer};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::model::{ErrorData, Message, RequestId};
use crate::protocol::{self, HandlerRegistry, Peer, Plugin, ProtocolOptions, RequestContext};
use crate::transport::common::http_header::{
    DEFAULT_PROTOCOL_VERSION, HEADER_LAST_EVENT_ID, HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID,
    MIME_EVENT_STREAM, MIME_JSON, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::transport::event_store::{EventId, EventStore};
use crate::transport::session_store::{SessionRecord, SessionStore};
use crate::transport::{InboundMessage, Transport};

// Same timer shim the teacher pairs with `sse_stream::SseBody::with_keep_alive`.
pin_project_lite::pin_project! {
    struct TokioTimer {
        #[pin]
        sleep: tokio::time::Sleep,
    }
}

impl std::future::Future for TokioTimer {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.project().sleep.poll(cx)
    }
}

impl Timer for TokioTimer {
    fn from_duration(duration: Duration) -> Self {
        Self {
            sleep: tokio::time::sleep(duration),
        }
    }

    fn reset(self: std::pin::Pin<&mut Self>, when: std::time::Instant) {
        self.project()
            .sleep
            .reset(tokio::time::Instant::from_std(when));
    }
}

fn sse_item(id: Option<EventId>, text: String) -> Result<Sse, std::convert::Infallible> {
    let mut sse = Sse::default().data(text);
    sse.id = id.map(|n| n.to_string());
    Ok(sse)
}

fn sse_stream_response(
    stream: impl futures::Stream<Item = Result<Sse, std::convert::Infallible>>
        + Send
        + Sync
        + 'static,
    keep_alive: Option<Duration>,
) -> Response {
    let body = SseBody::new(stream);
    let body = match keep_alive {
        Some(duration) => body
            .with_keep_alive::<TokioTimer>(KeepAlive::new().interval(duration))
            .boxed(),
        None => body.boxed(),
    };
    let response = http::Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MIME_EVENT_STREAM)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .expect("valid response");
    response.map(AxumBody::new)
}

/// §4.3 knobs: keep-alive cadence, whether sessions are tracked at all, the
/// JSON-vs-SSE response mode, and the DNS-rebinding allow-lists.
#[derive(Clone)]
pub struct StreamableHttpServerConfig {
    pub sse_keep_alive: Option<Duration>,
    pub stateful_mode: bool,
    pub enable_json_response: bool,
    pub allowed_hosts: Option<Vec<String>>,
    pub allowed_origins: Option<Vec<String>>,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            sse_keep_alive: Some(Duration::from_secs(15)),
            stateful_mode: true,
            enable_json_response: false,
            allowed_hosts: None,
            allowed_origins: None,
        }
    }
}

/// Builds a fresh handler registry, plugin set and protocol options for one
/// new session. Invoked once per `initialize`.
pub trait SessionFactory: Send + Sync + 'static {
    fn build(&self) -> (HandlerRegistry, Vec<Arc<dyn Plugin>>, ProtocolOptions);
}

impl<F> SessionFactory for F
where
    F: Fn() -> (HandlerRegistry, Vec<Arc<dyn Plugin>>, ProtocolOptions) + Send + Sync + 'static,
{
    fn build(&self) -> (HandlerRegistry, Vec<Arc<dyn Plugin>>, ProtocolOptions) {
        self()
    }
}

struct SessionEntry {
    peer: Peer,
    transport: Arc<SessionTransport>,
    driver: tokio::task::JoinHandle<()>,
}

/// Owns every live session and the stores behind them; `router()` turns it
/// into the axum `Router` an embedder nests into its own app.
pub struct StreamableHttpServer {
    config: StreamableHttpServerConfig,
    factory: Box<dyn SessionFactory>,
    session_store: Arc<dyn SessionStore>,
    event_store: Option<Arc<dyn EventStore>>,
    sessions: Mutex<HashMap<String, Arc<SessionEntry>>>,
}

const STATELESS_SESSION_KEY: &str = "__stateless__";

impl StreamableHttpServer {
    pub fn new(
        config: StreamableHttpServerConfig,
        factory: impl SessionFactory,
        session_store: Arc<dyn SessionStore>,
        event_store: Option<Arc<dyn EventStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory: Box::new(factory),
            session_store,
            event_store,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", post(handle_post))
            .route("/", get(handle_get))
            .route("/", delete(handle_delete))
            .with_state(self)
    }
}

fn err_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

fn check_dns_rebinding(config: &StreamableHttpServerConfig, headers: &HeaderMap) -> Result<(), Response> {
    if let Some(hosts) = &config.allowed_hosts {
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !hosts.iter().any(|h| h == host) {
            return Err(err_response(StatusCode::FORBIDDEN, "host not allowed"));
        }
    }
    if let Some(origins) = &config.allowed_origins {
        if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
            if !origins.iter().any(|o| o == origin) {
                return Err(err_response(StatusCode::FORBIDDEN, "origin not allowed"));
            }
        }
    }
    Ok(())
}

fn check_protocol_version(headers: &HeaderMap) -> Result<(), Response> {
    let version = headers
        .get(HEADER_PROTOCOL_VERSION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);
    if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
        return Err(err_response(
            StatusCode::BAD_REQUEST,
            format!("unsupported protocol version: {version}"),
        ));
    }
    Ok(())
}

fn check_accept_for_post(headers: &HeaderMap) -> Result<(), Response> {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if accept == "*/*" || (accept.contains(MIME_JSON) && accept.contains(MIME_EVENT_STREAM)) {
        Ok(())
    } else {
        Err(err_response(
            StatusCode::NOT_ACCEPTABLE,
            "Accept must include application/json and text/event-stream",
        ))
    }
}

fn check_content_type(headers: &HeaderMap) -> Result<(), Response> {
    let ct = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if ct.starts_with(MIME_JSON) {
        Ok(())
    } else {
        Err(err_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        ))
    }
}

fn parse_batch(body: &[u8]) -> Result<Vec<Message>, String> {
    let value: Value = serde_json::from_slice(body).map_err(|e| format!("invalid json: {e}"))?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(|e| format!("invalid message: {e}")))
            .collect(),
        single => Ok(vec![serde_json::from_value(single)
            .map_err(|e| format!("invalid message: {e}"))?]),
    }
}

fn message_params(message: &Message) -> Option<&Value> {
    match message {
        Message::Request(r) => r.params.as_ref(),
        Message::Notification(n) => n.params.as_ref(),
        _ => None,
    }
}

fn session_header_value(session_id: &str) -> HeaderValue {
    HeaderValue::from_str(session_id).unwrap_or_else(|_| HeaderValue::from_static(""))
}

async fn handle_post(
    State(server): State<Arc<StreamableHttpServer>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = check_dns_rebinding(&server.config, &headers) {
        return resp;
    }
    if let Err(resp) = check_protocol_version(&headers) {
        return resp;
    }
    if let Err(resp) = check_accept_for_post(&headers) {
        return resp;
    }
    if let Err(resp) = check_content_type(&headers) {
        return resp;
    }

    let messages = match parse_batch(&body) {
        Ok(m) if !m.is_empty() => m,
        Ok(_) => return err_response(StatusCode::BAD_REQUEST, "empty batch"),
        Err(e) => return err_response(StatusCode::BAD_REQUEST, e),
    };

    let header_session_id = headers
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if let Some(header_id) = &header_session_id {
        for message in &messages {
            if let Some(body_sid) = message_params(message)
                .and_then(|p| p.get("sessionId"))
                .and_then(|v| v.as_str())
            {
                if body_sid != header_id {
                    return err_response(StatusCode::BAD_REQUEST, "session id mismatch");
                }
            }
        }
    }

    let initialize_count = messages
        .iter()
        .filter(|m| m.method() == Some("initialize"))
        .count();
    if initialize_count > 1 {
        return err_response(StatusCode::BAD_REQUEST, "at most one initialize per batch");
    }

    if initialize_count == 1 {
        return handle_initialize_batch(server, messages).await;
    }

    if !server.config.stateful_mode {
        return dispatch_stateless(server, messages).await;
    }

    let Some(session_id) = header_session_id else {
        return err_response(StatusCode::BAD_REQUEST, "missing Mcp-Session-Id");
    };
    let entry = {
        let sessions = server.sessions.lock().await;
        sessions.get(&session_id).cloned()
    };
    let Some(entry) = entry else {
        return err_response(StatusCode::NOT_FOUND, "unknown session");
    };
    server.session_store.update_session_activity(&session_id).await;

    dispatch_batch(&server, &entry, messages).await
}

async fn handle_initialize_batch(
    server: Arc<StreamableHttpServer>,
    messages: Vec<Message>,
) -> Response {
    let (handlers, plugins, options) = server.factory.build();

    let init_request = messages
        .iter()
        .find_map(|m| match m {
            Message::Request(r) if r.method == "initialize" => Some(r.clone()),
            _ => None,
        })
        .expect("caller already confirmed exactly one initialize request");

    let Some(handler) = handlers.get("initialize") else {
        return err_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "no initialize handler registered",
        );
    };

    let ctx = RequestContext {
        request_id: init_request.id.clone(),
        method: init_request.method.clone(),
        meta: init_request.meta.clone(),
        session_id: None,
        cancellation: CancellationToken::new(),
        extra: serde_json::Map::new(),
    };
    let result: Result<Value, ErrorData> =
        handler.handle_request(ctx, init_request.params.clone()).await;
    let result = match result {
        Ok(v) => v,
        Err(e) => return err_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now();
    server
        .session_store
        .store_session(SessionRecord {
            session_id: session_id.clone(),
            created_at: now,
            last_activity: now,
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
        })
        .await;

    let transport = SessionTransport::new(session_id.clone(), server.event_store.clone());
    let (peer, driver) = protocol::serve(
        transport.clone() as Arc<dyn Transport>,
        handlers,
        plugins,
        options,
    )
    .await;
    peer.set_session_id(Some(session_id.clone()));

    let entry = Arc::new(SessionEntry {
        peer,
        transport,
        driver,
    });
    server
        .sessions
        .lock()
        .await
        .insert(session_id.clone(), entry.clone());

    let rest: Vec<Message> = messages
        .into_iter()
        .filter(|m| m.method() != Some("initialize"))
        .collect();

    let init_response = serde_json::json!({
        "jsonrpc": "2.0",
        "id": init_request.id,
        "result": result,
    });

    if rest.is_empty() {
        let mut resp = Json(init_response).into_response();
        resp.headers_mut()
            .insert(HEADER_SESSION_ID, session_header_value(&session_id));
        return resp;
    }

    // The rest of the batch is handled the normal way; the initialize
    // result is folded into whichever response shape that path produces.
    dispatch_batch_with_extra(&server, &entry, rest, Some(init_response)).await
}

async fn dispatch_stateless(server: Arc<StreamableHttpServer>, messages: Vec<Message>) -> Response {
    let entry = {
        let mut sessions = server.sessions.lock().await;
        if let Some(entry) = sessions.get(STATELESS_SESSION_KEY) {
            entry.clone()
        } else {
            let (handlers, plugins, options) = server.factory.build();
            let transport =
                SessionTransport::new(STATELESS_SESSION_KEY.to_string(), server.event_store.clone());
            let (peer, driver) = protocol::serve(
                transport.clone() as Arc<dyn Transport>,
                handlers,
                plugins,
                options,
            )
            .await;
            let entry = Arc::new(SessionEntry {
                peer,
                transport,
                driver,
            });
            sessions.insert(STATELESS_SESSION_KEY.to_string(), entry.clone());
            entry
        }
    };
    dispatch_batch(&server, &entry, messages).await
}

async fn dispatch_batch(
    server: &Arc<StreamableHttpServer>,
    entry: &Arc<SessionEntry>,
    messages: Vec<Message>,
) -> Response {
    dispatch_batch_with_extra(server, entry, messages, None).await
}

/// `extra` is a pre-computed response (the `initialize` result) to fold
/// into the batch's reply, for the rare batch that pairs `initialize` with
/// further requests.
async fn dispatch_batch_with_extra(
    server: &Arc<StreamableHttpServer>,
    entry: &Arc<SessionEntry>,
    messages: Vec<Message>,
    extra: Option<Value>,
) -> Response {
    let request_ids: Vec<RequestId> = messages
        .iter()
        .filter_map(|m| match m {
            Message::Request(r) => Some(r.id.clone()),
            _ => None,
        })
        .collect();

    let session_id = entry.transport.session_id_str().to_string();

    if request_ids.is_empty() && extra.is_none() {
        for m in messages {
            let _ = entry.transport.feed(InboundMessage::new(m));
        }
        let mut resp = StatusCode::ACCEPTED.into_response();
        resp.headers_mut()
            .insert(HEADER_SESSION_ID, session_header_value(&session_id));
        return resp;
    }

    let (tx, mut rx) = mpsc::channel::<SseFrame>(64);
    let stream_id = if request_ids.is_empty() {
        None
    } else {
        Some(entry.transport.register_call_stream(request_ids, tx))
    };

    for m in messages {
        let _ = entry.transport.feed(InboundMessage::new(m));
    }

    if server.config.enable_json_response {
        let mut values: Vec<Value> = extra.into_iter().collect();
        if stream_id.is_some() {
            while let Some(frame) = rx.recv().await {
                match frame {
                    SseFrame::Data(_, text) => {
                        if let Ok(v) = serde_json::from_str::<Value>(&text) {
                            values.push(v);
                        }
                    }
                    SseFrame::End => break,
                }
            }
        }
        let body = if values.len() == 1 {
            values.into_iter().next().unwrap()
        } else {
            Value::Array(values)
        };
        let mut resp = Json(body).into_response();
        resp.headers_mut()
            .insert(HEADER_SESSION_ID, session_header_value(&session_id));
        return resp;
    }

    let stream = async_stream::stream! {
        if let Some(extra) = extra {
            let text = serde_json::to_string(&extra).unwrap_or_default();
            yield sse_item(None, text);
        }
        if stream_id.is_some() {
            while let Some(frame) = rx.recv().await {
                match frame {
                    SseFrame::Data(id, text) => yield sse_item(id, text),
                    SseFrame::End => break,
                }
            }
        }
    };
    let mut resp = sse_stream_response(stream, server.config.sse_keep_alive);
    resp.headers_mut()
        .insert(HEADER_SESSION_ID, session_header_value(&session_id));
    resp
}

async fn handle_get(State(server): State<Arc<StreamableHttpServer>>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_dns_rebinding(&server.config, &headers) {
        return resp;
    }
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !accept.contains(MIME_EVENT_STREAM) {
        return err_response(
            StatusCode::NOT_ACCEPTABLE,
            "Accept must include text/event-stream",
        );
    }
    let Some(session_id) = headers
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
    else {
        return err_response(StatusCode::BAD_REQUEST, "missing Mcp-Session-Id");
    };
    let entry = {
        let sessions = server.sessions.lock().await;
        sessions.get(&session_id).cloned()
    };
    let Some(entry) = entry else {
        return err_response(StatusCode::NOT_FOUND, "unknown session");
    };

    let (tx, mut rx) = mpsc::channel::<SseFrame>(64);
    if entry.transport.open_standalone(tx.clone()).is_err() {
        return err_response(StatusCode::CONFLICT, "standalone stream already open");
    }

    if let Some(last_event_id) = headers.get(HEADER_LAST_EVENT_ID).and_then(|v| v.to_str().ok()) {
        if let (Some(store), Ok(cursor)) = (&server.event_store, last_event_id.parse::<u64>()) {
            if let Some((_owner, events)) = store.replay_events_after(cursor).await {
                for event in events {
                    let text = serde_json::to_string(&event.message).unwrap_or_default();
                    let _ = tx.send(SseFrame::Data(Some(event.event_id), text)).await;
                }
            }
        }
    }

    let transport = entry.transport.clone();
    let stream = async_stream::stream! {
        while let Some(frame) = rx.recv().await {
            match frame {
                SseFrame::Data(id, text) => yield sse_item(id, text),
                SseFrame::End => break,
            }
        }
        transport.close_standalone();
    };
    sse_stream_response(stream, server.config.sse_keep_alive)
}

async fn handle_delete(
    State(server): State<Arc<StreamableHttpServer>>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = headers
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
    else {
        return err_response(StatusCode::BAD_REQUEST, "missing Mcp-Session-Id");
    };
    let entry = server.sessions.lock().await.remove(&session_id);
    let Some(entry) = entry else {
        return err_response(StatusCode::NOT_FOUND, "unknown session");
    };
    entry.peer.close().await;
    entry.driver.abort();
    server.session_store.delete_session(&session_id).await;
    StatusCode::OK.into_response()
}
