//! The protocol engine (§4.2): request/response correlation, cancellation,
//! plugin pipeline orchestration, error interception. This is the part of
//! the stack SPEC_FULL.md weights heaviest, and the only part that mutates
//! shared state outside of a transport or a store — every mutation below
//! happens inside a synchronous `lock()`, never held across an `.await`
//! (§5 "Scheduling model").

pub mod handler;
pub mod outstanding;
pub mod plugin;
pub mod progress;
pub mod timeout;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ServiceError;
use crate::model::{
    ErrorCode, ErrorData, JsonRpcVersion2_0, Message, Meta, Notification, ProgressToken, Request,
    RequestId,
};
use crate::transport::{InboundMessage, SendOptions, Transport};

pub use handler::{Handler, HandlerRegistry, NotificationContext, RequestContext};
pub use outstanding::OutstandingRequest;
pub use plugin::{
    ErrorInterceptor, ErrorInterceptorContext, ErrorKind, ErrorOverride, Plugin, PluginHost,
};
pub use progress::{ProgressManager, ProgressSubscriber};
pub use timeout::TimeoutConfig;

/// Options a caller supplies for a single outbound request (§4.2 "Outbound
/// request").
#[derive(Default)]
pub struct RequestOptions {
    pub timeout: TimeoutConfig,
    pub on_progress: Option<ProgressSubscriber>,
}

/// Options governing a whole `Protocol` instance (§4.2, §4.5 capability
/// enforcement).
pub struct ProtocolOptions {
    pub enforce_strict_capabilities: bool,
    pub debounced_notification_methods: HashSet<String>,
    pub error_interceptor: Option<ErrorInterceptor>,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            enforce_strict_capabilities: false,
            debounced_notification_methods: HashSet::new(),
            error_interceptor: None,
        }
    }
}

struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle_request(
        &self,
        _ctx: RequestContext,
        _params: Option<Value>,
    ) -> Result<Value, ErrorData> {
        Ok(serde_json::json!({}))
    }
}

type CapabilityChecker = dyn Fn(&str) -> bool + Send + Sync;

/// The engine's shared state. Always accessed through `Arc<Inner>`; `self_weak`
/// lets any `&self` method mint a fresh `Arc<Inner>` when it needs one with a
/// `'static` lifetime (spawning a task, building a `PluginHost` trait
/// object) without requiring an `Arc`-flavored `self` receiver.
struct Inner {
    transport: Arc<dyn Transport>,
    handlers: HandlerRegistry,
    plugins: Vec<Arc<dyn Plugin>>,
    outstanding: Mutex<HashMap<RequestId, OutstandingRequest>>,
    next_id: AtomicU64,
    progress: ProgressManager,
    error_interceptor: Option<ErrorInterceptor>,
    session_id: Mutex<Option<String>>,
    debounce_scheduled: Mutex<HashSet<String>>,
    debounced_methods: HashSet<String>,
    enforce_strict_capabilities: bool,
    capability_checker: Mutex<Option<Box<CapabilityChecker>>>,
    side_channels: Mutex<HashMap<RequestId, oneshot::Sender<Message>>>,
    closed: AtomicBool,
    self_weak: Weak<Inner>,
}

#[async_trait]
impl PluginHost for Inner {
    fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap().clone()
    }

    async fn send_raw(&self, message: Message) -> Result<(), ServiceError> {
        self.transport.send(message, SendOptions::default()).await
    }

    fn register_handler(&self, method: &str, handler: Arc<dyn Handler>) {
        self.handlers.register(method.to_string(), handler);
    }

    fn unregister_handler(&self, method: &str) {
        self.handlers.unregister(method);
    }

    fn register_side_channel(&self, id: RequestId, resolver: oneshot::Sender<Message>) {
        self.side_channels.lock().unwrap().insert(id, resolver);
    }

    fn progress_manager(&self) -> &ProgressManager {
        &self.progress
    }

    fn report_error(&self, error: ServiceError) {
        tracing::error!(%error, "protocol error reported with no waiting caller");
    }

    async fn dispatch_request(
        &self,
        ctx: RequestContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ErrorData> {
        let Some(handler) = self.handlers.get(method) else {
            return Err(ErrorData::method_not_found(method));
        };
        handler.handle_request(ctx, params).await
    }
}

impl Inner {
    fn arc(&self) -> Arc<Inner> {
        self.self_weak
            .upgrade()
            .expect("Inner must outlive any &self borrow of it")
    }

    fn host(&self) -> Arc<dyn PluginHost> {
        self.arc() as Arc<dyn PluginHost>
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap().clone()
    }

    async fn apply_error_interceptor(
        &self,
        kind: ErrorKind,
        method: Option<String>,
        request_id: Option<RequestId>,
        error: ErrorData,
    ) -> ErrorData {
        let Some(interceptor) = &self.error_interceptor else {
            return error;
        };
        let ctx = ErrorInterceptorContext {
            kind,
            method,
            request_id,
            error_code: error.code.0,
        };
        let mut error = error;
        if let Some(over) = interceptor(ctx, &error) {
            if let Some(message) = over.message {
                error.message = message;
            }
            if let Some(data) = over.data {
                error.data = Some(data);
            }
            if kind == ErrorKind::Application {
                if let Some(code) = over.code {
                    error.code = ErrorCode(code);
                }
            }
        }
        error
    }

    async fn send_result(&self, id: RequestId, result: Value) {
        let related = Some(id.clone());
        if let Err(e) = self
            .transport
            .send(
                Message::result(id, result),
                SendOptions {
                    related_request_id: related,
                    ..Default::default()
                },
            )
            .await
        {
            tracing::warn!(%e, "failed to send result");
        }
    }

    async fn send_error(&self, id: RequestId, error: ErrorData) {
        let related = Some(id.clone());
        if let Err(e) = self
            .transport
            .send(
                Message::error(id, error),
                SendOptions {
                    related_request_id: related,
                    ..Default::default()
                },
            )
            .await
        {
            tracing::warn!(%e, "failed to send error response");
        }
    }

    async fn dispatch_inbound(&self, inbound: InboundMessage) {
        let message = inbound.message;
        for plugin in &self.plugins {
            if plugin.should_route_message(&message) {
                plugin.route_message(message, self.host()).await;
                return;
            }
        }
        match message {
            Message::Request(request) => self.handle_inbound_request(request).await,
            Message::Notification(notification) => {
                self.handle_inbound_notification(notification).await
            }
            response @ (Message::Response(_) | Message::Error(_)) => {
                self.handle_inbound_response(response).await
            }
        }
    }

    async fn handle_inbound_request(&self, request: Request) {
        let Request {
            id,
            method,
            params,
            meta,
            ..
        } = request;

        let Some(handler) = self.handlers.get(&method) else {
            let error = ErrorData::method_not_found(&method);
            let error = self
                .apply_error_interceptor(ErrorKind::Protocol, Some(method), Some(id.clone()), error)
                .await;
            self.send_error(id, error).await;
            return;
        };

        let cancellation = self.handlers.begin(id.clone());
        let mut extra = serde_json::Map::new();
        for plugin in &self.plugins {
            plugin.on_build_handler_context(&mut extra).await;
        }
        let ctx = RequestContext {
            request_id: id.clone(),
            method: method.clone(),
            meta: meta.clone(),
            session_id: self.session_id(),
            cancellation: cancellation.clone(),
            extra,
        };

        let mut message = Message::Request(Request {
            jsonrpc: JsonRpcVersion2_0,
            id: id.clone(),
            method: method.clone(),
            params,
            meta,
        });
        for plugin in &self.plugins {
            message = plugin.on_request(&ctx, message).await;
        }
        let params = match message {
            Message::Request(r) => r.params,
            _ => None,
        };

        let outcome = tokio::select! {
            result = handler.handle_request(ctx.clone(), params) => Some(result),
            _ = cancellation.cancelled() => None,
        };
        self.handlers.end(&id);

        let Some(outcome) = outcome else {
            // cancelled: the result, if any, is discarded (§4.2, §4.5).
            return;
        };

        match outcome {
            Ok(result) => {
                let mut result = result;
                for plugin in &self.plugins {
                    result = plugin.on_request_result(&ctx, result).await;
                }
                self.send_result(id, result).await;
            }
            Err(error) => {
                let mut error = error;
                for plugin in &self.plugins {
                    error = plugin.on_request_error(&ctx, error).await;
                }
                let kind = if error.is_protocol_error() {
                    ErrorKind::Protocol
                } else {
                    ErrorKind::Application
                };
                let error = self
                    .apply_error_interceptor(kind, Some(method), Some(id.clone()), error)
                    .await;
                self.send_error(id, error).await;
            }
        }
    }

    async fn handle_inbound_notification(&self, notification: Notification) {
        if notification.method == "notifications/cancelled" {
            if let Some(id) = notification
                .params
                .as_ref()
                .and_then(|p| p.get("requestId"))
                .and_then(|v| serde_json::from_value::<RequestId>(v.clone()).ok())
            {
                self.handlers.abort(&id);
            }
            return;
        }

        if notification.method == "notifications/progress" {
            let Some(params) = notification.params else {
                return;
            };
            let Some(token) = params
                .get("progressToken")
                .and_then(|v| serde_json::from_value::<ProgressToken>(v.clone()).ok())
            else {
                return;
            };
            if !self.progress.deliver(&token, params.clone()) {
                tracing::warn!(token = %token, "progress notification for unknown token");
            }
            if let Some(req) = self.outstanding.lock().unwrap().get(&token) {
                if let Some(timeout) = &req.timeout {
                    timeout.reset_on_progress();
                }
            }
            return;
        }

        let Some(handler) = self.handlers.get(&notification.method) else {
            return;
        };
        let mut params = notification.params;
        for plugin in &self.plugins {
            params = plugin.on_notification(&notification.method, params).await;
        }
        let ctx = NotificationContext {
            method: notification.method,
            meta: notification.meta,
            session_id: self.session_id(),
        };
        handler.handle_notification(ctx, params).await;
    }

    async fn handle_inbound_response(&self, message: Message) {
        for plugin in &self.plugins {
            plugin.on_response(&message).await;
        }
        let Some(id) = message.request_id().cloned() else {
            return;
        };

        if let Some(resolver) = self.side_channels.lock().unwrap().remove(&id) {
            let _ = resolver.send(message);
            return;
        }

        let outcome = match message {
            Message::Response(r) => Ok(r.result),
            Message::Error(e) => Err(e.error),
            _ => return,
        };

        let settled = self.outstanding.lock().unwrap().remove(&id);
        if let Some(mut req) = settled {
            let token = req.progress_token.clone();
            req.settle(outcome);
            if let Some(token) = token {
                self.progress.remove(&token);
            }
        }
    }

    async fn fire_timeout(&self, id: RequestId) {
        let settled = self.outstanding.lock().unwrap().remove(&id);
        let Some(mut req) = settled else {
            return;
        };
        req.timeout = None;
        let token = req.progress_token.clone();
        req.mark_timed_out();
        req.settle(Err(ErrorData::request_timeout("Request timed out")));
        if let Some(token) = token {
            self.progress.remove(&token);
        }
        let _ = self
            .transport
            .send(
                Message::notification(
                    "notifications/cancelled",
                    Some(serde_json::json!({
                        "requestId": id,
                        "reason": "Request timed out",
                    })),
                ),
                SendOptions::default(),
            )
            .await;
    }

    async fn send_request(
        &self,
        method: String,
        params: Option<Value>,
        opts: RequestOptions,
    ) -> Result<Value, ServiceError> {
        if self.enforce_strict_capabilities {
            let supported = self
                .capability_checker
                .lock()
                .unwrap()
                .as_ref()
                .map(|checker| checker(&method))
                .unwrap_or(true);
            if !supported {
                return Err(ServiceError::UnsupportedCapability(method));
            }
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut meta = Meta::default();
        let progress_token = opts.on_progress.map(|subscriber| {
            self.progress.register(id.clone(), subscriber);
            id.clone()
        });
        meta.progress_token = progress_token.clone();

        let request = Request {
            jsonrpc: JsonRpcVersion2_0,
            id: id.clone(),
            method,
            params,
            meta,
        };
        let mut message = Message::Request(request);
        for plugin in &self.plugins {
            message = plugin.on_before_send_request(message).await;
        }

        for plugin in &self.plugins {
            if plugin.should_route_message(&message) {
                let (tx, rx) = oneshot::channel();
                self.side_channels.lock().unwrap().insert(id.clone(), tx);
                plugin.route_message(message, self.host()).await;
                return match rx.await {
                    Ok(Message::Response(r)) => Ok(r.result),
                    Ok(Message::Error(e)) => Err(ServiceError::PeerError(e.error)),
                    Ok(_) => Err(ServiceError::ConnectionClosed(
                        "unexpected routed reply shape".into(),
                    )),
                    Err(_) => Err(ServiceError::ConnectionClosed(
                        "routed request dropped without a reply".into(),
                    )),
                };
            }
        }

        let (tx, rx) = oneshot::channel();
        let id_for_timeout = id.clone();
        let weak_self = self.self_weak.clone();
        let timeout = timeout::TimeoutHandle::spawn(opts.timeout, move || {
            if let Some(inner) = weak_self.upgrade() {
                tokio::spawn(async move {
                    inner.fire_timeout(id_for_timeout).await;
                });
            }
        });
        let timed_out = Arc::new(AtomicBool::new(false));
        self.outstanding.lock().unwrap().insert(
            id.clone(),
            OutstandingRequest {
                resolver: Some(tx),
                progress_token,
                timeout: Some(timeout),
                timed_out: timed_out.clone(),
            },
        );

        if let Err(e) = self.transport.send(message, SendOptions::default()).await {
            if let Some(mut req) = self.outstanding.lock().unwrap().remove(&id) {
                req.settle(Err(ErrorData::connection_closed(e.to_string())));
            }
            return Err(e);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            // distinguish our own soft timeout from a peer that happens to
            // reply with the same wire error code for its own reasons.
            Ok(Err(_)) if timed_out.load(Ordering::SeqCst) => Err(ServiceError::Timeout),
            Ok(Err(error)) => Err(ServiceError::PeerError(error)),
            Err(_) => Err(ServiceError::ConnectionClosed(
                "connection closed while request was outstanding".into(),
            )),
        }
    }

    async fn send_notification(
        &self,
        method: String,
        params: Option<Value>,
        related_request_id: Option<RequestId>,
    ) -> Result<(), ServiceError> {
        let debounced = self.debounced_methods.contains(&method)
            && params.is_none()
            && related_request_id.is_none();

        if debounced {
            let mut scheduled = self.debounce_scheduled.lock().unwrap();
            if scheduled.contains(&method) {
                return Ok(());
            }
            scheduled.insert(method.clone());
            drop(scheduled);

            let inner = self.arc();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                inner.debounce_scheduled.lock().unwrap().remove(&method);
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = inner.emit_notification(method, None, None).await {
                    inner.report_error(ServiceError::TransportSend(e.to_string()));
                }
            });
            return Ok(());
        }

        self.emit_notification(method, params, related_request_id).await
    }

    async fn emit_notification(
        &self,
        method: String,
        params: Option<Value>,
        related_request_id: Option<RequestId>,
    ) -> Result<(), ServiceError> {
        let notification = Notification {
            jsonrpc: JsonRpcVersion2_0,
            method,
            params,
            meta: Meta::default(),
        };
        let mut message = Message::Notification(notification);
        for plugin in &self.plugins {
            message = plugin.on_before_send_notification(message).await;
        }
        for plugin in &self.plugins {
            if plugin.should_route_message(&message) {
                plugin.route_message(message, self.host()).await;
                return Ok(());
            }
        }
        self.transport
            .send(
                message,
                SendOptions {
                    related_request_id,
                    ..Default::default()
                },
            )
            .await
    }

    fn close_all_outstanding(&self) {
        let mut outstanding = self.outstanding.lock().unwrap();
        for (_, mut req) in outstanding.drain() {
            req.settle(Err(ErrorData::connection_closed("connection closed")));
        }
    }
}

/// A cloneable handle to a live protocol session, used to send outbound
/// requests/notifications and to register handlers at runtime. This is the
/// embedder-facing counterpart to [`PluginHost`], which plugins see instead.
#[derive(Clone)]
pub struct Peer(Arc<Inner>);

impl Peer {
    pub async fn request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        opts: RequestOptions,
    ) -> Result<Value, ServiceError> {
        self.0.send_request(method.into(), params, opts).await
    }

    pub async fn notify(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<(), ServiceError> {
        self.0.send_notification(method.into(), params, None).await
    }

    /// A notification bound to an inbound request's SSE stream (§4.1
    /// `relatedRequestId`, §5 ordering guarantees).
    pub async fn notify_related(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        related_request_id: RequestId,
    ) -> Result<(), ServiceError> {
        self.0
            .send_notification(method.into(), params, Some(related_request_id))
            .await
    }

    pub fn session_id(&self) -> Option<String> {
        self.0.session_id()
    }

    pub fn set_session_id(&self, id: Option<String>) {
        *self.0.session_id.lock().unwrap() = id;
    }

    pub fn set_capability_checker(&self, checker: impl Fn(&str) -> bool + Send + Sync + 'static) {
        *self.0.capability_checker.lock().unwrap() = Some(Box::new(checker));
    }

    pub fn register_handler(&self, method: impl Into<String>, handler: Arc<dyn Handler>) {
        self.0.handlers.register(method.into(), handler);
    }

    pub fn unregister_handler(&self, method: &str) {
        self.0.handlers.unregister(method);
    }

    pub fn progress_manager(&self) -> &ProgressManager {
        &self.0.progress
    }

    /// Emit `notifications/cancelled` for `id` and abort the matching
    /// in-flight inbound request if this side owns one (§5 "Cancellation").
    pub async fn cancel(&self, id: RequestId, reason: impl Into<String>) {
        self.0.handlers.abort(&id);
        let _ = self
            .0
            .emit_notification(
                "notifications/cancelled".to_string(),
                Some(serde_json::json!({ "requestId": id, "reason": reason.into() })),
                None,
            )
            .await;
    }

    pub async fn close(&self) {
        self.0.transport.close().await;
    }
}

/// The wiring step: install plugins, start the default handlers, and spawn
/// the inbound-dispatch loop (§5 "inbound messages are dispatched in arrival
/// order" — arrival order is preserved by reading `Transport::receive` in a
/// single loop; each inbound message's *handling* is then spawned onto its
/// own task so concurrent handlers don't block each other, matching the
/// suspension points enumerated in §5).
pub async fn serve(
    transport: Arc<dyn Transport>,
    handlers: HandlerRegistry,
    plugins: Vec<Arc<dyn Plugin>>,
    options: ProtocolOptions,
) -> (Peer, tokio::task::JoinHandle<()>) {
    if handlers.get("ping").is_none() {
        handlers.register("ping", Arc::new(PingHandler));
    }

    let session_id = transport.session_id();
    let inner = Arc::new_cyclic(|weak| Inner {
        transport,
        handlers,
        plugins: plugin::sort_by_priority(plugins),
        outstanding: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        progress: ProgressManager::new(),
        error_interceptor: options.error_interceptor,
        session_id: Mutex::new(session_id),
        debounce_scheduled: Mutex::new(HashSet::new()),
        debounced_methods: options.debounced_notification_methods,
        enforce_strict_capabilities: options.enforce_strict_capabilities,
        capability_checker: Mutex::new(None),
        side_channels: Mutex::new(HashMap::new()),
        closed: AtomicBool::new(false),
        self_weak: weak.clone(),
    });

    let host = inner.host();
    for plugin in &inner.plugins {
        plugin.install(host.clone()).await;
    }
    for plugin in &inner.plugins {
        plugin.on_connect().await;
    }

    let peer = Peer(inner.clone());
    let loop_inner = inner;
    let handle = tokio::spawn(async move {
        loop {
            match loop_inner.transport.receive().await {
                Some(inbound) => {
                    let task_inner = loop_inner.clone();
                    tokio::spawn(async move {
                        task_inner.dispatch_inbound(inbound).await;
                    });
                }
                None => break,
            }
        }
        loop_inner.closed.store(true, Ordering::SeqCst);
        loop_inner.close_all_outstanding();
        for plugin in &loop_inner.plugins {
            plugin.on_close().await;
        }
    });

    (peer, handle)
}
