//! The only contract the protocol engine has with the wire (§4.1).
//!
//! Where the source spec describes `start()`/`close()`/`send()` plus
//! `onmessage`/`onclose`/`onerror` callbacks, this crate uses the pull-based
//! shape already idiomatic for async Rust transports: [`Transport::receive`]
//! replaces the `onmessage` callback (connection close is `Ok(None)`), and
//! send failures surface as a `Result` instead of a separate `onerror` call.
//! A transport is owned by exactly one [`crate::protocol::Protocol`] at a
//! time — it is moved into `Protocol::serve`, not registered into a
//! callback slot that could be overwritten out from under a live session.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ServiceError;
use crate::model::{Message, RequestId};

pub mod common;

#[cfg(feature = "transport-io")]
pub mod stdio;

#[cfg(feature = "transport-streamable-http-server")]
pub mod event_store;
#[cfg(feature = "transport-streamable-http-server")]
pub mod session_store;
#[cfg(feature = "transport-streamable-http-server")]
pub mod streamable_http_server;

#[cfg(feature = "transport-streamable-http-client")]
pub mod streamable_http_client;

/// Opaque authentication record handed down by the transport (§1 Non-goals:
/// "the core receives an opaque authentication record from the transport").
/// The core never interprets it, only threads it through to handler context.
pub type AuthRecord = Value;

/// A callback a transport hands back so a handler (or the engine) can close
/// a specific SSE stream without knowing the transport's internals.
pub type StreamCloseHandle = std::sync::Arc<dyn Fn() + Send + Sync>;

/// Extras accompanying an inbound message (§4.1: "Extras carry an optional
/// authentication record, a handle to close the per-request SSE stream, and
/// a handle to close the standalone stream").
#[derive(Clone, Default)]
pub struct MessageExtra {
    pub auth: Option<AuthRecord>,
    pub close_request_stream: Option<StreamCloseHandle>,
    pub close_standalone_stream: Option<StreamCloseHandle>,
}

impl std::fmt::Debug for MessageExtra {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageExtra")
            .field("auth", &self.auth)
            .field("close_request_stream", &self.close_request_stream.is_some())
            .field(
                "close_standalone_stream",
                &self.close_standalone_stream.is_some(),
            )
            .finish()
    }
}

/// A frame pulled off the transport together with its extras.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message: Message,
    pub extra: MessageExtra,
}

impl InboundMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            extra: MessageExtra::default(),
        }
    }
}

/// A callback invoked with each resumption token the transport mints while
/// streaming a send, so the caller can persist it for a future
/// `Last-Event-ID` (§4.1, §4.3 "GET ... resumption").
pub type OnResumptionToken = std::sync::Arc<dyn Fn(String) + Send + Sync>;

/// Per-send options (§4.1).
#[derive(Clone, Default)]
pub struct SendOptions {
    /// Binds an outbound notification to an inbound request's stream, so
    /// it is delivered on the same SSE stream as that request's eventual
    /// response (§5 "Ordering guarantees").
    pub related_request_id: Option<RequestId>,
    pub session_id: Option<String>,
    pub resumption_token: Option<String>,
    pub on_resumption_token: Option<OnResumptionToken>,
}

impl std::fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendOptions")
            .field("related_request_id", &self.related_request_id)
            .field("session_id", &self.session_id)
            .field("resumption_token", &self.resumption_token)
            .field("on_resumption_token", &self.on_resumption_token.is_some())
            .finish()
    }
}

/// The wire-facing half of a session. Implementations: [`stdio::StdioTransport`],
/// the streamable HTTP server and client transports.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one frame. `options` is ignored by transports that have no
    /// concept of multiple streams (e.g. stdio).
    async fn send(&self, message: Message, options: SendOptions) -> Result<(), ServiceError>;

    /// Pull the next inbound frame. Returns `None` exactly once, when the
    /// connection has closed; every call after that also returns `None`.
    async fn receive(&self) -> Option<InboundMessage>;

    async fn close(&self);

    fn session_id(&self) -> Option<String> {
        None
    }
}
