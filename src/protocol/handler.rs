//! Method dispatch table (§3 "Handler entry", §4.2 "Inbound request").
//!
//! The core does not know the shape of any particular MCP method: handlers
//! are looked up by bare method name and exchange `serde_json::Value`
//! payloads, with typed request/response surfaces left to the embedder
//! (§1 Out of scope).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::model::{Meta, RequestId};

/// Context handed to a handler, built by [`crate::protocol::Protocol`] and
/// augmented by plugins' `onBuildHandlerContext` hook before the handler
/// runs (§4.2).
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub method: String,
    pub meta: Meta,
    pub session_id: Option<String>,
    pub cancellation: CancellationToken,
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct NotificationContext {
    pub method: String,
    pub meta: Meta,
    pub session_id: Option<String>,
}

/// Implemented by anything the registry can dispatch a request or
/// notification to. Typically one handler per method, registered under that
/// method's name.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle_request(
        &self,
        ctx: RequestContext,
        params: Option<Value>,
    ) -> Result<Value, crate::model::ErrorData>;

    /// Default notification handling is to do nothing; most handlers are
    /// request-only.
    async fn handle_notification(&self, _ctx: NotificationContext, _params: Option<Value>) {}
}

/// Lookup table for request/notification handlers, plus the abort controller
/// for every in-flight inbound request (§3 "Handler entry").
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    in_flight: RwLock<HashMap<RequestId, CancellationToken>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, method: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.write().unwrap().insert(method.into(), handler);
    }

    pub fn unregister(&self, method: &str) {
        self.handlers.write().unwrap().remove(method);
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().unwrap().get(method).cloned()
    }

    /// Create and record an abort controller for an inbound request, keyed
    /// by its id. Returns the token the handler task should select on.
    pub fn begin(&self, id: RequestId) -> CancellationToken {
        let token = CancellationToken::new();
        self.in_flight.write().unwrap().insert(id, token.clone());
        token
    }

    /// Remove the bookkeeping for a finished (or cancelled) inbound request.
    pub fn end(&self, id: &RequestId) {
        self.in_flight.write().unwrap().remove(id);
    }

    /// Abort the in-flight request for `id`, if any is still running. Used by
    /// the `notifications/cancelled` handler (§4.2 "Cancellation").
    pub fn abort(&self, id: &RequestId) -> bool {
        if let Some(token) = self.in_flight.read().unwrap().get(id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub fn is_in_flight(&self, id: &RequestId) -> bool {
        self.in_flight.read().unwrap().contains_key(id)
    }
}
