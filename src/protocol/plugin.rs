//! The plugin pipeline (§4.2 "Plugin pipeline", §9 design notes).
//!
//! Plugins are ordered by an integer priority assigned at install time and
//! are the only extension point the engine exposes: the task subsystem
//! (`crate::task::TaskPlugin`) is itself a plugin, not a special case wired
//! into `Protocol`.
//!
//! `Plugin` is dyn-dispatched — the pipeline is a `Vec<Arc<dyn Plugin>>` of
//! otherwise-unrelated types — so it uses `#[async_trait]` rather than the
//! `impl Future` style used elsewhere in this crate, the same tradeoff the
//! handler-dispatch trait in a comparably-shaped async framework makes for
//! its heterogeneous handler collection.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ServiceError;
use crate::model::{ErrorData, Message, RequestId};
use crate::protocol::handler::{Handler, RequestContext};
use crate::protocol::progress::ProgressManager;

/// What kind of error is being sent, for the error interceptor (§6 "Error
/// interceptor interface", §7 taxonomy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Application,
}

#[derive(Debug, Clone)]
pub struct ErrorInterceptorContext {
    pub kind: ErrorKind,
    pub method: Option<String>,
    pub request_id: Option<RequestId>,
    pub error_code: i32,
}

/// What an [`ErrorInterceptor`] may override. `code` is only honored for
/// [`ErrorKind::Application`] errors — protocol errors keep their fixed code
/// no matter what is returned here (§4.2, §7).
#[derive(Debug, Clone, Default)]
pub struct ErrorOverride {
    pub message: Option<String>,
    pub data: Option<Value>,
    pub code: Option<i32>,
}

pub type ErrorInterceptor =
    Arc<dyn Fn(ErrorInterceptorContext, &ErrorData) -> Option<ErrorOverride> + Send + Sync>;

/// The interface `Protocol` implements and hands to plugins at install time
/// (§6 "Plugin host interface", §9 "break the Protocol/plugin cycle with a
/// small host interface").
#[async_trait]
pub trait PluginHost: Send + Sync + 'static {
    fn session_id(&self) -> Option<String>;

    /// Send a fully-formed message directly to the transport, bypassing the
    /// outbound plugin hooks (a plugin that already ran those hooks on
    /// itself, e.g. to re-route a message, uses this to finish the send).
    async fn send_raw(&self, message: Message) -> Result<(), ServiceError>;

    fn register_handler(&self, method: &str, handler: Arc<dyn Handler>);
    fn unregister_handler(&self, method: &str);

    /// Install a one-shot resolver for a request id, used by the task
    /// subsystem to redirect a create-task acknowledgement into a side
    /// channel instead of the caller's normal response slot (§4.5).
    fn register_side_channel(&self, id: RequestId, resolver: oneshot::Sender<Message>);

    fn progress_manager(&self) -> &ProgressManager;

    /// Report an error that has no caller to reject — surfaced the same way
    /// `onerror` is in §4.1/§7 ("transport failures ... surface through the
    /// onerror channel").
    fn report_error(&self, error: ServiceError);

    /// Invoke the handler registered for `method` directly, bypassing the
    /// `onRequest`/`onRequestResult` hook pipeline. The task subsystem uses
    /// this to run the real handler for a task-mode request in the
    /// background after it has already answered the caller with a task
    /// acknowledgement (§4.5).
    async fn dispatch_request(
        &self,
        ctx: RequestContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ErrorData>;
}

/// An extension point in the protocol pipeline. Every hook has a no-op
/// default; implementors override only the hooks they need.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Lower values run first. Ties break by install order.
    fn priority(&self) -> i32 {
        0
    }

    fn name(&self) -> &str;

    async fn install(&self, _host: Arc<dyn PluginHost>) {}
    async fn on_connect(&self) {}
    async fn on_close(&self) {}

    /// May substitute the inbound request before the handler runs.
    async fn on_request(&self, _ctx: &RequestContext, request: Message) -> Message {
        request
    }

    async fn on_request_result(&self, _ctx: &RequestContext, result: Value) -> Value {
        result
    }

    async fn on_request_error(&self, _ctx: &RequestContext, error: ErrorData) -> ErrorData {
        error
    }

    async fn on_notification(&self, _method: &str, params: Option<Value>) -> Option<Value> {
        params
    }

    /// May substitute an outbound request before it traverses the timeout
    /// and progress setup (§4.2 "Outbound request").
    async fn on_before_send_request(&self, request: Message) -> Message {
        request
    }

    async fn on_before_send_notification(&self, notification: Message) -> Message {
        notification
    }

    async fn on_build_handler_context(&self, extra: &mut serde_json::Map<String, Value>) {
        let _ = extra;
    }

    async fn on_response(&self, _message: &Message) {}

    /// First-match interception (§4.2, §9): if this returns `true` for a
    /// message, this plugin's [`Plugin::route_message`] owns it instead of
    /// the normal dispatch path. Checked in priority order; the first `true`
    /// wins.
    fn should_route_message(&self, _message: &Message) -> bool {
        false
    }

    async fn route_message(&self, _message: Message, _host: Arc<dyn PluginHost>) {}
}

/// Run the plugins in priority order, returning them sorted. Called once at
/// `Protocol` construction.
pub fn sort_by_priority(mut plugins: Vec<Arc<dyn Plugin>>) -> Vec<Arc<dyn Plugin>> {
    plugins.sort_by_key(|p| p.priority());
    plugins
}
