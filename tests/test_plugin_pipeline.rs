//! Plugin hooks run in priority order and can rewrite a request/result in
//! flight; a plugin claiming `should_route_message` takes a message over the
//! normal dispatch path entirely.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mcp_protocol_core::model::{ErrorData, Message};
use mcp_protocol_core::protocol::{Handler, HandlerRegistry, Plugin, PluginHost, RequestContext};
use mcp_protocol_core::{serve, ProtocolOptions, RequestOptions};
use serde_json::{json, Value};

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle_request(
        &self,
        _ctx: RequestContext,
        params: Option<Value>,
    ) -> Result<Value, ErrorData> {
        Ok(params.unwrap_or(Value::Null))
    }
}

/// Appends its name to a shared log on every hook it fires, so the test can
/// assert on install/dispatch order.
struct OrderTrackingPlugin {
    name: &'static str,
    priority: i32,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Plugin for OrderTrackingPlugin {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        self.name
    }

    async fn on_request(&self, _ctx: &RequestContext, request: Message) -> Message {
        self.log.lock().unwrap().push(self.name.to_string());
        request
    }

    async fn on_request_result(&self, _ctx: &RequestContext, result: Value) -> Value {
        let mut result = result;
        if let Value::Object(map) = &mut result {
            map.insert(
                format!("stamped_by_{}", self.name),
                Value::Bool(true),
            );
        }
        result
    }
}

/// Intercepts every message unconditionally, acknowledging it itself instead
/// of letting it reach the handler registry.
struct InterceptingPlugin {
    intercepted: Arc<AtomicBool>,
}

#[async_trait]
impl Plugin for InterceptingPlugin {
    fn priority(&self) -> i32 {
        -100
    }

    fn name(&self) -> &str {
        "intercepting"
    }

    fn should_route_message(&self, message: &Message) -> bool {
        matches!(message, Message::Request(r) if r.method == "intercepted")
    }

    async fn route_message(&self, message: Message, host: Arc<dyn PluginHost>) {
        self.intercepted.store(true, Ordering::SeqCst);
        if let Message::Request(r) = message {
            let _ = host
                .send_raw(Message::result(r.id, json!({"handled_by": "plugin"})))
                .await;
        }
    }
}

#[tokio::test]
async fn plugins_run_in_priority_order_and_rewrite_the_result() {
    let (transport_a, transport_b) = common::pair();

    let (peer_a, _handle_a) = serve(
        transport_a,
        HandlerRegistry::new(),
        vec![],
        ProtocolOptions::default(),
    )
    .await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let handlers_b = HandlerRegistry::new();
    handlers_b.register("echo", Arc::new(EchoHandler));
    let plugins: Vec<Arc<dyn Plugin>> = vec![
        Arc::new(OrderTrackingPlugin {
            name: "second",
            priority: 10,
            log: log.clone(),
        }),
        Arc::new(OrderTrackingPlugin {
            name: "first",
            priority: 0,
            log: log.clone(),
        }),
    ];
    let (_peer_b, _handle_b) = serve(transport_b, handlers_b, plugins, ProtocolOptions::default()).await;

    let result = peer_a
        .request("echo", Some(json!({})), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["first".to_string(), "second".to_string()]);
    assert_eq!(result["stamped_by_first"], Value::Bool(true));
    assert_eq!(result["stamped_by_second"], Value::Bool(true));
}

#[tokio::test]
async fn a_routing_plugin_answers_before_the_handler_registry_sees_the_request() {
    let (transport_a, transport_b) = common::pair();

    let (peer_a, _handle_a) = serve(
        transport_a,
        HandlerRegistry::new(),
        vec![],
        ProtocolOptions::default(),
    )
    .await;

    let intercepted = Arc::new(AtomicBool::new(false));
    let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(InterceptingPlugin {
        intercepted: intercepted.clone(),
    })];
    let (_peer_b, _handle_b) = serve(transport_b, HandlerRegistry::new(), plugins, ProtocolOptions::default()).await;

    let result = peer_a
        .request("intercepted", None, RequestOptions::default())
        .await
        .unwrap();

    assert!(intercepted.load(Ordering::SeqCst));
    assert_eq!(result, json!({"handled_by": "plugin"}));
}
