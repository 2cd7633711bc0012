//! Fire-and-forget notifications, including the debounced-by-method case
//! where repeated sends with no params collapse into one delivery.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mcp_protocol_core::protocol::{Handler, HandlerRegistry, NotificationContext};
use mcp_protocol_core::{serve, ProtocolOptions};
use serde_json::Value;

struct CountingHandler {
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for CountingHandler {
    async fn handle_request(
        &self,
        _ctx: mcp_protocol_core::protocol::RequestContext,
        _params: Option<Value>,
    ) -> Result<Value, mcp_protocol_core::model::ErrorData> {
        unreachable!("this handler is only ever registered for a notification method")
    }

    async fn handle_notification(&self, _ctx: NotificationContext, _params: Option<Value>) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn a_plain_notification_is_delivered_once() {
    let (transport_a, transport_b) = common::pair();

    let (peer_a, _handle_a) = serve(
        transport_a,
        HandlerRegistry::new(),
        vec![],
        ProtocolOptions::default(),
    )
    .await;

    let count = Arc::new(AtomicUsize::new(0));
    let handlers_b = HandlerRegistry::new();
    handlers_b.register(
        "notifications/custom",
        Arc::new(CountingHandler { count: count.clone() }),
    );
    let (_peer_b, _handle_b) = serve(transport_b, handlers_b, vec![], ProtocolOptions::default()).await;

    peer_a
        .notify("notifications/custom", Some(serde_json::json!({"n": 1})))
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeated_parameterless_sends_of_a_debounced_method_collapse() {
    let (transport_a, transport_b) = common::pair();

    let mut debounced = HashSet::new();
    debounced.insert("notifications/progress_summary".to_string());
    let options_a = ProtocolOptions {
        debounced_notification_methods: debounced,
        ..ProtocolOptions::default()
    };
    let (peer_a, _handle_a) = serve(transport_a, HandlerRegistry::new(), vec![], options_a).await;

    let count = Arc::new(AtomicUsize::new(0));
    let handlers_b = HandlerRegistry::new();
    handlers_b.register(
        "notifications/progress_summary",
        Arc::new(CountingHandler { count: count.clone() }),
    );
    let (_peer_b, _handle_b) = serve(transport_b, handlers_b, vec![], ProtocolOptions::default()).await;

    for _ in 0..5 {
        peer_a
            .notify("notifications/progress_summary", None)
            .await
            .unwrap();
    }

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}
