//! `Peer::cancel` aborts a still-running inbound handler on the other side,
//! and the caller never receives that handler's eventual result.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcp_protocol_core::model::{ErrorData, RequestId};
use mcp_protocol_core::protocol::{Handler, HandlerRegistry, RequestContext};
use mcp_protocol_core::{serve, ProtocolOptions, RequestOptions};
use serde_json::Value;

struct SlowHandler {
    ran_to_completion: Arc<AtomicBool>,
}

#[async_trait]
impl Handler for SlowHandler {
    async fn handle_request(
        &self,
        ctx: RequestContext,
        _params: Option<Value>,
    ) -> Result<Value, ErrorData> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(5)) => {
                self.ran_to_completion.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            }
            _ = ctx.cancellation.cancelled() => {
                Err(ErrorData::internal_error("cancelled", None))
            }
        }
    }
}

#[tokio::test]
async fn cancel_notification_aborts_the_in_flight_handler() {
    let (transport_a, transport_b) = common::pair();

    let (peer_a, _handle_a) = serve(
        transport_a,
        HandlerRegistry::new(),
        vec![],
        ProtocolOptions::default(),
    )
    .await;

    let ran_to_completion = Arc::new(AtomicBool::new(false));
    let handlers_b = HandlerRegistry::new();
    handlers_b.register(
        "long_running",
        Arc::new(SlowHandler {
            ran_to_completion: ran_to_completion.clone(),
        }),
    );
    let (_peer_b, _handle_b) = serve(transport_b, handlers_b, vec![], ProtocolOptions::default()).await;

    let peer_a_clone = peer_a.clone();
    let in_flight = tokio::spawn(async move {
        peer_a_clone
            .request("long_running", None, RequestOptions::default())
            .await
    });

    // give the request time to reach the handler, then cancel it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    peer_a.cancel(RequestId::Number(1), "no longer needed").await;

    // the caller's future never resolves for a cancelled request (the engine
    // drops its outstanding-request entry without settling it), so bound the
    // wait instead of awaiting forever.
    let outcome = tokio::time::timeout(Duration::from_millis(300), in_flight).await;
    assert!(outcome.is_err(), "cancelled request should not resolve");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!ran_to_completion.load(Ordering::SeqCst));
}
