//! Progress notifications delivered to the matching token, and a soft
//! timeout firing when no reply (and no progress) arrives in time.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mcp_protocol_core::model::ErrorData;
use mcp_protocol_core::protocol::{Handler, HandlerRegistry, RequestContext, TimeoutConfig};
use mcp_protocol_core::{serve, Peer, ProtocolOptions, RequestOptions, ServiceError};
use serde_json::{json, Value};

struct ProgressThenReplyHandler {
    peer_slot: Arc<Mutex<Option<Peer>>>,
}

#[async_trait]
impl Handler for ProgressThenReplyHandler {
    async fn handle_request(
        &self,
        ctx: RequestContext,
        _params: Option<Value>,
    ) -> Result<Value, ErrorData> {
        let peer = self.peer_slot.lock().unwrap().clone().expect("peer installed");
        let token = ctx.meta.progress_token.clone();
        if let Some(token) = token {
            let _ = peer
                .notify_related(
                    "notifications/progress",
                    Some(json!({"progressToken": token, "progress": 50, "total": 100})),
                    ctx.request_id.clone(),
                )
                .await;
        }
        Ok(json!({"done": true}))
    }
}

/// Sends a handful of progress notifications spaced further apart than the
/// caller's soft timeout, then replies. Used to tell apart "progress resets
/// the timer" from "progress is merely observed".
struct PingThenReplyHandler {
    peer_slot: Arc<Mutex<Option<Peer>>>,
    pings: usize,
    interval: Duration,
}

#[async_trait]
impl Handler for PingThenReplyHandler {
    async fn handle_request(
        &self,
        ctx: RequestContext,
        _params: Option<Value>,
    ) -> Result<Value, ErrorData> {
        let peer = self.peer_slot.lock().unwrap().clone().expect("peer installed");
        let token = ctx.meta.progress_token.clone();
        for _ in 0..self.pings {
            tokio::time::sleep(self.interval).await;
            if let Some(token) = &token {
                let _ = peer
                    .notify_related(
                        "notifications/progress",
                        Some(json!({"progressToken": token, "progress": 1, "total": 100})),
                        ctx.request_id.clone(),
                    )
                    .await;
            }
        }
        Ok(json!({"done": true}))
    }
}

struct NeverRepliesHandler;

#[async_trait]
impl Handler for NeverRepliesHandler {
    async fn handle_request(
        &self,
        _ctx: RequestContext,
        _params: Option<Value>,
    ) -> Result<Value, ErrorData> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn progress_notifications_reach_their_matching_subscriber() {
    let (transport_a, transport_b) = common::pair();

    let (peer_a, _handle_a) = serve(
        transport_a,
        HandlerRegistry::new(),
        vec![],
        ProtocolOptions::default(),
    )
    .await;

    let peer_slot = Arc::new(Mutex::new(None));
    let handlers_b = HandlerRegistry::new();
    handlers_b.register(
        "slow_work",
        Arc::new(ProgressThenReplyHandler {
            peer_slot: peer_slot.clone(),
        }),
    );
    let (peer_b, _handle_b) = serve(transport_b, handlers_b, vec![], ProtocolOptions::default()).await;
    *peer_slot.lock().unwrap() = Some(peer_b);

    let progress_calls = Arc::new(AtomicUsize::new(0));
    let progress_calls_clone = progress_calls.clone();
    let opts = RequestOptions {
        timeout: TimeoutConfig::default(),
        on_progress: Some(Box::new(move |_payload| {
            progress_calls_clone.fetch_add(1, Ordering::SeqCst);
        })),
    };

    let result = peer_a.request("slow_work", None, opts).await.unwrap();
    assert_eq!(result, json!({"done": true}));
    assert_eq!(progress_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_request_with_no_reply_times_out() {
    let (transport_a, transport_b) = common::pair();

    let (peer_a, _handle_a) = serve(
        transport_a,
        HandlerRegistry::new(),
        vec![],
        ProtocolOptions::default(),
    )
    .await;

    let handlers_b = HandlerRegistry::new();
    handlers_b.register("stuck", Arc::new(NeverRepliesHandler));
    let (_peer_b, _handle_b) = serve(transport_b, handlers_b, vec![], ProtocolOptions::default()).await;

    let opts = RequestOptions {
        timeout: TimeoutConfig {
            timeout: Duration::from_millis(50),
            reset_on_progress: false,
            max_total_timeout: None,
        },
        on_progress: None,
    };

    let err = peer_a.request("stuck", None, opts).await.unwrap_err();
    assert!(matches!(err, ServiceError::Timeout), "expected a timeout error, got {err:?}");
}

#[tokio::test]
async fn progress_does_not_extend_a_timeout_that_opted_out_of_resets() {
    let (transport_a, transport_b) = common::pair();

    let (peer_a, _handle_a) = serve(
        transport_a,
        HandlerRegistry::new(),
        vec![],
        ProtocolOptions::default(),
    )
    .await;

    let peer_slot = Arc::new(Mutex::new(None));
    let handlers_b = HandlerRegistry::new();
    handlers_b.register(
        "pinging_work",
        Arc::new(PingThenReplyHandler {
            peer_slot: peer_slot.clone(),
            pings: 5,
            interval: Duration::from_millis(30),
        }),
    );
    let (peer_b, _handle_b) = serve(transport_b, handlers_b, vec![], ProtocolOptions::default()).await;
    *peer_slot.lock().unwrap() = Some(peer_b);

    let opts = RequestOptions {
        timeout: TimeoutConfig {
            timeout: Duration::from_millis(80),
            reset_on_progress: false,
            max_total_timeout: None,
        },
        on_progress: Some(Box::new(|_payload| {})),
    };

    let err = peer_a.request("pinging_work", None, opts).await.unwrap_err();
    assert!(matches!(err, ServiceError::Timeout), "expected a timeout error, got {err:?}");
}

#[tokio::test]
async fn progress_extends_a_timeout_that_opted_into_resets() {
    let (transport_a, transport_b) = common::pair();

    let (peer_a, _handle_a) = serve(
        transport_a,
        HandlerRegistry::new(),
        vec![],
        ProtocolOptions::default(),
    )
    .await;

    let peer_slot = Arc::new(Mutex::new(None));
    let handlers_b = HandlerRegistry::new();
    handlers_b.register(
        "pinging_work",
        Arc::new(PingThenReplyHandler {
            peer_slot: peer_slot.clone(),
            pings: 5,
            interval: Duration::from_millis(30),
        }),
    );
    let (peer_b, _handle_b) = serve(transport_b, handlers_b, vec![], ProtocolOptions::default()).await;
    *peer_slot.lock().unwrap() = Some(peer_b);

    let opts = RequestOptions {
        timeout: TimeoutConfig {
            timeout: Duration::from_millis(80),
            reset_on_progress: true,
            max_total_timeout: None,
        },
        on_progress: Some(Box::new(|_payload| {})),
    };

    let result = peer_a.request("pinging_work", None, opts).await.unwrap();
    assert_eq!(result, json!({"done": true}));
}
