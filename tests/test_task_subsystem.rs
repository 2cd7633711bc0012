//! A `_meta.task` request is acknowledged immediately with a `Task` record
//! instead of running the handler inline, and the real result becomes
//! available later through `tasks/get`/`tasks/result`.
//!
//! Task mode is requested through `_meta.task`, a field `Peer::request` has
//! no dedicated knob for (it's meant to be set by a client-side plugin or a
//! caller composing the wire frame directly) — so this drives the client
//! side off the raw `Transport`, and only wraps the server side in `serve`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcp_protocol_core::model::{ErrorData, Message, Meta, Request, RequestId, TaskCreateHint};
use mcp_protocol_core::protocol::{Handler, HandlerRegistry, RequestContext};
use mcp_protocol_core::task::{InMemoryTaskStore, TaskPlugin};
use mcp_protocol_core::transport::SendOptions;
use mcp_protocol_core::{serve, Plugin, ProtocolOptions, Transport};
use serde_json::json;

struct SlowJobHandler;

#[async_trait]
impl Handler for SlowJobHandler {
    async fn handle_request(
        &self,
        _ctx: RequestContext,
        _params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ErrorData> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(json!({"answer": 42}))
    }
}

fn task_mode_request(id: u64, method: &str, params: Option<serde_json::Value>) -> Message {
    Message::Request(Request {
        jsonrpc: Default::default(),
        id: RequestId::Number(id),
        method: method.to_string(),
        params,
        meta: Meta {
            task: Some(TaskCreateHint { ttl_seconds: None }),
            ..Meta::default()
        },
    })
}

fn plain_request(id: u64, method: &str, params: Option<serde_json::Value>) -> Message {
    Message::request(RequestId::Number(id), method, params)
}

#[tokio::test]
async fn task_mode_acknowledges_immediately_and_the_result_arrives_later() {
    let (transport_a, transport_b) = common::pair();

    let handlers_b = HandlerRegistry::new();
    handlers_b.register("slow_job", Arc::new(SlowJobHandler));
    let store = InMemoryTaskStore::new();
    let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(TaskPlugin::new(store))];
    let (_peer_b, _handle_b) = serve(transport_b, handlers_b, plugins, ProtocolOptions::default()).await;

    transport_a
        .send(task_mode_request(1, "slow_job", None), SendOptions::default())
        .await
        .unwrap();

    let ack = transport_a.receive().await.unwrap().message;
    let Message::Response(response) = ack else {
        panic!("expected a result carrying the freshly minted task");
    };
    let task_id = response.result["taskId"].as_str().unwrap().to_string();
    assert_eq!(response.result["status"], "working");

    // poll until the handler has actually finished in the background.
    let mut status = "working".to_string();
    for attempt in 0..20u64 {
        transport_a
            .send(
                plain_request(100 + attempt, "tasks/get", Some(json!({"taskId": task_id}))),
                SendOptions::default(),
            )
            .await
            .unwrap();
        let Message::Response(resp) = transport_a.receive().await.unwrap().message else {
            panic!("expected tasks/get to reply with a result");
        };
        status = resp.result["status"].as_str().unwrap().to_string();
        if status == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, "completed");

    transport_a
        .send(
            plain_request(999, "tasks/result", Some(json!({"taskId": task_id}))),
            SendOptions::default(),
        )
        .await
        .unwrap();
    let Message::Response(resp) = transport_a.receive().await.unwrap().message else {
        panic!("expected tasks/result to reply with a result");
    };
    assert_eq!(resp.result, json!({"answer": 42}));
}

#[tokio::test]
async fn a_cancelled_task_is_removed_from_the_running_set_without_error() {
    let (transport_a, transport_b) = common::pair();

    let handlers_b = HandlerRegistry::new();
    handlers_b.register("slow_job", Arc::new(SlowJobHandler));
    let store = InMemoryTaskStore::new();
    let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(TaskPlugin::new(store))];
    let (_peer_b, _handle_b) = serve(transport_b, handlers_b, plugins, ProtocolOptions::default()).await;

    transport_a
        .send(task_mode_request(1, "slow_job", None), SendOptions::default())
        .await
        .unwrap();
    let Message::Response(response) = transport_a.receive().await.unwrap().message else {
        panic!("expected the task acknowledgement");
    };
    let task_id = response.result["taskId"].as_str().unwrap().to_string();

    transport_a
        .send(
            plain_request(2, "tasks/cancel", Some(json!({"taskId": task_id}))),
            SendOptions::default(),
        )
        .await
        .unwrap();
    let Message::Response(resp) = transport_a.receive().await.unwrap().message else {
        panic!("expected tasks/cancel to reply with the updated task");
    };
    assert_eq!(resp.result["status"], "cancelled");
}
