//! Wire-level data types shared by every transport and by the protocol engine.
//!
//! The core deliberately does not know about tools, prompts, or resources:
//! those are higher-level registries built on top of this crate, so request
//! and result payloads here are bare [`serde_json::Value`]. See the crate's
//! top-level docs for why.

mod error;
mod jsonrpc;
mod meta;

pub use error::{ErrorCode, ErrorData};
pub use jsonrpc::{
    ClientJsonRpcMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JsonRpcVersion2_0, Message, Notification, Request, RequestId, Response, ServerJsonRpcMessage,
};
pub use meta::{Meta, ProgressToken, RelatedTask, TaskCreateHint, TaskPollHint};
