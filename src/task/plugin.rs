//! The task plugin (§4.5): turns a request bearing `_meta.task` into a
//! detached execution, answering the caller immediately with the freshly
//! created [`Task`] and running the real handler in the background.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::model::{ErrorData, Message, Request};
use crate::protocol::handler::{Handler, RequestContext};
use crate::protocol::{Plugin, PluginHost};

use super::store::{TaskPage, TaskStore};
use super::task::TaskStatus;

fn task_id_param(params: &Option<Value>) -> Result<String, ErrorData> {
    params
        .as_ref()
        .and_then(|p| p.get("taskId"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ErrorData::invalid_params("missing taskId", None))
}

struct TasksGetHandler {
    store: Arc<dyn TaskStore>,
}

#[async_trait]
impl Handler for TasksGetHandler {
    async fn handle_request(
        &self,
        _ctx: RequestContext,
        params: Option<Value>,
    ) -> Result<Value, ErrorData> {
        let task_id = task_id_param(&params)?;
        let task = self
            .store
            .get_task(&task_id)
            .await
            .ok_or_else(|| ErrorData::invalid_params(format!("no task with id {task_id:?}"), None))?;
        serde_json::to_value(&task).map_err(|e| ErrorData::internal_error(e.to_string(), None))
    }
}

struct TasksListHandler {
    store: Arc<dyn TaskStore>,
}

#[async_trait]
impl Handler for TasksListHandler {
    async fn handle_request(
        &self,
        ctx: RequestContext,
        params: Option<Value>,
    ) -> Result<Value, ErrorData> {
        let cursor = params
            .as_ref()
            .and_then(|p| p.get("cursor"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let TaskPage { tasks, next_cursor } = self
            .store
            .list_tasks(cursor, ctx.session_id)
            .await
            .map_err(|e| ErrorData::invalid_params(e.to_string(), None))?;
        Ok(serde_json::json!({
            "tasks": tasks,
            "nextCursor": next_cursor,
        }))
    }
}

struct TasksCancelHandler {
    store: Arc<dyn TaskStore>,
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

#[async_trait]
impl Handler for TasksCancelHandler {
    async fn handle_request(
        &self,
        _ctx: RequestContext,
        params: Option<Value>,
    ) -> Result<Value, ErrorData> {
        let task_id = task_id_param(&params)?;
        self.store
            .update_task_status(
                &task_id,
                TaskStatus::Cancelled,
                Some("cancelled by caller".into()),
            )
            .await
            .map_err(|e| ErrorData::invalid_params(e.to_string(), None))?;
        if let Some(token) = self.running.lock().unwrap().remove(&task_id) {
            token.cancel();
        }
        let task = self
            .store
            .get_task(&task_id)
            .await
            .ok_or_else(|| ErrorData::internal_error("task vanished after cancel", None))?;
        serde_json::to_value(&task).map_err(|e| ErrorData::internal_error(e.to_string(), None))
    }
}

struct TasksResultHandler {
    store: Arc<dyn TaskStore>,
}

#[async_trait]
impl Handler for TasksResultHandler {
    async fn handle_request(
        &self,
        _ctx: RequestContext,
        params: Option<Value>,
    ) -> Result<Value, ErrorData> {
        let task_id = task_id_param(&params)?;
        let task = self
            .store
            .get_task(&task_id)
            .await
            .ok_or_else(|| ErrorData::invalid_params(format!("no task with id {task_id:?}"), None))?;
        if !task.status.is_terminal() {
            return Err(ErrorData::invalid_request(
                format!("task {task_id:?} has not finished"),
                None,
            ));
        }
        match self.store.get_task_result(&task_id).await {
            Some(Ok(value)) => Ok(value),
            Some(Err(error)) => Err(error),
            None => Err(ErrorData::internal_error(
                "terminal task has no stored result",
                None,
            )),
        }
    }
}

/// Installed once per `Protocol` that wants task support. Intercepts inbound
/// requests carrying `_meta.task` ahead of normal dispatch (§4.2 routing,
/// §4.5) and registers the four `tasks/*` handlers.
pub struct TaskPlugin {
    store: Arc<dyn TaskStore>,
    default_ttl: Option<Duration>,
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
    host: Mutex<Option<Arc<dyn PluginHost>>>,
}

impl TaskPlugin {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            default_ttl: None,
            running: Arc::new(Mutex::new(HashMap::new())),
            host: Mutex::new(None),
        }
    }

    /// Ttl applied to a task-mode request that doesn't set `_meta.task.ttl`
    /// itself. `None` means such tasks never expire on their own.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }
}

#[async_trait]
impl Plugin for TaskPlugin {
    fn name(&self) -> &str {
        "task-subsystem"
    }

    async fn install(&self, host: Arc<dyn PluginHost>) {
        host.register_handler(
            "tasks/get",
            Arc::new(TasksGetHandler {
                store: self.store.clone(),
            }),
        );
        host.register_handler(
            "tasks/list",
            Arc::new(TasksListHandler {
                store: self.store.clone(),
            }),
        );
        host.register_handler(
            "tasks/cancel",
            Arc::new(TasksCancelHandler {
                store: self.store.clone(),
                running: self.running.clone(),
            }),
        );
        host.register_handler(
            "tasks/result",
            Arc::new(TasksResultHandler {
                store: self.store.clone(),
            }),
        );
        *self.host.lock().unwrap() = Some(host);
    }

    async fn on_close(&self) {
        if let Some(host) = self.host.lock().unwrap().take() {
            host.unregister_handler("tasks/get");
            host.unregister_handler("tasks/list");
            host.unregister_handler("tasks/cancel");
            host.unregister_handler("tasks/result");
        }
    }

    fn should_route_message(&self, message: &Message) -> bool {
        matches!(message, Message::Request(r) if r.meta.task.is_some())
    }

    async fn route_message(&self, message: Message, host: Arc<dyn PluginHost>) {
        let Message::Request(request) = message else {
            return;
        };
        let original_request = Message::Request(request.clone());
        let Request {
            id, method, params, meta, ..
        } = request;

        let ttl = meta
            .task
            .as_ref()
            .and_then(|hint| hint.ttl_seconds)
            .map(Duration::from_secs)
            .or(self.default_ttl);
        let session_id = host.session_id();

        let task = self
            .store
            .create_task(
                params.clone(),
                id.clone(),
                original_request,
                session_id.clone(),
                ttl,
            )
            .await;

        let ack = match serde_json::to_value(&task) {
            Ok(v) => v,
            Err(e) => {
                host.report_error(crate::error::ServiceError::TransportSend(e.to_string()));
                return;
            }
        };
        if let Err(e) = host.send_raw(Message::result(id.clone(), ack)).await {
            host.report_error(e);
            return;
        }

        let cancellation = CancellationToken::new();
        self.running
            .lock()
            .unwrap()
            .insert(task.task_id.clone(), cancellation.clone());

        let store = self.store.clone();
        let running = self.running.clone();
        let task_id = task.task_id.clone();
        let ctx = RequestContext {
            request_id: id,
            method: method.clone(),
            meta,
            session_id,
            cancellation: cancellation.clone(),
            extra: serde_json::Map::new(),
        };
        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = host.dispatch_request(ctx, &method, params) => Some(result),
                _ = cancellation.cancelled() => None,
            };
            running.lock().unwrap().remove(&task_id);
            if let Some(outcome) = outcome {
                if let Err(e) = store.store_task_result(&task_id, outcome).await {
                    tracing::debug!(task_id = %task_id, error = %e, "task result not stored");
                }
            }
        });
    }
}
