//! Task persistence and TTL scheduling (§4.5, §6 "Persistent state").

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use crate::model::{Message, RequestId};
use crate::protocol::timeout::{TimeoutConfig, TimeoutHandle};

use super::task::{Task, TaskResult, TaskStatus, DEFAULT_POLL_INTERVAL};

#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("no task with id {0:?}")]
    NotFound(String),
    #[error("task {0:?} is already in a terminal status")]
    TerminalStatus(String),
    #[error("invalid cursor")]
    InvalidCursor,
}

/// One page of `listTasks` (§4.5: "page size ≥ 1, opaque cursor, invalid
/// cursor is an error").
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub next_cursor: Option<String>,
}

pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Where task state lives. Implementations own TTL scheduling: if `ttl` is
/// supplied to `create_task`, deletion is scheduled for `createdAt + ttl`;
/// [`TaskStore::store_task_result`] and a terminal
/// [`TaskStore::update_task_status`] both reset that timer to now + ttl
/// (§4.5). A task created without a ttl persists until explicitly deleted.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    async fn create_task(
        &self,
        params: Option<Value>,
        request_id: RequestId,
        original_request: Message,
        session_id: Option<String>,
        ttl: Option<Duration>,
    ) -> Task;

    async fn get_task(&self, task_id: &str) -> Option<Task>;

    async fn get_task_result(&self, task_id: &str) -> Option<TaskResult>;

    /// Store the outcome of the underlying call and move the task to
    /// `Completed` or `Failed`. Errors if the task is already terminal
    /// (§3 invariant 5) or unknown.
    async fn store_task_result(
        &self,
        task_id: &str,
        result: TaskResult,
    ) -> Result<(), TaskStoreError>;

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        message: Option<String>,
    ) -> Result<(), TaskStoreError>;

    async fn list_tasks(
        &self,
        cursor: Option<String>,
        session_id: Option<String>,
    ) -> Result<TaskPage, TaskStoreError>;

    async fn delete_task(&self, task_id: &str);
}

struct TaskRecord {
    task: Task,
    session_id: Option<String>,
    #[allow(dead_code)]
    request_id: RequestId,
    #[allow(dead_code)]
    original_request: Message,
    #[allow(dead_code)]
    params: Option<Value>,
    result: Option<TaskResult>,
    ttl: Option<Duration>,
    deletion_timer: Option<TimeoutHandle>,
}

/// In-memory [`TaskStore`]. Retention beyond ttl-driven deletion is
/// unbounded, same tradeoff as [`crate::transport::event_store::InMemoryEventStore`].
pub struct InMemoryTaskStore {
    state: Mutex<HashMap<String, TaskRecord>>,
    self_weak: Weak<InMemoryTaskStore>,
}

impl InMemoryTaskStore {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: Mutex::new(HashMap::new()),
            self_weak: weak.clone(),
        })
    }

    fn schedule_deletion(&self, task_id: String, ttl: Duration) -> TimeoutHandle {
        let weak = self.self_weak.clone();
        TimeoutHandle::spawn(
            TimeoutConfig {
                timeout: ttl,
                reset_on_progress: true,
                max_total_timeout: None,
            },
            move || {
                if let Some(store) = weak.upgrade() {
                    tokio::spawn(async move {
                        store.delete_task(&task_id).await;
                    });
                }
            },
        )
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(
        &self,
        params: Option<Value>,
        request_id: RequestId,
        original_request: Message,
        session_id: Option<String>,
        ttl: Option<Duration>,
    ) -> Task {
        let task_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let task = Task {
            task_id: task_id.clone(),
            status: TaskStatus::Working,
            ttl: ttl.map(|d| d.as_secs()),
            created_at: now,
            last_updated_at: now,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            status_message: None,
        };
        let deletion_timer = ttl.map(|d| self.schedule_deletion(task_id.clone(), d));
        let record = TaskRecord {
            task: task.clone(),
            session_id,
            request_id,
            original_request,
            params,
            result: None,
            ttl,
            deletion_timer,
        };
        self.state.lock().unwrap().insert(task_id, record);
        task
    }

    async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.state.lock().unwrap().get(task_id).map(|r| r.task.clone())
    }

    async fn get_task_result(&self, task_id: &str) -> Option<TaskResult> {
        self.state
            .lock()
            .unwrap()
            .get(task_id)
            .and_then(|r| r.result.clone())
    }

    async fn store_task_result(
        &self,
        task_id: &str,
        result: TaskResult,
    ) -> Result<(), TaskStoreError> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .get_mut(task_id)
            .ok_or_else(|| TaskStoreError::NotFound(task_id.to_string()))?;
        if record.task.status.is_terminal() {
            return Err(TaskStoreError::TerminalStatus(task_id.to_string()));
        }
        record.task.status = if result.is_ok() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        record.task.last_updated_at = Utc::now();
        record.result = Some(result);
        if let (Some(ttl), Some(timer)) = (record.ttl, &record.deletion_timer) {
            let _ = ttl;
            timer.reset_on_progress();
        }
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        message: Option<String>,
    ) -> Result<(), TaskStoreError> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .get_mut(task_id)
            .ok_or_else(|| TaskStoreError::NotFound(task_id.to_string()))?;
        if record.task.status.is_terminal() {
            return Err(TaskStoreError::TerminalStatus(task_id.to_string()));
        }
        record.task.status = status;
        record.task.last_updated_at = Utc::now();
        if let Some(message) = message {
            record.task.status_message = Some(message);
        }
        if status.is_terminal() {
            if let Some(timer) = &record.deletion_timer {
                timer.reset_on_progress();
            }
        }
        Ok(())
    }

    async fn list_tasks(
        &self,
        cursor: Option<String>,
        session_id: Option<String>,
    ) -> Result<TaskPage, TaskStoreError> {
        let offset = match cursor {
            None => 0,
            Some(c) => c.parse::<usize>().map_err(|_| TaskStoreError::InvalidCursor)?,
        };
        let state = self.state.lock().unwrap();
        let mut matching: Vec<&TaskRecord> = state
            .values()
            .filter(|r| {
                session_id
                    .as_ref()
                    .map_or(true, |sid| r.session_id.as_deref() == Some(sid.as_str()))
            })
            .collect();
        matching.sort_by(|a, b| {
            a.task
                .created_at
                .cmp(&b.task.created_at)
                .then_with(|| a.task.task_id.cmp(&b.task.task_id))
        });
        if offset > matching.len() {
            return Err(TaskStoreError::InvalidCursor);
        }
        let page: Vec<Task> = matching
            .iter()
            .skip(offset)
            .take(DEFAULT_PAGE_SIZE)
            .map(|r| r.task.clone())
            .collect();
        let next_cursor = if offset + page.len() < matching.len() {
            Some((offset + page.len()).to_string())
        } else {
            None
        };
        Ok(TaskPage {
            tasks: page,
            next_cursor,
        })
    }

    async fn delete_task(&self, task_id: &str) {
        if let Some(record) = self.state.lock().unwrap().remove(task_id) {
            if let Some(timer) = record.deletion_timer {
                timer.cancel();
            }
        }
    }
}
