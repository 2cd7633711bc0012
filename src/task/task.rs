//! Task record shape (§3 "Task", §4.5).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::ErrorData;

/// Poll interval advertised on a freshly created task, until an embedder
/// configures something else.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// `{working, input_required, completed, failed, cancelled}` (§3). The last
/// three are terminal: [`TaskStatus::is_terminal`] guards every transition
/// the store accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Working,
    InputRequired,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// `{taskId, status, ttl?, createdAt, lastUpdatedAt, pollInterval, statusMessage?}`
/// (§3). The stored result, if any, lives alongside this in the store and is
/// fetched separately through `tasks/result` — a task's wire shape never
/// carries its own result payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastUpdatedAt")]
    pub last_updated_at: DateTime<Utc>,
    #[serde(rename = "pollInterval")]
    pub poll_interval_ms: u64,
    #[serde(rename = "statusMessage", skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

pub type TaskResult = Result<Value, ErrorData>;
