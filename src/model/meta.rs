use serde::{Deserialize, Serialize};

use super::RequestId;

/// A progress token is either side's way of tagging a request so that
/// progress notifications for it can be matched back up (§3, §4.2). Same
/// representation as [`RequestId`]: either an integer or a string.
pub type ProgressToken = RequestId;

/// A hint the task subsystem attaches to `_meta["related-task"]` so a peer
/// handling a task-mode request knows how to poll it (§3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPollHint {
    #[serde(rename = "pollInterval", skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

/// `_meta["related-task"]`: links a request to the task that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedTask {
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(flatten, default, skip_serializing_if = "Option::is_none")]
    pub poll_hint: Option<TaskPollHint>,
}

/// The caller's request to run a call in task mode, carried as `_meta.task`
/// (SPEC_FULL §4.5). An empty object is enough to ask for task mode; `ttl`
/// overrides the store's default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreateHint {
    #[serde(rename = "ttl", skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

/// Request metadata (`_meta`). Three keys the core recognizes
/// (`progressToken`, `related-task`, `task`) are named fields; every other
/// key round-trips unchanged in `extra` (§3: "unknown keys pass through
/// unchanged").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(rename = "progressToken", skip_serializing_if = "Option::is_none")]
    pub progress_token: Option<ProgressToken>,
    #[serde(rename = "related-task", skip_serializing_if = "Option::is_none")]
    pub related_task: Option<RelatedTask>,
    #[serde(rename = "task", skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskCreateHint>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Meta {
    pub fn is_empty(&self) -> bool {
        self.progress_token.is_none() && self.related_task.is_none() && self.extra.is_empty()
    }

    pub fn with_progress_token(token: ProgressToken) -> Self {
        Self {
            progress_token: Some(token),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_round_trip() {
        let text = r#"{"progressToken":1,"custom-key":"value"}"#;
        let meta: Meta = serde_json::from_str(text).unwrap();
        assert_eq!(meta.progress_token, Some(ProgressToken::Number(1)));
        assert_eq!(
            meta.extra.get("custom-key").and_then(|v| v.as_str()),
            Some("value")
        );
        let round_tripped = serde_json::to_value(&meta).unwrap();
        assert_eq!(round_tripped["custom-key"], "value");
    }

    #[test]
    fn empty_meta_detected() {
        assert!(Meta::default().is_empty());
        assert!(!Meta::with_progress_token(ProgressToken::Number(1)).is_empty());
    }
}
