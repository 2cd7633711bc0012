//! Detached execution of task-mode calls (§3 "Task", §4.5).
//!
//! A request carrying `_meta.task` is answered immediately with the newly
//! created [`Task`], and the underlying handler then runs to completion in
//! the background; its outcome lands in a [`TaskStore`] for later retrieval
//! through the `tasks/get`, `tasks/list`, `tasks/cancel`, `tasks/result`
//! handlers [`TaskPlugin`] registers.

mod plugin;
mod store;
mod task;

pub use plugin::TaskPlugin;
pub use store::{InMemoryTaskStore, TaskPage, TaskStore, TaskStoreError, DEFAULT_PAGE_SIZE};
pub use task::{Task, TaskResult, TaskStatus, DEFAULT_POLL_INTERVAL};
