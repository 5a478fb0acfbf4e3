//! Persistence contract for Task and Topic records.
//!
//! The core never talks to SQL directly; it goes through [`Repository`].
//! Every operation that touches both a Task and a Topic runs as one unit of
//! work so the Topic's mirrored status cannot diverge from its Task.

mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared_types::{Task, TaskStatus, Topic};

use crate::error::Result;

pub use sqlite::SqliteRepository;

/// A status write applied to a Task and mirrored onto its Topic.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub status: TaskStatus,
    pub sandbox_id: String,
    /// Already truncated; written only when `Some`.
    pub err_msg: Option<String>,
    pub updated_uid: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusChangeOutcome {
    Applied { task: Task, topic: Topic },
    TopicMissing,
    TaskMissing,
    Rejected { from: TaskStatus, to: TaskStatus },
}

/// Rows touched by a bulk status update keyed on sandbox ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxSyncCount {
    pub topics: u64,
    pub tasks: u64,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_task(&self, task: &Task) -> Result<()>;
    async fn update_task(&self, task: &Task) -> Result<()>;
    async fn get_task_by_id(&self, id: &str) -> Result<Option<Task>>;
    /// Most recently created task bound to the sandbox.
    async fn get_task_by_sandbox_id(&self, sandbox_id: &str) -> Result<Option<Task>>;
    async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;
    /// RUNNING tasks whose `updated_at` precedes `threshold`, oldest first.
    async fn get_tasks_exceeding_update_time(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>>;
    /// Moves RUNNING tasks and RUNNING topics bound to any of `sandbox_ids`
    /// to `status`, in one transaction.
    async fn update_task_status_by_sandbox_ids(
        &self,
        sandbox_ids: &[String],
        status: TaskStatus,
        err_msg: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<SandboxSyncCount>;
    /// Marks RUNNING tasks last updated before `threshold` as ERROR and
    /// mirrors the status onto topics pointing at them. Returns the task count.
    async fn update_stale_running_tasks(
        &self,
        threshold: DateTime<Utc>,
        err_msg: &str,
        at: DateTime<Utc>,
    ) -> Result<u64>;
    /// Returns false, without touching the row, when the task is RUNNING or
    /// absent.
    async fn delete_task(&self, id: &str) -> Result<bool>;
    async fn count_tasks_by_topic(&self, topic_id: &str) -> Result<i64>;
    async fn bind_remote_task_id(&self, task_id: &str, remote_task_id: &str) -> Result<bool>;

    async fn create_topic(&self, topic: &Topic) -> Result<()>;
    async fn get_topic_by_id(&self, id: &str) -> Result<Option<Topic>>;
    async fn update_topic(&self, topic: &Topic) -> Result<bool>;
    async fn get_user_running_topics(&self, user_id: &str) -> Result<Vec<Topic>>;
    async fn get_users_with_running_topics(&self) -> Result<Vec<String>>;

    /// Inserts `task` and writes `topic` atomically.
    async fn commit_new_task(&self, task: &Task, topic: &Topic) -> Result<()>;
    /// Loads topic and task, checks the transition, and writes both.
    async fn commit_status_change(
        &self,
        topic_id: &str,
        task_id: &str,
        change: &StatusChange,
    ) -> Result<StatusChangeOutcome>;
}
