//! Task lifecycle: creation against a topic and every status mutation.
//!
//! All status writes go through [`TaskLifecycleManager::update_task_status`],
//! which writes the Task and mirrors the status onto its Topic in one
//! repository transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared_types::{truncate_err_msg, DataIsolation, NewTask, Task, TaskStatus, Topic};
use tracing::{debug, info, warn};

use crate::error::{HypervisorError, Result};
use crate::ids::IdGenerator;
use crate::orchestrator::DispatchGuard;
use crate::repository::{Repository, SandboxSyncCount, StatusChange, StatusChangeOutcome};

pub struct TaskLifecycleManager {
    repo: Arc<dyn Repository>,
    ids: Arc<dyn IdGenerator>,
}

impl TaskLifecycleManager {
    pub fn new(repo: Arc<dyn Repository>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { repo, ids }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Persist a fresh WAITING task and point the topic at it.
    ///
    /// Never resumes an earlier task; `topic` is updated in place to match
    /// what was written.
    pub async fn init_topic_task(
        &self,
        isolation: &DataIsolation,
        topic: &mut Topic,
        new_task: NewTask,
    ) -> Result<Task> {
        let now = Utc::now();
        let task = Task {
            id: self.ids.next_id(),
            topic_id: topic.id.clone(),
            project_id: new_task.project_id,
            workspace_id: new_task.workspace_id,
            user_id: isolation.user_id.clone(),
            sandbox_id: new_task.sandbox_id,
            remote_task_id: String::new(),
            prompt: new_task.prompt,
            attachments: new_task.attachments,
            mentions: new_task.mentions,
            task_mode: new_task.task_mode,
            work_dir: new_task.work_dir,
            status: TaskStatus::Waiting,
            err_msg: None,
            created_at: now,
            updated_at: now,
        };

        let mut updated = topic.clone();
        updated.current_task_id = Some(task.id.clone());
        updated.current_task_status = Some(TaskStatus::Waiting);
        updated.task_mode = task.task_mode.clone();
        updated.updated_at = now;
        updated.updated_uid = isolation.user_id.clone();

        self.repo.commit_new_task(&task, &updated).await?;
        *topic = updated;

        info!(
            user_id = %isolation.user_id,
            topic_id = %task.topic_id,
            task_id = %task.id,
            "task created"
        );
        Ok(task)
    }

    /// Move a task to `status` and mirror it onto the topic.
    ///
    /// `err_msg` is stored only for ERROR, truncated to the stored limit.
    /// An empty `sandbox_id` leaves the existing binding untouched.
    pub async fn update_task_status(
        &self,
        isolation: &DataIsolation,
        topic_id: &str,
        status: TaskStatus,
        task_id: &str,
        sandbox_id: &str,
        err_msg: Option<&str>,
    ) -> Result<bool> {
        let change = StatusChange {
            status,
            sandbox_id: sandbox_id.to_string(),
            err_msg: match (status, err_msg) {
                (TaskStatus::Error, Some(msg)) => Some(truncate_err_msg(msg)),
                _ => None,
            },
            updated_uid: isolation.user_id.clone(),
            at: Utc::now(),
        };

        match self
            .repo
            .commit_status_change(topic_id, task_id, &change)
            .await?
        {
            StatusChangeOutcome::Applied { .. } => {
                info!(
                    user_id = %isolation.user_id,
                    topic_id,
                    task_id,
                    sandbox_id,
                    %status,
                    "task status updated"
                );
                Ok(true)
            }
            StatusChangeOutcome::TopicMissing => Err(HypervisorError::IllegalOperation(format!(
                "topic {topic_id} does not exist"
            ))),
            StatusChangeOutcome::TaskMissing => Err(HypervisorError::IllegalOperation(format!(
                "task {task_id} does not exist"
            ))),
            StatusChangeOutcome::Rejected { from, to } => {
                warn!(topic_id, task_id, %from, %to, "rejected task status transition");
                Err(HypervisorError::IllegalOperation(format!(
                    "task {task_id} cannot move from {from} to {to}"
                )))
            }
        }
    }

    /// False, without touching the row, when the task is RUNNING or absent.
    pub async fn delete_task(&self, task_id: &str) -> Result<bool> {
        let deleted = self.repo.delete_task(task_id).await?;
        if deleted {
            info!(task_id, "task deleted");
        } else {
            debug!(task_id, "task not deleted (running or missing)");
        }
        Ok(deleted)
    }

    pub async fn update_stale_running_tasks(
        &self,
        threshold: DateTime<Utc>,
        err_msg: &str,
    ) -> Result<u64> {
        self.repo
            .update_stale_running_tasks(threshold, &truncate_err_msg(err_msg), Utc::now())
            .await
    }

    /// Force RUNNING tasks and topics bound to `sandbox_ids` to `status`,
    /// recording `reason` on the tasks.
    pub async fn update_task_status_by_sandbox_ids(
        &self,
        sandbox_ids: &[String],
        status: TaskStatus,
        reason: &str,
    ) -> Result<SandboxSyncCount> {
        let reason = truncate_err_msg(reason);
        self.repo
            .update_task_status_by_sandbox_ids(sandbox_ids, status, Some(&reason), Utc::now())
            .await
    }

    pub async fn bind_remote_task_id(&self, task_id: &str, remote_task_id: &str) -> Result<bool> {
        self.repo.bind_remote_task_id(task_id, remote_task_id).await
    }

    pub async fn get_topic(&self, topic_id: &str) -> Result<Topic> {
        self.repo
            .get_topic_by_id(topic_id)
            .await?
            .ok_or_else(|| HypervisorError::not_found("topic", topic_id))
    }

    pub async fn get_task_by_id(&self, task_id: &str) -> Result<Option<Task>> {
        self.repo.get_task_by_id(task_id).await
    }

    pub async fn get_tasks_exceeding_update_time(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>> {
        self.repo.get_tasks_exceeding_update_time(threshold, limit).await
    }

    pub async fn count_tasks_by_topic(&self, topic_id: &str) -> Result<i64> {
        self.repo.count_tasks_by_topic(topic_id).await
    }
}

/// A task is still worth dispatching while it exists and is not terminal.
#[async_trait]
impl DispatchGuard for TaskLifecycleManager {
    async fn should_dispatch(&self, task_id: &str) -> Result<bool> {
        Ok(self
            .repo
            .get_task_by_id(task_id)
            .await?
            .is_some_and(|task| !task.status.is_terminal()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use shared_types::{ERR_MSG_ELLIPSIS, MAX_ERR_MSG_CHARS};

    use super::*;
    use crate::ids::UlidGenerator;
    use crate::testing::{sample_isolation, sample_task, sample_topic, test_repository};

    async fn manager_with_topic(sandbox_id: &str) -> (TaskLifecycleManager, Topic) {
        let repo = test_repository().await;
        let topic = sample_topic("topic-1", "user-1", sandbox_id);
        repo.create_topic(&topic).await.unwrap();
        (
            TaskLifecycleManager::new(repo, Arc::new(UlidGenerator::new())),
            topic,
        )
    }

    fn new_task(prompt: &str) -> NewTask {
        NewTask {
            topic_id: "topic-1".to_string(),
            project_id: "project-1".to_string(),
            prompt: prompt.to_string(),
            task_mode: "chat".to_string(),
            ..NewTask::default()
        }
    }

    #[tokio::test]
    async fn test_init_topic_task_is_waiting_with_fresh_id() {
        let (manager, mut topic) = manager_with_topic("").await;
        let isolation = sample_isolation();

        let mut seen = HashSet::new();
        for i in 0..3 {
            let task = manager
                .init_topic_task(&isolation, &mut topic, new_task(&format!("prompt {i}")))
                .await
                .unwrap();
            assert_eq!(task.status, TaskStatus::Waiting);
            assert!(seen.insert(task.id.clone()), "task id reused");

            let stored = manager.get_topic("topic-1").await.unwrap();
            assert_eq!(stored.current_task_status, Some(TaskStatus::Waiting));
            assert_eq!(stored.current_task_id.as_deref(), Some(task.id.as_str()));
            assert_eq!(stored.updated_uid, isolation.user_id);
            assert_eq!(topic.current_task_id, stored.current_task_id);
        }
        assert_eq!(manager.count_tasks_by_topic("topic-1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_init_topic_task_for_missing_topic_is_not_found() {
        let (manager, _) = manager_with_topic("").await;
        let mut ghost = sample_topic("ghost", "user-1", "");

        let err = manager
            .init_topic_task(&sample_isolation(), &mut ghost, new_task("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::NotFound { .. }));
        assert_eq!(ghost.current_task_id, None);
    }

    #[tokio::test]
    async fn test_error_message_truncated_to_limit() {
        let (manager, mut topic) = manager_with_topic("").await;
        let isolation = sample_isolation();
        let task = manager
            .init_topic_task(&isolation, &mut topic, new_task("hi"))
            .await
            .unwrap();

        let source: String = "é".repeat(600);
        manager
            .update_task_status(&isolation, "topic-1", TaskStatus::Error, &task.id, "", Some(&source))
            .await
            .unwrap();

        let stored = manager.get_task_by_id(&task.id).await.unwrap().unwrap();
        let msg = stored.err_msg.unwrap();
        assert_eq!(msg.chars().count(), MAX_ERR_MSG_CHARS);
        assert!(msg.ends_with(ERR_MSG_ELLIPSIS));
        let kept: String = source.chars().take(MAX_ERR_MSG_CHARS - ERR_MSG_ELLIPSIS.len()).collect();
        assert!(msg.starts_with(&kept));
    }

    #[tokio::test]
    async fn test_error_message_ignored_for_non_error_status() {
        let (manager, mut topic) = manager_with_topic("").await;
        let isolation = sample_isolation();
        let task = manager
            .init_topic_task(&isolation, &mut topic, new_task("hi"))
            .await
            .unwrap();

        manager
            .update_task_status(&isolation, "topic-1", TaskStatus::Running, &task.id, "sbx-1", Some("noise"))
            .await
            .unwrap();

        let stored = manager.get_task_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.err_msg, None);
        assert_eq!(stored.sandbox_id, "sbx-1");
        assert_eq!(manager.get_topic("topic-1").await.unwrap().sandbox_id, "sbx-1");
    }

    #[tokio::test]
    async fn test_update_status_on_missing_entities_is_illegal() {
        let (manager, _) = manager_with_topic("").await;
        let isolation = sample_isolation();

        let err = manager
            .update_task_status(&isolation, "topic-1", TaskStatus::Running, "nope", "", None)
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::IllegalOperation(_)));

        let err = manager
            .update_task_status(&isolation, "nope", TaskStatus::Running, "nope", "", None)
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::IllegalOperation(_)));
    }

    #[tokio::test]
    async fn test_terminal_status_is_not_resumed() {
        let (manager, mut topic) = manager_with_topic("").await;
        let isolation = sample_isolation();
        let task = manager
            .init_topic_task(&isolation, &mut topic, new_task("hi"))
            .await
            .unwrap();

        manager
            .update_task_status(&isolation, "topic-1", TaskStatus::Suspended, &task.id, "", None)
            .await
            .unwrap();
        let err = manager
            .update_task_status(&isolation, "topic-1", TaskStatus::Running, &task.id, "", None)
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::IllegalOperation(_)));

        let stored = manager.get_task_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Suspended);
    }

    #[tokio::test]
    async fn test_delete_task_respects_running() {
        let repo = test_repository().await;
        repo.create_task(&sample_task("running", "topic-1", TaskStatus::Running))
            .await
            .unwrap();
        repo.create_task(&sample_task("waiting", "topic-1", TaskStatus::Waiting))
            .await
            .unwrap();
        let manager = TaskLifecycleManager::new(repo, Arc::new(UlidGenerator::new()));

        assert!(!manager.delete_task("running").await.unwrap());
        let running = manager.get_task_by_id("running").await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::Running);

        assert!(manager.delete_task("waiting").await.unwrap());
        assert!(manager.get_task_by_id("waiting").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_init_topic_task_copies_task_mode_to_topic() {
        let (manager, mut topic) = manager_with_topic("").await;
        let mut task = new_task("plan the migration");
        task.task_mode = "plan".to_string();

        manager
            .init_topic_task(&sample_isolation(), &mut topic, task)
            .await
            .unwrap();

        assert_eq!(topic.task_mode, "plan");
        assert_eq!(manager.get_topic("topic-1").await.unwrap().task_mode, "plan");
    }

    #[tokio::test]
    async fn test_stopped_task_is_not_dispatched() {
        let (manager, mut topic) = manager_with_topic("").await;
        let isolation = sample_isolation();
        let task = manager
            .init_topic_task(&isolation, &mut topic, new_task("hi"))
            .await
            .unwrap();
        assert!(manager.should_dispatch(&task.id).await.unwrap());

        manager
            .update_task_status(&isolation, "topic-1", TaskStatus::Suspended, &task.id, "", None)
            .await
            .unwrap();
        assert!(!manager.should_dispatch(&task.id).await.unwrap());
        assert!(!manager.should_dispatch("missing").await.unwrap());
    }
}
