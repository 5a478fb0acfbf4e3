use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::error::{HypervisorError, Result};
use crate::lifecycle::TaskLifecycleManager;

/// Error message stored on tasks swept for inactivity.
pub const STALE_TASK_REASON: &str = "Task timed out without progress";

/// Time-based safety net: RUNNING tasks that have not been touched for
/// `max_age` are moved to ERROR. Never calls the gateway.
pub struct StaleTaskSweeper {
    lifecycle: Arc<TaskLifecycleManager>,
    max_age: Duration,
    log_limit: i64,
}

impl StaleTaskSweeper {
    pub fn new(lifecycle: Arc<TaskLifecycleManager>, max_age: Duration, log_limit: i64) -> Self {
        Self {
            lifecycle,
            max_age,
            log_limit,
        }
    }

    /// Sweep relative to `now`. Returns the number of tasks marked ERROR.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<u64> {
        let max_age = chrono::Duration::from_std(self.max_age).map_err(|e| {
            HypervisorError::IllegalOperation(format!("stale task max age out of range: {e}"))
        })?;
        let threshold = now - max_age;

        let stale = self
            .lifecycle
            .get_tasks_exceeding_update_time(threshold, self.log_limit)
            .await?;
        if stale.is_empty() {
            return Ok(0);
        }
        for task in &stale {
            warn!(
                task_id = %task.id,
                topic_id = %task.topic_id,
                sandbox_id = %task.sandbox_id,
                updated_at = %task.updated_at,
                "sweeping stale running task"
            );
        }

        let swept = self
            .lifecycle
            .update_stale_running_tasks(threshold, STALE_TASK_REASON)
            .await?;
        info!(swept, %threshold, "stale task sweep finished");
        Ok(swept)
    }

    /// Background task: sweep every `period`.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // first tick is immediate; skip it
        loop {
            interval.tick().await;
            if let Err(e) = self.sweep_once(Utc::now()).await {
                error!("stale task sweep failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use shared_types::TaskStatus;

    use super::*;
    use crate::ids::UlidGenerator;
    use crate::repository::Repository;
    use crate::testing::{sample_task, sample_topic, test_repository};

    #[tokio::test]
    async fn test_sweep_marks_only_old_running_tasks() {
        let repo = test_repository().await;
        let now = Utc::now();

        let mut topic = sample_topic("topic-1", "user-1", "sbx-1");
        topic.current_task_id = Some("old".to_string());
        topic.current_task_status = Some(TaskStatus::Running);
        repo.create_topic(&topic).await.unwrap();

        let mut old = sample_task("old", "topic-1", TaskStatus::Running);
        old.updated_at = now - chrono::Duration::hours(4);
        repo.create_task(&old).await.unwrap();

        let mut recent = sample_task("recent", "topic-2", TaskStatus::Running);
        recent.updated_at = now - chrono::Duration::minutes(10);
        repo.create_task(&recent).await.unwrap();

        let mut old_waiting = sample_task("old-waiting", "topic-3", TaskStatus::Waiting);
        old_waiting.updated_at = now - chrono::Duration::hours(4);
        repo.create_task(&old_waiting).await.unwrap();

        let lifecycle = Arc::new(TaskLifecycleManager::new(
            repo.clone(),
            Arc::new(UlidGenerator::new()),
        ));
        let sweeper = StaleTaskSweeper::new(lifecycle, Duration::from_secs(3 * 3600), 100);

        assert_eq!(sweeper.sweep_once(now).await.unwrap(), 1);

        let old = repo.get_task_by_id("old").await.unwrap().unwrap();
        assert_eq!(old.status, TaskStatus::Error);
        assert_eq!(old.err_msg.as_deref(), Some(STALE_TASK_REASON));
        let topic = repo.get_topic_by_id("topic-1").await.unwrap().unwrap();
        assert_eq!(topic.current_task_status, Some(TaskStatus::Error));

        let recent = repo.get_task_by_id("recent").await.unwrap().unwrap();
        assert_eq!(recent.status, TaskStatus::Running);
        let waiting = repo.get_task_by_id("old-waiting").await.unwrap().unwrap();
        assert_eq!(waiting.status, TaskStatus::Waiting);

        // Nothing left to sweep.
        assert_eq!(sweeper.sweep_once(now).await.unwrap(), 0);
    }
}
