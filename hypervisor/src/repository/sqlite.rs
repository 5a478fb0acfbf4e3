use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared_types::{Task, TaskStatus, Topic};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};

use super::{Repository, SandboxSyncCount, StatusChange, StatusChangeOutcome};
use crate::error::{HypervisorError, Result};

const TASK_COLUMNS: &str = "id, topic_id, project_id, workspace_id, user_id, sandbox_id, \
     remote_task_id, prompt, attachments, mentions, task_mode, work_dir, status, err_msg, \
     created_at, updated_at";

const TOPIC_COLUMNS: &str = "id, user_id, workspace_id, project_id, sandbox_id, current_task_id, \
     current_task_status, task_mode, topic_mode, work_dir, updated_at, updated_uid";

/// SQLite-backed repository over the hypervisor's `SqlitePool`.
///
/// Timestamps are stored as Unix milliseconds so range predicates compare
/// integers rather than formatted strings.
#[derive(Debug, Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> std::result::Result<DateTime<Utc>, sqlx::Error> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| sqlx::Error::Decode(format!("invalid timestamp {ms}").into()))
}

fn parse_status(raw: &str) -> std::result::Result<TaskStatus, sqlx::Error> {
    raw.parse::<TaskStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn task_from_row(row: &SqliteRow) -> std::result::Result<Task, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Task {
        id: row.try_get("id")?,
        topic_id: row.try_get("topic_id")?,
        project_id: row.try_get("project_id")?,
        workspace_id: row.try_get("workspace_id")?,
        user_id: row.try_get("user_id")?,
        sandbox_id: row.try_get("sandbox_id")?,
        remote_task_id: row.try_get("remote_task_id")?,
        prompt: row.try_get("prompt")?,
        attachments: row.try_get("attachments")?,
        mentions: row.try_get("mentions")?,
        task_mode: row.try_get("task_mode")?,
        work_dir: row.try_get("work_dir")?,
        status: parse_status(&status)?,
        err_msg: row.try_get("err_msg")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn topic_from_row(row: &SqliteRow) -> std::result::Result<Topic, sqlx::Error> {
    let current_task_status: Option<String> = row.try_get("current_task_status")?;
    Ok(Topic {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        workspace_id: row.try_get("workspace_id")?,
        project_id: row.try_get("project_id")?,
        sandbox_id: row.try_get("sandbox_id")?,
        current_task_id: row.try_get("current_task_id")?,
        current_task_status: current_task_status
            .as_deref()
            .map(parse_status)
            .transpose()?,
        task_mode: row.try_get("task_mode")?,
        topic_mode: row.try_get("topic_mode")?,
        work_dir: row.try_get("work_dir")?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
        updated_uid: row.try_get("updated_uid")?,
    })
}

async fn insert_task(conn: &mut SqliteConnection, task: &Task) -> std::result::Result<(), sqlx::Error> {
    let sql = format!(
        "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    sqlx::query(&sql)
        .bind(&task.id)
        .bind(&task.topic_id)
        .bind(&task.project_id)
        .bind(&task.workspace_id)
        .bind(&task.user_id)
        .bind(&task.sandbox_id)
        .bind(&task.remote_task_id)
        .bind(&task.prompt)
        .bind(&task.attachments)
        .bind(&task.mentions)
        .bind(&task.task_mode)
        .bind(&task.work_dir)
        .bind(task.status.as_str())
        .bind(&task.err_msg)
        .bind(millis(task.created_at))
        .bind(millis(task.updated_at))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn update_task_row(conn: &mut SqliteConnection, task: &Task) -> std::result::Result<u64, sqlx::Error> {
    let rows = sqlx::query(
        "UPDATE tasks SET sandbox_id = ?, remote_task_id = ?, prompt = ?, attachments = ?,
             mentions = ?, task_mode = ?, work_dir = ?, status = ?, err_msg = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(&task.sandbox_id)
    .bind(&task.remote_task_id)
    .bind(&task.prompt)
    .bind(&task.attachments)
    .bind(&task.mentions)
    .bind(&task.task_mode)
    .bind(&task.work_dir)
    .bind(task.status.as_str())
    .bind(&task.err_msg)
    .bind(millis(task.updated_at))
    .bind(&task.id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows)
}

async fn update_topic_row(conn: &mut SqliteConnection, topic: &Topic) -> std::result::Result<u64, sqlx::Error> {
    let rows = sqlx::query(
        "UPDATE topics SET workspace_id = ?, project_id = ?, sandbox_id = ?, current_task_id = ?,
             current_task_status = ?, task_mode = ?, topic_mode = ?, work_dir = ?,
             updated_at = ?, updated_uid = ?
         WHERE id = ?",
    )
    .bind(&topic.workspace_id)
    .bind(&topic.project_id)
    .bind(&topic.sandbox_id)
    .bind(&topic.current_task_id)
    .bind(topic.current_task_status.map(|s| s.as_str()))
    .bind(&topic.task_mode)
    .bind(&topic.topic_mode)
    .bind(&topic.work_dir)
    .bind(millis(topic.updated_at))
    .bind(&topic.updated_uid)
    .bind(&topic.id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows)
}

async fn fetch_task(conn: &mut SqliteConnection, id: &str) -> std::result::Result<Option<Task>, sqlx::Error> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
    sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| task_from_row(&row))
        .transpose()
}

async fn fetch_topic(conn: &mut SqliteConnection, id: &str) -> std::result::Result<Option<Topic>, sqlx::Error> {
    let sql = format!("SELECT {TOPIC_COLUMNS} FROM topics WHERE id = ?");
    sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| topic_from_row(&row))
        .transpose()
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_task(&mut conn, task).await?;
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        update_task_row(&mut conn, task).await?;
        Ok(())
    }

    async fn get_task_by_id(&self, id: &str) -> Result<Option<Task>> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_task(&mut conn, id).await?)
    }

    async fn get_task_by_sandbox_id(&self, sandbox_id: &str) -> Result<Option<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE sandbox_id = ?
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let task = sqlx::query(&sql)
            .bind(sandbox_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| task_from_row(&row))
            .transpose()?;
        Ok(task)
    }

    async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(task_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn get_tasks_exceeding_update_time(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'running' AND updated_at < ?
             ORDER BY updated_at ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(millis(threshold))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(task_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn update_task_status_by_sandbox_ids(
        &self,
        sandbox_ids: &[String],
        status: TaskStatus,
        err_msg: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<SandboxSyncCount> {
        if sandbox_ids.is_empty() {
            return Ok(SandboxSyncCount::default());
        }
        let marks = placeholders(sandbox_ids.len());
        let mut tx = self.pool.begin().await?;

        let topic_sql = format!(
            "UPDATE topics SET current_task_status = ?, updated_at = ?
             WHERE current_task_status = 'running' AND sandbox_id IN ({marks})"
        );
        let mut query = sqlx::query(&topic_sql)
            .bind(status.as_str())
            .bind(millis(at));
        for id in sandbox_ids {
            query = query.bind(id.as_str());
        }
        let topics = query.execute(&mut *tx).await?.rows_affected();

        let task_sql = format!(
            "UPDATE tasks SET status = ?, err_msg = COALESCE(?, err_msg), updated_at = ?
             WHERE status = 'running' AND sandbox_id IN ({marks})"
        );
        let mut query = sqlx::query(&task_sql)
            .bind(status.as_str())
            .bind(err_msg)
            .bind(millis(at));
        for id in sandbox_ids {
            query = query.bind(id.as_str());
        }
        let tasks = query.execute(&mut *tx).await?.rows_affected();

        tx.commit().await?;
        Ok(SandboxSyncCount { topics, tasks })
    }

    async fn update_stale_running_tasks(
        &self,
        threshold: DateTime<Utc>,
        err_msg: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE topics SET current_task_status = 'error', updated_at = ?
             WHERE current_task_id IN (
                 SELECT id FROM tasks WHERE status = 'running' AND updated_at < ?
             )",
        )
        .bind(millis(at))
        .bind(millis(threshold))
        .execute(&mut *tx)
        .await?;

        let tasks = sqlx::query(
            "UPDATE tasks SET status = 'error', err_msg = ?, updated_at = ?
             WHERE status = 'running' AND updated_at < ?",
        )
        .bind(err_msg)
        .bind(millis(at))
        .bind(millis(threshold))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(tasks)
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM tasks WHERE id = ? AND status != 'running'")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    async fn count_tasks_by_topic(&self, topic_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE topic_id = ?")
            .bind(topic_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn bind_remote_task_id(&self, task_id: &str, remote_task_id: &str) -> Result<bool> {
        let rows = sqlx::query("UPDATE tasks SET remote_task_id = ? WHERE id = ?")
            .bind(remote_task_id)
            .bind(task_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    async fn create_topic(&self, topic: &Topic) -> Result<()> {
        let sql = format!(
            "INSERT INTO topics ({TOPIC_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(&topic.id)
            .bind(&topic.user_id)
            .bind(&topic.workspace_id)
            .bind(&topic.project_id)
            .bind(&topic.sandbox_id)
            .bind(&topic.current_task_id)
            .bind(topic.current_task_status.map(|s| s.as_str()))
            .bind(&topic.task_mode)
            .bind(&topic.topic_mode)
            .bind(&topic.work_dir)
            .bind(millis(topic.updated_at))
            .bind(&topic.updated_uid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_topic_by_id(&self, id: &str) -> Result<Option<Topic>> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_topic(&mut conn, id).await?)
    }

    async fn update_topic(&self, topic: &Topic) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(update_topic_row(&mut conn, topic).await? > 0)
    }

    async fn get_user_running_topics(&self, user_id: &str) -> Result<Vec<Topic>> {
        let sql = format!(
            "SELECT {TOPIC_COLUMNS} FROM topics
             WHERE user_id = ? AND current_task_status = 'running' ORDER BY id"
        );
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(topic_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn get_users_with_running_topics(&self) -> Result<Vec<String>> {
        let users: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT user_id FROM topics WHERE current_task_status = 'running' ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    async fn commit_new_task(&self, task: &Task, topic: &Topic) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_task(&mut tx, task).await?;
        if update_topic_row(&mut tx, topic).await? == 0 {
            return Err(HypervisorError::not_found("topic", &topic.id));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn commit_status_change(
        &self,
        topic_id: &str,
        task_id: &str,
        change: &StatusChange,
    ) -> Result<StatusChangeOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(mut topic) = fetch_topic(&mut tx, topic_id).await? else {
            return Ok(StatusChangeOutcome::TopicMissing);
        };
        let Some(mut task) = fetch_task(&mut tx, task_id).await? else {
            return Ok(StatusChangeOutcome::TaskMissing);
        };
        if !task.status.can_transition_to(change.status) {
            return Ok(StatusChangeOutcome::Rejected {
                from: task.status,
                to: change.status,
            });
        }

        task.status = change.status;
        if !change.sandbox_id.is_empty() {
            task.sandbox_id = change.sandbox_id.clone();
            topic.sandbox_id = change.sandbox_id.clone();
        }
        if let Some(msg) = &change.err_msg {
            task.err_msg = Some(msg.clone());
        }
        task.updated_at = change.at;
        update_task_row(&mut tx, &task).await?;

        topic.current_task_id = Some(task.id.clone());
        topic.current_task_status = Some(change.status);
        topic.updated_at = change.at;
        topic.updated_uid = change.updated_uid.clone();
        update_topic_row(&mut tx, &topic).await?;

        tx.commit().await?;
        Ok(StatusChangeOutcome::Applied { task, topic })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::testing::{sample_task, sample_topic, test_repository};

    #[tokio::test]
    async fn test_create_and_fetch_task() {
        let repo = test_repository().await;
        let task = sample_task("task-1", "topic-1", TaskStatus::Waiting);
        repo.create_task(&task).await.unwrap();

        let loaded = repo.get_task_by_id("task-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.status, TaskStatus::Waiting);
        assert_eq!(loaded.created_at.timestamp_millis(), task.created_at.timestamp_millis());
        assert!(repo.get_task_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_status_change_mirrors_topic() {
        let repo = test_repository().await;
        repo.create_topic(&sample_topic("topic-1", "user-1", "")).await.unwrap();
        repo.create_task(&sample_task("task-1", "topic-1", TaskStatus::Waiting))
            .await
            .unwrap();

        let change = StatusChange {
            status: TaskStatus::Running,
            sandbox_id: "sbx-1".to_string(),
            err_msg: None,
            updated_uid: "user-1".to_string(),
            at: Utc::now(),
        };
        let outcome = repo
            .commit_status_change("topic-1", "task-1", &change)
            .await
            .unwrap();
        let StatusChangeOutcome::Applied { task, topic } = outcome else {
            panic!("expected applied, got {outcome:?}");
        };
        assert_eq!(task.sandbox_id, "sbx-1");
        assert_eq!(topic.current_task_status, Some(TaskStatus::Running));
        assert_eq!(topic.current_task_id.as_deref(), Some("task-1"));

        let stored = repo.get_topic_by_id("topic-1").await.unwrap().unwrap();
        assert_eq!(stored.sandbox_id, "sbx-1");
        assert_eq!(stored.current_task_status, Some(TaskStatus::Running));
    }

    #[tokio::test]
    async fn test_commit_status_change_rejects_leaving_terminal_state() {
        let repo = test_repository().await;
        repo.create_topic(&sample_topic("topic-1", "user-1", "sbx-1")).await.unwrap();
        repo.create_task(&sample_task("task-1", "topic-1", TaskStatus::Error))
            .await
            .unwrap();

        let change = StatusChange {
            status: TaskStatus::Running,
            sandbox_id: "sbx-1".to_string(),
            err_msg: None,
            updated_uid: "user-1".to_string(),
            at: Utc::now(),
        };
        let outcome = repo
            .commit_status_change("topic-1", "task-1", &change)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StatusChangeOutcome::Rejected {
                from: TaskStatus::Error,
                to: TaskStatus::Running
            }
        );
        let task = repo.get_task_by_id("task-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);

        let outcome = repo
            .commit_status_change("no-topic", "task-1", &change)
            .await
            .unwrap();
        assert_eq!(outcome, StatusChangeOutcome::TopicMissing);
    }

    #[tokio::test]
    async fn test_commit_new_task_rolls_back_without_topic() {
        let repo = test_repository().await;
        let task = sample_task("task-1", "missing-topic", TaskStatus::Waiting);
        let topic = sample_topic("missing-topic", "user-1", "");

        let err = repo.commit_new_task(&task, &topic).await.unwrap_err();
        assert!(matches!(err, HypervisorError::NotFound { entity: "topic", .. }));
        assert!(repo.get_task_by_id("task-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_refuses_running_task() {
        let repo = test_repository().await;
        repo.create_task(&sample_task("running", "topic-1", TaskStatus::Running))
            .await
            .unwrap();
        repo.create_task(&sample_task("done", "topic-1", TaskStatus::Suspended))
            .await
            .unwrap();

        assert!(!repo.delete_task("running").await.unwrap());
        assert!(repo.get_task_by_id("running").await.unwrap().is_some());
        assert!(repo.delete_task("done").await.unwrap());
        assert!(repo.get_task_by_id("done").await.unwrap().is_none());
        assert!(!repo.delete_task("done").await.unwrap());
    }

    #[tokio::test]
    async fn test_sandbox_sync_only_touches_running_rows() {
        let repo = test_repository().await;
        let mut live = sample_topic("topic-live", "user-1", "sbx-live");
        live.current_task_id = Some("task-live".to_string());
        live.current_task_status = Some(TaskStatus::Running);
        repo.create_topic(&live).await.unwrap();

        let mut task = sample_task("task-live", "topic-live", TaskStatus::Running);
        task.sandbox_id = "sbx-live".to_string();
        repo.create_task(&task).await.unwrap();

        let mut old = sample_task("task-old", "topic-live", TaskStatus::Error);
        old.sandbox_id = "sbx-live".to_string();
        old.err_msg = Some("boom".to_string());
        repo.create_task(&old).await.unwrap();

        let count = repo
            .update_task_status_by_sandbox_ids(
                &["sbx-live".to_string()],
                TaskStatus::Suspended,
                Some("Synchronize sandbox status"),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(count, SandboxSyncCount { topics: 1, tasks: 1 });

        let old = repo.get_task_by_id("task-old").await.unwrap().unwrap();
        assert_eq!(old.status, TaskStatus::Error);
        assert_eq!(old.err_msg.as_deref(), Some("boom"));
        let topic = repo.get_topic_by_id("topic-live").await.unwrap().unwrap();
        assert_eq!(topic.current_task_status, Some(TaskStatus::Suspended));

        let none = repo
            .update_task_status_by_sandbox_ids(&[], TaskStatus::Suspended, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(none, SandboxSyncCount::default());
    }

    #[tokio::test]
    async fn test_stale_running_tasks_marked_error() {
        let repo = test_repository().await;
        let now = Utc::now();

        let mut topic = sample_topic("topic-1", "user-1", "sbx-1");
        topic.current_task_id = Some("stale".to_string());
        topic.current_task_status = Some(TaskStatus::Running);
        repo.create_topic(&topic).await.unwrap();

        let mut stale = sample_task("stale", "topic-1", TaskStatus::Running);
        stale.updated_at = now - Duration::hours(5);
        repo.create_task(&stale).await.unwrap();

        let mut fresh = sample_task("fresh", "topic-2", TaskStatus::Running);
        fresh.updated_at = now - Duration::minutes(5);
        repo.create_task(&fresh).await.unwrap();

        let threshold = now - Duration::hours(3);
        let exceeding = repo
            .get_tasks_exceeding_update_time(threshold, 10)
            .await
            .unwrap();
        assert_eq!(exceeding.len(), 1);
        assert_eq!(exceeding[0].id, "stale");

        let updated = repo
            .update_stale_running_tasks(threshold, "stale", now)
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let stale = repo.get_task_by_id("stale").await.unwrap().unwrap();
        assert_eq!(stale.status, TaskStatus::Error);
        let fresh = repo.get_task_by_id("fresh").await.unwrap().unwrap();
        assert_eq!(fresh.status, TaskStatus::Running);
        let topic = repo.get_topic_by_id("topic-1").await.unwrap().unwrap();
        assert_eq!(topic.current_task_status, Some(TaskStatus::Error));
    }

    #[tokio::test]
    async fn test_running_topics_and_counts() {
        let repo = test_repository().await;
        let mut a = sample_topic("topic-a", "user-1", "sbx-a");
        a.current_task_status = Some(TaskStatus::Running);
        let mut b = sample_topic("topic-b", "user-2", "sbx-b");
        b.current_task_status = Some(TaskStatus::Running);
        let c = sample_topic("topic-c", "user-1", "sbx-c");
        for topic in [&a, &b, &c] {
            repo.create_topic(topic).await.unwrap();
        }

        let running = repo.get_user_running_topics("user-1").await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "topic-a");
        assert_eq!(
            repo.get_users_with_running_topics().await.unwrap(),
            vec!["user-1".to_string(), "user-2".to_string()]
        );

        repo.create_task(&sample_task("t1", "topic-a", TaskStatus::Error))
            .await
            .unwrap();
        repo.create_task(&sample_task("t2", "topic-a", TaskStatus::Waiting))
            .await
            .unwrap();
        assert_eq!(repo.count_tasks_by_topic("topic-a").await.unwrap(), 2);
        assert!(repo.bind_remote_task_id("t2", "agent-77").await.unwrap());
        let t2 = repo.get_task_by_id("t2").await.unwrap().unwrap();
        assert_eq!(t2.remote_task_id, "agent-77");
    }

    #[tokio::test]
    async fn test_update_rows_and_lookups() {
        let repo = test_repository().await;
        let now = Utc::now();

        let mut older = sample_task("older", "topic-1", TaskStatus::Error);
        older.sandbox_id = "sbx-1".to_string();
        older.created_at = now - Duration::minutes(10);
        repo.create_task(&older).await.unwrap();
        let mut newer = sample_task("newer", "topic-1", TaskStatus::Waiting);
        newer.sandbox_id = "sbx-1".to_string();
        repo.create_task(&newer).await.unwrap();

        newer.status = TaskStatus::Running;
        newer.prompt = "revised prompt".to_string();
        repo.update_task(&newer).await.unwrap();

        let latest = repo.get_task_by_sandbox_id("sbx-1").await.unwrap().unwrap();
        assert_eq!(latest.id, "newer");
        assert_eq!(latest.prompt, "revised prompt");
        assert!(repo.get_task_by_sandbox_id("sbx-none").await.unwrap().is_none());

        let running = repo.get_tasks_by_status(TaskStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "newer");
        assert!(repo
            .get_tasks_by_status(TaskStatus::Suspended)
            .await
            .unwrap()
            .is_empty());

        let mut topic = sample_topic("topic-1", "user-1", "");
        repo.create_topic(&topic).await.unwrap();
        topic.sandbox_id = "sbx-1".to_string();
        topic.topic_mode = "data_analysis".to_string();
        assert!(repo.update_topic(&topic).await.unwrap());
        let stored = repo.get_topic_by_id("topic-1").await.unwrap().unwrap();
        assert_eq!(stored.sandbox_id, "sbx-1");
        assert_eq!(stored.topic_mode, "data_analysis");
        assert!(!repo
            .update_topic(&sample_topic("missing", "user-1", ""))
            .await
            .unwrap());
    }
}
