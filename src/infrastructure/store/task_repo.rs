//! Scheduled task persistence.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{fmt_datetime, parse_datetime};
use crate::domain::errors::{GatewayError, GatewayResult};
use crate::domain::models::schedule::Schedule;
use crate::domain::models::task::{ScheduledTask, TaskRunStatus, TaskStatus};

pub struct TaskRepo {
    pool: SqlitePool,
}

impl TaskRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> GatewayResult<ScheduledTask> {
        let schedule_json: String = row.get("schedule_json");
        let schedule: Schedule = serde_json::from_str(&schedule_json)?;
        let status_str: String = row.get("status");
        let status = TaskStatus::from_str(&status_str)
            .ok_or_else(|| GatewayError::Store(format!("bad task status '{status_str}'")))?;
        let last_status = row
            .get::<Option<String>, _>("last_status")
            .and_then(|s| match s.as_str() {
                "success" => Some(TaskRunStatus::Success),
                "error" => Some(TaskRunStatus::Error),
                _ => None,
            });

        Ok(ScheduledTask {
            id: Uuid::parse_str(row.get::<String, _>("id").as_str())
                .map_err(|e| GatewayError::Store(e.to_string()))?,
            agent_id: row.get("agent_id"),
            name: row.get("name"),
            schedule,
            prompt: row.get("prompt"),
            status,
            last_status,
            last_error: row.get("last_error"),
            last_run_at: row
                .get::<Option<String>, _>("last_run_at")
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            next_run_at: row
                .get::<Option<String>, _>("next_run_at")
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            created_at: parse_datetime(row.get::<String, _>("created_at").as_str())?,
            updated_at: parse_datetime(row.get::<String, _>("updated_at").as_str())?,
        })
    }

    pub async fn insert(&self, task: &ScheduledTask) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO tasks (id, agent_id, name, schedule_json, prompt, status,
                                last_status, last_error, last_run_at, next_run_at,
                                created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string())
        .bind(&task.agent_id)
        .bind(&task.name)
        .bind(serde_json::to_string(&task.schedule)?)
        .bind(&task.prompt)
        .bind(task.status.as_str())
        .bind(task.last_status.map(|s| s.as_str()))
        .bind(&task.last_error)
        .bind(task.last_run_at.map(fmt_datetime))
        .bind(task.next_run_at.map(fmt_datetime))
        .bind(fmt_datetime(task.created_at))
        .bind(fmt_datetime(task.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> GatewayResult<Option<ScheduledTask>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    pub async fn list(&self, agent_id: Option<&str>) -> GatewayResult<Vec<ScheduledTask>> {
        let rows = match agent_id {
            Some(agent) => {
                sqlx::query("SELECT * FROM tasks WHERE agent_id = ? ORDER BY created_at")
                    .bind(agent)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM tasks ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_task).collect()
    }

    /// Active tasks whose `next_run_at` is at or before `now`.
    pub async fn list_due(&self, now: DateTime<Utc>) -> GatewayResult<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks
             WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ?
             ORDER BY next_run_at",
        )
        .bind(fmt_datetime(now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    /// Record the outcome of a fire and advance the task.
    pub async fn record_fire(
        &self,
        id: Uuid,
        status: TaskStatus,
        last_status: TaskRunStatus,
        last_error: Option<&str>,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> GatewayResult<()> {
        sqlx::query(
            "UPDATE tasks SET status = ?, last_status = ?, last_error = ?,
                              last_run_at = ?, next_run_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(last_status.as_str())
        .bind(last_error)
        .bind(fmt_datetime(last_run_at))
        .bind(next_run_at.map(fmt_datetime))
        .bind(fmt_datetime(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(&self, id: Uuid, status: TaskStatus) -> GatewayResult<()> {
        sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(fmt_datetime(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> GatewayResult<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::StoreConnection;

    async fn repo() -> TaskRepo {
        let db = StoreConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        TaskRepo::new(db.pool().clone())
    }

    fn cron_task(name: &str) -> ScheduledTask {
        ScheduledTask::new(
            "general",
            name,
            Schedule::Cron {
                cron_expr: "@daily".into(),
            },
            "check the news",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn insert_get_round_trip() {
        let repo = repo().await;
        let task = cron_task("news");
        repo.insert(&task).await.unwrap();

        let loaded = repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "news");
        assert_eq!(loaded.schedule, task.schedule);
        assert_eq!(loaded.status, TaskStatus::Active);
        assert_eq!(loaded.next_run_at, task.next_run_at);
    }

    #[tokio::test]
    async fn due_query_honors_next_run() {
        let repo = repo().await;
        let mut task = cron_task("due");
        task.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        repo.insert(&task).await.unwrap();

        let mut future = cron_task("future");
        future.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
        repo.insert(&future).await.unwrap();

        let due = repo.list_due(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "due");
    }

    #[tokio::test]
    async fn record_fire_advances_and_completes() {
        let repo = repo().await;
        let mut task = cron_task("once");
        task.schedule = Schedule::Once { at_ms: 1 };
        task.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        repo.insert(&task).await.unwrap();

        repo.record_fire(
            task.id,
            TaskStatus::Completed,
            TaskRunStatus::Success,
            None,
            Utc::now(),
            None,
        )
        .await
        .unwrap();

        let loaded = repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.next_run_at, None);
        assert_eq!(loaded.last_status, Some(TaskRunStatus::Success));
    }
}
