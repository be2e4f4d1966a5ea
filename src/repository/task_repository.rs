use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use super::{parse_datetime, parse_datetime_opt};
use crate::domain::{Task, TaskStatus};

pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a task in `created` state. Returns the task ID.
    pub async fn create(&self, hypothesis: &str) -> Result<String> {
        let id = format!("t_{}", uuid::Uuid::new_v4().simple());
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO tasks (id, hypothesis, status, created_at) VALUES (?, ?, 'created', ?)",
        )
        .bind(&id)
        .bind(hypothesis)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to create task")?;

        log::info!("Created task {} for hypothesis: {}", id, hypothesis);
        Ok(id)
    }

    pub async fn get_by_id(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(
            "SELECT id, hypothesis, status, created_at, completed_at, result_summary
             FROM tasks WHERE id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch task")?;

        Ok(row.map(|row| Task {
            id: row.get("id"),
            hypothesis: row.get("hypothesis"),
            status: TaskStatus::from_str(row.get::<&str, _>("status"))
                .unwrap_or(TaskStatus::Created),
            created_at: parse_datetime(row.get("created_at")),
            completed_at: parse_datetime_opt(row.get::<Option<&str>, _>("completed_at")),
            result_summary: row.get("result_summary"),
        }))
    }

    pub async fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let completed_at = if status.is_terminal() {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };

        sqlx::query(
            "UPDATE tasks SET status = ?, completed_at = COALESCE(?, completed_at) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .context("Failed to update task status")?;

        log::info!("Task {} -> {}", task_id, status);
        Ok(())
    }

    /// Flip created/paused tasks back to exploring when new work arrives.
    pub async fn mark_exploring(&self, task_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = 'exploring'
             WHERE id = ? AND status IN ('created', 'paused')",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark task exploring")?;
        Ok(())
    }

    /// Delete a task and everything it owns (cascade).
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete task")?;
        log::info!("Deleted task {}", task_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClaimGranularity, ClaimPolarity, ClaimType, QueryCategory};
    use crate::repository::{ClaimRepository, PageRepository, SearchRepository};

    #[tokio::test]
    async fn lifecycle_transitions_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let tasks = TaskRepository::new(pool);

        let id = tasks.create("does X hold").await.unwrap();
        assert_eq!(
            tasks.get_by_id(&id).await.unwrap().unwrap().status,
            TaskStatus::Created
        );

        tasks.mark_exploring(&id).await.unwrap();
        assert_eq!(
            tasks.get_by_id(&id).await.unwrap().unwrap().status,
            TaskStatus::Exploring
        );

        // mark_exploring only lifts created/paused states.
        tasks.update_status(&id, TaskStatus::Completed).await.unwrap();
        tasks.mark_exploring(&id).await.unwrap();
        let task = tasks.get_by_id(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn delete_cascades_owned_rows_but_not_shared_pages() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;

        let tasks = TaskRepository::new(pool.clone());
        let claims = ClaimRepository::new(pool.clone());
        let searches = SearchRepository::new(pool.clone());
        let pages = PageRepository::new(pool.clone());

        let task_id = tasks.create("owned rows").await.unwrap();
        claims
            .insert(
                &task_id,
                "claim text",
                ClaimType::Factual,
                ClaimPolarity::Positive,
                ClaimGranularity::Atomic,
                None,
                "owned rows",
                &[],
                &[],
                0.9,
            )
            .await
            .unwrap();
        searches
            .insert_query(&task_id, "q", "q", QueryCategory::General, None)
            .await
            .unwrap();

        // Pages are shared, not owned.
        let url = url::Url::parse("https://example.com/shared").unwrap();
        pages.upsert(&url, Some("Shared"), None, None).await.unwrap();

        tasks.delete(&task_id).await.unwrap();

        assert!(claims.for_task(&task_id).await.unwrap().is_empty());
        let remaining_queries: i64 =
            sqlx::query("SELECT COUNT(*) AS cnt FROM queries WHERE task_id = ?")
                .bind(&task_id)
                .fetch_one(&pool)
                .await
                .map(|r| r.get("cnt"))
                .unwrap();
        assert_eq!(remaining_queries, 0);

        let page_id = crate::repository::page_id_for_url(url.as_str());
        assert!(pages.get_by_id(&page_id).await.unwrap().is_some());
    }
}
