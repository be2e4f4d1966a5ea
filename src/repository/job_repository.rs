//! Job queue persistence.
//!
//! The queue is the `jobs` table: workers pick by `(priority, queued_at,
//! rowid)` within a slot, and duplicate submissions are detected against
//! queued/running rows by a kind-specific key inside `input_json`.
//! State transitions are guarded so a job's state only advances.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use super::{parse_datetime, parse_datetime_opt};
use crate::domain::{Job, JobKind, JobState};

pub struct JobRepository {
    pool: SqlitePool,
}

impl JobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a queued job. Returns the job ID.
    pub async fn insert(
        &self,
        task_id: &str,
        kind: JobKind,
        priority: i64,
        input: &serde_json::Value,
        cause_id: Option<&str>,
    ) -> Result<String> {
        let id = format!("{}_{}", kind.id_prefix(), &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let now = Utc::now().to_rfc3339();
        let input_json = serde_json::to_string(input).context("Failed to encode job input")?;

        sqlx::query(
            "INSERT INTO jobs (id, task_id, kind, priority, slot, state, input_json, queued_at, cause_id)
             VALUES (?, ?, ?, ?, ?, 'queued', ?, ?, ?)",
        )
        .bind(&id)
        .bind(task_id)
        .bind(kind.as_str())
        .bind(priority)
        .bind(kind.slot())
        .bind(&input_json)
        .bind(&now)
        .bind(cause_id)
        .execute(&self.pool)
        .await
        .context("Failed to insert job")?;

        Ok(id)
    }

    /// Find a queued or running job with the same kind and dedup key.
    ///
    /// `key_path` is a JSON path into `input_json` (e.g. `$.query`).
    pub async fn find_duplicate(
        &self,
        task_id: &str,
        kind: JobKind,
        key_path: &str,
        key_value: &str,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT id FROM jobs
             WHERE task_id = ? AND kind = ?
               AND state IN ('queued', 'running')
               AND json_extract(input_json, ?) = ?",
        )
        .bind(task_id)
        .bind(kind.as_str())
        .bind(key_path)
        .bind(key_value)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check for duplicate job")?;

        Ok(row.map(|r| r.get("id")))
    }

    /// Find a queued or running job of a kind regardless of input (used for
    /// task-scoped kinds like verify_nli).
    pub async fn find_active_of_kind(&self, task_id: &str, kind: JobKind) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT id FROM jobs
             WHERE task_id = ? AND kind = ? AND state IN ('queued', 'running')",
        )
        .bind(task_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check for active job")?;

        Ok(row.map(|r| r.get("id")))
    }

    /// Next runnable job in a slot. Paused and failed tasks are skipped.
    pub async fn next_for_slot(&self, slot: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT j.id, j.task_id, j.kind, j.priority, j.slot, j.state, j.input_json,
                    j.queued_at, j.started_at, j.finished_at, j.cause_id, j.error
             FROM jobs j
             JOIN tasks t ON t.id = j.task_id
             WHERE j.slot = ? AND j.state = 'queued'
               AND t.status NOT IN ('paused', 'failed')
             ORDER BY j.priority ASC, j.queued_at ASC, j.rowid ASC
             LIMIT 1",
        )
        .bind(slot)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch next job")?;

        row.map(|r| row_to_job(&r)).transpose()
    }

    pub async fn get_by_id(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT id, task_id, kind, priority, slot, state, input_json,
                    queued_at, started_at, finished_at, cause_id, error
             FROM jobs WHERE id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch job")?;

        row.map(|r| row_to_job(&r)).transpose()
    }

    /// queued -> running. Returns false if the job was not in `queued`.
    pub async fn mark_running(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'running', started_at = ?
             WHERE id = ? AND state = 'queued'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark job running")?;

        Ok(result.rows_affected() == 1)
    }

    /// running -> done | failed. Returns false if the job was not running.
    pub async fn mark_finished(
        &self,
        job_id: &str,
        state: JobState,
        error: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(state.is_terminal());
        let result = sqlx::query(
            "UPDATE jobs SET state = ?, finished_at = ?, error = ?
             WHERE id = ? AND state = 'running'",
        )
        .bind(state.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark job finished")?;

        Ok(result.rows_affected() == 1)
    }

    /// Count of queued/running jobs for a task across all slots.
    pub async fn active_count_for_task(&self, task_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM jobs
             WHERE task_id = ? AND state IN ('queued', 'running')",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count active jobs")?;
        Ok(row.get("cnt"))
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let kind = JobKind::from_str(row.get::<&str, _>("kind"))
        .map_err(|_| anyhow::anyhow!("unknown job kind in row"))?;
    let state = JobState::from_str(row.get::<&str, _>("state"))
        .map_err(|_| anyhow::anyhow!("unknown job state in row"))?;
    let input: serde_json::Value = serde_json::from_str(row.get::<&str, _>("input_json"))
        .context("Malformed job input_json")?;

    Ok(Job {
        id: row.get("id"),
        task_id: row.get("task_id"),
        kind,
        priority: row.get("priority"),
        slot: row.get("slot"),
        state,
        input,
        queued_at: parse_datetime(row.get("queued_at")),
        started_at: parse_datetime_opt(row.get::<Option<&str>, _>("started_at")),
        finished_at: parse_datetime_opt(row.get::<Option<&str>, _>("finished_at")),
        cause_id: row.get("cause_id"),
        error: row.get("error"),
    })
}
