use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use super::parse_datetime;
use crate::domain::timeline::{ClaimTimeline, TimelineEvent};
use crate::domain::{Claim, ClaimGranularity, ClaimPolarity, ClaimType};

pub struct ClaimRepository {
    pool: SqlitePool,
}

impl ClaimRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        &self,
        task_id: &str,
        claim_text: &str,
        claim_type: ClaimType,
        polarity: ClaimPolarity,
        granularity: ClaimGranularity,
        parent_claim_id: Option<&str>,
        source_question: &str,
        keywords: &[String],
        verification_hints: &[String],
        confidence: f64,
    ) -> Result<String> {
        let id = format!("cl_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);

        sqlx::query(
            "INSERT INTO claims
                 (id, task_id, claim_text, claim_type, expected_polarity, granularity,
                  parent_claim_id, source_question, keywords_json, verification_hints_json,
                  confidence_score, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(task_id)
        .bind(claim_text)
        .bind(claim_type.as_str())
        .bind(polarity.as_str())
        .bind(granularity.as_str())
        .bind(parent_claim_id)
        .bind(source_question)
        .bind(serde_json::to_string(keywords)?)
        .bind(serde_json::to_string(verification_hints)?)
        .bind(confidence.clamp(0.0, 1.0))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to insert claim")?;

        Ok(id)
    }

    pub async fn get_by_id(&self, claim_id: &str) -> Result<Option<Claim>> {
        let row = sqlx::query(&select_sql("WHERE id = ?"))
            .bind(claim_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch claim")?;

        row.map(|r| row_to_claim(&r)).transpose()
    }

    pub async fn for_task(&self, task_id: &str) -> Result<Vec<Claim>> {
        let rows = sqlx::query(&select_sql("WHERE task_id = ? ORDER BY created_at ASC"))
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch task claims")?;

        rows.iter().map(row_to_claim).collect()
    }

    /// Claims of a task with no supports/refutes edge yet.
    pub async fn unverified_for_task(&self, task_id: &str) -> Result<Vec<Claim>> {
        let rows = sqlx::query(&select_sql(
            "WHERE task_id = ? AND is_verified = 0 AND rejected = 0",
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch unverified claims")?;

        rows.iter().map(row_to_claim).collect()
    }

    /// Append a timeline event. Events are append-only; the stored
    /// confidence is untouched by retractions.
    pub async fn append_timeline_event(&self, claim_id: &str, event: TimelineEvent) -> Result<()> {
        let row = sqlx::query("SELECT timeline_json FROM claims WHERE id = ?")
            .bind(claim_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read claim timeline")?
            .ok_or_else(|| anyhow::anyhow!("claim not found: {}", claim_id))?;

        let mut timeline = ClaimTimeline::from_json(row.get::<&str, _>("timeline_json"))?;
        timeline.append(event);

        sqlx::query("UPDATE claims SET timeline_json = ? WHERE id = ?")
            .bind(timeline.to_json()?)
            .bind(claim_id)
            .execute(&self.pool)
            .await
            .context("Failed to write claim timeline")?;

        Ok(())
    }

    pub async fn set_verified(&self, claim_id: &str, verified: bool) -> Result<()> {
        sqlx::query("UPDATE claims SET is_verified = ? WHERE id = ?")
            .bind(verified)
            .bind(claim_id)
            .execute(&self.pool)
            .await
            .context("Failed to set claim verified flag")?;
        Ok(())
    }

    pub async fn set_rejected(&self, claim_id: &str, rejected: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE claims SET rejected = ? WHERE id = ?")
            .bind(rejected)
            .bind(claim_id)
            .execute(&self.pool)
            .await
            .context("Failed to set claim rejected flag")?;
        Ok(result.rows_affected() == 1)
    }
}

fn select_sql(where_clause: &str) -> String {
    format!(
        "SELECT id, task_id, claim_text, claim_type, expected_polarity, granularity,
                parent_claim_id, source_question, keywords_json, verification_hints_json,
                confidence_score, timeline_json, is_verified, rejected, created_at
         FROM claims {}",
        where_clause
    )
}

fn row_to_claim(row: &sqlx::sqlite::SqliteRow) -> Result<Claim> {
    let keywords: Vec<String> =
        serde_json::from_str(row.get::<&str, _>("keywords_json")).unwrap_or_default();
    let hints: Vec<String> =
        serde_json::from_str(row.get::<&str, _>("verification_hints_json")).unwrap_or_default();

    Ok(Claim {
        id: row.get("id"),
        task_id: row.get("task_id"),
        claim_text: row.get("claim_text"),
        claim_type: ClaimType::from_str(row.get::<&str, _>("claim_type"))
            .unwrap_or(ClaimType::Factual),
        expected_polarity: ClaimPolarity::from_str(row.get::<&str, _>("expected_polarity"))
            .unwrap_or(ClaimPolarity::Neutral),
        granularity: ClaimGranularity::from_str(row.get::<&str, _>("granularity"))
            .unwrap_or(ClaimGranularity::Atomic),
        parent_claim_id: row.get("parent_claim_id"),
        source_question: row.get("source_question"),
        keywords,
        verification_hints: hints,
        confidence_score: row.get("confidence_score"),
        timeline_json: row.get("timeline_json"),
        is_verified: row.get::<i64, _>("is_verified") != 0,
        rejected: row.get::<i64, _>("rejected") != 0,
        created_at: parse_datetime(row.get("created_at")),
    })
}
