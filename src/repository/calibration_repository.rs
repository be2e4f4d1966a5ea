//! Calibration parameter history.
//!
//! Versions are append-only per source; a rollback re-points the active
//! version by inserting a copy of the target as the newest version.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationVersion {
    pub source: String,
    pub version: i64,
    pub method: String,
    pub params: serde_json::Value,
    pub brier_before: Option<f64>,
    pub brier_after: Option<f64>,
    pub reason: Option<String>,
    pub created_at: String,
}

pub struct CalibrationRepository {
    pool: SqlitePool,
}

impl CalibrationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_version(
        &self,
        source: &str,
        method: &str,
        params: &serde_json::Value,
        brier_before: Option<f64>,
        brier_after: Option<f64>,
        reason: Option<&str>,
    ) -> Result<i64> {
        let version = self.latest_version(source).await?.map(|v| v.version).unwrap_or(0) + 1;

        sqlx::query(
            "INSERT INTO calibration_params
                 (source, version, method, params_json, brier_before, brier_after, reason, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(source)
        .bind(version)
        .bind(method)
        .bind(serde_json::to_string(params)?)
        .bind(brier_before)
        .bind(brier_after)
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to insert calibration version")?;

        Ok(version)
    }

    pub async fn latest_version(&self, source: &str) -> Result<Option<CalibrationVersion>> {
        let row = sqlx::query(
            "SELECT source, version, method, params_json, brier_before, brier_after, reason, created_at
             FROM calibration_params WHERE source = ?
             ORDER BY version DESC LIMIT 1",
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest calibration version")?;

        row.map(|r| row_to_version(&r)).transpose()
    }

    pub async fn get_version(&self, source: &str, version: i64) -> Result<Option<CalibrationVersion>> {
        let row = sqlx::query(
            "SELECT source, version, method, params_json, brier_before, brier_after, reason, created_at
             FROM calibration_params WHERE source = ? AND version = ?",
        )
        .bind(source)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch calibration version")?;

        row.map(|r| row_to_version(&r)).transpose()
    }

    pub async fn history(&self, source: &str) -> Result<Vec<CalibrationVersion>> {
        let rows = sqlx::query(
            "SELECT source, version, method, params_json, brier_before, brier_after, reason, created_at
             FROM calibration_params WHERE source = ?
             ORDER BY version ASC",
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch calibration history")?;

        rows.iter().map(row_to_version).collect()
    }

    pub async fn sources(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT source FROM calibration_params ORDER BY source")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch calibration sources")?;
        Ok(rows.into_iter().map(|r| r.get("source")).collect())
    }
}

fn row_to_version(row: &sqlx::sqlite::SqliteRow) -> Result<CalibrationVersion> {
    Ok(CalibrationVersion {
        source: row.get("source"),
        version: row.get("version"),
        method: row.get("method"),
        params: serde_json::from_str(row.get::<&str, _>("params_json"))
            .context("Malformed calibration params_json")?,
        brier_before: row.get("brier_before"),
        brier_after: row.get("brier_after"),
        reason: row.get("reason"),
        created_at: row.get("created_at"),
    })
}
