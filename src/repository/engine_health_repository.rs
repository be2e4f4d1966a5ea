//! Engine health persistence.
//!
//! One row per engine, written through after every breaker record (UPSERT).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::parse_datetime_opt;
use crate::domain::EngineHealth;

pub struct EngineHealthRepository {
    pool: SqlitePool,
}

impl EngineHealthRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, health: &EngineHealth) -> Result<()> {
        sqlx::query(
            "INSERT INTO engine_health
                 (engine, status, success_rate_1h, success_rate_24h, captcha_rate,
                  median_latency_ms, consecutive_failures, total_failures_in_window,
                  cooldown_until, last_used_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(engine) DO UPDATE SET
                 status = excluded.status,
                 success_rate_1h = excluded.success_rate_1h,
                 success_rate_24h = excluded.success_rate_24h,
                 captcha_rate = excluded.captcha_rate,
                 median_latency_ms = excluded.median_latency_ms,
                 consecutive_failures = excluded.consecutive_failures,
                 total_failures_in_window = excluded.total_failures_in_window,
                 cooldown_until = excluded.cooldown_until,
                 last_used_at = excluded.last_used_at,
                 updated_at = CURRENT_TIMESTAMP",
        )
        .bind(&health.engine)
        .bind(&health.status)
        .bind(health.success_rate_1h)
        .bind(health.success_rate_24h)
        .bind(health.captcha_rate)
        .bind(health.median_latency_ms)
        .bind(health.consecutive_failures)
        .bind(health.total_failures_in_window)
        .bind(health.cooldown_until.map(|dt| dt.to_rfc3339()))
        .bind(health.last_used_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await
        .context("Failed to upsert engine health")?;

        Ok(())
    }

    pub async fn get(&self, engine: &str) -> Result<Option<EngineHealth>> {
        let row = sqlx::query(
            "SELECT engine, status, success_rate_1h, success_rate_24h, captcha_rate,
                    median_latency_ms, consecutive_failures, total_failures_in_window,
                    cooldown_until, last_used_at
             FROM engine_health WHERE engine = ?",
        )
        .bind(engine)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch engine health")?;

        Ok(row.map(|row| EngineHealth {
            engine: row.get("engine"),
            status: row.get("status"),
            success_rate_1h: row.get("success_rate_1h"),
            success_rate_24h: row.get("success_rate_24h"),
            captcha_rate: row.get("captcha_rate"),
            median_latency_ms: row.get("median_latency_ms"),
            consecutive_failures: row.get("consecutive_failures"),
            total_failures_in_window: row.get("total_failures_in_window"),
            cooldown_until: parse_datetime_opt(row.get::<Option<&str>, _>("cooldown_until")),
            last_used_at: parse_datetime_opt(row.get::<Option<&str>, _>("last_used_at")),
        }))
    }

    /// Bump the daily request counter for an engine; returns today's count.
    pub async fn bump_daily_usage(&self, engine: &str, now: DateTime<Utc>) -> Result<i64> {
        let day = now.format("%Y-%m-%d").to_string();
        sqlx::query(
            "INSERT INTO engine_daily_usage (engine, day, request_count) VALUES (?, ?, 1)
             ON CONFLICT(engine, day) DO UPDATE SET request_count = request_count + 1",
        )
        .bind(engine)
        .bind(&day)
        .execute(&self.pool)
        .await
        .context("Failed to bump daily usage")?;

        self.daily_usage(engine, now).await
    }

    pub async fn daily_usage(&self, engine: &str, now: DateTime<Utc>) -> Result<i64> {
        let day = now.format("%Y-%m-%d").to_string();
        let row = sqlx::query(
            "SELECT request_count FROM engine_daily_usage WHERE engine = ? AND day = ?",
        )
        .bind(engine)
        .bind(&day)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch daily usage")?;

        Ok(row.map(|r| r.get("request_count")).unwrap_or(0))
    }
}
