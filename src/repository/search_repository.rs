//! Queries and SERP items.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::domain::{QueryCategory, SerpItem};

pub struct SearchRepository {
    pool: SqlitePool,
}

impl SearchRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record an executed query. Queries are immutable once inserted.
    pub async fn insert_query(
        &self,
        task_id: &str,
        query_text: &str,
        normalized_text: &str,
        category: QueryCategory,
        engine: Option<&str>,
    ) -> Result<String> {
        let id = format!("q_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);

        sqlx::query(
            "INSERT INTO queries (id, task_id, query_text, normalized_text, category, engine, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(task_id)
        .bind(query_text)
        .bind(normalized_text)
        .bind(category.as_str())
        .bind(engine)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to insert query")?;

        Ok(id)
    }

    pub async fn insert_serp_items(&self, items: &[SerpItem]) -> Result<()> {
        for item in items {
            sqlx::query(
                "INSERT INTO serp_items (query_id, url, title, snippet, source_tag, rank)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&item.query_id)
            .bind(&item.url)
            .bind(&item.title)
            .bind(&item.snippet)
            .bind(item.source_tag.as_str())
            .bind(item.rank)
            .execute(&self.pool)
            .await
            .context("Failed to insert serp item")?;
        }
        Ok(())
    }

    /// Domains the operator has blocked through feedback.
    pub async fn blocked_domains(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT domain FROM domain_overrides WHERE action = 'block'")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch blocked domains")?;

        Ok(rows.into_iter().map(|row| row.get("domain")).collect())
    }
}
