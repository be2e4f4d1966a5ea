//! Pages and fragments.
//!
//! Pages are task-independent: the id is derived from the URL hash, so the
//! same URL fetched through two tasks lands on one row.

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use super::parse_datetime_opt;
use crate::domain::{registrable_domain, Fragment, Page};

/// Task-wide harvest numbers: useful fragments over pages fetched.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskHarvest {
    pub pages_fetched: i64,
    pub useful_fragments: i64,
}

impl TaskHarvest {
    pub fn rate(&self) -> f64 {
        if self.pages_fetched == 0 {
            0.0
        } else {
            self.useful_fragments as f64 / self.pages_fetched as f64
        }
    }
}

/// Stable URL-derived page id.
pub fn page_id_for_url(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.trim_end_matches('/').as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("p_{}", hex)
}

pub struct PageRepository {
    pool: SqlitePool,
}

impl PageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or refresh a page row, keyed by URL hash. Returns the page id.
    pub async fn upsert(
        &self,
        url: &url::Url,
        title: Option<&str>,
        html_path: Option<&str>,
        canonical_id: Option<&str>,
    ) -> Result<String> {
        let id = page_id_for_url(url.as_str());
        let domain = registrable_domain(url);
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO pages (id, url, title, domain, html_path, canonical_id, fetched_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(url) DO UPDATE SET
                 title = COALESCE(excluded.title, title),
                 html_path = COALESCE(excluded.html_path, html_path),
                 canonical_id = COALESCE(excluded.canonical_id, canonical_id),
                 fetched_at = excluded.fetched_at",
        )
        .bind(&id)
        .bind(url.as_str())
        .bind(title)
        .bind(&domain)
        .bind(html_path)
        .bind(canonical_id)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to upsert page")?;

        Ok(id)
    }

    pub async fn get_by_id(&self, page_id: &str) -> Result<Option<Page>> {
        let row = sqlx::query(
            "SELECT id, url, title, domain, html_path, canonical_id, fetched_at
             FROM pages WHERE id = ?",
        )
        .bind(page_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch page")?;

        Ok(row.map(|row| Page {
            id: row.get("id"),
            url: row.get("url"),
            title: row.get("title"),
            domain: row.get("domain"),
            html_path: row.get("html_path"),
            canonical_id: row.get("canonical_id"),
            fetched_at: parse_datetime_opt(row.get::<Option<&str>, _>("fetched_at")),
        }))
    }

    pub async fn insert_fragment(
        &self,
        page_id: &str,
        text_content: &str,
        heading_context: Option<&str>,
        rerank_score: f64,
        is_relevant: bool,
    ) -> Result<String> {
        let id = format!("f_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);

        sqlx::query(
            "INSERT INTO fragments (id, page_id, text_content, heading_context, rerank_score, is_relevant)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(page_id)
        .bind(text_content)
        .bind(heading_context)
        .bind(rerank_score)
        .bind(is_relevant)
        .execute(&self.pool)
        .await
        .context("Failed to insert fragment")?;

        Ok(id)
    }

    /// Relevant fragments reachable from a task through serp items.
    pub async fn relevant_fragments_for_task(&self, task_id: &str) -> Result<Vec<Fragment>> {
        let rows = sqlx::query(
            "SELECT DISTINCT f.id, f.page_id, f.text_content, f.heading_context,
                    f.rerank_score, f.is_relevant
             FROM fragments f
             JOIN pages p ON p.id = f.page_id
             JOIN serp_items s ON s.url = p.url
             JOIN queries q ON q.id = s.query_id
             WHERE q.task_id = ? AND f.is_relevant = 1",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch task fragments")?;

        Ok(rows.into_iter().map(|row| row_to_fragment(&row)).collect())
    }

    /// Harvest numbers for the lastmile decision and materials stats.
    pub async fn harvest_for_task(&self, task_id: &str) -> Result<TaskHarvest> {
        let row = sqlx::query(
            "SELECT
                 (SELECT COUNT(DISTINCT p.id)
                  FROM pages p
                  JOIN serp_items s ON s.url = p.url
                  JOIN queries q ON q.id = s.query_id
                  WHERE q.task_id = ?1 AND p.fetched_at IS NOT NULL) AS pages_fetched,
                 (SELECT COUNT(DISTINCT f.id)
                  FROM fragments f
                  JOIN pages p ON p.id = f.page_id
                  JOIN serp_items s ON s.url = p.url
                  JOIN queries q ON q.id = s.query_id
                  WHERE q.task_id = ?1 AND f.is_relevant = 1) AS useful_fragments",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute harvest rate")?;

        Ok(TaskHarvest {
            pages_fetched: row.get("pages_fetched"),
            useful_fragments: row.get("useful_fragments"),
        })
    }
}

fn row_to_fragment(row: &sqlx::sqlite::SqliteRow) -> Fragment {
    Fragment {
        id: row.get("id"),
        page_id: row.get("page_id"),
        text_content: row.get("text_content"),
        heading_context: row.get("heading_context"),
        rerank_score: row.get("rerank_score"),
        is_relevant: row.get::<i64, _>("is_relevant") != 0,
    }
}
