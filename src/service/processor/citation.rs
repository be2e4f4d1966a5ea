//! citation_graph handler: expand reference candidates from academic paper
//! ids into the citation_edges table, where queue_reference_candidates
//! picks them up.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use super::ProcessorDeps;
use crate::domain::Job;
use crate::service::llm::CitationIndex;
use crate::service::scheduler::{JobHandler, JobOutcome};

pub struct CitationGraphHandler {
    citations: Option<Arc<dyn CitationIndex>>,
    pool: SqlitePool,
}

impl CitationGraphHandler {
    pub fn new(deps: &ProcessorDeps) -> Self {
        Self {
            citations: deps.citations.clone(),
            pool: deps.pool.clone(),
        }
    }
}

#[async_trait]
impl JobHandler for CitationGraphHandler {
    async fn execute(&self, job: &Job) -> Result<JobOutcome> {
        let paper_ids: Vec<String> = job.input["paper_ids"]
            .as_array()
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        if paper_ids.is_empty() {
            return Ok(JobOutcome::summary("no paper ids"));
        }

        let citations = self
            .citations
            .as_ref()
            .context("citation index not configured")?;

        let citing_page_id = job.input["citing_page_id"].as_str().unwrap_or_default();
        let mut inserted = 0usize;

        for paper_id in &paper_ids {
            let references = citations
                .references(paper_id)
                .await
                .with_context(|| format!("reference expansion failed for {}", paper_id))?;

            for candidate in references {
                let id = format!("ce_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
                sqlx::query(
                    "INSERT INTO citation_edges
                         (id, task_id, citing_page_id, candidate_url, citation_context,
                          citation_source, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&id)
                .bind(&job.task_id)
                .bind(citing_page_id)
                .bind(&candidate.url)
                .bind(&candidate.context)
                .bind(candidate.source.as_deref().unwrap_or("citation_index"))
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await
                .context("Failed to insert citation edge")?;
                inserted += 1;
            }
        }

        Ok(JobOutcome::summary(format!(
            "papers={} candidates={}",
            paper_ids.len(),
            inserted
        )))
    }
}
