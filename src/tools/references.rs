//! queue_reference_candidates: citation-chasing control.
//!
//! Reads unconsumed reference candidates for a task, applies include- or
//! exclude-list filtering, and enqueues the survivors to target_queue.
//! URLs that resolve to a DOI take the academic fast path.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::Row;

use super::AppContext;
use crate::domain::{JobKind, TaskStatus};
use crate::error::{AppError, Result};
use crate::repository::TaskRepository;
use crate::service::scheduler::priority_from_name;
use crate::trace::CausalTrace;

#[derive(Debug, Deserialize)]
pub struct QueueReferenceCandidatesRequest {
    pub task_id: String,
    #[serde(default)]
    pub include_ids: Vec<String>,
    #[serde(default)]
    pub exclude_ids: Vec<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub options: super::search::QueueSearchOptions,
}

fn default_limit() -> i64 {
    10
}

#[derive(Debug, Serialize)]
pub struct CandidateSummary {
    pub citation_edge_id: String,
    pub url: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation_context: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueueReferenceCandidatesResponse {
    pub ok: bool,
    pub queued_count: usize,
    pub skipped_count: usize,
    pub candidates: Vec<CandidateSummary>,
    pub target_ids: Vec<String>,
    pub dry_run: bool,
    pub message: String,
}

/// Extract a DOI from a URL, trimming trailing punctuation.
pub fn extract_doi_from_url(url: &str) -> Option<String> {
    let patterns = [
        r"(?:https?://)?(?:dx\.)?doi\.org/(10\.\d{4,}/\S+)",
        r"(?:https?://)?\S*/(10\.\d{4,}/[^/\s]+)",
    ];
    for pattern in patterns {
        let re = Regex::new(pattern).expect("static regex");
        if let Some(cap) = re.captures(url) {
            let doi = cap[1].trim_end_matches(['.', ',', ';', ':', ')']).to_lowercase();
            return Some(doi);
        }
    }
    None
}

struct CandidateRow {
    id: String,
    url: String,
    context: Option<String>,
}

pub async fn queue_reference_candidates(
    ctx: &AppContext,
    req: QueueReferenceCandidatesRequest,
) -> Result<QueueReferenceCandidatesResponse> {
    super::require_non_empty(&req.task_id, "task_id")?;

    if !req.include_ids.is_empty() && !req.exclude_ids.is_empty() {
        return Err(AppError::invalid_params(
            "Cannot specify both include_ids and exclude_ids",
            "include_ids/exclude_ids",
            "only one of include_ids or exclude_ids",
        ));
    }
    if req.limit < 1 {
        return Err(AppError::invalid_params(
            "limit must be a positive integer",
            "limit",
            "positive integer",
        ));
    }

    let tasks = TaskRepository::new(ctx.pool.clone());
    let task = tasks
        .get_by_id(&req.task_id)
        .await?
        .ok_or_else(|| AppError::not_found("task", &req.task_id))?;
    if task.status == TaskStatus::Failed {
        return Err(AppError::PolicyRejected(
            "Cannot queue reference candidates on a failed task".to_string(),
        ));
    }

    let rows = sqlx::query(
        "SELECT id, candidate_url, citation_context
         FROM citation_edges
         WHERE task_id = ? AND consumed = 0
         ORDER BY created_at ASC",
    )
    .bind(&req.task_id)
    .fetch_all(&ctx.pool)
    .await
    .map_err(|e| AppError::Internal(e.into()))?;

    let mut candidates: Vec<CandidateRow> = rows
        .into_iter()
        .map(|row| CandidateRow {
            id: row.get("id"),
            url: row.get("candidate_url"),
            context: row.get("citation_context"),
        })
        .collect();

    if !req.include_ids.is_empty() {
        candidates.retain(|c| req.include_ids.contains(&c.id));
    } else if !req.exclude_ids.is_empty() {
        candidates.retain(|c| !req.exclude_ids.contains(&c.id));
    }
    candidates.truncate(req.limit as usize);

    if candidates.is_empty() {
        return Ok(QueueReferenceCandidatesResponse {
            ok: true,
            queued_count: 0,
            skipped_count: 0,
            candidates: Vec::new(),
            target_ids: Vec::new(),
            dry_run: req.dry_run,
            message: "No reference candidates found for this task".to_string(),
        });
    }

    let summaries: Vec<CandidateSummary> = candidates
        .iter()
        .map(|c| {
            let doi = extract_doi_from_url(&c.url);
            CandidateSummary {
                citation_edge_id: c.id.clone(),
                url: c.url.clone(),
                kind: if doi.is_some() { "doi" } else { "url" },
                doi,
                citation_context: c.context.as_ref().map(|s| truncate(s, 200)),
            }
        })
        .collect();

    if req.dry_run {
        return Ok(QueueReferenceCandidatesResponse {
            ok: true,
            queued_count: 0,
            skipped_count: 0,
            message: format!("Dry run: {} candidates would be queued", summaries.len()),
            candidates: summaries,
            target_ids: Vec::new(),
            dry_run: true,
        });
    }

    let priority = priority_from_name(req.options.priority.as_deref().unwrap_or("medium"));
    let trace = CausalTrace::new();
    let mut target_ids = Vec::new();
    let mut skipped = 0usize;

    for (candidate, summary) in candidates.iter().zip(summaries.iter()) {
        let target = match &summary.doi {
            Some(doi) => json!({
                "kind": "doi",
                "doi": doi,
                "reason": "citation_chase",
                "original_url": candidate.url,
            }),
            None => json!({
                "kind": "url",
                "url": candidate.url,
                "reason": "citation_chase",
            }),
        };
        let input = json!({
            "target": target,
            "citation_edge_id": candidate.id,
        });

        let outcome = trace
            .scope(ctx.scheduler.submit(
                JobKind::TargetQueue,
                input,
                priority,
                &req.task_id,
                None,
            ))
            .await?;

        if outcome.accepted {
            target_ids.push(outcome.job_id);
            sqlx::query("UPDATE citation_edges SET consumed = 1 WHERE id = ?")
                .bind(&candidate.id)
                .execute(&ctx.pool)
                .await
                .map_err(|e| AppError::Internal(e.into()))?;
        } else {
            skipped += 1;
        }
    }

    let mut message = format!("{} reference candidates queued", target_ids.len());
    if skipped > 0 {
        message.push_str(&format!(" ({} duplicates skipped)", skipped));
    }

    log::info!(
        "Reference candidates queued: task={} queued={} skipped={}",
        req.task_id,
        target_ids.len(),
        skipped
    );

    Ok(QueueReferenceCandidatesResponse {
        ok: true,
        queued_count: target_ids.len(),
        skipped_count: skipped,
        candidates: summaries,
        target_ids,
        dry_run: false,
        message,
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
