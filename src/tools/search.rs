//! queue_searches: enqueue search queries for background execution.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppContext;
use crate::domain::{JobKind, TaskStatus};
use crate::error::{AppError, Result};
use crate::repository::TaskRepository;
use crate::service::scheduler::priority_from_name;
use crate::trace::CausalTrace;

#[derive(Debug, Default, Deserialize)]
pub struct QueueSearchOptions {
    pub priority: Option<String>,
    pub engine: Option<String>,
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct QueueSearchesRequest {
    pub task_id: String,
    pub queries: Vec<String>,
    #[serde(default)]
    pub options: QueueSearchOptions,
}

#[derive(Debug, Serialize)]
pub struct QueueSearchesResponse {
    pub ok: bool,
    pub queued_count: usize,
    pub skipped_count: usize,
    pub search_ids: Vec<String>,
    pub task_resumed: bool,
    pub message: String,
}

pub async fn queue_searches(
    ctx: &AppContext,
    req: QueueSearchesRequest,
) -> Result<QueueSearchesResponse> {
    super::require_non_empty(&req.task_id, "task_id")?;
    if req.queries.is_empty() {
        return Err(AppError::invalid_params(
            "queries must not be empty",
            "queries",
            "non-empty array of strings",
        ));
    }

    let tasks = TaskRepository::new(ctx.pool.clone());
    let task = tasks
        .get_by_id(&req.task_id)
        .await?
        .ok_or_else(|| AppError::not_found("task", &req.task_id))?;

    if task.status == TaskStatus::Failed {
        return Err(AppError::PolicyRejected(
            "Cannot queue searches on a failed task".to_string(),
        ));
    }
    let was_paused = task.status == TaskStatus::Paused;
    if was_paused {
        log::info!("Resuming paused task {} with new searches", req.task_id);
    }

    let priority = priority_from_name(req.options.priority.as_deref().unwrap_or("medium"));

    let mut options = serde_json::Map::new();
    if let Some(engine) = &req.options.engine {
        options.insert("engine".to_string(), json!(engine));
    }
    if let Some(limit) = req.options.limit {
        options.insert("limit".to_string(), json!(limit));
    }

    // All searches queued by this call share one causal trace.
    let trace = CausalTrace::new();
    let mut search_ids = Vec::new();
    let mut skipped = 0usize;

    for query in &req.queries {
        let input = json!({
            "query": query,
            "options": options.clone(),
        });
        let outcome = trace
            .scope(ctx.scheduler.submit(
                JobKind::SearchQueue,
                input,
                priority,
                &req.task_id,
                None,
            ))
            .await?;

        if outcome.accepted {
            search_ids.push(outcome.job_id);
        } else {
            skipped += 1;
        }
    }

    let mut message = format!("{} searches queued", search_ids.len());
    if skipped > 0 {
        message.push_str(&format!(" ({} duplicates skipped)", skipped));
    }

    log::info!(
        "Searches queued: task={} queued={} skipped={}",
        req.task_id,
        search_ids.len(),
        skipped
    );

    Ok(QueueSearchesResponse {
        ok: true,
        queued_count: search_ids.len(),
        skipped_count: skipped,
        task_resumed: was_paused && !search_ids.is_empty(),
        search_ids,
        message,
    })
}
