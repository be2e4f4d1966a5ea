//! Task submission and control.
//!
//! A task is created from a hypothesis; the decomposer turns it into
//! atomic claims immediately so search and verification have something to
//! anchor on.

use serde::{Deserialize, Serialize};

use super::AppContext;
use crate::error::{AppError, Result};
use crate::repository::{ClaimRepository, TaskRepository};

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub hypothesis: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub ok: bool,
    pub task_id: String,
    pub claim_count: usize,
    pub decomposition_method: &'static str,
}

pub async fn submit_task(ctx: &AppContext, req: SubmitTaskRequest) -> Result<SubmitTaskResponse> {
    super::require_non_empty(&req.hypothesis, "hypothesis")?;

    let tasks = TaskRepository::new(ctx.pool.clone());
    let claims = ClaimRepository::new(ctx.pool.clone());

    let task_id = tasks.create(&req.hypothesis).await?;

    let decomposition = ctx.decomposer.decompose(&req.hypothesis).await;
    for claim in &decomposition.claims {
        claims
            .insert(
                &task_id,
                &claim.text,
                claim.claim_type,
                claim.expected_polarity,
                claim.granularity,
                None,
                &req.hypothesis,
                &claim.keywords,
                &claim.verification_hints,
                claim.confidence,
            )
            .await?;
    }

    log::info!(
        "Task submitted: id={} claims={} method={}",
        task_id,
        decomposition.claims.len(),
        decomposition.method
    );

    Ok(SubmitTaskResponse {
        ok: true,
        task_id,
        claim_count: decomposition.claims.len(),
        decomposition_method: decomposition.method,
    })
}

#[derive(Debug, Deserialize)]
pub struct CancelTaskRequest {
    pub task_id: String,
}

#[derive(Debug, Serialize)]
pub struct CancelTaskResponse {
    pub ok: bool,
    pub task_id: String,
    pub status: &'static str,
}

/// Cooperative cancel: running jobs finish, queued jobs wait, the task
/// parks in `paused` until new work arrives.
pub async fn cancel_task(ctx: &AppContext, req: CancelTaskRequest) -> Result<CancelTaskResponse> {
    super::require_non_empty(&req.task_id, "task_id")?;

    let tasks = TaskRepository::new(ctx.pool.clone());
    tasks
        .get_by_id(&req.task_id)
        .await?
        .ok_or_else(|| AppError::not_found("task", &req.task_id))?;

    ctx.scheduler.cancel_task(&req.task_id).await?;

    Ok(CancelTaskResponse {
        ok: true,
        task_id: req.task_id,
        status: "paused",
    })
}
