//! get_materials: structured report materials for a task.
//!
//! Returns claims with their effective confidence (retraction penalty
//! applied on read, stored scores untouched), relevant fragments, harvest
//! statistics, and optionally the evidence graph and citation candidates.

use serde::{Deserialize, Serialize};
use sqlx::Row;

use super::AppContext;
use crate::domain::timeline::ClaimTimeline;
use crate::domain::Edge;
use crate::error::{AppError, Result};
use crate::repository::{ClaimRepository, EdgeRepository, PageRepository, TaskRepository};

#[derive(Debug, Default, Deserialize)]
pub struct MaterialsOptions {
    #[serde(default)]
    pub include_graph: bool,
    #[serde(default)]
    pub include_citations: bool,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GetMaterialsRequest {
    pub task_id: String,
    #[serde(default)]
    pub options: MaterialsOptions,
}

#[derive(Debug, Serialize)]
pub struct ClaimMaterial {
    pub id: String,
    pub text: String,
    pub claim_type: String,
    pub expected_polarity: String,
    pub granularity: String,
    pub stored_confidence: f64,
    pub effective_confidence: f64,
    pub is_verified: bool,
    pub is_retracted: bool,
    pub is_corrected: bool,
    pub confirmation_count: usize,
    pub keywords: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FragmentMaterial {
    pub id: String,
    pub page_id: String,
    pub text: String,
    pub heading_context: Option<String>,
    pub rerank_score: f64,
}

#[derive(Debug, Serialize)]
pub struct CitationMaterial {
    pub citation_edge_id: String,
    pub candidate_url: String,
    pub citation_context: Option<String>,
    pub consumed: bool,
}

#[derive(Debug, Serialize)]
pub struct MaterialsStats {
    pub pages_fetched: i64,
    pub useful_fragments: i64,
    pub harvest_rate: f64,
    pub claim_count: usize,
    pub edge_count: usize,
}

#[derive(Debug, Serialize)]
pub struct GetMaterialsResponse {
    pub ok: bool,
    pub task_id: String,
    pub hypothesis: String,
    pub task_status: String,
    pub claims: Vec<ClaimMaterial>,
    pub retracted_claims: Vec<ClaimMaterial>,
    pub rejected_claims: Vec<ClaimMaterial>,
    pub fragments: Vec<FragmentMaterial>,
    pub stats: MaterialsStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<Vec<Edge>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<CitationMaterial>>,
}

pub async fn get_materials(
    ctx: &AppContext,
    req: GetMaterialsRequest,
) -> Result<GetMaterialsResponse> {
    super::require_non_empty(&req.task_id, "task_id")?;

    let tasks = TaskRepository::new(ctx.pool.clone());
    let task = tasks
        .get_by_id(&req.task_id)
        .await?
        .ok_or_else(|| AppError::not_found("task", &req.task_id))?;

    let claim_repo = ClaimRepository::new(ctx.pool.clone());
    let page_repo = PageRepository::new(ctx.pool.clone());
    let edge_repo = EdgeRepository::new(ctx.pool.clone());

    let all_claims = claim_repo.for_task(&req.task_id).await?;
    let mut claims = Vec::new();
    let mut retracted = Vec::new();
    let mut rejected = Vec::new();

    for claim in &all_claims {
        let timeline = ClaimTimeline::from_json(&claim.timeline_json)?;
        let material = ClaimMaterial {
            id: claim.id.clone(),
            text: claim.claim_text.clone(),
            claim_type: claim.claim_type.as_str().to_string(),
            expected_polarity: claim.expected_polarity.as_str().to_string(),
            granularity: claim.granularity.as_str().to_string(),
            stored_confidence: claim.confidence_score,
            effective_confidence: timeline.effective_confidence(claim.confidence_score),
            is_verified: claim.is_verified,
            is_retracted: timeline.is_retracted(),
            is_corrected: timeline.is_corrected(),
            confirmation_count: timeline.confirmation_count(),
            keywords: claim.keywords.clone(),
        };

        if claim.rejected {
            rejected.push(material);
        } else if material.is_retracted {
            retracted.push(material);
        } else {
            claims.push(material);
        }
    }

    let fragments: Vec<FragmentMaterial> = page_repo
        .relevant_fragments_for_task(&req.task_id)
        .await?
        .into_iter()
        .map(|f| FragmentMaterial {
            id: f.id,
            page_id: f.page_id,
            text: f.text_content,
            heading_context: f.heading_context,
            rerank_score: f.rerank_score,
        })
        .collect();

    let edges = edge_repo.for_task_claims(&req.task_id).await?;
    let harvest = page_repo.harvest_for_task(&req.task_id).await?;

    let stats = MaterialsStats {
        pages_fetched: harvest.pages_fetched,
        useful_fragments: harvest.useful_fragments,
        harvest_rate: harvest.rate(),
        claim_count: all_claims.len(),
        edge_count: edges.len(),
    };

    let graph = req.options.include_graph.then_some(edges);

    let citations = if req.options.include_citations {
        let rows = sqlx::query(
            "SELECT id, candidate_url, citation_context, consumed
             FROM citation_edges WHERE task_id = ? ORDER BY created_at ASC",
        )
        .bind(&req.task_id)
        .fetch_all(&ctx.pool)
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

        Some(
            rows.into_iter()
                .map(|row| CitationMaterial {
                    citation_edge_id: row.get("id"),
                    candidate_url: row.get("candidate_url"),
                    citation_context: row.get("citation_context"),
                    consumed: row.get::<i64, _>("consumed") != 0,
                })
                .collect(),
        )
    } else {
        None
    };

    Ok(GetMaterialsResponse {
        ok: true,
        task_id: task.id,
        hypothesis: task.hypothesis,
        task_status: task.status.to_string(),
        claims,
        retracted_claims: retracted,
        rejected_claims: rejected,
        fragments,
        stats,
        graph,
        citations,
    })
}
