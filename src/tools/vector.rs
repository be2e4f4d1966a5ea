//! vector_search: semantic similarity over stored embeddings.

use serde::{Deserialize, Serialize};

use super::AppContext;
use crate::error::{AppError, Result};
use crate::service::vector_store::{VectorHit, VectorStore};

#[derive(Debug, Deserialize)]
pub struct VectorSearchRequest {
    pub query: String,
    #[serde(default = "default_target")]
    pub target: String,
    pub task_id: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
}

fn default_target() -> String {
    "claims".to_string()
}

fn default_top_k() -> i64 {
    10
}

fn default_min_similarity() -> f64 {
    0.5
}

#[derive(Debug, Serialize)]
pub struct VectorSearchResponse {
    pub ok: bool,
    pub results: Vec<VectorHit>,
    pub total_searched: usize,
}

pub async fn vector_search(
    ctx: &AppContext,
    req: VectorSearchRequest,
) -> Result<VectorSearchResponse> {
    super::require_non_empty(&req.query, "query")?;

    let target_type = match req.target.as_str() {
        "fragments" => "fragment",
        "claims" => "claim",
        _ => {
            return Err(AppError::invalid_params(
                "target must be 'fragments' or 'claims'",
                "target",
                "'fragments' or 'claims'",
            ))
        }
    };

    if !(1..=50).contains(&req.top_k) {
        return Err(AppError::invalid_params(
            "top_k must be between 1 and 50",
            "top_k",
            "integer 1-50",
        ));
    }
    if !(0.0..=1.0).contains(&req.min_similarity) {
        return Err(AppError::invalid_params(
            "min_similarity must be between 0.0 and 1.0",
            "min_similarity",
            "float 0.0-1.0",
        ));
    }

    let embedder = ctx.embedder.as_ref().ok_or_else(|| {
        AppError::TransientExternal("embedding model not available".to_string())
    })?;

    let query_vector = embedder
        .embed(&req.query)
        .await
        .map_err(|e| AppError::TransientExternal(format!("embedding failed: {:#}", e)))?;

    let store = VectorStore::new(ctx.pool.clone());
    let (results, total_searched) = store
        .search(
            &query_vector,
            target_type,
            embedder.model_id(),
            req.task_id.as_deref(),
            req.top_k as usize,
            req.min_similarity,
        )
        .await?;

    Ok(VectorSearchResponse {
        ok: true,
        results,
        total_searched,
    })
}
