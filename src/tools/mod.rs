//! Command-style tool surface.
//!
//! Each tool is an async function taking the application context and a
//! typed request, returning a serializable response or an `AppError` that
//! the host renders into the error envelope. Tools never process-exit.

pub mod calibration;
pub mod feedback;
pub mod materials;
pub mod references;
pub mod search;
pub mod sql;
pub mod tasks;
pub mod vector;

use std::path::PathBuf;
use std::sync::Arc;

use sqlx::SqlitePool;

use crate::error::{AppError, ErrorEnvelope};
use crate::service::circuit_breaker::CircuitBreakerManager;
use crate::service::claim_decomposer::ClaimDecomposer;
use crate::service::engine_registry::EngineRegistry;
use crate::service::llm::Embedder;
use crate::service::policy_engine::PolicyEngine;
use crate::service::scheduler::JobScheduler;

/// Shared state behind the tool surface.
pub struct AppContext {
    pub pool: SqlitePool,
    pub db_path: PathBuf,
    pub scheduler: Arc<JobScheduler>,
    pub registry: Arc<EngineRegistry>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub policy: Arc<PolicyEngine>,
    pub decomposer: Arc<ClaimDecomposer>,
    pub embedder: Option<Arc<dyn Embedder>>,
}

/// Render a tool result into the wire envelope.
pub fn envelope<T: serde::Serialize>(result: Result<T, AppError>) -> serde_json::Value {
    match result {
        Ok(value) => serde_json::to_value(value).unwrap_or_else(|e| {
            serde_json::to_value(ErrorEnvelope::from(&AppError::Internal(e.into())))
                .expect("error envelope serializes")
        }),
        Err(error) => serde_json::to_value(ErrorEnvelope::from(&error))
            .expect("error envelope serializes"),
    }
}

pub(crate) fn require_non_empty(value: &str, param: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::invalid_params(
            format!("{} is required", param),
            param,
            "non-empty string",
        ));
    }
    Ok(())
}
