//! Job handlers: one executor per job kind, wired into the scheduler.

mod citation;
mod search;
mod target;
mod verify;

pub use citation::CitationGraphHandler;
pub use search::SearchQueueHandler;
pub use target::TargetQueueHandler;
pub use verify::VerifyNliHandler;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use sqlx::SqlitePool;

use crate::domain::JobKind;
use crate::service::circuit_breaker::CircuitBreakerManager;
use crate::service::engine_registry::EngineRegistry;
use crate::service::fetcher::PageFetcher;
use crate::service::llm::{CitationIndex, Embedder, NliJudge};
use crate::service::policy_engine::PolicyEngine;
use crate::service::scheduler::{EngineRateGate, JobHandler};
use crate::service::search_provider::SearchProvider;

/// Everything the handlers need; collaborators stay behind their traits.
pub struct ProcessorDeps {
    pub pool: SqlitePool,
    pub registry: Arc<EngineRegistry>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub policy: Arc<PolicyEngine>,
    pub gate: Arc<EngineRateGate>,
    pub provider: Arc<dyn SearchProvider>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub nli: Option<Arc<dyn NliJudge>>,
    pub citations: Option<Arc<dyn CitationIndex>>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub html_dir: PathBuf,
}

pub fn build_handlers(deps: &ProcessorDeps) -> HashMap<JobKind, Arc<dyn JobHandler>> {
    let mut handlers: HashMap<JobKind, Arc<dyn JobHandler>> = HashMap::new();
    handlers.insert(
        JobKind::SearchQueue,
        Arc::new(SearchQueueHandler::new(deps)),
    );
    handlers.insert(
        JobKind::TargetQueue,
        Arc::new(TargetQueueHandler::new(deps)),
    );
    handlers.insert(JobKind::VerifyNli, Arc::new(VerifyNliHandler::new(deps)));
    handlers.insert(
        JobKind::CitationGraph,
        Arc::new(CitationGraphHandler::new(deps)),
    );
    handlers
}
