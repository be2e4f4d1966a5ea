//! Application lifecycle: logging, service construction and wiring.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::service::circuit_breaker::{BreakerSettings, CircuitBreakerManager};
use crate::service::claim_decomposer::ClaimDecomposer;
use crate::service::engine_registry::EngineRegistry;
use crate::service::fetcher::{HttpFetcher, PageFetcher};
use crate::service::llm::{CitationIndex, Embedder, LlmClient, LocalLlmClient, NliJudge};
use crate::service::policy_engine::PolicyEngine;
use crate::service::processor::{build_handlers, ProcessorDeps};
use crate::service::scheduler::{EngineRateGate, JobScheduler};
use crate::service::search_provider::{MetaSearchClient, SearchProvider};
use crate::tools::AppContext;

/// Slot-default minimum interval for engines without registry config.
const DEFAULT_ENGINE_INTERVAL: Duration = Duration::from_secs(1);
/// Engine config mtime poll cadence.
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Initialize logging with tracing_subscriber; `log::` macros are bridged
/// through the tracing-log feature.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sqlx=warn".parse().unwrap())
                .add_directive("argus=debug".parse().unwrap())
                .add_directive("info".parse().unwrap()),
        )
        .compact()
        .with_target(false)
        .with_ansi(true)
        .init();
}

/// External collaborators, swappable for tests.
pub struct Collaborators {
    pub provider: Arc<dyn SearchProvider>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub nli: Option<Arc<dyn NliJudge>>,
    pub citations: Option<Arc<dyn CitationIndex>>,
    pub embedder: Option<Arc<dyn Embedder>>,
}

impl Collaborators {
    pub fn from_config(config: &Config) -> Self {
        Self {
            provider: Arc::new(MetaSearchClient::default()),
            fetcher: Arc::new(HttpFetcher::new()),
            llm: Some(Arc::new(LocalLlmClient::new(config.llm_base_url.clone()))),
            nli: None,
            citations: None,
            embedder: None,
        }
    }
}

/// Build the full application context: database, registry, breakers,
/// policy, scheduler with its handlers, and the tool surface state.
pub async fn bootstrap(config: &Config, collaborators: Collaborators) -> Result<AppContext> {
    let pool = db::init_db(&config.db_path).await?;

    let registry = Arc::new(EngineRegistry::load(&config.engines_config_path));
    let breakers = Arc::new(CircuitBreakerManager::new(
        pool.clone(),
        BreakerSettings {
            failure_threshold: config.failure_threshold,
            cooldown_min_minutes: config.cooldown_min_minutes,
            cooldown_max_minutes: config.cooldown_max_minutes,
        },
    ));
    let policy = Arc::new(PolicyEngine::new(
        pool.clone(),
        registry.clone(),
        breakers.clone(),
        config.lastmile_threshold,
    ));
    let gate = Arc::new(EngineRateGate::new(DEFAULT_ENGINE_INTERVAL));

    let deps = ProcessorDeps {
        pool: pool.clone(),
        registry: registry.clone(),
        breakers: breakers.clone(),
        policy: policy.clone(),
        gate: gate.clone(),
        provider: collaborators.provider,
        fetcher: collaborators.fetcher,
        nli: collaborators.nli,
        citations: collaborators.citations,
        embedder: collaborators.embedder.clone(),
        html_dir: config.html_dir.clone(),
    };
    let handlers = build_handlers(&deps);
    let scheduler = Arc::new(JobScheduler::new(pool.clone(), handlers, gate));

    let decomposer = Arc::new(ClaimDecomposer::new(collaborators.llm));

    Ok(AppContext {
        pool,
        db_path: config.db_path.clone(),
        scheduler,
        registry,
        breakers,
        policy,
        decomposer,
        embedder: collaborators.embedder,
    })
}

/// Start the background workers: one per scheduler slot, plus the engine
/// config watcher.
pub fn start_background(ctx: &AppContext) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = ctx.scheduler.start();
    handles.push(ctx.registry.start_watcher(CONFIG_POLL_INTERVAL));
    handles
}
