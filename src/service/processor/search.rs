//! search_queue handler: select an engine, normalize the query, honor the
//! QPS gate, issue the search and record the SERP.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;

use super::ProcessorDeps;
use crate::domain::{Job, SerpItem};
use crate::repository::{EngineHealthRepository, PageRepository, SearchRepository};
use crate::service::circuit_breaker::CircuitBreakerManager;
use crate::service::engine_registry::EngineRegistry;
use crate::service::policy_engine::{detect_category, PolicyEngine};
use crate::service::query_normalizer::transform_query_for_engine;
use crate::service::scheduler::{EngineRateGate, FollowUpJob, JobHandler, JobOutcome};
use crate::service::search_provider::{SearchFailure, SearchProvider};

const DEFAULT_RESULT_LIMIT: usize = 10;
/// How many top results each search pushes to the fetch queue.
const FETCH_FOLLOW_UP_COUNT: usize = 3;

pub struct SearchQueueHandler {
    registry: Arc<EngineRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    policy: Arc<PolicyEngine>,
    gate: Arc<EngineRateGate>,
    provider: Arc<dyn SearchProvider>,
    searches: SearchRepository,
    pages: PageRepository,
    health: EngineHealthRepository,
}

impl SearchQueueHandler {
    pub fn new(deps: &ProcessorDeps) -> Self {
        Self {
            registry: deps.registry.clone(),
            breakers: deps.breakers.clone(),
            policy: deps.policy.clone(),
            gate: deps.gate.clone(),
            provider: deps.provider.clone(),
            searches: SearchRepository::new(deps.pool.clone()),
            pages: PageRepository::new(deps.pool.clone()),
            health: EngineHealthRepository::new(deps.pool.clone()),
        }
    }

    /// Engine selection order: a pinned engine from the job input, then the
    /// lastmile slot when the harvest rate clears the threshold, then the
    /// best-weighted available engine for the detected category.
    async fn select_engine(&self, job: &Job, query: &str) -> Result<Option<String>> {
        if let Some(pinned) = job.input["options"]["engine"].as_str() {
            if self.breakers.is_available(pinned).await? {
                return Ok(Some(pinned.to_string()));
            }
            log::warn!("Pinned engine {} unavailable, falling through", pinned);
        }

        let harvest = self.pages.harvest_for_task(&job.task_id).await?;
        let lastmile = self.policy.select_lastmile_engine(harvest.rate()).await?;
        if let Some(engine) = lastmile.engine {
            log::info!(
                "Lastmile slot active: engine={} harvest_rate={:.2}",
                engine,
                lastmile.harvest_rate
            );
            return Ok(Some(engine));
        }

        let category = detect_category(query);
        let ranked = self.policy.rank_engines(category).await?;
        Ok(ranked.into_iter().next())
    }
}

#[async_trait]
impl JobHandler for SearchQueueHandler {
    async fn execute(&self, job: &Job) -> Result<JobOutcome> {
        let query = job.input["query"]
            .as_str()
            .context("search_queue input missing query")?;
        let limit = job.input["options"]["limit"]
            .as_u64()
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_RESULT_LIMIT);

        let Some(engine) = self.select_engine(job, query).await? else {
            anyhow::bail!("no search engine available");
        };

        let snapshot = self.registry.snapshot();
        let normalized = transform_query_for_engine(query, &engine, &snapshot);
        if normalized != query {
            log::debug!(
                "Query operators normalized: engine={} original={} normalized={}",
                engine,
                query,
                normalized
            );
        }

        let config = snapshot.get(&engine);
        let (base_url, min_interval) = match &config {
            Some(c) => (c.base_url.clone(), Some(c.min_interval())),
            None => (String::new(), None),
        };

        // Strict per-engine QPS barrier.
        self.gate.wait(&engine, min_interval).await;
        self.health.bump_daily_usage(&engine, Utc::now()).await?;

        match self.provider.search(&engine, &base_url, &normalized, limit).await {
            Ok(outcome) => {
                self.breakers
                    .record_success(&engine, Some(outcome.elapsed_ms))
                    .await?;

                let category = detect_category(query);
                let query_id = self
                    .searches
                    .insert_query(&job.task_id, query, &normalized, category, Some(&engine))
                    .await?;

                let items: Vec<SerpItem> = outcome
                    .hits
                    .iter()
                    .map(|hit| SerpItem {
                        query_id: query_id.clone(),
                        url: hit.url.clone(),
                        title: Some(hit.title.clone()),
                        snippet: Some(hit.snippet.clone()),
                        source_tag: hit.source_tag,
                        rank: hit.rank,
                    })
                    .collect();
                self.searches.insert_serp_items(&items).await?;

                // Top results flow on to the fetch queue under the same
                // causal trace; dedup in submit absorbs repeats and
                // operator-blocked domains never enter the queue.
                let blocked = self.searches.blocked_domains().await?;
                let follow_ups: Vec<FollowUpJob> = items
                    .iter()
                    .filter(|item| !blocked.iter().any(|d| item.url.contains(d.as_str())))
                    .take(FETCH_FOLLOW_UP_COUNT)
                    .map(|item| FollowUpJob {
                        kind: crate::domain::JobKind::TargetQueue,
                        input: serde_json::json!({
                            "target": {"kind": "url", "url": item.url},
                        }),
                        priority: job.priority,
                    })
                    .collect();

                Ok(JobOutcome {
                    summary: format!("engine={} results={}", engine, items.len()),
                    follow_ups,
                })
            }
            Err(failure) => {
                let is_captcha = failure == SearchFailure::Captcha;
                let is_timeout = failure == SearchFailure::Timeout;
                self.breakers
                    .record_failure(&engine, is_captcha, is_timeout)
                    .await?;
                anyhow::bail!(
                    "search failed: engine={} captcha={} timeout={}",
                    engine,
                    is_captcha,
                    is_timeout
                );
            }
        }
    }
}
