//! Engine selection policy.
//!
//! Turns persisted engine health into a dynamic weight, detects the query
//! category, and decides when the lastmile slot opens.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use super::circuit_breaker::CircuitBreakerManager;
use super::engine_registry::EngineRegistry;
use crate::domain::QueryCategory;
use crate::repository::EngineHealthRepository;

/// Hours after which metrics stop counting at all (weight reverts to base).
const STALE_HOURS: f64 = 48.0;
/// Metrics younger than this are considered fully fresh.
const FRESH_HOURS: f64 = 1.0;

/// Dynamic weight with the confidence in the metrics behind it.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DynamicWeight {
    pub weight: f64,
    pub confidence: f64,
}

/// Lastmile slot decision.
#[derive(Debug, Clone, Serialize)]
pub struct LastmileDecision {
    pub should_use_lastmile: bool,
    pub engine: Option<String>,
    pub harvest_rate: f64,
    pub threshold: f64,
}

/// Weight from base weight and recent health with time decay.
///
/// Stale metrics decay linearly toward the base weight: decay is 0 within
/// one hour of last use and 1 at 48h stale or never used. Output is clamped
/// to [0.1, 1.0]; confidence falls with the same decay.
pub fn calculate_dynamic_weight(
    base_weight: f64,
    success_rate_1h: f64,
    success_rate_24h: f64,
    captcha_rate: f64,
    latency_ms: f64,
    last_used_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DynamicWeight {
    let time_decay = match last_used_at {
        None => 1.0,
        Some(used) => {
            let hours = (now - used).num_seconds() as f64 / 3600.0;
            ((hours - FRESH_HOURS) / (STALE_HOURS - FRESH_HOURS)).clamp(0.0, 1.0)
        }
    };

    let success_factor = 0.6 * success_rate_1h + 0.4 * success_rate_24h;
    let latency_factor = 1.0 / (1.0 + latency_ms.max(0.0) / 1000.0);
    let health = base_weight * success_factor * latency_factor * (1.0 - captcha_rate);

    let weight = (health * (1.0 - time_decay) + time_decay * base_weight).clamp(0.1, 1.0);
    let confidence = 1.0 - time_decay;

    DynamicWeight { weight, confidence }
}

/// Deterministic keyword heuristics over the raw query. Advisory only; the
/// scheduler falls back to "all available" when nothing matches.
pub fn detect_category(query: &str) -> QueryCategory {
    let q = query.to_lowercase();

    const ACADEMIC: &[&str] = &[
        "paper", "study", "research", "journal", "doi", "arxiv", "peer-reviewed", "論文", "研究",
        "学会",
    ];
    const NEWS: &[&str] = &[
        "news", "breaking", "announced", "latest", "today", "ニュース", "速報", "発表",
    ];
    const GOVERNMENT: &[&str] = &[
        "government", "ministry", "regulation", "law", "policy", "official", "政府", "省庁",
        "法律", "規制",
    ];
    const TECHNICAL: &[&str] = &[
        "api", "documentation", "github", "error", "install", "code", "library", "実装",
        "ドキュメント",
    ];

    let matches = |words: &[&str]| words.iter().any(|w| q.contains(w));

    if matches(ACADEMIC) {
        QueryCategory::Academic
    } else if matches(GOVERNMENT) {
        QueryCategory::Government
    } else if matches(NEWS) {
        QueryCategory::News
    } else if matches(TECHNICAL) {
        QueryCategory::Technical
    } else {
        QueryCategory::General
    }
}

pub struct PolicyEngine {
    registry: Arc<EngineRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    health_repo: EngineHealthRepository,
    lastmile_threshold: f64,
}

impl PolicyEngine {
    pub fn new(
        pool: SqlitePool,
        registry: Arc<EngineRegistry>,
        breakers: Arc<CircuitBreakerManager>,
        lastmile_threshold: f64,
    ) -> Self {
        Self {
            registry,
            breakers,
            health_repo: EngineHealthRepository::new(pool),
            lastmile_threshold,
        }
    }

    /// Dynamic weight for an engine. Unknown engines fall back to 1.0 so
    /// ad-hoc engines sort last only through their missing category weight.
    pub async fn get_dynamic_engine_weight(&self, engine: &str) -> Result<DynamicWeight> {
        let Some(config) = self.registry.get(engine) else {
            return Ok(DynamicWeight {
                weight: 1.0,
                confidence: 0.0,
            });
        };

        let health = self.health_repo.get(engine).await?;
        let now = Utc::now();
        Ok(match health {
            Some(h) => calculate_dynamic_weight(
                config.weight,
                h.success_rate_1h,
                h.success_rate_24h,
                h.captcha_rate,
                h.median_latency_ms,
                h.last_used_at,
                now,
            ),
            None => calculate_dynamic_weight(config.weight, 1.0, 1.0, 0.0, 1000.0, None, now),
        })
    }

    /// Engines for a category, available per breaker, ordered by dynamic
    /// weight descending. Empty category match falls back to all engines.
    pub async fn rank_engines(&self, category: QueryCategory) -> Result<Vec<String>> {
        let snapshot = self.registry.snapshot();
        let mut candidates = snapshot.get_for_category(category.as_str());
        if candidates.is_empty() {
            candidates = snapshot
                .engine_names()
                .into_iter()
                .filter_map(|name| snapshot.get(&name))
                .collect();
        }

        let mut ranked = Vec::new();
        for config in candidates {
            if !self.breakers.is_available(&config.name).await? {
                continue;
            }
            let dynamic = self.get_dynamic_engine_weight(&config.name).await?;
            ranked.push((config.name.clone(), dynamic.weight));
        }

        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(ranked.into_iter().map(|(name, _)| name).collect())
    }

    /// Lastmile slot decision for a task-wide harvest rate (inclusive
    /// boundary). Returns the first lastmile engine that is available and
    /// under its daily cap, or no engine when none qualifies.
    pub async fn select_lastmile_engine(&self, harvest_rate: f64) -> Result<LastmileDecision> {
        if harvest_rate < self.lastmile_threshold {
            return Ok(LastmileDecision {
                should_use_lastmile: false,
                engine: None,
                harvest_rate,
                threshold: self.lastmile_threshold,
            });
        }

        let now = Utc::now();
        for name in self.registry.get_lastmile_engines() {
            let Some(config) = self.registry.get(&name) else {
                continue;
            };
            if !self.breakers.is_available(&name).await? {
                continue;
            }
            if let Some(limit) = config.daily_limit {
                let used = self.health_repo.daily_usage(&name, now).await?;
                if used >= limit {
                    log::debug!("Lastmile engine {} at daily cap ({}/{})", name, used, limit);
                    continue;
                }
            }
            return Ok(LastmileDecision {
                should_use_lastmile: true,
                engine: Some(name),
                harvest_rate,
                threshold: self.lastmile_threshold,
            });
        }

        Ok(LastmileDecision {
            should_use_lastmile: true,
            engine: None,
            harvest_rate,
            threshold: self.lastmile_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn hours_ago(h: i64) -> Option<DateTime<Utc>> {
        Some(Utc::now() - Duration::hours(h))
    }

    #[test]
    fn ideal_metrics_keep_weight_near_base() {
        let w = calculate_dynamic_weight(0.7, 1.0, 1.0, 0.0, 500.0, hours_ago(1), Utc::now());
        // Latency factor 1/(1+0.5) reduces the ideal weight.
        assert!(w.weight >= 0.4 && w.weight <= 1.0, "weight={}", w.weight);
        assert!(w.confidence > 0.9);
    }

    #[test]
    fn degraded_metrics_reduce_weight() {
        let good = calculate_dynamic_weight(0.7, 1.0, 1.0, 0.0, 500.0, hours_ago(1), Utc::now());
        let bad = calculate_dynamic_weight(0.7, 0.5, 0.6, 0.3, 2000.0, hours_ago(1), Utc::now());
        assert!(bad.weight < good.weight);
    }

    #[test]
    fn weight_is_clamped_to_unit_band() {
        let min = calculate_dynamic_weight(0.7, 0.0, 0.0, 1.0, 10_000.0, hours_ago(1), Utc::now());
        assert!(min.weight >= 0.1);

        let max = calculate_dynamic_weight(2.0, 1.0, 1.0, 0.0, 100.0, hours_ago(1), Utc::now());
        assert!(max.weight <= 1.0);

        let zero_latency =
            calculate_dynamic_weight(0.7, 1.0, 1.0, 0.0, 0.0, hours_ago(1), Utc::now());
        assert!((0.1..=1.0).contains(&zero_latency.weight));
    }

    #[test]
    fn stale_metrics_decay_toward_base_weight() {
        let now = Utc::now();
        let bad = |last_used| calculate_dynamic_weight(0.7, 0.3, 0.4, 0.5, 3000.0, last_used, now);

        let recent = bad(hours_ago(1));
        let half = bad(hours_ago(24));
        let stale = bad(hours_ago(48));
        let never = bad(None);

        // Bad metrics hurt less as they go stale.
        assert!(half.weight > recent.weight);
        assert!(stale.weight >= half.weight);
        assert!((stale.weight - 0.7).abs() < 1e-9);
        assert!((never.weight - 0.7).abs() < 1e-9);

        // Confidence tracks freshness.
        assert!(recent.confidence > 0.8);
        assert!((0.5..=0.8).contains(&bad(hours_ago(12)).confidence));
        assert!((0.3..=0.6).contains(&half.confidence));
        assert!(stale.confidence <= 0.3);
        assert!(never.confidence <= f64::EPSILON);
    }

    #[test]
    fn category_detection_uses_keyword_cues() {
        assert_eq!(detect_category("arxiv transformer paper"), QueryCategory::Academic);
        assert_eq!(detect_category("AI規制 政府 方針"), QueryCategory::Government);
        assert_eq!(detect_category("GPT-4 breaking news"), QueryCategory::News);
        assert_eq!(detect_category("tokio api documentation"), QueryCategory::Technical);
        assert_eq!(detect_category("weather in paris"), QueryCategory::General);
    }

    // -- registry-backed tests ------------------------------------------------

    use crate::service::circuit_breaker::BreakerSettings;
    use std::io::Write;

    const ENGINES: &str = r#"
engines:
  duckduckgo:
    base_url: "https://duckduckgo.com/html"
    weight: 0.7
    qps: 0.2
    categories:
      general: 0.7
  brave:
    base_url: "https://search.brave.com/search"
    weight: 0.9
    qps: 0.1
    daily_limit: 50
    is_lastmile: true
    categories:
      general: 0.9
  google:
    base_url: "https://www.google.com/search"
    weight: 1.0
    qps: 0.05
    daily_limit: 20
    is_lastmile: true
    categories:
      general: 1.0
"#;

    async fn policy(dir: &tempfile::TempDir) -> (PolicyEngine, Arc<CircuitBreakerManager>, SqlitePool) {
        let pool = crate::db::test_pool(dir.path()).await;
        let config_path = dir.path().join("engines.yaml");
        let mut f = std::fs::File::create(&config_path).unwrap();
        f.write_all(ENGINES.as_bytes()).unwrap();

        let registry = Arc::new(EngineRegistry::load(&config_path));
        let breakers = Arc::new(CircuitBreakerManager::new(
            pool.clone(),
            BreakerSettings::default(),
        ));
        let policy = PolicyEngine::new(pool.clone(), registry, breakers.clone(), 0.9);
        (policy, breakers, pool)
    }

    #[tokio::test]
    async fn unknown_engine_falls_back_to_default_weight() {
        let dir = tempfile::tempdir().unwrap();
        let (policy, _, _) = policy(&dir).await;

        let w = policy
            .get_dynamic_engine_weight("nonexistent_engine_xyz")
            .await
            .unwrap();
        assert!((w.weight - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn lastmile_boundary_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let (policy, _, _) = policy(&dir).await;

        let below = policy.select_lastmile_engine(0.89).await.unwrap();
        assert!(!below.should_use_lastmile);
        assert!(below.engine.is_none());

        let exact = policy.select_lastmile_engine(0.9).await.unwrap();
        assert!(exact.should_use_lastmile);
        assert_eq!(exact.engine.as_deref(), Some("brave"));

        let above = policy.select_lastmile_engine(1.0).await.unwrap();
        assert!(above.should_use_lastmile);
    }

    #[tokio::test]
    async fn lastmile_skips_engines_at_daily_cap_and_open_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let (policy, breakers, pool) = policy(&dir).await;

        // Fill brave's daily cap.
        let repo = EngineHealthRepository::new(pool.clone());
        for _ in 0..50 {
            repo.bump_daily_usage("brave", Utc::now()).await.unwrap();
        }

        let decision = policy.select_lastmile_engine(0.95).await.unwrap();
        assert_eq!(decision.engine.as_deref(), Some("google"));

        // With google's breaker open as well, no engine qualifies.
        breakers.force_open("google", Some(30)).await.unwrap();
        let decision = policy.select_lastmile_engine(0.95).await.unwrap();
        assert!(decision.should_use_lastmile);
        assert!(decision.engine.is_none());
    }

    #[tokio::test]
    async fn rank_engines_skips_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let (policy, breakers, _) = policy(&dir).await;

        breakers.force_open("brave", Some(30)).await.unwrap();
        let ranked = policy.rank_engines(QueryCategory::General).await.unwrap();
        assert!(!ranked.contains(&"brave".to_string()));
        assert!(ranked.contains(&"duckduckgo".to_string()));
    }
}
