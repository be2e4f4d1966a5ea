//! Per-engine circuit breakers.
//!
//! Each engine has a CLOSED/OPEN/HALF-OPEN state machine with EMA health
//! metrics and an exponential cooldown driven by the failure history.
//! State is written through to the `engine_health` table after every
//! record; a breaker with no prior row starts CLOSED with perfect metrics.
//!
//! Transitions:
//! - CLOSED -> OPEN      consecutive_failures >= failure_threshold
//! - OPEN -> HALF-OPEN   now >= cooldown_until (computed lazily on read)
//! - HALF-OPEN -> CLOSED first probe success
//! - HALF-OPEN -> OPEN   probe failure, new cooldown
//!
//! The breaker never errors toward callers; availability is checked with
//! `is_available` before the caller decides to skip or probe.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::domain::EngineHealth;
use crate::repository::EngineHealthRepository;

/// EMA smoothing for the 1h-horizon metrics.
const EMA_ALPHA: f64 = 0.1;
/// Slower horizon consumed by the policy engine's success factor.
const EMA_ALPHA_24H: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl std::str::FromStr for CircuitState {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half-open" => Ok(Self::HalfOpen),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_min_minutes: u32,
    pub cooldown_max_minutes: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 2,
            cooldown_min_minutes: 5,
            cooldown_max_minutes: 120,
        }
    }
}

/// Exponential cooldown: doubles per failure beyond the threshold, clamped
/// to [base, max] minutes. Deterministic; no jitter.
fn cooldown_minutes(extra_failures: u32, base_minutes: u32, max_minutes: u32) -> u32 {
    let exponent = extra_failures.min(20);
    let cooldown = (base_minutes as u64).saturating_mul(1u64 << exponent);
    cooldown.min(max_minutes as u64).max(base_minutes as u64) as u32
}

/// Breaker metrics snapshot for the tool surface and logs.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub engine: String,
    pub state: &'static str,
    pub success_rate_1h: f64,
    pub success_rate_24h: f64,
    pub latency_ema_ms: f64,
    pub captcha_rate: f64,
    pub consecutive_failures: i64,
    pub total_failures_in_window: i64,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub is_available: bool,
}

/// Circuit breaker for a single search engine.
#[derive(Debug, Clone)]
pub struct EngineCircuitBreaker {
    pub engine: String,
    settings: BreakerSettings,
    state: CircuitState,
    consecutive_failures: i64,
    total_failures_in_window: i64,
    cooldown_until: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
    success_rate_1h: f64,
    success_rate_24h: f64,
    latency_ema_ms: f64,
    captcha_rate: f64,
}

impl EngineCircuitBreaker {
    pub fn new(engine: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            engine: engine.into(),
            settings,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_failures_in_window: 0,
            cooldown_until: None,
            last_used_at: None,
            success_rate_1h: 1.0,
            success_rate_24h: 1.0,
            latency_ema_ms: 1000.0,
            captcha_rate: 0.0,
        }
    }

    /// Current state; OPEN lazily becomes HALF-OPEN once the cooldown has
    /// elapsed. `cooldown_until` is held only while OPEN.
    pub fn state(&mut self) -> CircuitState {
        if self.state == CircuitState::Open {
            if let Some(until) = self.cooldown_until {
                if Utc::now() >= until {
                    self.state = CircuitState::HalfOpen;
                    self.cooldown_until = None;
                    log::info!("Circuit half-opened for probing: engine={}", self.engine);
                }
            }
        }
        self.state
    }

    pub fn is_available(&mut self) -> bool {
        matches!(self.state(), CircuitState::Closed | CircuitState::HalfOpen)
    }

    pub fn record_success(&mut self, latency_ms: Option<f64>) {
        self.state();

        self.success_rate_1h = EMA_ALPHA * 1.0 + (1.0 - EMA_ALPHA) * self.success_rate_1h;
        self.success_rate_24h = EMA_ALPHA_24H * 1.0 + (1.0 - EMA_ALPHA_24H) * self.success_rate_24h;
        if let Some(latency) = latency_ms {
            self.latency_ema_ms = EMA_ALPHA * latency + (1.0 - EMA_ALPHA) * self.latency_ema_ms;
        }

        self.consecutive_failures = 0;
        self.last_used_at = Some(Utc::now());

        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
            self.cooldown_until = None;
            self.total_failures_in_window = (self.total_failures_in_window - 1).max(0);
            log::info!(
                "Circuit closed after successful probe: engine={} success_rate={:.3}",
                self.engine,
                self.success_rate_1h
            );
        }
    }

    pub fn record_failure(&mut self, is_captcha: bool, is_timeout: bool) {
        self.state();

        self.success_rate_1h = (1.0 - EMA_ALPHA) * self.success_rate_1h;
        self.success_rate_24h = (1.0 - EMA_ALPHA_24H) * self.success_rate_24h;
        self.captcha_rate = if is_captcha {
            EMA_ALPHA * 1.0 + (1.0 - EMA_ALPHA) * self.captcha_rate
        } else {
            (1.0 - EMA_ALPHA) * self.captcha_rate
        };

        self.consecutive_failures += 1;
        self.total_failures_in_window += 1;
        self.last_used_at = Some(Utc::now());

        if self.state == CircuitState::HalfOpen {
            self.open_circuit();
            log::warn!("Circuit reopened after failed probe: engine={}", self.engine);
        } else if self.state == CircuitState::Closed
            && self.consecutive_failures >= self.settings.failure_threshold as i64
        {
            self.open_circuit();
            log::warn!(
                "Circuit opened: engine={} consecutive_failures={} timeout={}",
                self.engine,
                self.consecutive_failures,
                is_timeout
            );
        }
    }

    fn open_circuit(&mut self) {
        let extra = (self.total_failures_in_window as u32)
            .saturating_sub(self.settings.failure_threshold);
        let minutes = cooldown_minutes(
            extra,
            self.settings.cooldown_min_minutes,
            self.settings.cooldown_max_minutes,
        );
        self.state = CircuitState::Open;
        self.cooldown_until = Some(Utc::now() + ChronoDuration::minutes(minutes as i64));
        log::info!(
            "Circuit opened: engine={} cooldown_minutes={}",
            self.engine,
            minutes
        );
    }

    /// Manual open. Idempotent; custom cooldown defaults to cooldown_max.
    pub fn force_open(&mut self, cooldown_minutes: Option<u32>) {
        let minutes = cooldown_minutes.unwrap_or(self.settings.cooldown_max_minutes);
        self.state = CircuitState::Open;
        self.cooldown_until = Some(Utc::now() + ChronoDuration::minutes(minutes as i64));
        log::info!("Circuit force-opened: engine={} minutes={}", self.engine, minutes);
    }

    /// Manual close. Idempotent; zeroes failures and clears the cooldown.
    pub fn force_close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.cooldown_until = None;
        log::info!("Circuit force-closed: engine={}", self.engine);
    }

    pub fn metrics(&mut self) -> BreakerMetrics {
        let state = self.state();
        BreakerMetrics {
            engine: self.engine.clone(),
            state: state.as_str(),
            success_rate_1h: self.success_rate_1h,
            success_rate_24h: self.success_rate_24h,
            latency_ema_ms: self.latency_ema_ms,
            captcha_rate: self.captcha_rate,
            consecutive_failures: self.consecutive_failures,
            total_failures_in_window: self.total_failures_in_window,
            cooldown_until: self.cooldown_until,
            is_available: matches!(state, CircuitState::Closed | CircuitState::HalfOpen),
        }
    }

    pub fn to_health(&mut self) -> EngineHealth {
        let state = self.state();
        EngineHealth {
            engine: self.engine.clone(),
            status: state.as_str().to_string(),
            success_rate_1h: self.success_rate_1h,
            success_rate_24h: self.success_rate_24h,
            captcha_rate: self.captcha_rate,
            median_latency_ms: self.latency_ema_ms,
            consecutive_failures: self.consecutive_failures,
            total_failures_in_window: self.total_failures_in_window,
            cooldown_until: self.cooldown_until,
            last_used_at: self.last_used_at,
        }
    }

    pub fn apply_health(&mut self, health: &EngineHealth) {
        self.state = health.status.parse().unwrap_or(CircuitState::Closed);
        self.success_rate_1h = health.success_rate_1h;
        self.success_rate_24h = health.success_rate_24h;
        self.captcha_rate = health.captcha_rate;
        self.latency_ema_ms = health.median_latency_ms;
        self.consecutive_failures = health.consecutive_failures;
        self.total_failures_in_window = health.total_failures_in_window;
        self.cooldown_until = health.cooldown_until;
        self.last_used_at = health.last_used_at;
    }

    #[cfg(test)]
    pub(crate) fn set_cooldown_until(&mut self, until: Option<DateTime<Utc>>) {
        self.cooldown_until = until;
    }

    #[cfg(test)]
    pub(crate) fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        self.cooldown_until
    }
}

/// Manages breakers for all engines, with write-through persistence.
pub struct CircuitBreakerManager {
    repo: EngineHealthRepository,
    settings: BreakerSettings,
    breakers: Mutex<HashMap<String, EngineCircuitBreaker>>,
}

impl CircuitBreakerManager {
    pub fn new(pool: SqlitePool, settings: BreakerSettings) -> Self {
        Self {
            repo: EngineHealthRepository::new(pool),
            settings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` against the engine's breaker, loading persisted state on
    /// first touch and writing through afterwards.
    async fn with_breaker<T>(
        &self,
        engine: &str,
        f: impl FnOnce(&mut EngineCircuitBreaker) -> T,
    ) -> Result<T> {
        let mut breakers = self.breakers.lock().await;

        if !breakers.contains_key(engine) {
            let mut breaker = EngineCircuitBreaker::new(engine, self.settings);
            if let Some(health) = self.repo.get(engine).await? {
                breaker.apply_health(&health);
            }
            breakers.insert(engine.to_string(), breaker);
        }

        let breaker = breakers.get_mut(engine).expect("breaker just inserted");
        let out = f(breaker);
        let health = breaker.to_health();
        self.repo.upsert(&health).await?;
        Ok(out)
    }

    pub async fn is_available(&self, engine: &str) -> Result<bool> {
        self.with_breaker(engine, |b| b.is_available()).await
    }

    pub async fn record_success(&self, engine: &str, latency_ms: Option<f64>) -> Result<()> {
        self.with_breaker(engine, |b| b.record_success(latency_ms)).await
    }

    pub async fn record_failure(&self, engine: &str, is_captcha: bool, is_timeout: bool) -> Result<()> {
        self.with_breaker(engine, |b| b.record_failure(is_captcha, is_timeout))
            .await
    }

    pub async fn force_open(&self, engine: &str, cooldown_minutes: Option<u32>) -> Result<()> {
        self.with_breaker(engine, |b| b.force_open(cooldown_minutes)).await
    }

    pub async fn force_close(&self, engine: &str) -> Result<()> {
        self.with_breaker(engine, |b| b.force_close()).await
    }

    pub async fn metrics(&self, engine: &str) -> Result<BreakerMetrics> {
        self.with_breaker(engine, |b| b.metrics()).await
    }

    /// Filter the requested engines down to the currently available ones.
    pub async fn available_engines(&self, requested: &[String]) -> Result<Vec<String>> {
        let mut available = Vec::new();
        for engine in requested {
            if self.is_available(engine).await? {
                available.push(engine.clone());
            }
        }
        Ok(available)
    }

    #[cfg(test)]
    pub(crate) async fn expire_cooldown(&self, engine: &str) -> Result<()> {
        self.with_breaker(engine, |b| {
            b.set_cooldown_until(Some(Utc::now() - ChronoDuration::seconds(1)));
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 2,
            cooldown_min_minutes: 1,
            cooldown_max_minutes: 60,
        }
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let mut breaker = EngineCircuitBreaker::new("duckduckgo", settings());
        assert!(breaker.is_available());

        breaker.record_failure(false, false);
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure(false, false);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_available());

        // First open uses exactly the minimum cooldown.
        let until = breaker.cooldown_until().expect("cooldown while open");
        let remaining = (until - Utc::now()).num_seconds();
        assert!((55..=60).contains(&remaining), "remaining={}", remaining);
    }

    #[test]
    fn half_opens_after_cooldown_then_closes_on_probe_success() {
        let mut breaker = EngineCircuitBreaker::new("duckduckgo", settings());
        breaker.record_failure(false, false);
        breaker.record_failure(false, false);
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.set_cooldown_until(Some(Utc::now() - ChronoDuration::seconds(1)));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.is_available());

        breaker.record_success(Some(400.0));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.cooldown_until().is_none());
    }

    #[test]
    fn probe_failure_reopens_with_longer_cooldown() {
        let mut breaker = EngineCircuitBreaker::new("duckduckgo", settings());
        breaker.record_failure(false, false);
        breaker.record_failure(false, false);
        breaker.set_cooldown_until(Some(Utc::now() - ChronoDuration::seconds(1)));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure(false, false);
        assert_eq!(breaker.state(), CircuitState::Open);

        // Third failure in window doubles the base cooldown.
        let until = breaker.cooldown_until().unwrap();
        let remaining = (until - Utc::now()).num_seconds();
        assert!((115..=120).contains(&remaining), "remaining={}", remaining);
    }

    #[test]
    fn cooldown_never_exceeds_max() {
        assert_eq!(cooldown_minutes(0, 1, 60), 1);
        assert_eq!(cooldown_minutes(1, 1, 60), 2);
        assert_eq!(cooldown_minutes(5, 1, 60), 32);
        assert_eq!(cooldown_minutes(6, 1, 60), 60);
        assert_eq!(cooldown_minutes(63, 1, 60), 60);
    }

    #[test]
    fn ema_metrics_track_failures_and_captcha() {
        let mut breaker = EngineCircuitBreaker::new("mojeek", settings());

        breaker.record_failure(true, false);
        let m = breaker.metrics();
        assert!((m.success_rate_1h - 0.9).abs() < 1e-9);
        assert!((m.captcha_rate - 0.1).abs() < 1e-9);

        breaker.record_success(Some(500.0));
        let m = breaker.metrics();
        assert!((m.success_rate_1h - 0.91).abs() < 1e-9);
        // Latency EMA moved from 1000 toward 500.
        assert!((m.latency_ema_ms - 950.0).abs() < 1e-9);
    }

    #[test]
    fn force_overrides_are_idempotent() {
        let mut breaker = EngineCircuitBreaker::new("brave", settings());

        breaker.force_open(Some(10));
        breaker.force_open(Some(10));
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.force_close();
        breaker.force_close();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().consecutive_failures, 0);
        assert!(breaker.cooldown_until().is_none());
    }

    #[tokio::test]
    async fn manager_persists_write_through_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;

        {
            let manager = CircuitBreakerManager::new(pool.clone(), settings());
            manager.record_failure("duckduckgo", false, true).await.unwrap();
            manager.record_failure("duckduckgo", false, false).await.unwrap();
            assert!(!manager.is_available("duckduckgo").await.unwrap());
        }

        // A fresh manager sees the persisted OPEN state.
        let manager = CircuitBreakerManager::new(pool.clone(), settings());
        assert!(!manager.is_available("duckduckgo").await.unwrap());

        // Engines with no prior record start CLOSED with perfect metrics.
        let m = manager.metrics("never_seen").await.unwrap();
        assert_eq!(m.state, "closed");
        assert!((m.success_rate_1h - 1.0).abs() < f64::EPSILON);

        // Cooldown elapse is observed through the persisted row as well.
        manager.expire_cooldown("duckduckgo").await.unwrap();
        assert!(manager.is_available("duckduckgo").await.unwrap());
        manager.record_success("duckduckgo", Some(300.0)).await.unwrap();
        assert_eq!(manager.metrics("duckduckgo").await.unwrap().state, "closed");
    }

    #[tokio::test]
    async fn available_engines_filters_open_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::test_pool(dir.path()).await;
        let manager = CircuitBreakerManager::new(pool, settings());

        manager.force_open("bad_engine", Some(30)).await.unwrap();

        let requested = vec!["good_engine".to_string(), "bad_engine".to_string()];
        let available = manager.available_engines(&requested).await.unwrap();
        assert_eq!(available, vec!["good_engine".to_string()]);
    }
}
