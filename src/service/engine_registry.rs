//! Search engine registry.
//!
//! Engines are declared in a YAML document keyed by engine name. The
//! registry publishes immutable snapshots behind an atomic pointer swap:
//! readers keep whatever snapshot they borrowed, a reload publishes a new
//! one, and a failed reload leaves the running snapshot untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Query operators an engine may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOperator {
    Site,
    Filetype,
    Intitle,
    Exact,
    Exclude,
    DateAfter,
}

impl QueryOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Site => "site",
            Self::Filetype => "filetype",
            Self::Intitle => "intitle",
            Self::Exact => "exact",
            Self::Exclude => "exclude",
            Self::DateAfter => "date_after",
        }
    }
}

/// One engine's declarative configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub name: String,
    pub base_url: String,
    /// Base weight used when no category-specific weight applies.
    pub weight: f64,
    /// Per-category weights in [0, 1].
    pub category_weights: BTreeMap<String, f64>,
    pub qps: f64,
    pub daily_limit: Option<i64>,
    pub is_lastmile: bool,
    pub timeout_ms: u64,
    pub headers: BTreeMap<String, String>,
    /// Supported operators with their per-engine syntax templates
    /// (`{value}` placeholder).
    pub operator_syntax: BTreeMap<QueryOperator, String>,
}

impl EngineConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.qps)
    }

    pub fn min_interval_seconds(&self) -> f64 {
        1.0 / self.qps
    }

    pub fn supports(&self, op: QueryOperator) -> bool {
        self.operator_syntax.contains_key(&op)
    }

    pub fn category_weight(&self, category: &str) -> f64 {
        self.category_weights.get(category).copied().unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// YAML document shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EnginesDocument {
    engines: BTreeMap<String, EngineEntry>,
}

#[derive(Debug, Deserialize)]
struct EngineEntry {
    base_url: String,
    weight: f64,
    qps: f64,
    #[serde(default)]
    daily_limit: Option<i64>,
    #[serde(default)]
    is_lastmile: bool,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    categories: BTreeMap<String, f64>,
    #[serde(default)]
    operators: BTreeMap<QueryOperator, String>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    engines: BTreeMap<String, Arc<EngineConfig>>,
}

impl RegistrySnapshot {
    pub fn get(&self, name: &str) -> Option<Arc<EngineConfig>> {
        self.engines.get(name).cloned()
    }

    pub fn engine_names(&self) -> Vec<String> {
        self.engines.keys().cloned().collect()
    }

    /// Engines carrying a weight for the category, heaviest first.
    pub fn get_for_category(&self, category: &str) -> Vec<Arc<EngineConfig>> {
        let mut engines: Vec<Arc<EngineConfig>> = self
            .engines
            .values()
            .filter(|e| e.category_weight(category) > 0.0)
            .cloned()
            .collect();
        engines.sort_by(|a, b| {
            b.category_weight(category)
                .partial_cmp(&a.category_weight(category))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        engines
    }

    pub fn get_lastmile_engines(&self) -> Vec<String> {
        self.engines
            .values()
            .filter(|e| e.is_lastmile)
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

pub struct EngineRegistry {
    path: PathBuf,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    last_mtime: RwLock<Option<SystemTime>>,
}

impl EngineRegistry {
    /// Load the registry from a YAML document. An unreadable document at
    /// startup yields an empty registry (engines simply unavailable).
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let registry = Self {
            path,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
            last_mtime: RwLock::new(None),
        };

        if let Err(e) = registry.reload() {
            log::warn!("Engine config not loaded, registry starts empty: {:#}", e);
        }
        registry
    }

    /// Current snapshot. Holders keep using it across reloads.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().expect("registry lock poisoned").clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<EngineConfig>> {
        self.snapshot().get(name)
    }

    pub fn get_for_category(&self, category: &str) -> Vec<Arc<EngineConfig>> {
        self.snapshot().get_for_category(category)
    }

    pub fn get_lastmile_engines(&self) -> Vec<String> {
        self.snapshot().get_lastmile_engines()
    }

    /// Parse and atomically publish a new snapshot.
    pub fn reload(&self) -> Result<()> {
        let snapshot = Arc::new(load_snapshot(&self.path)?);
        let mtime = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();

        *self.snapshot.write().expect("registry lock poisoned") = snapshot;
        *self.last_mtime.write().expect("registry lock poisoned") = mtime;

        log::info!(
            "Engine registry loaded: {} engines from {}",
            self.snapshot().len(),
            self.path.display()
        );
        Ok(())
    }

    /// Reload when the file mtime changed. A load failure keeps the prior
    /// snapshot and is reported through the log and the Err.
    pub fn reload_if_modified(&self) -> Result<bool> {
        let current = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();

        let known = *self.last_mtime.read().expect("registry lock poisoned");
        if current == known {
            return Ok(false);
        }

        match self.reload() {
            Ok(()) => Ok(true),
            Err(e) => {
                // Remember the bad mtime so a broken file is not re-parsed
                // every poll tick.
                *self.last_mtime.write().expect("registry lock poisoned") = current;
                log::error!("Engine config reload failed, keeping prior snapshot: {:#}", e);
                Err(e)
            }
        }
    }

    /// Background mtime poller.
    pub fn start_watcher(self: &Arc<Self>, poll_interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let _ = registry.reload_if_modified();
            }
        })
    }
}

fn load_snapshot(path: &Path) -> Result<RegistrySnapshot> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read engine config: {}", path.display()))?;
    let document: EnginesDocument =
        serde_yaml::from_str(&raw).context("failed to parse engine config document")?;

    let mut engines = BTreeMap::new();
    for (name, entry) in document.engines {
        if entry.qps <= 0.0 {
            log::warn!("Engine '{}' dropped: qps must be > 0 (got {})", name, entry.qps);
            continue;
        }
        if !(0.0..=1.0).contains(&entry.weight) {
            log::warn!(
                "Engine '{}' dropped: weight must be in [0, 1] (got {})",
                name,
                entry.weight
            );
            continue;
        }
        if entry.categories.values().any(|w| !(0.0..=1.0).contains(w)) {
            log::warn!("Engine '{}' dropped: category weight outside [0, 1]", name);
            continue;
        }

        engines.insert(
            name.clone(),
            Arc::new(EngineConfig {
                name,
                base_url: entry.base_url,
                weight: entry.weight,
                category_weights: entry.categories,
                qps: entry.qps,
                daily_limit: entry.daily_limit,
                is_lastmile: entry.is_lastmile,
                timeout_ms: entry.timeout_ms,
                headers: entry.headers,
                operator_syntax: entry.operators,
            }),
        );
    }

    Ok(RegistrySnapshot { engines })
}
