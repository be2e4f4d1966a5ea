//! Runtime configuration.
//!
//! Paths and endpoints are resolved from environment variables with
//! data-dir-relative defaults. CLI argument parsing lives with the host.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the database, fetched HTML and reports.
    pub data_dir: PathBuf,
    /// Evidence graph database file.
    pub db_path: PathBuf,
    /// Directory for fetched HTML bodies.
    pub html_dir: PathBuf,
    /// Directory for generated reports (composition is out of core).
    pub reports_dir: PathBuf,
    /// Declarative engine configuration document.
    pub engines_config_path: PathBuf,
    /// Local LLM completion endpoint.
    pub llm_base_url: String,
    /// Circuit breaker defaults.
    pub failure_threshold: u32,
    pub cooldown_min_minutes: u32,
    pub cooldown_max_minutes: u32,
    /// Lastmile activation threshold on the task harvest rate (inclusive).
    pub lastmile_threshold: f64,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("ARGUS_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        Self::with_data_dir(data_dir)
    }

    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        let engines_config_path = std::env::var("ARGUS_ENGINES_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./config/engines.yaml"));

        Self {
            db_path: data_dir.join("evidence.db"),
            html_dir: data_dir.join("html"),
            reports_dir: data_dir.join("reports"),
            data_dir,
            engines_config_path,
            llm_base_url: std::env::var("ARGUS_LLM_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            failure_threshold: 2,
            cooldown_min_minutes: 5,
            cooldown_max_minutes: 120,
            lastmile_threshold: 0.9,
        }
    }
}
