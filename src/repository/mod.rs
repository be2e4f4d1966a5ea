//! Repository layer over the evidence graph database.
//!
//! One repository per aggregate. All queries are runtime SQL bound through
//! sqlx; the single write path serializes through the shared pool.

mod calibration_repository;
mod claim_repository;
mod edge_repository;
mod engine_health_repository;
mod job_repository;
mod page_repository;
mod search_repository;
mod task_repository;

pub use calibration_repository::{CalibrationRepository, CalibrationVersion};
pub use claim_repository::ClaimRepository;
pub use edge_repository::EdgeRepository;
pub use engine_health_repository::EngineHealthRepository;
pub use job_repository::JobRepository;
pub use page_repository::{page_id_for_url, PageRepository, TaskHarvest};
pub use search_repository::SearchRepository;
pub use task_repository::TaskRepository;

use chrono::{DateTime, Utc};

/// Parse an RFC3339 column, falling back to now on malformed rows.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_datetime_opt(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.map(parse_datetime)
}
