//! calibration_metrics and calibration_rollback.
//!
//! Calibration training happens offline; this surface only inspects the
//! parameter history and performs the (destructive) rollback, which is a
//! separate tool so it cannot be invoked by accident.

use serde::{Deserialize, Serialize};

use super::AppContext;
use crate::error::{AppError, Result};
use crate::repository::{CalibrationRepository, CalibrationVersion};

#[derive(Debug, Deserialize)]
pub struct CalibrationMetricsRequest {
    pub action: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SourceStats {
    pub source: String,
    pub current_version: i64,
    pub method: String,
    pub brier_after: Option<f64>,
    pub version_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum CalibrationMetricsResponse {
    Stats {
        ok: bool,
        sources: Vec<SourceStats>,
    },
    Evaluations {
        ok: bool,
        source: String,
        evaluations: Vec<CalibrationVersion>,
    },
}

pub async fn calibration_metrics(
    ctx: &AppContext,
    req: CalibrationMetricsRequest,
) -> Result<CalibrationMetricsResponse> {
    let repo = CalibrationRepository::new(ctx.pool.clone());

    match req.action.as_str() {
        "get_stats" => {
            let mut sources = Vec::new();
            for source in repo.sources().await? {
                let history = repo.history(&source).await?;
                if let Some(latest) = history.last() {
                    sources.push(SourceStats {
                        source: source.clone(),
                        current_version: latest.version,
                        method: latest.method.clone(),
                        brier_after: latest.brier_after,
                        version_count: history.len(),
                    });
                }
            }
            Ok(CalibrationMetricsResponse::Stats { ok: true, sources })
        }
        "get_evaluations" => {
            let source = req.source.ok_or_else(|| {
                AppError::invalid_params(
                    "source is required for get_evaluations",
                    "source",
                    "non-empty string",
                )
            })?;
            let evaluations = repo.history(&source).await?;
            Ok(CalibrationMetricsResponse::Evaluations {
                ok: true,
                source,
                evaluations,
            })
        }
        other => Err(AppError::invalid_params(
            format!("unknown action: {}", other),
            "action",
            "one of: get_stats, get_evaluations",
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct CalibrationRollbackRequest {
    pub source: String,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "Manual rollback".to_string()
}

#[derive(Debug, Serialize)]
pub struct CalibrationRollbackResponse {
    pub ok: bool,
    pub source: String,
    pub rolled_back_to: i64,
    pub previous_version: i64,
    pub reason: String,
    pub method: String,
    pub brier_after: Option<f64>,
}

pub async fn calibration_rollback(
    ctx: &AppContext,
    req: CalibrationRollbackRequest,
) -> Result<CalibrationRollbackResponse> {
    super::require_non_empty(&req.source, "source")?;

    let repo = CalibrationRepository::new(ctx.pool.clone());
    let current = repo.latest_version(&req.source).await?;
    let previous_version = current.as_ref().map(|v| v.version).unwrap_or(0);

    let target_version = match req.version {
        Some(v) => v,
        None => {
            if previous_version <= 1 {
                return Err(AppError::Calibration(format!(
                    "Cannot rollback: no previous version for source '{}'",
                    req.source
                )));
            }
            previous_version - 1
        }
    };

    let target = repo
        .get_version(&req.source, target_version)
        .await?
        .ok_or_else(|| {
            AppError::Calibration(format!(
                "Rollback failed: version {} not found for source '{}'",
                target_version, req.source
            ))
        })?;

    // The rollback is itself a new version pointing at the old parameters,
    // so the history stays append-only.
    repo.insert_version(
        &req.source,
        &target.method,
        &target.params,
        target.brier_before,
        target.brier_after,
        Some(&req.reason),
    )
    .await?;

    log::warn!(
        "Calibration rolled back: source={} from_version={} to_version={} reason={}",
        req.source,
        previous_version,
        target_version,
        req.reason
    );

    Ok(CalibrationRollbackResponse {
        ok: true,
        source: req.source,
        rolled_back_to: target_version,
        previous_version,
        reason: req.reason,
        method: target.method,
        brier_after: target.brier_after,
    })
}
