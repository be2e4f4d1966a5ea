//! query_sql: guarded read-only SQL over the evidence graph.

use serde::Deserialize;

use super::AppContext;
use crate::error::{AppError, Result};
use crate::service::sql_guard::{
    self, SqlGuardOptions, SqlQueryOutput, DEFAULT_LIMIT, DEFAULT_MAX_VM_STEPS,
    DEFAULT_TIMEOUT_MS, MAX_LIMIT, MAX_MAX_VM_STEPS, MAX_TIMEOUT_MS,
};

#[derive(Debug, Default, Deserialize)]
pub struct QuerySqlOptions {
    pub limit: Option<i64>,
    pub timeout_ms: Option<i64>,
    pub max_vm_steps: Option<i64>,
    #[serde(default)]
    pub include_schema: bool,
}

#[derive(Debug, Deserialize)]
pub struct QuerySqlRequest {
    pub sql: String,
    #[serde(default)]
    pub options: QuerySqlOptions,
}

pub async fn query_sql(ctx: &AppContext, req: QuerySqlRequest) -> Result<SqlQueryOutput> {
    super::require_non_empty(&req.sql, "sql")?;

    sql_guard::validate_sql_text(&req.sql).map_err(|message| {
        AppError::invalid_params(message, "sql", "read-only SELECT query")
    })?;

    let limit = req.options.limit.unwrap_or(DEFAULT_LIMIT as i64);
    if !(1..=MAX_LIMIT as i64).contains(&limit) {
        return Err(AppError::invalid_params(
            format!("limit must be between 1 and {}", MAX_LIMIT),
            "options.limit",
            format!("integer 1-{}", MAX_LIMIT),
        ));
    }

    let timeout_ms = req.options.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS as i64);
    if !(1..=MAX_TIMEOUT_MS as i64).contains(&timeout_ms) {
        return Err(AppError::invalid_params(
            format!("timeout_ms must be between 1 and {}", MAX_TIMEOUT_MS),
            "options.timeout_ms",
            format!("integer 1-{}", MAX_TIMEOUT_MS),
        ));
    }

    let max_vm_steps = req.options.max_vm_steps.unwrap_or(DEFAULT_MAX_VM_STEPS as i64);
    if !(1..=MAX_MAX_VM_STEPS as i64).contains(&max_vm_steps) {
        return Err(AppError::invalid_params(
            format!("max_vm_steps must be between 1 and {}", MAX_MAX_VM_STEPS),
            "options.max_vm_steps",
            format!("integer 1-{}", MAX_MAX_VM_STEPS),
        ));
    }

    let options = SqlGuardOptions {
        limit: limit as usize,
        timeout_ms: timeout_ms as u64,
        max_vm_steps: max_vm_steps as u64,
        include_schema: req.options.include_schema,
    };

    Ok(sql_guard::execute(ctx.db_path.clone(), req.sql, options).await)
}
