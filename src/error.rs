//! Error types for the search-and-verify engine.
//!
//! This module provides structured error handling with:
//! - `AppError`: the error taxonomy shared by all tools and services
//! - `ErrorEnvelope`: serializable error payload returned by the tool surface
//! - `Result<T>`: type alias for Results using AppError

use serde::Serialize;
use thiserror::Error;

/// Error taxonomy for the tool surface and internal services.
///
/// Tools never process-exit; every error is rendered into the return
/// envelope with a stable `kind` string.
#[derive(Debug, Error)]
pub enum AppError {
    /// Caller passed a malformed or out-of-range parameter.
    #[error("{message}")]
    InvalidParams {
        message: String,
        param: String,
        expected: String,
    },

    /// Task or entity missing.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Operation rejected by policy (failed task, forbidden SQL keyword).
    #[error("{0}")]
    PolicyRejected(String),

    /// External I/O failure (fetch, search, LLM). Absorbed by the circuit
    /// breaker and recorded on the failed job, never raised to tool callers.
    #[error("transient external error: {0}")]
    TransientExternal(String),

    /// SQL budget exceeded (step budget or wall-clock deadline).
    #[error("{0}")]
    Interrupted(String),

    /// Calibration rollback target absent.
    #[error("{0}")]
    Calibration(String),

    /// Unexpected internal failure. Logged with the causal trace; callers
    /// see a redacted message.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn invalid_params(
        message: impl Into<String>,
        param: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidParams {
            message: message.into(),
            param: param.into(),
            expected: expected.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParams { .. } => "invalid_params",
            Self::NotFound { .. } => "not_found",
            Self::PolicyRejected(_) => "policy_rejected",
            Self::TransientExternal(_) => "transient_external",
            Self::Interrupted(_) => "interrupted",
            Self::Calibration(_) => "calibration",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type alias using AppError.
pub type Result<T> = std::result::Result<T, AppError>;

/// Serializable error payload for the tool envelope.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
}

impl From<&AppError> for ErrorEnvelope {
    fn from(error: &AppError) -> Self {
        let (param, expected) = match error {
            AppError::InvalidParams {
                param, expected, ..
            } => (Some(param.clone()), Some(expected.clone())),
            _ => (None, None),
        };

        let message = match error {
            // Internal details stay in the logs.
            AppError::Internal(e) => {
                log::error!("Internal error surfaced to tool caller: {:#}", e);
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        Self {
            ok: false,
            kind: error.kind(),
            message,
            param,
            expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_params_envelope_identifies_parameter() {
        let err = AppError::invalid_params(
            "limit must be between 1 and 200",
            "options.limit",
            "integer 1-200",
        );
        let env = ErrorEnvelope::from(&err);

        assert!(!env.ok);
        assert_eq!(env.kind, "invalid_params");
        assert_eq!(env.param.as_deref(), Some("options.limit"));
        assert_eq!(env.expected.as_deref(), Some("integer 1-200"));
        assert!(env.message.contains("limit"));
    }

    #[test]
    fn internal_error_is_redacted() {
        let err = AppError::Internal(anyhow::anyhow!("secret db path /tmp/x"));
        let env = ErrorEnvelope::from(&err);

        assert_eq!(env.kind, "internal");
        assert!(!env.message.contains("/tmp/x"));
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            AppError::PolicyRejected("task failed".into()).kind(),
            "policy_rejected"
        );
        assert_eq!(
            AppError::Interrupted("budget exceeded".into()).kind(),
            "interrupted"
        );
        assert_eq!(AppError::not_found("task", "t_x").kind(), "not_found");
    }
}
