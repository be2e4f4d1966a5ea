//! feedback: human-in-the-loop corrections at three levels.
//!
//! Domain: block/unblock/clear an override. Claim: reject/restore.
//! Edge: correct relation or confidence.

use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::AppContext;
use crate::domain::EdgeRelation;
use crate::error::{AppError, Result};
use crate::repository::{ClaimRepository, EdgeRepository};

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FeedbackRequest {
    DomainBlock {
        domain: String,
        #[serde(default)]
        reason: Option<String>,
    },
    DomainUnblock {
        domain: String,
        #[serde(default)]
        reason: Option<String>,
    },
    DomainClearOverride {
        domain: String,
    },
    ClaimReject {
        claim_id: String,
    },
    ClaimRestore {
        claim_id: String,
    },
    EdgeCorrect {
        edge_id: String,
        #[serde(default)]
        relation: Option<String>,
        #[serde(default)]
        confidence: Option<f64>,
    },
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub ok: bool,
    pub action: &'static str,
    pub target: String,
}

pub async fn feedback(ctx: &AppContext, req: FeedbackRequest) -> Result<FeedbackResponse> {
    match req {
        FeedbackRequest::DomainBlock { domain, reason } => {
            set_domain_override(ctx, &domain, "block", reason.as_deref()).await?;
            Ok(FeedbackResponse {
                ok: true,
                action: "domain_block",
                target: domain,
            })
        }
        FeedbackRequest::DomainUnblock { domain, reason } => {
            set_domain_override(ctx, &domain, "allow", reason.as_deref()).await?;
            Ok(FeedbackResponse {
                ok: true,
                action: "domain_unblock",
                target: domain,
            })
        }
        FeedbackRequest::DomainClearOverride { domain } => {
            super::require_non_empty(&domain, "domain")?;
            sqlx::query("DELETE FROM domain_overrides WHERE domain = ?")
                .bind(&domain)
                .execute(&ctx.pool)
                .await
                .map_err(|e| AppError::Internal(e.into()))?;
            Ok(FeedbackResponse {
                ok: true,
                action: "domain_clear_override",
                target: domain,
            })
        }
        FeedbackRequest::ClaimReject { claim_id } => {
            set_claim_rejected(ctx, &claim_id, true).await?;
            Ok(FeedbackResponse {
                ok: true,
                action: "claim_reject",
                target: claim_id,
            })
        }
        FeedbackRequest::ClaimRestore { claim_id } => {
            set_claim_rejected(ctx, &claim_id, false).await?;
            Ok(FeedbackResponse {
                ok: true,
                action: "claim_restore",
                target: claim_id,
            })
        }
        FeedbackRequest::EdgeCorrect {
            edge_id,
            relation,
            confidence,
        } => {
            super::require_non_empty(&edge_id, "edge_id")?;

            let relation = match relation.as_deref() {
                None => None,
                Some(raw) => Some(EdgeRelation::from_str(raw).map_err(|_| {
                    AppError::invalid_params(
                        format!("unknown relation: {}", raw),
                        "relation",
                        "one of: supports, refutes, cites, extracts",
                    )
                })?),
            };
            if let Some(c) = confidence {
                if !(0.0..=1.0).contains(&c) {
                    return Err(AppError::invalid_params(
                        "confidence must be between 0.0 and 1.0",
                        "confidence",
                        "float 0.0-1.0",
                    ));
                }
            }
            if relation.is_none() && confidence.is_none() {
                return Err(AppError::invalid_params(
                    "edge_correct requires relation or confidence",
                    "relation/confidence",
                    "at least one of relation, confidence",
                ));
            }

            let edges = EdgeRepository::new(ctx.pool.clone());
            let updated = edges.update(&edge_id, relation, confidence).await?;
            if !updated {
                return Err(AppError::not_found("edge", &edge_id));
            }

            log::info!("Edge corrected by operator: id={}", edge_id);
            Ok(FeedbackResponse {
                ok: true,
                action: "edge_correct",
                target: edge_id,
            })
        }
    }
}

async fn set_domain_override(
    ctx: &AppContext,
    domain: &str,
    action: &str,
    reason: Option<&str>,
) -> Result<()> {
    super::require_non_empty(domain, "domain")?;

    sqlx::query(
        "INSERT INTO domain_overrides (domain, action, reason, created_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(domain) DO UPDATE SET
             action = excluded.action,
             reason = excluded.reason,
             created_at = excluded.created_at",
    )
    .bind(domain)
    .bind(action)
    .bind(reason)
    .bind(Utc::now().to_rfc3339())
    .execute(&ctx.pool)
    .await
    .map_err(|e| AppError::Internal(e.into()))?;

    log::info!("Domain override: domain={} action={}", domain, action);
    Ok(())
}

async fn set_claim_rejected(ctx: &AppContext, claim_id: &str, rejected: bool) -> Result<()> {
    super::require_non_empty(claim_id, "claim_id")?;

    let claims = ClaimRepository::new(ctx.pool.clone());
    if !claims.set_rejected(claim_id, rejected).await? {
        return Err(AppError::not_found("claim", claim_id));
    }
    Ok(())
}
