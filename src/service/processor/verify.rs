//! verify_nli handler: run NLI judgments over a task's outstanding
//! claim/fragment pairs and write supports/refutes edges.
//!
//! When the NLI model is unavailable or errors, the lexical fallback
//! judges by keyword overlap; the job succeeds only when a usable result
//! was produced for every pair it attempted.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use chrono::Utc;

use super::ProcessorDeps;
use crate::domain::timeline::{TimelineEvent, TimelineEventType};
use crate::domain::{Claim, EdgeRelation, Fragment, Job, NodeType};
use crate::repository::{ClaimRepository, EdgeRepository, PageRepository};
use crate::service::llm::{NliJudge, NliJudgment, NliLabel};
use crate::service::scheduler::{JobHandler, JobOutcome};
use crate::service::temporal;

/// Keyword-overlap share above which the fallback counts entailment.
const LEXICAL_SUPPORT_THRESHOLD: f64 = 0.6;
const LEXICAL_CONFIDENCE: f64 = 0.5;

pub struct VerifyNliHandler {
    nli: Option<Arc<dyn NliJudge>>,
    claims: ClaimRepository,
    pages: PageRepository,
    edges: EdgeRepository,
}

impl VerifyNliHandler {
    pub fn new(deps: &ProcessorDeps) -> Self {
        Self {
            nli: deps.nli.clone(),
            claims: ClaimRepository::new(deps.pool.clone()),
            pages: PageRepository::new(deps.pool.clone()),
            edges: EdgeRepository::new(deps.pool.clone()),
        }
    }

    async fn judge(&self, fragment: &Fragment, claim: &Claim) -> NliJudgment {
        if let Some(nli) = &self.nli {
            match nli.judge(&fragment.text_content, &claim.claim_text).await {
                Ok(judgment) => return judgment,
                Err(e) => {
                    log::warn!("NLI judgment failed, using lexical fallback: {:#}", e);
                }
            }
        }
        lexical_judge(&fragment.text_content, claim)
    }
}

/// Rule-based fallback: share of claim keywords present in the fragment.
pub fn lexical_judge(fragment_text: &str, claim: &Claim) -> NliJudgment {
    let keywords: Vec<&str> = claim
        .keywords
        .iter()
        .map(String::as_str)
        .filter(|k| !k.is_empty())
        .collect();
    if keywords.is_empty() {
        return NliJudgment {
            label: NliLabel::Neutral,
            confidence: 0.0,
        };
    }

    let haystack = fragment_text.to_lowercase();
    let matched = keywords
        .iter()
        .filter(|k| haystack.contains(&k.to_lowercase()))
        .count();
    let overlap = matched as f64 / keywords.len() as f64;

    if overlap >= LEXICAL_SUPPORT_THRESHOLD {
        NliJudgment {
            label: NliLabel::Entailment,
            confidence: LEXICAL_CONFIDENCE,
        }
    } else {
        NliJudgment {
            label: NliLabel::Neutral,
            confidence: overlap,
        }
    }
}

#[async_trait]
impl JobHandler for VerifyNliHandler {
    async fn execute(&self, job: &Job) -> Result<JobOutcome> {
        let claims = self.claims.unverified_for_task(&job.task_id).await?;
        let fragments = self.pages.relevant_fragments_for_task(&job.task_id).await?;

        if claims.is_empty() || fragments.is_empty() {
            return Ok(JobOutcome::summary(format!(
                "nothing to verify: claims={} fragments={}",
                claims.len(),
                fragments.len()
            )));
        }

        let mut judged = 0usize;
        let mut edges_written = 0usize;

        for claim in &claims {
            let mut found_evidence = false;

            for fragment in &fragments {
                if self.edges.has_judgment(&fragment.id, &claim.id).await? {
                    continue;
                }

                let judgment = self.judge(fragment, claim).await;
                judged += 1;

                let relation = match judgment.label {
                    NliLabel::Entailment => EdgeRelation::Supports,
                    NliLabel::Contradiction => EdgeRelation::Refutes,
                    NliLabel::Neutral => continue,
                };

                // Stale sources attract a trust decay; temporally
                // impossible pairs carry the strongest discount.
                let page = self.pages.get_by_id(&fragment.page_id).await?;
                let consistency = temporal::check_consistency(
                    &claim.claim_text,
                    page.as_ref().and_then(|p| p.fetched_at),
                    Utc::now(),
                );
                let confidence =
                    (judgment.confidence * consistency.trust_factor).clamp(0.0, 1.0);

                self.edges
                    .insert(
                        NodeType::Fragment,
                        &fragment.id,
                        NodeType::Claim,
                        &claim.id,
                        relation,
                        confidence,
                    )
                    .await?;
                edges_written += 1;

                // First evidence starts the claim's timeline.
                if !found_evidence {
                    let timeline =
                        crate::domain::timeline::ClaimTimeline::from_json(&claim.timeline_json)?;
                    if !timeline.has_timeline() {
                        let mut event = TimelineEvent::new(TimelineEventType::FirstAppeared);
                        event.source_url = page.map(|p| p.url);
                        self.claims.append_timeline_event(&claim.id, event).await?;
                    }
                    found_evidence = true;
                }
            }

            if found_evidence {
                self.claims.set_verified(&claim.id, true).await?;
            }
        }

        Ok(JobOutcome::summary(format!(
            "claims={} fragments={} judged={} edges={}",
            claims.len(),
            fragments.len(),
            judged,
            edges_written
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClaimGranularity, ClaimPolarity, ClaimType};
    use chrono::Utc;

    fn claim_with_keywords(keywords: &[&str]) -> Claim {
        Claim {
            id: "cl_test".to_string(),
            task_id: "t_test".to_string(),
            claim_text: "test claim".to_string(),
            claim_type: ClaimType::Factual,
            expected_polarity: ClaimPolarity::Positive,
            granularity: ClaimGranularity::Atomic,
            parent_claim_id: None,
            source_question: String::new(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            verification_hints: Vec::new(),
            confidence_score: 1.0,
            timeline_json: "[]".to_string(),
            is_verified: false,
            rejected: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn high_overlap_counts_as_entailment() {
        let claim = claim_with_keywords(&["GPT-4", "released", "2023"]);
        let judgment = lexical_judge("GPT-4 was released by OpenAI in March 2023", &claim);
        assert_eq!(judgment.label, NliLabel::Entailment);
        assert!((judgment.confidence - LEXICAL_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[test]
    fn low_overlap_is_neutral() {
        let claim = claim_with_keywords(&["quantum", "entanglement", "teleportation"]);
        let judgment = lexical_judge("GPT-4 was released by OpenAI in March 2023", &claim);
        assert_eq!(judgment.label, NliLabel::Neutral);
    }

    #[test]
    fn claim_without_keywords_is_neutral_with_zero_confidence() {
        let claim = claim_with_keywords(&[]);
        let judgment = lexical_judge("anything", &claim);
        assert_eq!(judgment.label, NliLabel::Neutral);
        assert!(judgment.confidence.abs() < f64::EPSILON);
    }
}
