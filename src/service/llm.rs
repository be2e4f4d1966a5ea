//! Interfaces to external model collaborators.
//!
//! Inference endpoints, the NLI judgment model, the embedding model and the
//! academic citation index all live outside this crate. They are reached
//! through the traits below; the application context holds them as
//! `Arc<dyn …>` so tests can substitute stubs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Local LLM completion endpoint.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String>;
}

/// NLI label for one (premise, hypothesis) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NliLabel {
    Entailment,
    Contradiction,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NliJudgment {
    pub label: NliLabel,
    pub confidence: f64,
}

/// NLI judgment model: does the fragment entail or contradict the claim?
#[async_trait]
pub trait NliJudge: Send + Sync {
    async fn judge(&self, premise: &str, hypothesis: &str) -> Result<NliJudgment>;
}

/// Embedding model for the vector surface.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// One reference candidate expanded from an academic paper id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceCandidate {
    pub url: String,
    pub context: Option<String>,
    pub source: Option<String>,
}

/// Academic citation index (reference expansion from paper ids).
#[async_trait]
pub trait CitationIndex: Send + Sync {
    async fn references(&self, paper_id: &str) -> Result<Vec<ReferenceCandidate>>;
}

// ---------------------------------------------------------------------------
// Default local HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    content: String,
}

/// Completion client for a local inference server.
pub struct LocalLlmClient {
    client: reqwest::Client,
    base_url: String,
}

impl LocalLlmClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl LlmClient for LocalLlmClient {
    async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let url = format!("{}/completion", self.base_url.trim_end_matches('/'));
        let body = CompletionRequest {
            prompt,
            max_tokens,
            temperature: 0.3,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("LLM request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("LLM endpoint returned HTTP {}", response.status());
        }

        let parsed: CompletionResponse =
            response.json().await.context("Malformed LLM response")?;
        Ok(parsed.content)
    }
}
