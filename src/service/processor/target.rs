//! target_queue handler: fetch a URL or DOI, persist the Page and its
//! Fragments, and link them with extracts edges.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};

use super::ProcessorDeps;
use crate::domain::{EdgeRelation, Job, NodeType};
use crate::repository::{EdgeRepository, PageRepository};
use crate::service::fetcher::PageFetcher;
use crate::service::llm::Embedder;
use crate::service::scheduler::{FollowUpJob, JobHandler, JobOutcome};
use crate::service::vector_store::VectorStore;

/// Fragments shorter than this are navigation noise, not evidence.
const MIN_FRAGMENT_CHARS: usize = 80;
/// Score saturates at this fragment length.
const SCORE_SATURATION_CHARS: f64 = 400.0;

pub struct TargetQueueHandler {
    fetcher: Arc<dyn PageFetcher>,
    pages: PageRepository,
    edges: EdgeRepository,
    embedder: Option<Arc<dyn Embedder>>,
    vectors: VectorStore,
    html_dir: PathBuf,
}

#[derive(Debug)]
struct ExtractedPage {
    title: Option<String>,
    fragments: Vec<ExtractedFragment>,
}

#[derive(Debug)]
struct ExtractedFragment {
    text: String,
    heading: Option<String>,
    score: f64,
    relevant: bool,
}

impl TargetQueueHandler {
    pub fn new(deps: &ProcessorDeps) -> Self {
        Self {
            fetcher: deps.fetcher.clone(),
            pages: PageRepository::new(deps.pool.clone()),
            edges: EdgeRepository::new(deps.pool.clone()),
            embedder: deps.embedder.clone(),
            vectors: VectorStore::new(deps.pool.clone()),
            html_dir: deps.html_dir.clone(),
        }
    }

    fn resolve_url(job: &Job) -> Result<(url::Url, Option<String>)> {
        let target = &job.input["target"];
        match target["kind"].as_str() {
            Some("doi") => {
                let doi = target["doi"].as_str().context("doi target missing doi")?;
                let url = url::Url::parse(&format!("https://doi.org/{}", doi))
                    .with_context(|| format!("Invalid DOI: {}", doi))?;
                Ok((url, Some(format!("doi:{}", doi))))
            }
            _ => {
                let raw = target["url"].as_str().context("url target missing url")?;
                let url =
                    url::Url::parse(raw).with_context(|| format!("Invalid URL: {}", raw))?;
                Ok((url, None))
            }
        }
    }
}

/// Pull passage candidates out of the document: paragraph-level text with
/// the nearest preceding heading as context.
fn extract_page(html: &str) -> ExtractedPage {
    // Html is not Send; all parsing happens synchronously before any await.
    let document = Html::parse_document(html);

    let title = Selector::parse("title")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let block_selector =
        Selector::parse("h1, h2, h3, p, li").expect("static selector");

    let mut fragments = Vec::new();
    let mut current_heading: Option<String> = None;

    for element in document.select(&block_selector) {
        let text = element.text().collect::<String>().trim().to_string();
        if text.is_empty() {
            continue;
        }

        match element.value().name() {
            "h1" | "h2" | "h3" => current_heading = Some(text),
            _ => {
                let relevant = text.chars().count() >= MIN_FRAGMENT_CHARS;
                let score =
                    (text.chars().count() as f64 / SCORE_SATURATION_CHARS).min(1.0);
                fragments.push(ExtractedFragment {
                    text,
                    heading: current_heading.clone(),
                    score,
                    relevant,
                });
            }
        }
    }

    ExtractedPage { title, fragments }
}

#[async_trait]
impl JobHandler for TargetQueueHandler {
    async fn execute(&self, job: &Job) -> Result<JobOutcome> {
        let (url, canonical_id) = Self::resolve_url(job)?;

        let fetched = self.fetcher.fetch(&url).await?;
        if fetched.status >= 400 {
            anyhow::bail!("fetch returned HTTP {} for {}", fetched.status, url);
        }

        let extracted = extract_page(&fetched.html);

        // HTML body lands on disk next to the database.
        let page_id = crate::repository::page_id_for_url(url.as_str());
        let html_path = self.html_dir.join(format!("{}.html", page_id));
        tokio::fs::create_dir_all(&self.html_dir)
            .await
            .context("Failed to create html dir")?;
        tokio::fs::write(&html_path, &fetched.html)
            .await
            .with_context(|| format!("Failed to write {}", html_path.display()))?;

        let page_id = self
            .pages
            .upsert(
                &url,
                extracted.title.as_deref(),
                html_path.to_str(),
                canonical_id.as_deref(),
            )
            .await?;

        let mut relevant = 0usize;
        for fragment in &extracted.fragments {
            let fragment_id = self
                .pages
                .insert_fragment(
                    &page_id,
                    &fragment.text,
                    fragment.heading.as_deref(),
                    fragment.score,
                    fragment.relevant,
                )
                .await?;
            self.edges
                .insert(
                    NodeType::Fragment,
                    &fragment_id,
                    NodeType::Page,
                    &page_id,
                    EdgeRelation::Extracts,
                    1.0,
                )
                .await?;
            if fragment.relevant {
                relevant += 1;

                // Relevant fragments get embedded for the vector surface.
                if let Some(embedder) = &self.embedder {
                    match embedder.embed(&fragment.text).await {
                        Ok(vector) => {
                            self.vectors
                                .upsert_embedding(
                                    "fragment",
                                    &fragment_id,
                                    embedder.model_id(),
                                    &vector,
                                )
                                .await?;
                        }
                        Err(e) => {
                            log::warn!("Fragment embedding failed: {:#}", e);
                        }
                    }
                }
            }
        }

        // Fresh fragments make verification worth re-running; the
        // task-scoped dedup collapses concurrent requests.
        let follow_ups = if relevant > 0 {
            vec![FollowUpJob {
                kind: crate::domain::JobKind::VerifyNli,
                input: serde_json::json!({}),
                priority: job.priority,
            }]
        } else {
            Vec::new()
        };

        Ok(JobOutcome {
            summary: format!(
                "page={} fragments={} relevant={}",
                page_id,
                extracted.fragments.len(),
                relevant
            ),
            follow_ups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_title_headings_and_paragraphs() {
        let html = r#"<html><head><title>GPT-4 Announcement</title></head><body>
            <h2>Release</h2>
            <p>GPT-4 was released by OpenAI in March 2023 after an extended period of
               internal evaluation and red-teaming across many domains.</p>
            <p>ok</p>
        </body></html>"#;

        let page = extract_page(html);
        assert_eq!(page.title.as_deref(), Some("GPT-4 Announcement"));
        assert_eq!(page.fragments.len(), 2);

        let long = &page.fragments[0];
        assert!(long.relevant);
        assert_eq!(long.heading.as_deref(), Some("Release"));
        assert!(long.score > 0.2);

        let short = &page.fragments[1];
        assert!(!short.relevant);
    }

    #[test]
    fn empty_document_extracts_nothing() {
        let page = extract_page("<html><body></body></html>");
        assert!(page.title.is_none());
        assert!(page.fragments.is_empty());
    }
}
