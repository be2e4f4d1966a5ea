//! Search providers.
//!
//! `SearchProvider` is the capability seam for issuing one normalized query
//! to one engine. `MetaSearchClient` talks to a self-hosted metasearch
//! instance that proxies the public engines and returns JSON.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::domain::SourceTag;

/// Failure classification handed to the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchFailure {
    Captcha,
    Timeout,
    Other,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub rank: i64,
    pub source_tag: SourceTag,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub elapsed_ms: f64,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Issue `query` against `engine`. Classified errors feed the breaker.
    async fn search(
        &self,
        engine: &str,
        base_url: &str,
        query: &str,
        limit: usize,
    ) -> std::result::Result<SearchOutcome, SearchFailure>;
}

/// Classify a result's origin from its URL.
pub fn classify_source(url: &str) -> SourceTag {
    let url = url.to_lowercase();

    const ACADEMIC: &[&str] = &[
        "arxiv.org", "pubmed", "ncbi.nlm.nih.gov", "jstage.jst.go.jp", "cir.nii.ac.jp",
        "scholar.google", "researchgate.net", "academia.edu", "sciencedirect.com", "springer.com",
    ];
    if ACADEMIC.iter().any(|d| url.contains(d)) {
        return SourceTag::Academic;
    }

    const GOVERNMENT: &[&str] = &[".gov", ".go.jp", ".gov.uk", ".gouv.fr", ".gov.au"];
    if GOVERNMENT.iter().any(|p| url.contains(p)) {
        return SourceTag::Government;
    }

    const STANDARDS: &[&str] = &["iso.org", "ietf.org", "w3.org", "iana.org", "ieee.org"];
    if STANDARDS.iter().any(|d| url.contains(d)) {
        return SourceTag::Standards;
    }

    if url.contains("wikipedia.org") || url.contains("wikidata.org") {
        return SourceTag::Knowledge;
    }

    const NEWS: &[&str] = &[
        "reuters.com", "bbc.com", "nytimes.com", "theguardian.com", "nhk.or.jp", "asahi.com",
        "nikkei.com",
    ];
    if NEWS.iter().any(|d| url.contains(d)) {
        return SourceTag::News;
    }

    const TECHNICAL: &[&str] = &[
        "github.com", "gitlab.com", "stackoverflow.com", "docs.", "developer.", "documentation",
    ];
    if TECHNICAL.iter().any(|d| url.contains(d)) {
        return SourceTag::Technical;
    }

    const BLOG: &[&str] = &["blog", "medium.com", "note.com", "qiita.com", "zenn.dev"];
    if BLOG.iter().any(|p| url.contains(p)) {
        return SourceTag::Blog;
    }

    SourceTag::Unknown
}

// ---------------------------------------------------------------------------
// Metasearch JSON client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MetaSearchResponse {
    #[serde(default)]
    results: Vec<MetaSearchResult>,
}

#[derive(Debug, Deserialize)]
struct MetaSearchResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

pub struct MetaSearchClient {
    client: reqwest::Client,
}

impl MetaSearchClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    fn classify_status(status: reqwest::StatusCode) -> SearchFailure {
        // 429 and the challenge-page status are how engines surface CAPTCHAs
        // through the proxy.
        if status.as_u16() == 429 || status.as_u16() == 403 {
            SearchFailure::Captcha
        } else {
            SearchFailure::Other
        }
    }
}

impl Default for MetaSearchClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl SearchProvider for MetaSearchClient {
    async fn search(
        &self,
        engine: &str,
        base_url: &str,
        query: &str,
        limit: usize,
    ) -> std::result::Result<SearchOutcome, SearchFailure> {
        let start = std::time::Instant::now();

        let response = self
            .client
            .get(base_url)
            .query(&[("q", query), ("format", "json"), ("engines", engine)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SearchFailure::Timeout
                } else {
                    log::warn!("Search request failed: engine={} error={}", engine, e);
                    SearchFailure::Other
                }
            })?;

        if !response.status().is_success() {
            log::warn!(
                "Search engine error: engine={} status={}",
                engine,
                response.status()
            );
            return Err(Self::classify_status(response.status()));
        }

        let data: MetaSearchResponse = response.json().await.map_err(|e| {
            log::warn!("Malformed search response: engine={} error={}", engine, e);
            SearchFailure::Other
        })?;

        // Deduplicate by URL, keep rank order.
        let mut seen = std::collections::HashSet::new();
        let mut hits = Vec::new();
        for (idx, item) in data.results.into_iter().enumerate() {
            if item.url.is_empty() || !seen.insert(item.url.clone()) {
                continue;
            }
            let source_tag = classify_source(&item.url);
            hits.push(SearchHit {
                title: item.title,
                url: item.url,
                snippet: item.content,
                rank: (idx + 1) as i64,
                source_tag,
            });
            if hits.len() >= limit {
                break;
            }
        }

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        log::info!(
            "Search completed: engine={} results={} elapsed_ms={:.1}",
            engine,
            hits.len(),
            elapsed_ms
        );

        Ok(SearchOutcome { hits, elapsed_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_sources_by_url() {
        assert_eq!(classify_source("https://arxiv.org/abs/1234"), SourceTag::Academic);
        assert_eq!(classify_source("https://www.soumu.go.jp/x"), SourceTag::Government);
        assert_eq!(classify_source("https://www.ietf.org/rfc/rfc9110"), SourceTag::Standards);
        assert_eq!(classify_source("https://en.wikipedia.org/wiki/Rust"), SourceTag::Knowledge);
        assert_eq!(classify_source("https://www.reuters.com/article"), SourceTag::News);
        assert_eq!(classify_source("https://github.com/tokio-rs/tokio"), SourceTag::Technical);
        assert_eq!(classify_source("https://zenn.dev/someone/articles/1"), SourceTag::Blog);
        assert_eq!(classify_source("https://example.com/"), SourceTag::Unknown);
    }

    #[tokio::test]
    async fn parses_results_with_rank_and_dedup() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"results": [
                    {"title": "One", "url": "https://a.example/1", "content": "first"},
                    {"title": "Dup", "url": "https://a.example/1", "content": "dup"},
                    {"title": "Two", "url": "https://b.example/2", "content": "second"}
                ]}"#,
            )
            .create_async()
            .await;

        let client = MetaSearchClient::default();
        let outcome = client
            .search("duckduckgo", &server.url(), "anything", 10)
            .await
            .unwrap();

        assert_eq!(outcome.hits.len(), 2);
        assert_eq!(outcome.hits[0].rank, 1);
        assert_eq!(outcome.hits[1].url, "https://b.example/2");
    }

    #[tokio::test]
    async fn http_429_classifies_as_captcha() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(429)
            .create_async()
            .await;

        let client = MetaSearchClient::default();
        let err = client
            .search("duckduckgo", &server.url(), "anything", 10)
            .await
            .unwrap_err();
        assert_eq!(err, SearchFailure::Captcha);
    }

    #[tokio::test]
    async fn server_error_classifies_as_other() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let client = MetaSearchClient::default();
        let err = client
            .search("duckduckgo", &server.url(), "anything", 10)
            .await
            .unwrap_err();
        assert_eq!(err, SearchFailure::Other);
    }
}
