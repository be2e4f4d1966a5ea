//! Page fetching.
//!
//! The production fetcher (headless browser, stealth) is an external
//! collaborator; `PageFetcher` is its seam. `HttpFetcher` is the plain
//! HTTP implementation used for direct fetches and tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

/// A fetched page body with response metadata.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub html: String,
    pub elapsed_ms: u64,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &url::Url) -> Result<FetchedPage>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &url::Url) -> Result<FetchedPage> {
        let start = std::time::Instant::now();
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;

        let status = response.status().as_u16();
        let html = response
            .text()
            .await
            .with_context(|| format!("Failed to read body of {}", url))?;

        Ok(FetchedPage {
            url: url.to_string(),
            status,
            html,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetches_body_and_status() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/page")
            .with_status(200)
            .with_body("<html><body><h1>Hello</h1></body></html>")
            .create_async()
            .await;

        let fetcher = HttpFetcher::new();
        let url = url::Url::parse(&format!("{}/page", server.url())).unwrap();
        let page = fetcher.fetch(&url).await.unwrap();

        assert_eq!(page.status, 200);
        assert!(page.html.contains("Hello"));
    }
}
