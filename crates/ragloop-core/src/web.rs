//! Optional web search collaborator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::security::SecretValue;

pub const TAVILY_SEARCH_URL: &str = "https://api.tavily.com/search";

/// A single web search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebSearchOptions {
    pub max_results: usize,
}

impl Default for WebSearchOptions {
    fn default() -> Self {
        Self { max_results: 5 }
    }
}

#[async_trait]
pub trait WebSearchService: Send + Sync {
    async fn search(
        &self,
        query: &str,
        options: &WebSearchOptions,
    ) -> anyhow::Result<Vec<WebResult>>;
}

pub type DynWebSearch = Arc<dyn WebSearchService>;

/// Tavily search API client.
pub struct TavilySearch {
    client: Client,
    endpoint: String,
    api_key: SecretValue,
}

#[derive(Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
    search_depth: &'a str,
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<WebResult>,
}

impl TavilySearch {
    pub fn new(api_key: SecretValue, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build web search http client")?;
        Ok(Self {
            client,
            endpoint: TAVILY_SEARCH_URL.to_string(),
            api_key,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl WebSearchService for TavilySearch {
    async fn search(
        &self,
        query: &str,
        options: &WebSearchOptions,
    ) -> anyhow::Result<Vec<WebResult>> {
        let request = TavilyRequest {
            api_key: self.api_key.expose(),
            query,
            max_results: options.max_results,
            search_depth: "basic",
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| anyhow!("web search request failed: {err}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("web search returned {status}: {body}"));
        }

        let payload: TavilyResponse = response
            .json()
            .await
            .context("failed to decode web search response")?;

        debug!(query, results = payload.results.len(), "web search complete");
        Ok(payload
            .results
            .into_iter()
            .filter(|result| !result.url.trim().is_empty())
            .take(options.max_results)
            .collect())
    }
}
