use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reranker reorders candidate texts by relevance to a query.
///
/// Returns a permutation of `0..candidates.len()`, most relevant first.
/// Callers validate the permutation; an implementation must not drop or
/// repeat indices.
#[async_trait::async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<usize>>;
}

/// Keeps the candidate order unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughReranker;

#[async_trait::async_trait]
impl Reranker for PassthroughReranker {
    async fn rerank(&self, _query: &str, candidates: &[String]) -> Result<Vec<usize>> {
        Ok((0..candidates.len()).collect())
    }
}

/// Cohere-compatible rerank client (`/v1/rerank`)
pub struct HttpReranker {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    #[allow(dead_code)]
    relevance_score: f64,
}

impl HttpReranker {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build rerank client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }
}

#[async_trait::async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<usize>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let request = RerankRequest {
            model: &self.model,
            query,
            documents: candidates,
            top_n: candidates.len(),
        };

        let mut builder = self
            .client
            .post(format!("{}/v1/rerank", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("Failed to call rerank service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Rerank service returned status {}: {}", status, body);
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .context("Failed to parse rerank response")?;

        // Results arrive sorted by relevance
        Ok(parsed.results.into_iter().map(|r| r.index).collect())
    }
}
