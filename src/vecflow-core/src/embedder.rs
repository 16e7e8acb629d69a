use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Embedder trait for converting text to vectors
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Vector for stored content
    async fn vectorize(&self, text: &str) -> Result<Vec<f32>>;

    /// Vector for a search query. Models without a separate query mode reuse `vectorize`.
    async fn vectorize_query(&self, text: &str) -> Result<Vec<f32>> {
        self.vectorize(text).await
    }

    fn dimensions(&self) -> usize;
}

/// OpenAI-compatible embedding client (`/v1/embeddings`)
pub struct HttpEmbedder {
    client: Client,
    base_url: String,
    dimensions: usize,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a str,
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build embedding client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            dimensions,
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
impl Embedder for HttpEmbedder {
    async fn vectorize(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            input: text,
            model: &self.model,
        };

        let mut builder = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("Failed to call embedding service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding service returned status {}: {}", status, body);
        }

        let embedding_response: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        let embedding = embedding_response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .context("No embedding data in response")?;

        if embedding.len() != self.dimensions {
            anyhow::bail!(
                "Expected embedding dimension {}, got {}",
                self.dimensions,
                embedding.len()
            );
        }

        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Offline embedder: hashes lowercase terms into buckets and L2-normalizes.
/// Texts sharing words get similar vectors; no model or network needed.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        if self.dimensions == 0 {
            return vector;
        }

        for term in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(term.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) as usize
                % self.dimensions;
            vector[bucket] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait::async_trait]
impl Embedder for HashingEmbedder {
    async fn vectorize(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::cosine_similarity;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_embedder() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [0.1, 0.2, 0.3], "index": 0}]
            })))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(server.uri(), "test", 3, Duration::from_secs(5)).unwrap();
        let vector = embedder.vectorize("hello").await.unwrap();
        assert_eq!(vector.len(), 3);
        assert_eq!(embedder.vectorize_query("hello").await.unwrap(), vector);

        let wrong = HttpEmbedder::new(server.uri(), "test", 4, Duration::from_secs(5)).unwrap();
        assert!(wrong.vectorize("hello").await.is_err());
    }

    #[tokio::test]
    async fn test_http_embedder_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(server.uri(), "test", 3, Duration::from_secs(5)).unwrap();
        let err = embedder.vectorize("hello").await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.vectorize("Smart people").await.unwrap();
        let b = embedder.vectorize("smart PEOPLE").await.unwrap();
        let c = embedder.vectorize("unrelated words here").await.unwrap();

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
        assert!(embedder.vectorize("").await.unwrap().iter().all(|v| *v == 0.0));
    }
}
