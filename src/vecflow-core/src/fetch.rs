use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("GET {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("no document at {0}")]
    NotFound(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Fetcher retrieves raw document text from a URL
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// HTTP GET with a request timeout
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        tracing::debug!("Fetched {}", url);
        Ok(response.text().await?)
    }
}

/// Serves documents from memory, for offline runs and tests
#[derive(Debug, Clone, Default)]
pub struct StaticFetcher {
    pages: HashMap<String, String>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.pages.insert(url.into(), body.into());
        self
    }
}

#[async_trait::async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/smart.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>smart</p>"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let body = fetcher
            .fetch(&format!("{}/smart.html", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, "<p>smart</p>");
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let err = fetcher
            .fetch(&format!("{}/missing.html", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_static_fetcher() {
        let fetcher = StaticFetcher::new().with_page("mem://a", "alpha");
        assert_eq!(fetcher.fetch("mem://a").await.unwrap(), "alpha");
        assert!(matches!(
            fetcher.fetch("mem://b").await,
            Err(FetchError::NotFound(_))
        ));
    }
}
