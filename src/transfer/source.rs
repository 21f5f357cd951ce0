//! The network side of a fetch.
//!
//! A [`ResourceSource`] resolves one key to its bytes with a single attempt;
//! retries, timeouts and deduplication live in the fetch executor.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl SourceError {
    /// Client errors other than timeouts and throttling will not change on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Network(_) | SourceError::Timeout(_) => true,
            SourceError::Status(code) => !(400..500).contains(code) || *code == 408 || *code == 429,
        }
    }
}

#[async_trait]
pub trait ResourceSource: Send + Sync + 'static {
    /// Fetch the payload for `key` once.
    async fn fetch(&self, key: &str) -> Result<Bytes, SourceError>;
}

/// Fetches `{base_url}/{key}` over HTTP.
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SourceError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn url_for(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl ResourceSource for HttpSource {
    async fn fetch(&self, key: &str) -> Result<Bytes, SourceError> {
        let url = self.url_for(key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;
        debug!(url, size = body.len(), "Fetched resource");
        Ok(body)
    }
}
