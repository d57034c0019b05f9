//! HTTP client for the external embedding service
//!
//! The engine is agnostic to the model behind the service; it only enforces
//! that returned vectors match the deployment dimension. Failed requests are
//! retried twice with exponential backoff before surfacing
//! `EmbeddingUnavailable`.
//!
//! Contract: `POST {url}/embed {"texts": [...]} -> {"vectors": [[f32; D]]}`,
//! 200 on success; any other status counts as a failed attempt.

use crate::error::{Result, StorageError};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for the embedding client
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Embedding service base URL
    pub url: String,
    /// Expected vector dimension (deployment-wide D)
    pub dimension: usize,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retries after the first failure
    pub max_retries: usize,
    /// Base retry delay; doubles per attempt (100ms, 400ms with the default)
    pub retry_delay: Duration,
}

impl EmbeddingConfig {
    pub fn new(url: String, dimension: usize) -> Self {
        Self {
            url,
            dimension,
            timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Serialize, Debug)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize, Debug)]
struct EmbedResponse {
    vectors: Vec<Vec<f32>>,
}

/// Embedding client with retry and dimension checking
pub struct EmbeddingClient {
    config: EmbeddingConfig,
    client: Client,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(StorageError::internal)?;

        debug!(
            "embedding client ready: url={}, dimension={}, timeout={:?}",
            config.url, config.dimension, config.timeout
        );

        Ok(Self { config, client })
    }

    /// Embed a single text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        let mut vectors = self.embed_batch(&texts).await?;
        vectors
            .pop()
            .ok_or_else(|| StorageError::EmbeddingUnavailable("empty response".into()))
    }

    /// Embed a batch of texts in one round-trip
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut last_error = String::new();

        for attempt in 0..=self.config.max_retries {
            match self.try_embed(texts).await {
                Ok(vectors) => {
                    // Dimension check is not retried: a wrong-sized vector is
                    // a deployment mismatch, not a transient failure
                    for vector in &vectors {
                        if vector.len() != self.config.dimension {
                            return Err(StorageError::DimMismatch {
                                expected: self.config.dimension,
                                got: vector.len(),
                            });
                        }
                    }
                    if vectors.len() != texts.len() {
                        return Err(StorageError::EmbeddingUnavailable(format!(
                            "{} texts sent, {} vectors returned",
                            texts.len(),
                            vectors.len()
                        )));
                    }
                    return Ok(vectors);
                }
                Err(e) => {
                    last_error = e;
                    if attempt < self.config.max_retries {
                        let delay = self.config.retry_delay * (1 << (2 * attempt)) as u32;
                        warn!(
                            "embedding request failed (attempt {}/{}), retrying in {:?}: {}",
                            attempt + 1,
                            self.config.max_retries + 1,
                            delay,
                            last_error
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(StorageError::EmbeddingUnavailable(format!(
            "failed after {} attempts: {}",
            self.config.max_retries + 1,
            last_error
        )))
    }

    async fn try_embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, String> {
        let url = format!("{}/embed", self.config.url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .json(&EmbedRequest { texts })
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        match response.status() {
            StatusCode::OK => {
                let body: EmbedResponse = response
                    .json()
                    .await
                    .map_err(|e| format!("undecodable response: {}", e))?;
                Ok(body.vectors)
            }
            status => {
                let detail = response.text().await.unwrap_or_default();
                Err(format!("status {}: {}", status, detail))
            }
        }
    }
}
