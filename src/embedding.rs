//! Embedding client abstraction, retry policy, and ordered batching.
//!
//! Defines the [`EmbeddingClient`] trait and the pieces around it:
//! - **[`OpenAiEmbedder`]**: calls an OpenAI-compatible `POST /embeddings`
//!   endpoint. One HTTP attempt per call; failures are classified.
//! - **[`embed_with_retry`]**: the retry loop, driven by a [`RetryPolicy`].
//! - **[`embed_all`]**: splits a large input into batches, runs a bounded
//!   number of batches at once, and reassembles vectors in input order.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retry
//! - Malformed responses → fail immediately
//! - Backoff: `base_delay * 2^attempt`, so 1s, 2s, 4s with the defaults

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::EmbeddingConfig;
use crate::error::EmbedError;

/// A backend that turns texts into fixed-dimension vectors.
///
/// Implementations make a single attempt per call and report whether a
/// failure is worth retrying through [`EmbedError::Transient`].
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed `texts`, returning one vector per input in the same order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
    /// Returns the model identifier (e.g. `"text-embedding-ada-002"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
}

/// How many times to call the backend and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
        }
    }

    /// Delay after the failed attempt number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Call `client.embed` until it succeeds, fails permanently, or the policy
/// runs out of attempts.
///
/// # Errors
///
/// - Permanent failures are returned as-is after a single attempt.
/// - Transient failures on every attempt become [`EmbedError::Exhausted`].
/// - A successful response with the wrong number of vectors becomes
///   [`EmbedError::LengthMismatch`].
pub async fn embed_with_retry(
    client: &dyn EmbeddingClient,
    policy: &RetryPolicy,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, EmbedError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match client.embed(texts).await {
            Ok(vectors) => {
                if vectors.len() != texts.len() {
                    return Err(EmbedError::LengthMismatch {
                        expected: texts.len(),
                        actual: vectors.len(),
                    });
                }
                return Ok(vectors);
            }
            Err(e) if e.is_transient() => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(EmbedError::Exhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                let delay = policy.backoff(attempt - 1);
                tracing::warn!(
                    "Embedding attempt {}/{} failed: {}; retrying in {:?}",
                    attempt,
                    max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Embed a single text, e.g. a search query.
pub async fn embed_query(
    client: &dyn EmbeddingClient,
    policy: &RetryPolicy,
    text: &str,
) -> Result<Vec<f32>, EmbedError> {
    let mut vectors = embed_with_retry(client, policy, &[text.to_string()]).await?;
    vectors.pop().ok_or(EmbedError::LengthMismatch {
        expected: 1,
        actual: 0,
    })
}

/// Embed every text, `batch_size` at a time, with at most `concurrency`
/// batches in flight.
///
/// The result has exactly one vector per input, in input order. The first
/// failing batch aborts the run; batches still in flight are dropped.
/// Cancellation is checked before each batch starts and interrupts retry
/// sleeps.
pub async fn embed_all(
    client: &dyn EmbeddingClient,
    policy: &RetryPolicy,
    texts: &[String],
    batch_size: usize,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<Vec<Vec<f32>>, EmbedError> {
    let batch_size = batch_size.max(1);
    let total_batches = texts.len().div_ceil(batch_size);

    let batches: Vec<Vec<Vec<f32>>> = stream::iter(texts.chunks(batch_size).enumerate())
        .map(|(i, batch)| async move {
            if cancel.is_cancelled() {
                return Err(EmbedError::Cancelled);
            }
            tracing::debug!(
                "Embedding batch {}/{} ({} texts)",
                i + 1,
                total_batches,
                batch.len()
            );
            tokio::select! {
                _ = cancel.cancelled() => Err(EmbedError::Cancelled),
                result = embed_with_retry(client, policy, batch) => result,
            }
        })
        .buffered(concurrency.max(1))
        .try_collect()
        .await?;

    let vectors: Vec<Vec<f32>> = batches.into_iter().flatten().collect();
    if vectors.len() != texts.len() {
        return Err(EmbedError::LengthMismatch {
            expected: texts.len(),
            actual: vectors.len(),
        });
    }
    Ok(vectors)
}

// ============ OpenAI ============

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// Embedding client for the OpenAI embeddings API and compatible servers.
///
/// Calls `POST {api_base}/embeddings` with the configured model. The API key
/// and base URL come from [`EmbeddingConfig`].
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedder {
    /// # Errors
    ///
    /// Returns an error if no API key is configured or the HTTP client
    /// cannot be built.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let Some(api_key) = config.api_key.clone() else {
            bail!("OPENAI_API_KEY is not set");
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            endpoint: format!("{}/embeddings", config.api_base.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            dims: config.dims,
        })
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbedError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let message = format!("OpenAI API error {}: {}", status, body_text.trim());
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(EmbedError::Transient(message));
            }
            return Err(EmbedError::Permanent(message));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::Permanent(format!("invalid embeddings response: {}", e)))?;

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }
}
