#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{Embedder, check_dimensions, check_input_sizes};
use crate::WeaveError;
use crate::config::OllamaConfig;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Ollama unreachable: {0}")]
    Unavailable(String),
    #[error("Ollama rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: Url,
    model: String,
    batch_size: u32,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

impl OllamaClient {
    #[inline]
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let base_url = config
            .ollama_url()
            .context("Failed to generate Ollama URL from config")?;

        Ok(Self::from_url(base_url, &config.model, config.batch_size)
            .with_timeout(Duration::from_secs(config.timeout_seconds)))
    }

    #[inline]
    pub fn from_url(base_url: Url, model: &str, batch_size: u32) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(30)))
            .build()
            .into();

        Self {
            base_url,
            model: model.to_string(),
            batch_size: batch_size.max(1),
            agent,
        }
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        self
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Test connection to Ollama server and verify model availability
    #[inline]
    pub fn health_check(&self) -> Result<()> {
        debug!("Performing health check for Ollama at {}", self.base_url);

        let models = self.list_models().context("Server ping failed")?;

        if !models.iter().any(|m| m.name == self.model) {
            let available_models: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
            warn!(
                "Model {} not found. Available models: {:?}",
                self.model, available_models
            );
            return Err(RequestError::Rejected(format!(
                "Model '{}' is not available. Available models: {:?}",
                self.model, available_models
            ))
            .into());
        }

        info!(
            "Health check passed for Ollama server at {} with model {}",
            self.base_url, self.model
        );
        Ok(())
    }

    /// List all available models
    #[inline]
    pub fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self
            .base_url
            .join("/api/tags")
            .context("Failed to build models URL")?;

        debug!("Fetching available models from {}", url);

        let response_text = self
            .make_request(|| {
                self.agent
                    .get(url.as_str())
                    .call()
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })
            .context("Failed to fetch models")?;

        let models_response: ModelsResponse =
            serde_json::from_str(&response_text).context("Failed to parse models response")?;

        debug!("Found {} models", models_response.models.len());
        Ok(models_response.models)
    }

    /// Generate embeddings for multiple text inputs, batched to the configured size
    #[inline]
    pub fn generate_embeddings_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let mut results = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(self.batch_size as usize) {
            let batch_results = self
                .generate_embeddings_single_batch(chunk)
                .with_context(|| format!("Failed to process batch of {} texts", chunk.len()))?;

            results.extend(batch_results);
        }

        debug!("Generated {} embeddings total", results.len());
        Ok(results)
    }

    fn generate_embeddings_single_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            model: &self.model,
            input: texts,
        };

        let url = self
            .base_url
            .join("/api/embed")
            .context("Failed to build embedding URL")?;

        let request_json =
            serde_json::to_string(&request).context("Failed to serialize embedding request")?;

        let response_text = self
            .make_request(|| {
                self.agent
                    .post(url.as_str())
                    .header("Content-Type", "application/json")
                    .send(&request_json)
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })
            .context("Failed to generate embeddings")?;

        let response: EmbedResponse =
            serde_json::from_str(&response_text).context("Failed to parse embedding response")?;

        if response.embeddings.len() != texts.len() {
            return Err(RequestError::Rejected(format!(
                "Mismatch between request and response counts: {} vs {}",
                texts.len(),
                response.embeddings.len()
            ))
            .into());
        }

        Ok(response.embeddings)
    }

    /// One attempt; retrying transient failures is left to the caller
    fn make_request<F>(&self, request_fn: F) -> Result<String>
    where
        F: FnOnce() -> Result<String, ureq::Error>,
    {
        match request_fn() {
            Ok(response_text) => Ok(response_text),
            Err(ureq::Error::StatusCode(status)) if status >= 500 => {
                warn!("Server error (status {}) from {}", status, self.base_url);
                Err(RequestError::Unavailable(format!("HTTP {status}")).into())
            }
            Err(ureq::Error::StatusCode(status)) => {
                warn!("Client error (status {}) from {}", status, self.base_url);
                Err(RequestError::Rejected(format!("HTTP {status}")).into())
            }
            Err(
                error @ (ureq::Error::ConnectionFailed
                | ureq::Error::HostNotFound
                | ureq::Error::Timeout(_)
                | ureq::Error::Io(_)),
            ) => {
                error!("Transport error talking to {}: {}", self.base_url, error);
                Err(RequestError::Unavailable(error.to_string()).into())
            }
            Err(error) => {
                warn!("Request to {} failed: {}", self.base_url, error);
                Err(RequestError::Rejected(error.to_string()).into())
            }
        }
    }
}

/// Map client failures onto the crate taxonomy, keeping connectivity problems retryable
fn classify(error: &anyhow::Error) -> WeaveError {
    let unavailable = error.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<RequestError>(),
            Some(RequestError::Unavailable(_))
        )
    });

    if unavailable {
        WeaveError::EmbeddingUnavailable(format!("{error:#}"))
    } else {
        WeaveError::Embedding(format!("{error:#}"))
    }
}

/// `Embedder` over the blocking Ollama client; requests run on the blocking thread pool
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: Arc<OllamaClient>,
    dimension: usize,
    max_input_chars: usize,
}

impl OllamaEmbedder {
    #[inline]
    pub fn new(
        config: &OllamaConfig,
        dimension: usize,
        max_input_chars: usize,
    ) -> crate::Result<Self> {
        let client = OllamaClient::new(config)
            .map_err(|e| WeaveError::Config(format!("Failed to create Ollama client: {e:#}")))?;
        Ok(Self::from_client(client, dimension, max_input_chars))
    }

    #[inline]
    pub fn from_client(client: OllamaClient, dimension: usize, max_input_chars: usize) -> Self {
        Self {
            client: Arc::new(client),
            dimension,
            max_input_chars,
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    #[inline]
    fn identity(&self) -> String {
        format!("ollama:{}", self.client.model())
    }

    #[inline]
    fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    async fn embed(&self, text: &str) -> crate::Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| WeaveError::Embedding("Ollama returned no embedding".to_string()))
    }

    #[inline]
    async fn embed_batch(&self, texts: &[String]) -> crate::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        check_input_sizes(texts, self.max_input_chars)?;

        let client = Arc::clone(&self.client);
        let owned = texts.to_vec();
        let vectors = tokio::task::spawn_blocking(move || client.generate_embeddings_batch(&owned))
            .await
            .map_err(|e| WeaveError::Embedding(format!("Embedding task failed: {e}")))?
            .map_err(|e| classify(&e))?;

        check_dimensions(&vectors, self.dimension)?;
        Ok(vectors)
    }

    #[inline]
    async fn health_check(&self) -> crate::Result<()> {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || client.health_check())
            .await
            .map_err(|e| WeaveError::Embedding(format!("Health check task failed: {e}")))?
            .map_err(|e| classify(&e))
    }
}
