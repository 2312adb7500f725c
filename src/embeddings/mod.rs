// Embeddings module
// Text to fixed-length vector, shared by indexing and querying

pub mod hashing;
pub mod ollama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Config;
use crate::{Result, WeaveError};

pub use hashing::HashingEmbedder;
pub use ollama::{OllamaClient, OllamaEmbedder};

pub const DEFAULT_EMBEDDING_DIMENSION: usize = 768;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    #[default]
    Ollama,
    /// Offline feature-hashing embedder, no model required
    Hashing,
}

impl EmbeddingProvider {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match *self {
            Self::Ollama => "ollama",
            Self::Hashing => "hashing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub dimension: usize,
    /// Inputs longer than this are rejected rather than clipped
    pub max_input_chars: usize,
}

impl Default for EmbeddingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            max_input_chars: 32_000,
        }
    }
}

/// Deterministic text-to-vector mapping with a fixed output dimension.
///
/// Chunks and queries go through the same instance so their vectors are comparable.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Provider and model identity; a change invalidates previously stored vectors
    fn identity(&self) -> String;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn health_check(&self) -> Result<()>;
}

/// Build the embedder selected by the configuration
#[inline]
pub fn create_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match config.embedding.provider {
        EmbeddingProvider::Ollama => Arc::new(OllamaEmbedder::new(
            &config.ollama,
            config.embedding.dimension,
            config.embedding.max_input_chars,
        )?),
        EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new(
            config.embedding.dimension,
            config.embedding.max_input_chars,
        )),
    };
    Ok(embedder)
}

/// Reject any input above the configured size before it reaches a model
pub(crate) fn check_input_sizes(texts: &[String], max_input_chars: usize) -> Result<()> {
    if let Some(oversized) = texts.iter().find(|t| t.chars().count() > max_input_chars) {
        return Err(WeaveError::Embedding(format!(
            "Input of {} characters exceeds the embedding limit of {}",
            oversized.chars().count(),
            max_input_chars
        )));
    }
    Ok(())
}

/// Ensure every returned vector has the promised dimension
pub(crate) fn check_dimensions(vectors: &[Vec<f32>], expected: usize) -> Result<()> {
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        return Err(WeaveError::Embedding(format!(
            "Embedding has {} dimensions, expected {}",
            bad.len(),
            expected
        )));
    }
    Ok(())
}
