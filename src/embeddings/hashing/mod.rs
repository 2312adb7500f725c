
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{Embedder, check_input_sizes};
use crate::Result;

/// Feature-hashing embedder: lowercase identifier tokens are hashed into signed buckets and the
/// result is L2-normalised. Texts sharing vocabulary land close together, which is enough for
/// offline use and deterministic tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    max_input_chars: usize,
}

impl HashingEmbedder {
    #[inline]
    pub fn new(dimension: usize, max_input_chars: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            max_input_chars,
        }
    }

    /// Synchronous embedding of one text
    #[inline]
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];

        for token in tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0_u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = u64::from_le_bytes(bucket_bytes) % self.dimension as u64;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket as usize] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        } else {
            // Keep a valid direction for empty input
            vector[0] = 1.0;
        }
        vector
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl Embedder for HashingEmbedder {
    #[inline]
    fn identity(&self) -> String {
        format!("hashing-{}", self.dimension)
    }

    #[inline]
    fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        check_input_sizes(&[text.to_string()], self.max_input_chars)?;
        Ok(self.embed_text(text))
    }

    #[inline]
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        check_input_sizes(texts, self.max_input_chars)?;
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    #[inline]
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
