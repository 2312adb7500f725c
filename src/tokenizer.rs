// Token counting for prompt assembly
// Counts must be stable for the lifetime of the process so part boundaries are reproducible

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tiktoken_rs::{CoreBPE, cl100k_base};

use crate::{Result, WeaveError};

pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    #[default]
    Cl100k,
    Heuristic,
}

impl TokenizerKind {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match *self {
            Self::Cl100k => "cl100k",
            Self::Heuristic => "heuristic",
        }
    }
}

/// BPE counter matching the cl100k_base vocabulary
#[derive(Clone)]
pub struct TiktokenCounter {
    bpe: Arc<CoreBPE>,
}

impl TiktokenCounter {
    #[inline]
    pub fn new() -> Result<Self> {
        let bpe = cl100k_base()
            .map_err(|e| WeaveError::Config(format!("Failed to load cl100k tokenizer: {e}")))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenCounter for TiktokenCounter {
    #[inline]
    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    #[inline]
    fn name(&self) -> &'static str {
        "cl100k"
    }
}

/// Character-based estimate of roughly 3.5 characters per token, never below one
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    #[inline]
    fn count_tokens(&self, text: &str) -> usize {
        (text.chars().count() * 2 / 7).max(1)
    }

    #[inline]
    fn name(&self) -> &'static str {
        "heuristic"
    }
}

#[inline]
pub fn token_counter(kind: TokenizerKind) -> Result<Arc<dyn TokenCounter>> {
    Ok(match kind {
        TokenizerKind::Cl100k => Arc::new(TiktokenCounter::new()?),
        TokenizerKind::Heuristic => Arc::new(HeuristicCounter),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_counts() {
        let counter = HeuristicCounter;
        assert_eq!(counter.count_tokens(""), 1);
        assert_eq!(counter.count_tokens("abcdefg"), 2);
        assert_eq!(counter.count_tokens(&"x".repeat(700)), 200);
    }

    #[test]
    fn cl100k_counts_words() {
        let counter = TiktokenCounter::new().expect("cl100k loads");
        assert_eq!(counter.count_tokens("hello world"), 2);
        assert_eq!(counter.count_tokens(""), 0);
        assert_eq!(counter.name(), "cl100k");
    }

    #[test]
    fn counter_selection() {
        let counter = token_counter(TokenizerKind::Heuristic).expect("heuristic is infallible");
        assert_eq!(counter.name(), "heuristic");
    }
}
