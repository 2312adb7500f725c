use thiserror::Error;

pub type Result<T> = std::result::Result<T, WeaveError>;

#[derive(Error, Debug)]
pub enum WeaveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Vector store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Chunking error: {0}")]
    Chunking(String),

    #[error("Indexing error: {0}")]
    Indexing(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No index exists for collection '{0}'; run indexing first")]
    IndexMissing(String),

    #[error("Subproject '{0}' is already being indexed")]
    AlreadyIndexing(String),

    #[error("Unknown vector store backend '{name}' (available: {available})")]
    UnknownBackend { name: String, available: String },

    #[error("Indexing run was cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl WeaveError {
    /// Connectivity problems that may succeed on a later attempt.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WeaveError::StoreUnavailable(_) | WeaveError::EmbeddingUnavailable(_)
        )
    }
}

pub mod chunking;
pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod indexer;
pub mod prompt;
pub mod retrieval;
pub mod service;
pub mod tokenizer;
