
use anyhow::{Context, Result};
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::chunking::ChunkingConfig;
use crate::database::VectorStoreConfig;
use crate::embeddings::{EmbeddingConfig, EmbeddingProvider};
use crate::indexer::IndexingConfig;
use crate::prompt::PromptConfig;

const APP_DIR_NAME: &str = "codeweave";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub model: String,
    pub batch_size: u32,
    pub timeout_seconds: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: "nomic-embed-text:latest".to_string(),
            batch_size: 16,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid timeout: {0} (must be between 1 and 600 seconds)")]
    InvalidTimeout(u64),
    #[error("Invalid retry attempts: {0} (must be between 1 and 10)")]
    InvalidRetryAttempts(u32),
    #[error("Invalid embedding dimension: {0} (must be between 8 and 4096)")]
    InvalidEmbeddingDimension(usize),
    #[error("Invalid max input size: {0} (must be between 256 and 1000000 characters)")]
    InvalidMaxInputChars(usize),
    #[error("Invalid max chunk lines: {0} (must be between 2 and 2000)")]
    InvalidMaxChunkLines(usize),
    #[error("Overlap of {overlap} lines must be smaller than the max chunk size of {max} lines")]
    OverlapTooLarge { overlap: usize, max: usize },
    #[error("Invalid max file size: {0} KB (must be between 1 and 102400)")]
    InvalidMaxFileSize(u64),
    #[error("Invalid worker count: {0} (must be between 1 and 64)")]
    InvalidWorkers(usize),
    #[error("Invalid save batch size: {0} (must be between 1 and 10000)")]
    InvalidSaveBatchSize(usize),
    #[error("Invalid glob pattern '{0}'")]
    InvalidPattern(String),
    #[error("Vector store backend name cannot be empty")]
    EmptyBackend,
    #[error("Invalid token budget: {0} (must be between 512 and 2000000)")]
    InvalidTokenBudget(usize),
    #[error("Reply reserve of {reserve} tokens leaves no room in a budget of {budget}")]
    ReserveTooLarge { reserve: usize, budget: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Default application directory, `<platform config dir>/codeweave`
    #[inline]
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR_NAME))
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding.provider == EmbeddingProvider::Ollama {
            self.ollama.validate()?;
        }
        self.validate_embedding_config()?;
        self.validate_chunking_config()?;
        self.validate_indexing_config()?;
        self.validate_prompt_config()?;

        if self.vector_store.backend.trim().is_empty() {
            return Err(ConfigError::EmptyBackend);
        }

        Ok(())
    }

    fn validate_embedding_config(&self) -> Result<(), ConfigError> {
        let config = &self.embedding;

        if !(8..=4096).contains(&config.dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(config.dimension));
        }

        if !(256..=1_000_000).contains(&config.max_input_chars) {
            return Err(ConfigError::InvalidMaxInputChars(config.max_input_chars));
        }

        Ok(())
    }

    fn validate_chunking_config(&self) -> Result<(), ConfigError> {
        let config = &self.chunking;

        if !(2..=2000).contains(&config.max_chunk_lines) {
            return Err(ConfigError::InvalidMaxChunkLines(config.max_chunk_lines));
        }

        // Windows must always advance
        if config.overlap_lines >= config.max_chunk_lines {
            return Err(ConfigError::OverlapTooLarge {
                overlap: config.overlap_lines,
                max: config.max_chunk_lines,
            });
        }

        Ok(())
    }

    fn validate_indexing_config(&self) -> Result<(), ConfigError> {
        let config = &self.indexing;

        if !(1..=102_400).contains(&config.max_file_size_kb) {
            return Err(ConfigError::InvalidMaxFileSize(config.max_file_size_kb));
        }

        if !(1..=64).contains(&config.workers) {
            return Err(ConfigError::InvalidWorkers(config.workers));
        }

        if !(1..=10).contains(&config.retry_attempts) {
            return Err(ConfigError::InvalidRetryAttempts(config.retry_attempts));
        }

        if !(1..=10_000).contains(&config.save_batch_size) {
            return Err(ConfigError::InvalidSaveBatchSize(config.save_batch_size));
        }

        for pattern in config
            .include_patterns
            .iter()
            .chain(config.exclude_patterns.iter())
        {
            Glob::new(pattern).map_err(|_| ConfigError::InvalidPattern(pattern.clone()))?;
        }

        Ok(())
    }

    fn validate_prompt_config(&self) -> Result<(), ConfigError> {
        let config = &self.prompt;

        if !(512..=2_000_000).contains(&config.token_budget) {
            return Err(ConfigError::InvalidTokenBudget(config.token_budget));
        }

        if config.reserve_reply_tokens >= config.token_budget {
            return Err(ConfigError::ReserveTooLarge {
                reserve: config.reserve_reply_tokens,
                budget: config.token_budget,
            });
        }

        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Get the path for the SQLite bookkeeping database
    #[inline]
    pub fn database_path(&self) -> PathBuf {
        self.get_base_dir().join("metadata.db")
    }

    /// Vector store settings with relative storage locations resolved against the base directory
    #[inline]
    pub fn resolved_vector_store(&self) -> VectorStoreConfig {
        let mut store = self.vector_store.clone();
        if store.lancedb_path.is_none() {
            store.lancedb_path = Some(self.get_base_dir().join("vectors"));
        }
        if store.memory_path.is_none() {
            store.memory_path = Some(self.get_base_dir().join("memory"));
        }
        store
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        self.ollama.ollama_url()
    }
}

impl OllamaConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        self.ollama_url()?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if !(1..=600).contains(&self.timeout_seconds) {
            return Err(ConfigError::InvalidTimeout(self.timeout_seconds));
        }

        Ok(())
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    #[inline]
    pub fn set_protocol(&mut self, protocol: String) -> Result<(), ConfigError> {
        if protocol != "http" && protocol != "https" {
            return Err(ConfigError::InvalidProtocol(protocol));
        }
        self.protocol = protocol;
        Ok(())
    }

    #[inline]
    pub fn set_host(&mut self, host: String) -> Result<(), ConfigError> {
        let temp_config = OllamaConfig {
            host: host.clone(),
            ..self.clone()
        };
        temp_config.validate()?;
        self.host = host;
        Ok(())
    }

    #[inline]
    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }
        self.port = port;
        Ok(())
    }

    #[inline]
    pub fn set_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.model = model;
        Ok(())
    }

    #[inline]
    pub fn set_batch_size(&mut self, batch_size: u32) -> Result<(), ConfigError> {
        if batch_size == 0 || batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(batch_size));
        }
        self.batch_size = batch_size;
        Ok(())
    }
}
