// Database module
// Vector storage behind one contract (memory, LanceDB, Qdrant) plus SQLite bookkeeping


pub mod lancedb;
pub mod memory;
pub mod qdrant;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use crate::{Result, WeaveError};

pub use self::lancedb::LanceVectorStore;
pub use memory::MemoryVectorStore;
pub use qdrant::QdrantVectorStore;

/// One indexed unit of code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub repo_path: String,
    /// Relative to the repository root, always `/`-separated
    pub file_path: String,
    /// 1-based, inclusive
    pub start_line: usize,
    pub end_line: usize,
    pub file_hash: String,
    pub chunk_hash: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

impl ChunkRecord {
    /// Stable identifier derived from the upsert key `(repo_path, file_path, chunk_hash)`
    #[inline]
    pub fn record_id(&self) -> String {
        record_id(&self.repo_path, &self.file_path, &self.chunk_hash)
    }
}

#[inline]
pub fn record_id(repo_path: &str, file_path: &str, chunk_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo_path.as_bytes());
    hasher.update([0]);
    hasher.update(file_path.as_bytes());
    hasher.update([0]);
    hasher.update(chunk_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Per-collection bookkeeping, readable without touching any vectors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub collection: String,
    pub repos: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub files_seen: u64,
    pub chunks_stored: u64,
    /// Hash of the chunking and embedding parameters the records were built with
    #[serde(default)]
    pub config_fingerprint: Option<String>,
    /// repo -> relative path -> file fingerprint
    #[serde(default)]
    pub file_hashes: BTreeMap<String, BTreeMap<String, String>>,
}

impl IndexMetadata {
    #[inline]
    pub fn new(collection: &str) -> Self {
        let now = Utc::now();
        Self {
            collection: collection.to_string(),
            repos: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            files_seen: 0,
            chunks_stored: 0,
            config_fingerprint: None,
            file_hashes: BTreeMap::new(),
        }
    }

    /// Stored fingerprints for one repository
    #[inline]
    pub fn repo_hashes(&self, repo_path: &str) -> Option<&BTreeMap<String, String>> {
        self.file_hashes.get(repo_path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub record: ChunkRecord,
    pub score: f32,
}

/// Selects records for deletion; at least one field must be set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub repo_path: Option<String>,
    pub file_path: Option<String>,
}

impl RecordFilter {
    #[inline]
    pub fn repo(repo_path: &str) -> Self {
        Self {
            repo_path: Some(repo_path.to_string()),
            file_path: None,
        }
    }

    #[inline]
    pub fn file(repo_path: &str, file_path: &str) -> Self {
        Self {
            repo_path: Some(repo_path.to_string()),
            file_path: Some(file_path.to_string()),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.repo_path.is_none() && self.file_path.is_none()
    }

    #[inline]
    pub fn matches(&self, record: &ChunkRecord) -> bool {
        self.repo_path
            .as_deref()
            .is_none_or(|repo| repo == record.repo_path)
            && self
                .file_path
                .as_deref()
                .is_none_or(|file| file == record.file_path)
    }

    pub(crate) fn ensure_not_empty(&self) -> Result<()> {
        if self.is_empty() {
            return Err(WeaveError::InvalidInput(
                "Refusing to delete with an empty filter; use clear instead".to_string(),
            ));
        }
        Ok(())
    }
}

/// Durable storage and similarity search over the chunk records of one collection.
///
/// Records are upserted by `(repo_path, file_path, chunk_hash)`: saving a key that is already
/// present leaves the stored record untouched. Every backend keeps the insertion order of records
/// so equal scores come back in a stable order.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Registry key of the backend
    fn backend_name(&self) -> &'static str;

    fn collection(&self) -> &str;

    /// Open or create the collection
    async fn connect(&self) -> Result<()>;

    async fn health_check(&self) -> Result<()>;

    /// Upsert records and replace the stored metadata, returning how many records were new
    async fn save_records(&self, records: &[ChunkRecord], metadata: &IndexMetadata)
    -> Result<usize>;

    /// All records in insertion order, optionally restricted to one repository
    async fn load_records(
        &self,
        repo_filter: Option<&str>,
    ) -> Result<(Vec<ChunkRecord>, Option<IndexMetadata>)>;

    /// Top `top_k` records by cosine similarity, descending
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        repo_filter: Option<&str>,
    ) -> Result<Vec<SearchHit>>;

    async fn get_metadata(&self) -> Result<Option<IndexMetadata>>;

    /// Remove every record and the metadata
    async fn clear(&self) -> Result<()>;

    /// Whether the collection holds an index
    async fn exists(&self) -> Result<bool>;

    async fn count(&self, repo_filter: Option<&str>) -> Result<u64>;

    /// Delete matching records, returning how many were removed
    async fn delete_by_filter(&self, filter: &RecordFilter) -> Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    /// Registry key of the backend to use
    pub backend: String,
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub qdrant_timeout_seconds: u64,
    pub lancedb_path: Option<PathBuf>,
    /// Snapshot directory for the memory backend; unset keeps it purely in memory
    pub memory_path: Option<PathBuf>,
}

impl Default for VectorStoreConfig {
    #[inline]
    fn default() -> Self {
        Self {
            backend: "lancedb".to_string(),
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_api_key: None,
            qdrant_timeout_seconds: 30,
            lancedb_path: None,
            memory_path: None,
        }
    }
}

pub type BackendFuture = BoxFuture<'static, Result<Arc<dyn VectorStore>>>;
pub type BackendFactory = Arc<dyn Fn(VectorStoreConfig, String) -> BackendFuture + Send + Sync>;

/// Maps backend names to constructors; new backends are registered without touching call sites
pub struct BackendRegistry {
    factories: RwLock<BTreeMap<String, BackendFactory>>,
}

impl std::fmt::Debug for BackendRegistry {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.list_available_backends())
            .finish()
    }
}

impl Default for BackendRegistry {
    /// Registry with the built-in `memory`, `lancedb` and `qdrant` backends
    #[inline]
    fn default() -> Self {
        let registry = Self::empty();
        registry.register_backend("memory", |config, collection| async move {
            let store: Arc<dyn VectorStore> =
                Arc::new(MemoryVectorStore::new(&collection, config.memory_path));
            Ok(store)
        });
        registry.register_backend("lancedb", |config, collection| async move {
            let store: Arc<dyn VectorStore> =
                Arc::new(LanceVectorStore::open(&config, &collection).await?);
            Ok(store)
        });
        registry.register_backend("qdrant", |config, collection| async move {
            let store: Arc<dyn VectorStore> =
                Arc::new(QdrantVectorStore::new(&config, &collection)?);
            Ok(store)
        });
        registry
    }
}

impl BackendRegistry {
    #[inline]
    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register or replace the constructor for `name`
    #[inline]
    pub fn register_backend<F, Fut>(&self, name: &str, factory: F)
    where
        F: Fn(VectorStoreConfig, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn VectorStore>>> + Send + 'static,
    {
        let factory: BackendFactory = Arc::new(move |config, collection| {
            Box::pin(factory(config, collection)) as BackendFuture
        });
        let mut factories = self
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if factories.insert(name.to_string(), factory).is_some() {
            debug!("Replaced vector store backend '{}'", name);
        }
    }

    #[inline]
    pub fn list_available_backends(&self) -> Vec<String> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Build and connect the backend selected by `config.backend` for one collection
    #[inline]
    pub async fn create_vector_store(
        &self,
        config: &VectorStoreConfig,
        collection: &str,
    ) -> Result<Arc<dyn VectorStore>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&config.backend)
            .cloned();

        let Some(factory) = factory else {
            return Err(WeaveError::UnknownBackend {
                name: config.backend.clone(),
                available: self.list_available_backends().join(", "),
            });
        };

        let store = factory(config.clone(), collection.to_string()).await?;
        store.connect().await?;
        info!(
            "Opened collection '{}' on the {} backend",
            collection,
            store.backend_name()
        );
        Ok(store)
    }
}

/// Collection name for a subproject: anything outside `[a-zA-Z0-9_-]` becomes `_`
#[inline]
pub fn collection_name(subproject: &str) -> String {
    subproject
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Order hits by descending score, then by ascending insertion sequence
pub(crate) fn rank_hits(mut scored: Vec<(SearchHit, u64)>, top_k: usize) -> Vec<SearchHit> {
    scored.sort_by(|(a, a_seq), (b, b_seq)| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a_seq.cmp(b_seq))
    });
    scored.truncate(top_k);
    scored.into_iter().map(|(hit, _)| hit).collect()
}

/// Whether a search that asked the engine for `limit` rows already holds every row tied with
/// the `top_k`-th score, so `rank_hits` can break ties by insertion order
pub(crate) fn ties_resolved(scored: &[(SearchHit, u64)], top_k: usize, limit: usize) -> bool {
    if scored.len() < limit {
        return true;
    }
    let mut scores: Vec<f32> = scored.iter().map(|(hit, _)| hit.score).collect();
    scores.sort_by(|a, b| b.total_cmp(a));
    match (scores.get(top_k.saturating_sub(1)), scores.last()) {
        (Some(cut), Some(lowest)) => lowest < cut,
        _ => true,
    }
}

/// Quote a value for a SQL-like filter predicate
pub(crate) fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
