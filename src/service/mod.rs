// Service module
// The boundary consumed by the CLI: indexing runs, search, context assembly, backends

#[cfg(test)]
mod tests;

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chunking::Chunker;
use crate::config::Config;
use crate::database::sqlite::models::{Repository, RunCounters, Subproject};
use crate::database::sqlite::{Database, IndexStatus};
use crate::database::{
    BackendRegistry, IndexMetadata, RecordFilter, SearchHit, VectorStore, VectorStoreConfig,
    collection_name,
};
use crate::embeddings::{Embedder, create_embedder};
use crate::indexer::{
    IndexRequest, Indexer, ProgressEvent, ProgressHub, ProgressReceiver, ProgressStatus,
    RepoOutcome, RunHandle, RunLocks, RunSummary,
};
use crate::prompt::{ContextAssembler, ContextParts};
use crate::retrieval::{AttachmentRequest, Retriever, SearchOptions, parse_query};
use crate::{Result, WeaveError};

/// Input of `build_context`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRequest {
    /// May carry inline `@path:start-end` attachments
    pub query: String,
    pub attachments: Vec<AttachmentRequest>,
    pub repo_filter: Vec<String>,
    pub top_k: usize,
    pub keyword_boost: bool,
    /// Overrides the configured budget
    pub token_budget: Option<usize>,
}

impl ContextRequest {
    #[inline]
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            attachments: Vec::new(),
            repo_filter: Vec::new(),
            top_k: 10,
            keyword_boost: false,
            token_budget: None,
        }
    }
}

/// Introspection of one subproject that never loads vectors
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubprojectStatus {
    pub subproject: Subproject,
    pub repositories: Vec<Repository>,
    pub backend: String,
    pub collection: String,
    pub record_count: u64,
    pub metadata: Option<IndexMetadata>,
    pub running: bool,
    pub last_event: Option<ProgressEvent>,
}

pub struct WeaveService {
    config: Config,
    database: Database,
    embedder: Arc<dyn Embedder>,
    registry: BackendRegistry,
    stores: Mutex<HashMap<String, Arc<dyn VectorStore>>>,
    locks: Arc<RunLocks>,
    progress: Arc<ProgressHub>,
}

impl WeaveService {
    /// Service over the bookkeeping database in the configuration directory
    #[inline]
    pub async fn new(config: Config) -> Result<Self> {
        let database = Database::initialize_from_config_dir(config.get_base_dir()).await?;
        let embedder = create_embedder(&config)?;
        Ok(Self::with_parts(config, database, embedder))
    }

    #[inline]
    pub fn with_parts(config: Config, database: Database, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config,
            database,
            embedder,
            registry: BackendRegistry::default(),
            stores: Mutex::new(HashMap::new()),
            locks: Arc::new(RunLocks::default()),
            progress: Arc::new(ProgressHub::default()),
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn database(&self) -> &Database {
        &self.database
    }

    // Backend registration

    #[inline]
    pub fn register_backend<F, Fut>(&self, name: &str, factory: F)
    where
        F: Fn(VectorStoreConfig, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn VectorStore>>> + Send + 'static,
    {
        self.registry.register_backend(name, factory);
    }

    #[inline]
    pub fn list_available_backends(&self) -> Vec<String> {
        self.registry.list_available_backends()
    }

    #[inline]
    pub async fn create_vector_store(
        &self,
        config: &VectorStoreConfig,
        collection: &str,
    ) -> Result<Arc<dyn VectorStore>> {
        self.registry.create_vector_store(config, collection).await
    }

    // Subproject bookkeeping

    #[inline]
    pub async fn add_subproject(&self, name: &str) -> Result<Subproject> {
        if name.trim().is_empty() {
            return Err(WeaveError::InvalidInput(
                "Subproject name cannot be empty".to_string(),
            ));
        }
        if let Some(existing) = self.database.get_subproject(name).await? {
            return Ok(existing);
        }
        Ok(self.database.create_subproject(name).await?)
    }

    /// Register a repository root; the path is canonicalized so it identifies the repository
    /// stably across runs
    #[inline]
    pub async fn add_repository(&self, subproject: &str, path: &Path) -> Result<Repository> {
        let subproject = self.subproject(subproject).await?;
        let root = tokio::fs::canonicalize(path).await.map_err(|e| {
            WeaveError::InvalidInput(format!(
                "Repository {} is not accessible: {}",
                path.display(),
                e
            ))
        })?;
        if !root.is_dir() {
            return Err(WeaveError::InvalidInput(format!(
                "Repository {} is not a directory",
                root.display()
            )));
        }
        Ok(self
            .database
            .add_repository(subproject.id, &root.display().to_string())
            .await?)
    }

    /// Unregister a repository and drop its records from the subproject's collection
    #[inline]
    pub async fn remove_repository(&self, subproject: &str, path: &str) -> Result<bool> {
        let record = self.subproject(subproject).await?;
        let _guard = self.locks.try_acquire(subproject)?;
        if !self.database.remove_repository(record.id, path).await? {
            return Ok(false);
        }
        self.purge_repository(subproject, path).await?;
        Ok(true)
    }

    async fn purge_repository(&self, subproject: &str, path: &str) -> Result<()> {
        let store = self.open_store(subproject).await?;
        if !store.exists().await? {
            return Ok(());
        }

        let deleted = store.delete_by_filter(&RecordFilter::repo(path)).await?;
        if let Some(mut metadata) = store.get_metadata().await? {
            metadata.repos.remove(path);
            metadata.file_hashes.remove(path);
            metadata.files_seen = metadata
                .file_hashes
                .values()
                .map(|hashes| hashes.len() as u64)
                .sum();
            metadata.chunks_stored = store.count(None).await?;
            metadata.updated_at = Utc::now();
            store.save_records(&[], &metadata).await?;
        }
        info!(
            "Removed {} records of repository {} from '{}'",
            deleted, path, subproject
        );
        Ok(())
    }

    #[inline]
    pub async fn list_subprojects(&self) -> Result<Vec<Subproject>> {
        Ok(self.database.list_subprojects().await?)
    }

    async fn subproject(&self, name: &str) -> Result<Subproject> {
        self.database
            .get_subproject(name)
            .await?
            .ok_or_else(|| WeaveError::NotFound(format!("Subproject '{name}'")))
    }

    async fn repo_roots(&self, subproject: &Subproject) -> Result<Vec<String>> {
        Ok(self
            .database
            .list_repositories(subproject.id)
            .await?
            .into_iter()
            .map(|repo| repo.path)
            .collect())
    }

    /// The subproject's collection on the configured backend, connected once and then reused
    #[inline]
    pub async fn open_store(&self, subproject: &str) -> Result<Arc<dyn VectorStore>> {
        let collection = collection_name(subproject);
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(&collection) {
            return Ok(Arc::clone(store));
        }

        let store = self
            .registry
            .create_vector_store(&self.config.resolved_vector_store(), &collection)
            .await?;
        stores.insert(collection, Arc::clone(&store));
        Ok(store)
    }

    // Indexing

    /// Start indexing every repository of the subproject in the background.
    ///
    /// Fails immediately for an unknown subproject, a subproject without repositories, a run
    /// already in flight, or an unreachable vector store or embedder.
    #[inline]
    pub async fn index_subproject(&self, name: &str, incremental: bool) -> Result<RunHandle> {
        let subproject = self.subproject(name).await?;
        let repos = self.repo_roots(&subproject).await?;
        if repos.is_empty() {
            return Err(WeaveError::InvalidInput(format!(
                "Subproject '{name}' has no repositories"
            )));
        }

        let guard = self.locks.try_acquire(name)?;
        let store = self.open_store(name).await?;
        store.health_check().await?;
        self.embedder.health_check().await?;

        let indexer = Indexer::new(
            &self.config.indexing,
            Chunker::new(self.config.chunking),
            Arc::clone(&self.embedder),
            store,
        )?;

        self.database
            .set_subproject_status(subproject.id, IndexStatus::Indexing)
            .await?;

        let progress = self.progress.start_run(name);
        let cancel = CancellationToken::new();
        let request = IndexRequest {
            subproject: name.to_string(),
            repos,
            incremental,
        };
        let database = self.database.clone();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            let progress = Arc::clone(&progress);
            async move {
                let _guard = guard;
                let result = indexer.run(&request, &cancel, &progress).await;
                let recorded =
                    record_outcome(&database, indexer.store().as_ref(), &subproject, &result).await;
                if let Err(e) = recorded {
                    error!("Failed to record indexing outcome for '{}': {}", subproject.name, e);
                }
                result
            }
        });

        info!("Started indexing run for '{}'", name);
        Ok(RunHandle::new(name, progress, cancel, task))
    }

    /// Replay and follow the progress of the latest run of a subproject
    #[inline]
    pub fn subscribe(&self, subproject: &str) -> Option<ProgressReceiver> {
        self.progress.subscribe(subproject)
    }

    // Queries

    #[inline]
    pub async fn search(
        &self,
        subproject: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        self.subproject(subproject).await?;
        let store = self.open_store(subproject).await?;
        Retriever::new(store, Arc::clone(&self.embedder))
            .search(query, options)
            .await
    }

    #[inline]
    pub async fn build_context(
        &self,
        subproject: &str,
        request: &ContextRequest,
    ) -> Result<ContextParts> {
        let record = self.subproject(subproject).await?;
        let repo_roots = self.repo_roots(&record).await?;

        let (query, mut attachments) = parse_query(&request.query)?;
        attachments.extend(request.attachments.iter().cloned());

        let mut prompt = self.config.prompt.clone();
        if let Some(budget) = request.token_budget {
            prompt.token_budget = budget;
        }
        if prompt.token_budget <= prompt.reserve_reply_tokens {
            return Err(WeaveError::InvalidInput(format!(
                "Token budget of {} does not exceed the {} token reply reserve",
                prompt.token_budget, prompt.reserve_reply_tokens
            )));
        }
        let assembler = ContextAssembler::from_config(&prompt)?;

        let store = self.open_store(subproject).await?;
        let options = SearchOptions {
            top_k: request.top_k,
            repos: request.repo_filter.clone(),
            keyword_boost: request.keyword_boost,
        };
        let items = Retriever::new(store, Arc::clone(&self.embedder))
            .retrieve(&query, &attachments, &repo_roots, &options)
            .await?;

        assembler.assemble(&query, &items)
    }

    #[inline]
    pub async fn status(&self, subproject: &str) -> Result<SubprojectStatus> {
        let record = self.subproject(subproject).await?;
        let repositories = self.database.list_repositories(record.id).await?;
        let store = self.open_store(subproject).await?;

        Ok(SubprojectStatus {
            repositories,
            backend: store.backend_name().to_string(),
            collection: store.collection().to_string(),
            record_count: store.count(None).await?,
            metadata: store.get_metadata().await?,
            running: self.locks.is_running(subproject),
            last_event: self.progress.latest(subproject),
            subproject: record,
        })
    }
}

/// Write run counters and terminal status back to the bookkeeping rows
async fn record_outcome(
    database: &Database,
    store: &dyn VectorStore,
    subproject: &Subproject,
    result: &Result<RunSummary>,
) -> Result<()> {
    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            database
                .record_subproject_run(
                    subproject.id,
                    &RunCounters {
                        status: IndexStatus::Error,
                        total_files: 0,
                        indexed_files: 0,
                        total_chunks: 0,
                        error_message: Some(e.to_string()),
                    },
                )
                .await?;
            return Ok(());
        }
    };

    for repo in &summary.repos {
        let (status, error_message) = match &repo.outcome {
            RepoOutcome::Indexed => (IndexStatus::Indexed, None),
            RepoOutcome::PartiallyFailed { failed_files } => (
                IndexStatus::Error,
                Some(format!("{failed_files} files failed")),
            ),
            RepoOutcome::Failed(reason) => (IndexStatus::Error, Some(reason.clone())),
            RepoOutcome::Cancelled => {
                (IndexStatus::Error, Some(WeaveError::Cancelled.to_string()))
            }
        };
        let stored = match store.count(Some(&repo.repo_path)).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to count records of {}: {}", repo.repo_path, e);
                repo.chunks_stored as u64
            }
        };
        let counters = RunCounters {
            status,
            total_files: to_i64(repo.files_scanned),
            indexed_files: to_i64(repo.files_indexed + repo.files_unchanged),
            total_chunks: i64::try_from(stored).unwrap_or(i64::MAX),
            error_message,
        };
        if let Err(e) = database
            .record_repository_run(subproject.id, &repo.repo_path, &counters)
            .await
        {
            warn!("Failed to record run of {}: {}", repo.repo_path, e);
        }
    }

    let status = match summary.status {
        ProgressStatus::Indexed => IndexStatus::Indexed,
        _ => IndexStatus::Error,
    };
    let stored = store.count(None).await?;
    database
        .record_subproject_run(
            subproject.id,
            &RunCounters {
                status,
                total_files: to_i64(summary.files_scanned),
                indexed_files: to_i64(summary.files_indexed + summary.files_unchanged),
                total_chunks: i64::try_from(stored).unwrap_or(i64::MAX),
                error_message: summary.error_message(),
            },
        )
        .await?;
    Ok(())
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
