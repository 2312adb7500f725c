// Indexer module
// Incremental indexing of every repository of a subproject into its vector collection

pub mod change;
pub mod progress;
pub mod scanner;


use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunking::{Chunker, ChunkingConfig, Language};
use crate::database::{ChunkRecord, IndexMetadata, RecordFilter, VectorStore};
use crate::embeddings::Embedder;
use crate::{Result, WeaveError};

pub use change::{ChangeDetector, ChangeKind, content_fingerprint};
pub use progress::{ProgressEvent, ProgressHub, ProgressReceiver, ProgressStatus, ProgressStream};
pub use scanner::{FileScanner, ScanResult, ScannedFile, SkipReason, SkippedFile, is_binary};

const DEFAULT_INCLUDE_PATTERNS: &[&str] = &[
    "*.py", "*.js", "*.ts", "*.tsx", "*.jsx", "*.go", "*.java", "*.kt", "*.cs", "*.rb", "*.php",
    "*.rs", "*.c", "*.h", "*.cpp", "*.hpp", "*.swift", "*.txt", "*.yaml", "*.yml", "*.json",
];

const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &[
    ".git/**",
    "node_modules/**",
    "dist/**",
    "build/**",
    ".venv/**",
    "venv/**",
    "__pycache__/**",
    "target/**",
    ".next/**",
    ".idea/**",
    ".vscode/**",
    ".env",
    ".env.*",
];

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// File discovery and pipeline tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub max_file_size_kb: u64,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    /// Files processed concurrently within one repository
    pub workers: usize,
    /// Attempts for transient embedder and vector store failures
    pub retry_attempts: u32,
    /// Records accumulated before a write to the vector store
    pub save_batch_size: usize,
}

impl Default for IndexingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_file_size_kb: 512,
            include_patterns: DEFAULT_INCLUDE_PATTERNS
                .iter()
                .map(ToString::to_string)
                .collect(),
            exclude_patterns: DEFAULT_EXCLUDE_PATTERNS
                .iter()
                .map(ToString::to_string)
                .collect(),
            workers: 4,
            retry_attempts: 3,
            save_batch_size: 256,
        }
    }
}

/// Fingerprint of everything that shapes stored records; a change makes old records unusable
#[inline]
pub fn config_fingerprint(
    chunking: &ChunkingConfig,
    embedder_identity: &str,
    dimension: usize,
) -> String {
    content_fingerprint(
        format!(
            "chunk_lines={};overlap={};embedder={};dimension={}",
            chunking.max_chunk_lines, chunking.overlap_lines, embedder_identity, dimension
        )
        .as_bytes(),
    )
}

/// Bounded exponential backoff for transient failures only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    #[inline]
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    #[inline]
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1_u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let delay = self
                        .base_delay
                        .saturating_mul(2_u32.saturating_pow(attempt - 1));
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation, attempt, self.attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Per-subproject single-flight guard
#[derive(Debug, Default)]
pub struct RunLocks {
    active: Mutex<HashSet<String>>,
}

impl RunLocks {
    /// Claim the subproject, or fail with `AlreadyIndexing` while another run holds it
    #[inline]
    pub fn try_acquire(self: &Arc<Self>, subproject: &str) -> Result<RunGuard> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(subproject.to_string()) {
            return Err(WeaveError::AlreadyIndexing(subproject.to_string()));
        }
        Ok(RunGuard {
            locks: Arc::clone(self),
            subproject: subproject.to_string(),
        })
    }

    #[inline]
    pub fn is_running(&self, subproject: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(subproject)
    }
}

/// Releases the subproject when dropped
#[derive(Debug)]
pub struct RunGuard {
    locks: Arc<RunLocks>,
    subproject: String,
}

impl Drop for RunGuard {
    #[inline]
    fn drop(&mut self) {
        self.locks
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.subproject);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRequest {
    pub subproject: String,
    /// Repository roots; each path string is also the stored repository identifier
    pub repos: Vec<String>,
    /// `false` clears the collection and rebuilds it
    pub incremental: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoOutcome {
    Indexed,
    /// The run went through but some files could not be indexed
    PartiallyFailed { failed_files: usize },
    Failed(String),
    Cancelled,
}

impl RepoOutcome {
    #[inline]
    pub fn is_error(&self) -> bool {
        !matches!(self, RepoOutcome::Indexed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    Skipped,
    ParserFallback,
    Failed,
}

/// A file-scoped problem that did not stop the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIssue {
    pub repo_path: String,
    pub file_path: String,
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSummary {
    pub repo_path: String,
    pub outcome: RepoOutcome,
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_deleted: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub chunks_stored: usize,
}

impl RepoSummary {
    fn new(repo_path: &str) -> Self {
        Self {
            repo_path: repo_path.to_string(),
            outcome: RepoOutcome::Indexed,
            files_scanned: 0,
            files_indexed: 0,
            files_unchanged: 0,
            files_deleted: 0,
            files_skipped: 0,
            files_failed: 0,
            chunks_stored: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub subproject: String,
    /// `Indexed` or `Error`, the worst repository outcome
    pub status: ProgressStatus,
    pub full_rebuild: bool,
    pub cancelled: bool,
    pub repos: Vec<RepoSummary>,
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_deleted: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub chunks_stored: usize,
    pub embedding_calls: usize,
    pub issues: Vec<FileIssue>,
    pub elapsed: Duration,
}

impl RunSummary {
    fn new(subproject: &str) -> Self {
        Self {
            subproject: subproject.to_string(),
            status: ProgressStatus::Indexed,
            full_rebuild: false,
            cancelled: false,
            repos: Vec::new(),
            files_scanned: 0,
            files_indexed: 0,
            files_unchanged: 0,
            files_deleted: 0,
            files_skipped: 0,
            files_failed: 0,
            chunks_stored: 0,
            embedding_calls: 0,
            issues: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    fn add_repo(&mut self, repo: RepoSummary) {
        self.files_scanned += repo.files_scanned;
        self.files_indexed += repo.files_indexed;
        self.files_unchanged += repo.files_unchanged;
        self.files_deleted += repo.files_deleted;
        self.files_skipped += repo.files_skipped;
        self.files_failed += repo.files_failed;
        self.chunks_stored += repo.chunks_stored;
        if repo.outcome.is_error() {
            self.status = ProgressStatus::Error;
        }
        self.repos.push(repo);
    }

    /// One line per failed or cancelled repository
    #[inline]
    pub fn error_message(&self) -> Option<String> {
        let lines: Vec<String> = self
            .repos
            .iter()
            .filter_map(|repo| match &repo.outcome {
                RepoOutcome::Indexed => None,
                RepoOutcome::PartiallyFailed { failed_files } => Some(format!(
                    "{}: {} files failed",
                    repo.repo_path, failed_files
                )),
                RepoOutcome::Failed(reason) => Some(format!("{}: {}", repo.repo_path, reason)),
                RepoOutcome::Cancelled => Some(format!("{}: cancelled", repo.repo_path)),
            })
            .collect();

        if self.cancelled && lines.is_empty() {
            return Some(WeaveError::Cancelled.to_string());
        }
        (!lines.is_empty()).then(|| lines.join("; "))
    }
}

/// A background indexing run
#[derive(Debug)]
pub struct RunHandle {
    subproject: String,
    progress: Arc<ProgressStream>,
    cancel: CancellationToken,
    task: JoinHandle<Result<RunSummary>>,
}

impl RunHandle {
    #[inline]
    pub fn new(
        subproject: &str,
        progress: Arc<ProgressStream>,
        cancel: CancellationToken,
        task: JoinHandle<Result<RunSummary>>,
    ) -> Self {
        Self {
            subproject: subproject.to_string(),
            progress,
            cancel,
            task,
        }
    }

    #[inline]
    pub fn subproject(&self) -> &str {
        &self.subproject
    }

    /// Receiver that replays every event of this run before following live ones
    #[inline]
    pub fn subscribe(&self) -> ProgressReceiver {
        self.progress.subscribe()
    }

    /// Stop after the files currently in flight; their partial results are discarded
    #[inline]
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    #[inline]
    pub async fn wait(self) -> Result<RunSummary> {
        self.task
            .await
            .map_err(|e| WeaveError::Indexing(format!("Indexing task failed: {e}")))?
    }
}

/// Publishes counters as the run advances
struct Tracker<'a> {
    stream: &'a ProgressStream,
    subproject: String,
    files_total: usize,
    files_done: usize,
    chunks_total: usize,
}

impl Tracker<'_> {
    fn emit(&self, status: ProgressStatus, repo: Option<&str>, error: Option<String>) {
        self.stream.publish(ProgressEvent {
            subproject: self.subproject.clone(),
            status,
            files_done: self.files_done,
            files_total: self.files_total,
            chunks_total: self.chunks_total,
            repo: repo.map(ToString::to_string),
            error,
        });
    }

    fn file_done(&mut self, repo: &str) {
        self.files_done += 1;
        self.emit(ProgressStatus::Indexing, Some(repo), None);
    }
}

enum FileResult {
    Unchanged,
    Binary,
    Indexed {
        kind: ChangeKind,
        fingerprint: String,
        records: Vec<ChunkRecord>,
        warning: Option<String>,
    },
    Failed(WeaveError),
}

struct ProcessedFile {
    path: String,
    result: FileResult,
}

/// Shared state of the workers of one repository
struct FileContext {
    repo_path: String,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    detector: Arc<ChangeDetector>,
    retry: RetryPolicy,
    embedding_calls: Arc<AtomicUsize>,
}

/// Completed files waiting for the next vector store write
#[derive(Default)]
struct PendingBatch {
    records: Vec<ChunkRecord>,
    /// Paths whose stored records must go before the new ones land
    stale: Vec<String>,
    /// Paths that no longer have any records
    removed: Vec<String>,
    fingerprints: Vec<(String, String)>,
}

impl PendingBatch {
    fn is_empty(&self) -> bool {
        self.records.is_empty()
            && self.stale.is_empty()
            && self.removed.is_empty()
            && self.fingerprints.is_empty()
    }

    /// Mark the files of a batch that never landed so the next run treats them as modified.
    ///
    /// Removed paths keep their old fingerprint and are retried as deletions.
    fn invalidate(&self, repo: &str, metadata: &mut IndexMetadata) {
        let hashes = metadata.file_hashes.entry(repo.to_string()).or_default();
        for (path, _) in &self.fingerprints {
            hashes.insert(path.clone(), String::new());
        }
    }
}

/// Scans, chunks, embeds and stores the repositories of one subproject
pub struct Indexer {
    config: IndexingConfig,
    scanner: FileScanner,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    retry: RetryPolicy,
}

impl Indexer {
    #[inline]
    pub fn new(
        config: &IndexingConfig,
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            scanner: FileScanner::new(config)?,
            chunker,
            embedder,
            store,
            retry: RetryPolicy::new(config.retry_attempts, DEFAULT_RETRY_DELAY),
        })
    }

    #[inline]
    #[must_use]
    pub fn with_retry_delay(mut self, base_delay: Duration) -> Self {
        self.retry.base_delay = base_delay;
        self
    }

    #[inline]
    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    #[inline]
    pub fn config_fingerprint(&self) -> String {
        config_fingerprint(
            self.chunker.config(),
            &self.embedder.identity(),
            self.embedder.dimension(),
        )
    }

    /// Run in a background task holding `guard` until it finishes
    #[inline]
    pub fn spawn(
        self,
        request: IndexRequest,
        guard: RunGuard,
        progress: Arc<ProgressStream>,
    ) -> RunHandle {
        let cancel = CancellationToken::new();
        let subproject = request.subproject.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            let progress = Arc::clone(&progress);
            async move {
                let _guard = guard;
                self.run(&request, &cancel, &progress).await
            }
        });
        RunHandle::new(&subproject, progress, cancel, task)
    }

    /// Index every repository of the request.
    ///
    /// Failures confined to a file or a repository end up in the summary. An error is returned
    /// only when the collection itself cannot be used, and is also published as the terminal
    /// progress event.
    #[inline]
    pub async fn run(
        &self,
        request: &IndexRequest,
        cancel: &CancellationToken,
        progress: &ProgressStream,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let mut tracker = Tracker {
            stream: progress,
            subproject: request.subproject.clone(),
            files_total: 0,
            files_done: 0,
            chunks_total: 0,
        };
        tracker.emit(ProgressStatus::Scanning, None, None);
        info!(
            "Indexing subproject '{}' ({} repositories, incremental: {})",
            request.subproject,
            request.repos.len(),
            request.incremental
        );

        match self.run_repos(request, cancel, &mut tracker).await {
            Ok(mut summary) => {
                summary.elapsed = started.elapsed();
                tracker.emit(summary.status, None, summary.error_message());
                info!(
                    "Indexed subproject '{}': {} files indexed, {} unchanged, {} deleted, {} chunks stored in {:?}",
                    summary.subproject,
                    summary.files_indexed,
                    summary.files_unchanged,
                    summary.files_deleted,
                    summary.chunks_stored,
                    summary.elapsed
                );
                Ok(summary)
            }
            Err(e) => {
                error!("Indexing subproject '{}' failed: {}", request.subproject, e);
                tracker.emit(ProgressStatus::Error, None, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_repos(
        &self,
        request: &IndexRequest,
        cancel: &CancellationToken,
        tracker: &mut Tracker<'_>,
    ) -> Result<RunSummary> {
        self.store.health_check().await?;

        let mut summary = RunSummary::new(&request.subproject);
        let mut metadata = self.prepare_metadata(request, &mut summary).await?;

        let repos: Vec<&str> = request.repos.iter().map(String::as_str).unique().collect();

        self.drop_removed_repos(&repos, &mut metadata).await?;

        let mut scans = Vec::with_capacity(repos.len());
        for repo in &repos {
            let scanner = self.scanner.clone();
            let root = PathBuf::from(*repo);
            let scan = tokio::task::spawn_blocking(move || scanner.scan(&root))
                .await
                .map_err(|e| WeaveError::Indexing(format!("Scan task failed: {e}")))
                .and_then(|scan| scan);
            if let Ok(scan) = &scan {
                tracker.files_total += scan.files.len();
            }
            scans.push(scan);
        }
        tracker.emit(ProgressStatus::Indexing, None, None);

        let embedding_calls = Arc::new(AtomicUsize::new(0));
        for (repo, scan) in repos.iter().copied().zip(scans) {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                summary.add_repo(RepoSummary {
                    outcome: RepoOutcome::Cancelled,
                    ..RepoSummary::new(repo)
                });
                continue;
            }

            let repo_summary = self
                .index_repository(
                    repo,
                    scan,
                    &mut metadata,
                    cancel,
                    tracker,
                    &embedding_calls,
                    &mut summary.issues,
                )
                .await;
            if repo_summary.outcome == RepoOutcome::Cancelled {
                summary.cancelled = true;
            }
            tracker.emit(ProgressStatus::Indexing, Some(repo), None);
            summary.add_repo(repo_summary);
        }
        summary.embedding_calls = embedding_calls.load(Ordering::Relaxed);

        metadata.files_seen = metadata
            .file_hashes
            .values()
            .map(|hashes| hashes.len() as u64)
            .sum();
        metadata.chunks_stored = self.store.count(None).await?;
        metadata.updated_at = Utc::now();
        self.retry
            .run("metadata write", || self.store.save_records(&[], &metadata))
            .await?;

        Ok(summary)
    }

    /// Stored metadata when it can be built upon, otherwise an emptied collection
    async fn prepare_metadata(
        &self,
        request: &IndexRequest,
        summary: &mut RunSummary,
    ) -> Result<IndexMetadata> {
        let fingerprint = self.config_fingerprint();
        let stored = self.store.get_metadata().await?;

        let reusable = request.incremental
            && stored
                .as_ref()
                .is_some_and(|m| m.config_fingerprint.as_deref() == Some(fingerprint.as_str()));

        let mut metadata = match stored {
            Some(metadata) if reusable => metadata,
            stored => {
                if stored.is_some() || self.store.exists().await? {
                    if request.incremental {
                        info!(
                            "Chunking or embedding settings changed for '{}', rebuilding",
                            request.subproject
                        );
                    }
                    self.store.clear().await?;
                    summary.full_rebuild = true;
                }
                IndexMetadata::new(self.store.collection())
            }
        };
        metadata.config_fingerprint = Some(fingerprint);
        Ok(metadata)
    }

    async fn drop_removed_repos(&self, repos: &[&str], metadata: &mut IndexMetadata) -> Result<()> {
        let removed: Vec<String> = metadata
            .repos
            .iter()
            .filter(|repo| !repos.contains(&repo.as_str()))
            .cloned()
            .collect();

        for repo in removed {
            let filter = RecordFilter::repo(&repo);
            let deleted = self
                .retry
                .run("repository removal", || self.store.delete_by_filter(&filter))
                .await?;
            info!("Removed {} records of dropped repository {}", deleted, repo);
            metadata.repos.remove(&repo);
            metadata.file_hashes.remove(&repo);
        }
        Ok(())
    }

    #[expect(clippy::too_many_arguments, reason = "run-wide state threaded through")]
    async fn index_repository(
        &self,
        repo: &str,
        scan: Result<ScanResult>,
        metadata: &mut IndexMetadata,
        cancel: &CancellationToken,
        tracker: &mut Tracker<'_>,
        embedding_calls: &Arc<AtomicUsize>,
        issues: &mut Vec<FileIssue>,
    ) -> RepoSummary {
        let mut summary = RepoSummary::new(repo);
        let scan = match scan {
            Ok(scan) => scan,
            Err(e) => {
                error!("Repository {} cannot be enumerated: {}", repo, e);
                summary.outcome = RepoOutcome::Failed(e.to_string());
                tracker.emit(ProgressStatus::Indexing, Some(repo), Some(e.to_string()));
                return summary;
            }
        };

        summary.files_scanned = scan.files.len();
        for skipped in scan.skipped {
            warn!("Skipping {}/{}: {}", repo, skipped.relative_path, skipped.reason);
            summary.files_skipped += 1;
            issues.push(FileIssue {
                repo_path: repo.to_string(),
                file_path: skipped.relative_path,
                kind: IssueKind::Skipped,
                message: skipped.reason.to_string(),
            });
        }

        let detector = Arc::new(ChangeDetector::from_metadata(Some(metadata), repo));
        metadata.repos.insert(repo.to_string());

        let present: HashSet<String> = scan
            .files
            .iter()
            .map(|file| file.relative_path.clone())
            .collect();
        let mut pending = PendingBatch::default();
        for path in detector.deleted_paths(&present) {
            debug!("{}/{} was deleted", repo, path);
            summary.files_deleted += 1;
            pending.stale.push(path.clone());
            pending.removed.push(path);
        }

        let context = Arc::new(FileContext {
            repo_path: repo.to_string(),
            chunker: self.chunker.clone(),
            embedder: Arc::clone(&self.embedder),
            detector: Arc::clone(&detector),
            retry: self.retry,
            embedding_calls: Arc::clone(embedding_calls),
        });

        let mut files = scan.files.into_iter();
        let mut workers = JoinSet::new();
        let mut fatal: Option<String> = None;

        loop {
            while workers.len() < self.config.workers.max(1) && !cancel.is_cancelled() {
                let Some(file) = files.next() else {
                    break;
                };
                workers.spawn(process_file(Arc::clone(&context), file));
            }

            let joined = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    workers.abort_all();
                    summary.outcome = RepoOutcome::Cancelled;
                    break;
                }
                joined = workers.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok(processed) => {
                    absorb(repo, processed, &detector, &mut pending, &mut summary, issues);
                }
                Err(e) => {
                    warn!("File worker for {} failed: {}", repo, e);
                    summary.files_failed += 1;
                    issues.push(FileIssue {
                        repo_path: repo.to_string(),
                        file_path: String::new(),
                        kind: IssueKind::Failed,
                        message: e.to_string(),
                    });
                }
            }
            tracker.file_done(repo);

            if pending.records.len() >= self.config.save_batch_size {
                match self.flush(repo, &mut pending, metadata).await {
                    Ok(inserted) => {
                        summary.chunks_stored += inserted;
                        tracker.chunks_total += inserted;
                    }
                    Err(e) => {
                        workers.abort_all();
                        fatal = Some(e.to_string());
                        break;
                    }
                }
            }
        }

        // Completed files are whole, so they are kept even when the run was cancelled
        if fatal.is_none() {
            match self.flush(repo, &mut pending, metadata).await {
                Ok(inserted) => {
                    summary.chunks_stored += inserted;
                    tracker.chunks_total += inserted;
                }
                Err(e) => fatal = Some(e.to_string()),
            }
        }

        if let Some(reason) = fatal {
            error!("Storing records of {} failed: {}", repo, reason);
            pending.invalidate(repo, metadata);
            summary.outcome = RepoOutcome::Failed(reason);
        } else if summary.outcome != RepoOutcome::Cancelled && summary.files_failed > 0 {
            summary.outcome = RepoOutcome::PartiallyFailed {
                failed_files: summary.files_failed,
            };
        }
        summary
    }

    /// Write one batch, then commit its fingerprints to `metadata`
    async fn flush(
        &self,
        repo: &str,
        pending: &mut PendingBatch,
        metadata: &mut IndexMetadata,
    ) -> Result<usize> {
        if pending.is_empty() {
            return Ok(0);
        }

        for path in &pending.stale {
            let filter = RecordFilter::file(repo, path);
            self.retry
                .run("stale record removal", || self.store.delete_by_filter(&filter))
                .await?;
        }

        let mut next = metadata.clone();
        let hashes = next.file_hashes.entry(repo.to_string()).or_default();
        for path in &pending.removed {
            hashes.remove(path);
        }
        for (path, fingerprint) in &pending.fingerprints {
            hashes.insert(path.clone(), fingerprint.clone());
        }
        next.updated_at = Utc::now();

        let inserted = self
            .retry
            .run("record write", || {
                self.store.save_records(&pending.records, &next)
            })
            .await?;
        debug!(
            "Stored {} new records for {} ({} submitted)",
            inserted,
            repo,
            pending.records.len()
        );

        *metadata = next;
        *pending = PendingBatch::default();
        Ok(inserted)
    }
}

fn absorb(
    repo: &str,
    processed: ProcessedFile,
    detector: &ChangeDetector,
    pending: &mut PendingBatch,
    summary: &mut RepoSummary,
    issues: &mut Vec<FileIssue>,
) {
    let ProcessedFile { path, result } = processed;
    let issue = |kind: IssueKind, message: String| FileIssue {
        repo_path: repo.to_string(),
        file_path: path.clone(),
        kind,
        message,
    };

    match result {
        FileResult::Unchanged => summary.files_unchanged += 1,
        FileResult::Binary => {
            warn!("Skipping binary file {}/{}", repo, path);
            summary.files_skipped += 1;
            issues.push(issue(IssueKind::Skipped, SkipReason::Binary.to_string()));
            if detector.previous_fingerprint(&path).is_some() {
                pending.stale.push(path.clone());
                pending.removed.push(path);
            }
        }
        FileResult::Indexed {
            kind,
            fingerprint,
            records,
            warning,
        } => {
            if let Some(warning) = warning {
                issues.push(issue(IssueKind::ParserFallback, warning));
            }
            summary.files_indexed += 1;
            if kind == ChangeKind::Modified {
                pending.stale.push(path.clone());
            }
            pending.records.extend(records);
            pending.fingerprints.push((path, fingerprint));
        }
        FileResult::Failed(e) => {
            warn!("Failed to index {}/{}: {}", repo, path, e);
            summary.files_failed += 1;
            issues.push(issue(IssueKind::Failed, e.to_string()));
        }
    }
}

async fn process_file(context: Arc<FileContext>, file: ScannedFile) -> ProcessedFile {
    let result = index_file(&context, &file).await;
    ProcessedFile {
        path: file.relative_path,
        result,
    }
}

async fn index_file(context: &FileContext, file: &ScannedFile) -> FileResult {
    let bytes = match tokio::fs::read(&file.absolute_path).await {
        Ok(bytes) => bytes,
        Err(e) => return FileResult::Failed(WeaveError::Io(e)),
    };
    if is_binary(&bytes) {
        return FileResult::Binary;
    }

    let fingerprint = content_fingerprint(&bytes);
    let kind = context.detector.classify(&file.relative_path, &fingerprint);
    if kind == ChangeKind::Unchanged {
        return FileResult::Unchanged;
    }

    let text = String::from_utf8_lossy(&bytes).into_owned();
    let language = Language::from_path(Path::new(&file.relative_path));
    let chunker = context.chunker.clone();
    let outcome = match tokio::task::spawn_blocking(move || chunker.chunk(&text, language)).await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            return FileResult::Failed(WeaveError::Chunking(format!(
                "Chunking task failed: {e}"
            )));
        }
    };

    if outcome.chunks.is_empty() {
        return FileResult::Indexed {
            kind,
            fingerprint,
            records: Vec::new(),
            warning: outcome.fallback_warning,
        };
    }

    let texts: Vec<String> = outcome.chunks.iter().map(|c| c.text.clone()).collect();
    let embeddings = context
        .retry
        .run("embedding", || {
            context.embedding_calls.fetch_add(1, Ordering::Relaxed);
            context.embedder.embed_batch(&texts)
        })
        .await;
    let embeddings = match embeddings {
        Ok(embeddings) if embeddings.len() == outcome.chunks.len() => embeddings,
        Ok(embeddings) => {
            return FileResult::Failed(WeaveError::Embedding(format!(
                "Expected {} embeddings, got {}",
                outcome.chunks.len(),
                embeddings.len()
            )));
        }
        Err(e) => return FileResult::Failed(e),
    };

    let records = outcome
        .chunks
        .into_iter()
        .zip(embeddings)
        .map(|(chunk, embedding)| ChunkRecord {
            repo_path: context.repo_path.clone(),
            file_path: file.relative_path.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            file_hash: fingerprint.clone(),
            chunk_hash: chunk.chunk_hash(),
            text: chunk.text,
            embedding,
        })
        .collect();

    FileResult::Indexed {
        kind,
        fingerprint,
        records,
        warning: outcome.fallback_warning,
    }
}
