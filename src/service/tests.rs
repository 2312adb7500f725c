use super::*;
use crate::database::MemoryVectorStore;
use crate::embeddings::{EmbeddingConfig, EmbeddingProvider, HashingEmbedder};
use async_trait::async_trait;
use std::fs;
use tempfile::TempDir;
use tokio::sync::Semaphore;

const DIMENSION: usize = 64;

fn test_config(base_dir: &Path, backend: &str) -> Config {
    Config {
        embedding: EmbeddingConfig {
            provider: EmbeddingProvider::Hashing,
            dimension: DIMENSION,
            ..EmbeddingConfig::default()
        },
        vector_store: VectorStoreConfig {
            backend: backend.to_string(),
            ..VectorStoreConfig::default()
        },
        base_dir: base_dir.to_path_buf(),
        ..Config::default()
    }
}

async fn service_with(
    base_dir: &Path,
    backend: &str,
    embedder: Arc<dyn Embedder>,
) -> WeaveService {
    let database = Database::initialize_from_config_dir(base_dir)
        .await
        .expect("database opens");
    WeaveService::with_parts(test_config(base_dir, backend), database, embedder)
}

async fn service(base_dir: &Path) -> WeaveService {
    service_with(
        base_dir,
        "memory",
        Arc::new(HashingEmbedder::new(DIMENSION, 32_000)),
    )
    .await
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("should create parent dirs");
    }
    fs::write(path, content).expect("should write file");
}

fn api_repo() -> TempDir {
    let repo = TempDir::new().expect("should create temp dir");
    write(
        repo.path(),
        "src/parser.rs",
        "fn parse_request(body: &str) -> Request {\n    Request::from(body)\n}\n",
    );
    write(
        repo.path(),
        "src/router.rs",
        "fn route(request: Request) -> Response {\n    dispatch(request)\n}\n",
    );
    repo
}

fn web_repo() -> TempDir {
    let repo = TempDir::new().expect("should create temp dir");
    write(
        repo.path(),
        "app/view.ts",
        "export function renderView(props) {\n  return template(props);\n}\n",
    );
    repo
}

#[tokio::test]
async fn index_search_and_assemble() {
    let base = TempDir::new().expect("should create temp dir");
    let api = api_repo();
    let web = web_repo();
    let service = service(base.path()).await;

    service.add_subproject("shop").await.expect("subproject added");
    let api_row = service
        .add_repository("shop", api.path())
        .await
        .expect("repository added");
    service
        .add_repository("shop", web.path())
        .await
        .expect("repository added");

    let handle = service
        .index_subproject("shop", true)
        .await
        .expect("run starts");
    let summary = handle.wait().await.expect("run completes");
    assert_eq!(summary.status, ProgressStatus::Indexed);
    assert_eq!(summary.files_indexed, 3);

    let status = service.status("shop").await.expect("status readable");
    assert_eq!(status.record_count, 3);
    assert_eq!(status.backend, "memory");
    assert_eq!(status.subproject.status, IndexStatus::Indexed);
    assert_eq!(status.subproject.total_chunks, 3);
    assert!(status.repositories.iter().all(|r| r.status == IndexStatus::Indexed));
    assert!(!status.running);
    assert_eq!(
        status.last_event.map(|e| e.status),
        Some(ProgressStatus::Indexed)
    );

    let hits = service
        .search(
            "shop",
            "parse request body",
            &SearchOptions {
                top_k: 5,
                ..SearchOptions::default()
            },
        )
        .await
        .expect("search succeeds");
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].record.file_path, "src/parser.rs");
    assert_eq!(hits[0].record.repo_path, api_row.path);

    let scoped = service
        .search(
            "shop",
            "parse request body",
            &SearchOptions {
                top_k: 5,
                repos: vec![api_row.path.clone()],
                keyword_boost: true,
            },
        )
        .await
        .expect("search succeeds");
    assert_eq!(scoped.len(), 2);

    let context = service
        .build_context(
            "shop",
            &ContextRequest::new("how is a request parsed? @src/router.rs:1-2"),
        )
        .await
        .expect("context builds");
    assert_eq!(context.parts.len(), 1);
    let part = &context.parts[0];
    let attachment = part
        .find("src/router.rs:1-2 (score=1.0000)")
        .expect("attachment rendered");
    let hit = part.find("src/parser.rs:1-3").expect("search hit rendered");
    assert!(attachment < hit);
    assert!(!part.contains("src/router.rs:1-3"));
    assert!(part.contains("## Question\nhow is a request parsed?\n"));
}

#[tokio::test]
async fn caller_errors() {
    let base = TempDir::new().expect("should create temp dir");
    let service = service(base.path()).await;

    assert!(matches!(
        service.index_subproject("ghost", true).await,
        Err(WeaveError::NotFound(_))
    ));
    assert!(matches!(
        service
            .search("ghost", "query", &SearchOptions::default())
            .await,
        Err(WeaveError::NotFound(_))
    ));

    service.add_subproject("empty").await.expect("subproject added");
    assert!(matches!(
        service.index_subproject("empty", true).await,
        Err(WeaveError::InvalidInput(_))
    ));
    assert!(matches!(
        service
            .search("empty", "query", &SearchOptions::default())
            .await,
        Err(WeaveError::IndexMissing(_))
    ));
    assert!(service.add_subproject("  ").await.is_err());
    assert!(
        service
            .add_repository("empty", &base.path().join("missing"))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn tiny_budget_is_rejected() {
    let base = TempDir::new().expect("should create temp dir");
    let api = api_repo();
    let service = service(base.path()).await;
    service.add_subproject("shop").await.expect("subproject added");
    service
        .add_repository("shop", api.path())
        .await
        .expect("repository added");
    service
        .index_subproject("shop", true)
        .await
        .expect("run starts")
        .wait()
        .await
        .expect("run completes");

    let request = ContextRequest {
        token_budget: Some(1300),
        ..ContextRequest::new("parse")
    };
    assert!(matches!(
        service.build_context("shop", &request).await,
        Err(WeaveError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn unknown_backend_fails_before_the_run() {
    let base = TempDir::new().expect("should create temp dir");
    let api = api_repo();
    let service = service_with(
        base.path(),
        "faiss",
        Arc::new(HashingEmbedder::new(DIMENSION, 32_000)),
    )
    .await;
    service.add_subproject("shop").await.expect("subproject added");
    service
        .add_repository("shop", api.path())
        .await
        .expect("repository added");

    assert!(matches!(
        service.index_subproject("shop", true).await,
        Err(WeaveError::UnknownBackend { .. })
    ));

    service.register_backend("faiss", |_config, collection| async move {
        Ok(Arc::new(MemoryVectorStore::new(&collection, None)) as Arc<dyn VectorStore>)
    });
    assert!(service.list_available_backends().contains(&"faiss".to_string()));

    let summary = service
        .index_subproject("shop", true)
        .await
        .expect("run starts")
        .wait()
        .await
        .expect("run completes");
    assert_eq!(summary.chunks_stored, 2);
}

/// Blocks every batch until the test opens the gate
struct GatedEmbedder {
    inner: HashingEmbedder,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Embedder for GatedEmbedder {
    fn identity(&self) -> String {
        self.inner.identity()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.inner.embed(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| WeaveError::Embedding(e.to_string()))?;
        self.inner.embed_batch(texts).await
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn second_run_is_rejected_while_one_is_in_flight() {
    let base = TempDir::new().expect("should create temp dir");
    let api = api_repo();
    let gate = Arc::new(Semaphore::new(0));
    let service = service_with(
        base.path(),
        "memory",
        Arc::new(GatedEmbedder {
            inner: HashingEmbedder::new(DIMENSION, 32_000),
            gate: Arc::clone(&gate),
        }),
    )
    .await;
    service.add_subproject("shop").await.expect("subproject added");
    service
        .add_repository("shop", api.path())
        .await
        .expect("repository added");

    let first = service
        .index_subproject("shop", true)
        .await
        .expect("run starts");
    assert!(matches!(
        service.index_subproject("shop", true).await,
        Err(WeaveError::AlreadyIndexing(_))
    ));
    assert!(service.status("shop").await.expect("status").running);

    gate.add_permits(16);
    let summary = first.wait().await.expect("run completes");
    assert_eq!(summary.files_indexed, 2);

    let mut events = service.subscribe("shop").expect("run was recorded");
    let mut last = None;
    while let Some(event) = events.recv().await {
        last = Some(event.status);
    }
    assert_eq!(last, Some(ProgressStatus::Indexed));

    service
        .index_subproject("shop", true)
        .await
        .expect("lock released after the run")
        .wait()
        .await
        .expect("run completes");
}

#[tokio::test]
async fn cancelled_run_marks_the_subproject() {
    let base = TempDir::new().expect("should create temp dir");
    let api = api_repo();
    let gate = Arc::new(Semaphore::new(0));
    let service = service_with(
        base.path(),
        "memory",
        Arc::new(GatedEmbedder {
            inner: HashingEmbedder::new(DIMENSION, 32_000),
            gate: Arc::clone(&gate),
        }),
    )
    .await;
    service.add_subproject("shop").await.expect("subproject added");
    service
        .add_repository("shop", api.path())
        .await
        .expect("repository added");

    let handle = service
        .index_subproject("shop", true)
        .await
        .expect("run starts");
    handle.cancel();
    let summary = handle.wait().await.expect("run returns a summary");

    assert!(summary.cancelled);
    assert_eq!(summary.status, ProgressStatus::Error);
    let status = service.status("shop").await.expect("status readable");
    assert_eq!(status.subproject.status, IndexStatus::Error);
    assert_eq!(status.record_count, 0);
}

#[tokio::test]
async fn removed_repository_is_no_longer_searchable() {
    let base = TempDir::new().expect("should create temp dir");
    let api = api_repo();
    let web = web_repo();
    let service = service(base.path()).await;

    service.add_subproject("shop").await.expect("subproject added");
    service
        .add_repository("shop", api.path())
        .await
        .expect("repository added");
    let web_row = service
        .add_repository("shop", web.path())
        .await
        .expect("repository added");
    service
        .index_subproject("shop", true)
        .await
        .expect("run starts")
        .wait()
        .await
        .expect("run completes");

    let removed = service
        .remove_repository("shop", &web_row.path)
        .await
        .expect("removal succeeds");
    assert!(removed);

    let hits = service
        .search(
            "shop",
            "render view template",
            &SearchOptions {
                top_k: 10,
                ..SearchOptions::default()
            },
        )
        .await
        .expect("search succeeds");
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|hit| hit.record.repo_path != web_row.path));

    let status = service.status("shop").await.expect("status readable");
    assert_eq!(status.record_count, 2);
    let metadata = status.metadata.expect("metadata kept");
    assert!(!metadata.repos.contains(&web_row.path));
    assert!(metadata.repo_hashes(&web_row.path).is_none());
    assert_eq!(metadata.chunks_stored, 2);

    let again = service
        .remove_repository("shop", &web_row.path)
        .await
        .expect("removal succeeds");
    assert!(!again);
}
