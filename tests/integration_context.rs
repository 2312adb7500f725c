#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

//! Retrieval plus prompt assembly over a freshly indexed repository

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use codeweave::config::Config;
use codeweave::database::VectorStoreConfig;
use codeweave::database::sqlite::Database;
use codeweave::embeddings::{EmbeddingConfig, EmbeddingProvider, HashingEmbedder};
use codeweave::service::{ContextRequest, WeaveService};
use codeweave::tokenizer::{TokenizerKind, token_counter};
use codeweave::{Result, WeaveError};

const DIMENSION: usize = 64;
const FILES: usize = 12;

fn handler_source(index: usize) -> String {
    let mut source = format!("pub fn handle_order_{index}(order: &Order) -> Receipt {{\n");
    for line in 0..38 {
        let _ = writeln!(
            source,
            "    let subtotal_{line} = order.items[{line}].price * order.items[{line}].quantity;"
        );
    }
    source.push_str("}\n");
    source
}

async fn indexed_service(base_dir: &Path, repo: &Path) -> Result<WeaveService> {
    let config = Config {
        embedding: EmbeddingConfig {
            provider: EmbeddingProvider::Hashing,
            dimension: DIMENSION,
            ..EmbeddingConfig::default()
        },
        vector_store: VectorStoreConfig {
            backend: "memory".to_string(),
            ..VectorStoreConfig::default()
        },
        base_dir: base_dir.to_path_buf(),
        ..Config::default()
    };
    let database = Database::initialize_from_config_dir(base_dir).await?;
    let service = WeaveService::with_parts(
        config,
        database,
        Arc::new(HashingEmbedder::new(DIMENSION, 32_000)),
    );

    service.add_subproject("orders").await?;
    service.add_repository("orders", repo).await?;
    service.index_subproject("orders", true).await?.wait().await?;
    Ok(service)
}

fn order_repo() -> TempDir {
    let repo = TempDir::new().expect("should create temp dir");
    for index in 0..FILES {
        fs::write(
            repo.path().join(format!("handler_{index:02}.rs")),
            handler_source(index),
        )
        .expect("should write file");
    }
    repo
}

#[tokio::test]
async fn context_is_split_within_budget() {
    let base = TempDir::new().expect("should create temp dir");
    let repo = order_repo();
    let service = indexed_service(base.path(), repo.path())
        .await
        .expect("indexing succeeds");

    let request = ContextRequest {
        top_k: FILES,
        token_budget: Some(3000),
        ..ContextRequest::new("how is the order subtotal computed?")
    };
    let context = service
        .build_context("orders", &request)
        .await
        .expect("context builds");

    let prompt = &service.config().prompt;
    assert_eq!(prompt.tokenizer, TokenizerKind::Cl100k);
    let counter = token_counter(prompt.tokenizer).expect("tokenizer loads");
    let per_part = 3000 - prompt.reserve_reply_tokens;

    let total = context.parts.len();
    assert!(total > 1);
    for (index, part) in context.parts.iter().enumerate() {
        assert!(counter.count_tokens(part) <= per_part);
        assert_eq!(context.tokens_per_part[index], counter.count_tokens(part));
        assert!(part.contains(&format!("# [PART {}/{}] Context Data", index + 1, total)));
    }
    assert!(context.parts[0].contains("## Question\nhow is the order subtotal computed?"));
    assert!(context.parts[total - 1].contains("## Response Format"));

    for index in 0..FILES {
        let heading = format!("/handler_{index:02}.rs:1-40 (score=");
        let holders = context
            .parts
            .iter()
            .filter(|part| part.contains(&heading))
            .count();
        assert_eq!(holders, 1, "handler_{index:02}.rs");
    }
}

#[tokio::test]
async fn attachments_survive_a_repository_filter() {
    let base = TempDir::new().expect("should create temp dir");
    let repo = order_repo();
    let service = indexed_service(base.path(), repo.path())
        .await
        .expect("indexing succeeds");

    let request = ContextRequest {
        top_k: 2,
        repo_filter: vec!["/nowhere".to_string()],
        ..ContextRequest::new("explain @handler_03.rs:1-5")
    };
    let context = service
        .build_context("orders", &request)
        .await
        .expect("context builds");

    assert_eq!(context.parts.len(), 1);
    let part = &context.parts[0];
    assert!(part.contains("/handler_03.rs:1-5 (score=1.0000)"));
    assert!(part.contains("pub fn handle_order_3(order: &Order) -> Receipt {"));
    assert!(!part.contains(":1-40 (score="));
}

#[tokio::test]
async fn bad_attachment_range_is_a_caller_error() {
    let base = TempDir::new().expect("should create temp dir");
    let repo = order_repo();
    let service = indexed_service(base.path(), repo.path())
        .await
        .expect("indexing succeeds");

    let result = service
        .build_context("orders", &ContextRequest::new("why @handler_01.rs:90-95"))
        .await;
    assert!(matches!(result, Err(WeaveError::InvalidInput(_))));
}
