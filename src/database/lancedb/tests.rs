use super::*;
use tempfile::TempDir;

async fn open_store(temp_dir: &TempDir) -> LanceVectorStore {
    let store = LanceVectorStore::open_at(temp_dir.path().join("vectors"), "demo")
        .await
        .expect("should open LanceDB");
    store.connect().await.expect("should connect");
    store
}

fn record(repo: &str, file: &str, hash: &str, embedding: Vec<f32>) -> ChunkRecord {
    ChunkRecord {
        repo_path: repo.to_string(),
        file_path: file.to_string(),
        start_line: 1,
        end_line: 3,
        file_hash: "f".to_string(),
        chunk_hash: hash.to_string(),
        text: format!("fn {hash}() {{}}"),
        embedding,
    }
}

#[tokio::test]
async fn empty_collection_reports_nothing() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let store = open_store(&temp_dir).await;

    assert!(!store.exists().await.expect("exists"));
    assert_eq!(store.count(None).await.expect("count"), 0);
    assert!(store.get_metadata().await.expect("metadata").is_none());
    assert!(store.search(&[1.0, 0.0, 0.0], 5, None).await.expect("search").is_empty());
}

#[tokio::test]
async fn save_is_idempotent_and_metadata_round_trips() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let store = open_store(&temp_dir).await;
    let mut metadata = IndexMetadata::new("demo");
    metadata.repos.insert("repo".to_string());

    let records = vec![
        record("repo", "a.rs", "a", vec![1.0, 0.0, 0.0]),
        record("repo", "b.rs", "b", vec![0.0, 1.0, 0.0]),
    ];
    assert_eq!(store.save_records(&records, &metadata).await.expect("save"), 2);
    assert_eq!(store.save_records(&records, &metadata).await.expect("save"), 0);

    assert_eq!(store.count(None).await.expect("count"), 2);
    assert_eq!(store.get_metadata().await.expect("metadata"), Some(metadata));

    let (loaded, _) = store.load_records(None).await.expect("load");
    assert_eq!(loaded, records);
}

#[tokio::test]
async fn search_scores_and_filters() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let store = open_store(&temp_dir).await;
    let metadata = IndexMetadata::new("demo");
    store
        .save_records(
            &[
                record("one", "a.rs", "a", vec![1.0, 0.0, 0.0]),
                record("two", "b.rs", "b", vec![0.9, 0.1, 0.0]),
                record("two", "c.rs", "c", vec![0.0, 0.0, 1.0]),
            ],
            &metadata,
        )
        .await
        .expect("save");

    let hits = store.search(&[1.0, 0.0, 0.0], 2, None).await.expect("search");
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].record.chunk_hash, "a");
    assert!(hits[0].score >= hits[1].score);

    let filtered = store
        .search(&[1.0, 0.0, 0.0], 5, Some("two"))
        .await
        .expect("search");
    assert_eq!(filtered.len(), 2);
    assert!(filtered.iter().all(|h| h.record.repo_path == "two"));
}

#[tokio::test]
async fn ties_at_the_cut_keep_insertion_order() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let store = open_store(&temp_dir).await;
    let metadata = IndexMetadata::new("demo");

    for hash in ["e", "d", "c", "b", "a"] {
        store
            .save_records(&[record("repo", "same.rs", hash, vec![0.5, 0.5, 0.0])], &metadata)
            .await
            .expect("save");
    }
    store
        .save_records(&[record("repo", "far.rs", "z", vec![0.0, 0.0, 1.0])], &metadata)
        .await
        .expect("save");

    let hits = store.search(&[1.0, 1.0, 0.0], 2, None).await.expect("search");

    let order: Vec<&str> = hits.iter().map(|h| h.record.chunk_hash.as_str()).collect();
    assert_eq!(order, vec!["e", "d"]);
}

#[tokio::test]
async fn delete_and_clear() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let store = open_store(&temp_dir).await;
    let metadata = IndexMetadata::new("demo");
    store
        .save_records(
            &[
                record("repo", "a.rs", "a", vec![1.0, 0.0]),
                record("repo", "b.rs", "b", vec![0.0, 1.0]),
            ],
            &metadata,
        )
        .await
        .expect("save");

    let removed = store
        .delete_by_filter(&RecordFilter::file("repo", "a.rs"))
        .await
        .expect("delete");
    assert_eq!(removed, 1);
    assert_eq!(store.count(Some("repo")).await.expect("count"), 1);

    store.clear().await.expect("clear");
    assert!(!store.exists().await.expect("exists"));
}

#[tokio::test]
async fn dimension_change_requires_clear() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let store = open_store(&temp_dir).await;
    let metadata = IndexMetadata::new("demo");
    store
        .save_records(&[record("repo", "a.rs", "a", vec![1.0, 0.0])], &metadata)
        .await
        .expect("save");

    let result = store
        .save_records(&[record("repo", "b.rs", "b", vec![1.0, 0.0, 0.0])], &metadata)
        .await;
    assert!(matches!(result, Err(WeaveError::VectorStore(_))));
}
