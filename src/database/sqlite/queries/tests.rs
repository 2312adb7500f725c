use super::*;
use crate::database::sqlite::Database;
use tempfile::TempDir;

async fn create_test_database() -> (TempDir, Database) {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let database = Database::initialize_from_config_dir(temp_dir.path())
        .await
        .expect("should open database");
    (temp_dir, database)
}

#[tokio::test]
async fn subproject_lifecycle() {
    let (_temp_dir, database) = create_test_database().await;
    let pool = database.pool();

    let created = SubprojectQueries::create(pool, "platform")
        .await
        .expect("should create");
    assert_eq!(created.status, IndexStatus::New);
    assert_eq!(created.total_chunks, 0);
    assert!(created.last_indexed_at.is_none());

    SubprojectQueries::set_status(pool, created.id, IndexStatus::Indexing)
        .await
        .expect("should set status");
    SubprojectQueries::record_run(
        pool,
        created.id,
        &RunCounters {
            status: IndexStatus::Indexed,
            total_files: 12,
            indexed_files: 10,
            total_chunks: 40,
            error_message: None,
        },
    )
    .await
    .expect("should record run");

    let loaded = SubprojectQueries::get_by_name(pool, "platform")
        .await
        .expect("should query")
        .expect("should exist");
    assert_eq!(loaded.status, IndexStatus::Indexed);
    assert_eq!(loaded.indexed_files, 10);
    assert_eq!(loaded.total_chunks, 40);
    assert!(loaded.last_indexed_at.is_some());
}

#[tokio::test]
async fn duplicate_subproject_names_are_rejected() {
    let (_temp_dir, database) = create_test_database().await;
    let pool = database.pool();

    SubprojectQueries::create(pool, "dup").await.expect("first create");
    assert!(SubprojectQueries::create(pool, "dup").await.is_err());
}

#[tokio::test]
async fn repositories_are_unique_per_subproject() {
    let (_temp_dir, database) = create_test_database().await;
    let pool = database.pool();
    let subproject = SubprojectQueries::create(pool, "web").await.expect("create");

    let first = RepositoryQueries::add(pool, subproject.id, "/src/frontend")
        .await
        .expect("add");
    let again = RepositoryQueries::add(pool, subproject.id, "/src/frontend")
        .await
        .expect("add again");
    RepositoryQueries::add(pool, subproject.id, "/src/api")
        .await
        .expect("add second");

    assert_eq!(first.id, again.id);
    let repos = RepositoryQueries::list_for_subproject(pool, subproject.id)
        .await
        .expect("list");
    let paths: Vec<&str> = repos.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, vec!["/src/frontend", "/src/api"]);
}

#[tokio::test]
async fn deleting_a_subproject_cascades() {
    let (_temp_dir, database) = create_test_database().await;
    let pool = database.pool();
    let subproject = SubprojectQueries::create(pool, "gone").await.expect("create");
    RepositoryQueries::add(pool, subproject.id, "/repo").await.expect("add");

    assert!(SubprojectQueries::delete(pool, subproject.id).await.expect("delete"));
    let repos = RepositoryQueries::list_for_subproject(pool, subproject.id)
        .await
        .expect("list");
    assert!(repos.is_empty());
}

#[tokio::test]
async fn repository_run_is_recorded() {
    let (_temp_dir, database) = create_test_database().await;
    let pool = database.pool();
    let subproject = SubprojectQueries::create(pool, "svc").await.expect("create");
    RepositoryQueries::add(pool, subproject.id, "/repo").await.expect("add");

    RepositoryQueries::record_run(
        pool,
        subproject.id,
        "/repo",
        &RunCounters {
            status: IndexStatus::Error,
            total_files: 3,
            indexed_files: 1,
            total_chunks: 2,
            error_message: Some("permission denied".to_string()),
        },
    )
    .await
    .expect("record");

    let repos = RepositoryQueries::list_for_subproject(pool, subproject.id)
        .await
        .expect("list");
    assert_eq!(repos[0].status, IndexStatus::Error);
    assert_eq!(repos[0].error_message.as_deref(), Some("permission denied"));
    assert!(RepositoryQueries::remove(pool, subproject.id, "/repo").await.expect("remove"));
}
