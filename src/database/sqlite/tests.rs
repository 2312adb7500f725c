use super::*;
use anyhow::Result;
use std::collections::HashSet;
use tempfile::TempDir;

async fn create_test_database() -> Result<(TempDir, Database)> {
    let temp_dir = TempDir::new()?;
    let database = Database::initialize_from_config_dir(temp_dir.path()).await?;
    Ok((temp_dir, database))
}

#[tokio::test]
async fn integration_schema_migration() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' \
         AND name NOT LIKE '_sqlx%'",
    )
    .fetch_all(database.pool())
    .await?;

    let expected_tables: HashSet<&'static str> =
        ["subprojects", "repositories"].into_iter().collect();
    let actual_tables: HashSet<&str> = tables.iter().map(|t| t.as_str()).collect();
    assert_eq!(actual_tables, expected_tables);

    Ok(())
}

#[tokio::test]
async fn migrations_are_rerunnable() -> Result<()> {
    let (temp_dir, database) = create_test_database().await?;
    database.create_subproject("kept").await?;
    drop(database);

    let reopened = Database::initialize_from_config_dir(temp_dir.path()).await?;
    assert!(reopened.get_subproject("kept").await?.is_some());
    Ok(())
}

#[tokio::test]
async fn status_constraint_is_enforced() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    let subproject = database.create_subproject("checked").await?;

    let result = sqlx::query("UPDATE subprojects SET status = 'bogus' WHERE id = ?")
        .bind(subproject.id)
        .execute(database.pool())
        .await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn wrapper_round_trip() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    let subproject = database.create_subproject("tools").await?;
    database.add_repository(subproject.id, "/work/cli").await?;
    database
        .set_subproject_status(subproject.id, IndexStatus::Indexing)
        .await?;

    let listed = database.list_subprojects().await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, IndexStatus::Indexing);
    assert_eq!(database.list_repositories(subproject.id).await?.len(), 1);
    Ok(())
}
