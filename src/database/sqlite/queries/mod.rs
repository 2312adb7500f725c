#[cfg(test)]
mod tests;

use super::models::*;
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

const SUBPROJECT_COLUMNS: &str = "id, name, status, total_files, indexed_files, total_chunks, \
                                  error_message, last_indexed_at, created_at";
const REPOSITORY_COLUMNS: &str = "id, subproject_id, path, status, total_files, indexed_files, \
                                  total_chunks, error_message, created_at";

pub struct SubprojectQueries;

impl SubprojectQueries {
    #[inline]
    pub async fn create(pool: &SqlitePool, name: &str) -> Result<Subproject> {
        let now = Utc::now().naive_utc();
        let id = sqlx::query("INSERT INTO subprojects (name, status, created_at) VALUES (?, 'new', ?)")
            .bind(name)
            .bind(now)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create subproject '{name}'"))?
            .last_insert_rowid();

        Self::get_by_id(pool, id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created subproject"))
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: i64) -> Result<Option<Subproject>> {
        sqlx::query_as::<_, Subproject>(&format!(
            "SELECT {SUBPROJECT_COLUMNS} FROM subprojects WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get subproject by id")
    }

    #[inline]
    pub async fn get_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Subproject>> {
        sqlx::query_as::<_, Subproject>(&format!(
            "SELECT {SUBPROJECT_COLUMNS} FROM subprojects WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("Failed to get subproject by name")
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Subproject>> {
        sqlx::query_as::<_, Subproject>(&format!(
            "SELECT {SUBPROJECT_COLUMNS} FROM subprojects ORDER BY name"
        ))
        .fetch_all(pool)
        .await
        .context("Failed to list subprojects")
    }

    #[inline]
    pub async fn set_status(pool: &SqlitePool, id: i64, status: IndexStatus) -> Result<()> {
        sqlx::query("UPDATE subprojects SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(pool)
            .await
            .context("Failed to update subproject status")?;
        Ok(())
    }

    /// Write the outcome of a finished run
    #[inline]
    pub async fn record_run(pool: &SqlitePool, id: i64, counters: &RunCounters) -> Result<()> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            "UPDATE subprojects SET status = ?, total_files = ?, indexed_files = ?, \
             total_chunks = ?, error_message = ?, last_indexed_at = ? WHERE id = ?",
        )
        .bind(counters.status)
        .bind(counters.total_files)
        .bind(counters.indexed_files)
        .bind(counters.total_chunks)
        .bind(counters.error_message.as_deref())
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to record subproject run")?;

        debug!("Recorded run for subproject {}: {}", id, counters.status);
        Ok(())
    }

    #[inline]
    pub async fn delete(pool: &SqlitePool, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subprojects WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .context("Failed to delete subproject")?;
        Ok(result.rows_affected() > 0)
    }
}

pub struct RepositoryQueries;

impl RepositoryQueries {
    #[inline]
    pub async fn add(pool: &SqlitePool, subproject_id: i64, path: &str) -> Result<Repository> {
        let now = Utc::now().naive_utc();
        sqlx::query(
            "INSERT INTO repositories (subproject_id, path, status, created_at) VALUES (?, ?, 'new', ?) \
             ON CONFLICT (subproject_id, path) DO NOTHING",
        )
        .bind(subproject_id)
        .bind(path)
        .bind(now)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to add repository '{path}'"))?;

        sqlx::query_as::<_, Repository>(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE subproject_id = ? AND path = ?"
        ))
        .bind(subproject_id)
        .bind(path)
        .fetch_one(pool)
        .await
        .context("Failed to retrieve added repository")
    }

    #[inline]
    pub async fn list_for_subproject(
        pool: &SqlitePool,
        subproject_id: i64,
    ) -> Result<Vec<Repository>> {
        sqlx::query_as::<_, Repository>(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE subproject_id = ? ORDER BY id"
        ))
        .bind(subproject_id)
        .fetch_all(pool)
        .await
        .context("Failed to list repositories")
    }

    #[inline]
    pub async fn record_run(
        pool: &SqlitePool,
        subproject_id: i64,
        path: &str,
        counters: &RunCounters,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE repositories SET status = ?, total_files = ?, indexed_files = ?, \
             total_chunks = ?, error_message = ? WHERE subproject_id = ? AND path = ?",
        )
        .bind(counters.status)
        .bind(counters.total_files)
        .bind(counters.indexed_files)
        .bind(counters.total_chunks)
        .bind(counters.error_message.as_deref())
        .bind(subproject_id)
        .bind(path)
        .execute(pool)
        .await
        .context("Failed to record repository run")?;
        Ok(())
    }

    #[inline]
    pub async fn remove(pool: &SqlitePool, subproject_id: i64, path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM repositories WHERE subproject_id = ? AND path = ?")
            .bind(subproject_id)
            .bind(path)
            .execute(pool)
            .await
            .context("Failed to remove repository")?;
        Ok(result.rows_affected() > 0)
    }
}
