use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::{debug, info};

use crate::database::sqlite::models::{Repository, RunCounters, Subproject};
use crate::database::sqlite::queries::{RepositoryQueries, SubprojectQueries};

#[cfg(test)]
mod tests;

pub mod models;
pub mod queries;

pub use models::IndexStatus;

pub type DbPool = Pool<Sqlite>;

/// Bookkeeping rows for subprojects and their repositories
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    #[inline]
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    #[inline]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await
            .context("Failed to run schema migration")?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    #[inline]
    pub async fn initialize_from_config_dir(config_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        Self::new(config_dir.join("metadata.db")).await
    }

    // Subproject operations
    #[inline]
    pub async fn create_subproject(&self, name: &str) -> Result<Subproject> {
        SubprojectQueries::create(&self.pool, name).await
    }

    #[inline]
    pub async fn get_subproject(&self, name: &str) -> Result<Option<Subproject>> {
        SubprojectQueries::get_by_name(&self.pool, name).await
    }

    #[inline]
    pub async fn list_subprojects(&self) -> Result<Vec<Subproject>> {
        SubprojectQueries::list_all(&self.pool).await
    }

    #[inline]
    pub async fn set_subproject_status(&self, id: i64, status: IndexStatus) -> Result<()> {
        SubprojectQueries::set_status(&self.pool, id, status).await
    }

    #[inline]
    pub async fn record_subproject_run(&self, id: i64, counters: &RunCounters) -> Result<()> {
        SubprojectQueries::record_run(&self.pool, id, counters).await
    }

    #[inline]
    pub async fn delete_subproject(&self, id: i64) -> Result<bool> {
        SubprojectQueries::delete(&self.pool, id).await
    }

    // Repository operations
    #[inline]
    pub async fn add_repository(&self, subproject_id: i64, path: &str) -> Result<Repository> {
        RepositoryQueries::add(&self.pool, subproject_id, path).await
    }

    #[inline]
    pub async fn list_repositories(&self, subproject_id: i64) -> Result<Vec<Repository>> {
        RepositoryQueries::list_for_subproject(&self.pool, subproject_id).await
    }

    #[inline]
    pub async fn record_repository_run(
        &self,
        subproject_id: i64,
        path: &str,
        counters: &RunCounters,
    ) -> Result<()> {
        RepositoryQueries::record_run(&self.pool, subproject_id, path, counters).await
    }

    #[inline]
    pub async fn remove_repository(&self, subproject_id: i64, path: &str) -> Result<bool> {
        RepositoryQueries::remove(&self.pool, subproject_id, path).await
    }
}
