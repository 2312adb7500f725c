
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    ChunkRecord, IndexMetadata, RecordFilter, SearchHit, VectorStore, cosine_similarity, rank_hits,
};
use crate::{Result, WeaveError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    seq: u64,
    record: ChunkRecord,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    next_seq: u64,
    records: Vec<StoredRecord>,
    metadata: Option<IndexMetadata>,
}

#[derive(Debug, Clone, Default)]
struct State {
    next_seq: u64,
    /// Record id -> stored record
    records: HashMap<String, StoredRecord>,
    metadata: Option<IndexMetadata>,
}

impl State {
    fn ordered(&self, repo_filter: Option<&str>) -> Vec<&StoredRecord> {
        let mut stored: Vec<&StoredRecord> = self
            .records
            .values()
            .filter(|s| repo_filter.is_none_or(|repo| s.record.repo_path == repo))
            .collect();
        stored.sort_by_key(|s| s.seq);
        stored
    }
}

/// Embedded backend holding everything in memory, optionally mirrored to a JSON snapshot
/// (`<dir>/<collection>.json`) after each write.
#[derive(Debug)]
pub struct MemoryVectorStore {
    collection: String,
    snapshot_path: Option<PathBuf>,
    state: RwLock<State>,
}

impl MemoryVectorStore {
    #[inline]
    pub fn new(collection: &str, snapshot_dir: Option<PathBuf>) -> Self {
        Self {
            collection: collection.to_string(),
            snapshot_path: snapshot_dir.map(|dir| dir.join(format!("{collection}.json"))),
            state: RwLock::new(State::default()),
        }
    }

    async fn persist(&self, state: &State) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let snapshot = Snapshot {
            next_seq: state.next_seq,
            records: state.ordered(None).into_iter().cloned().collect(),
            metadata: state.metadata.clone(),
        };
        write_snapshot(path, &snapshot)
            .await
            .map_err(|e| WeaveError::VectorStore(format!("{e:#}")))
    }
}

async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create snapshot directory {}", parent.display()))?;
    }

    let json = serde_json::to_vec(snapshot).context("Failed to serialize snapshot")?;
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json)
        .await
        .with_context(|| format!("Failed to write snapshot {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to move snapshot into place at {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    #[inline]
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[inline]
    fn collection(&self) -> &str {
        &self.collection
    }

    #[inline]
    async fn connect(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No snapshot at {}, starting empty", path.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| {
            WeaveError::VectorStore(format!(
                "Corrupt snapshot {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut state = self.state.write().await;
        state.next_seq = snapshot.next_seq;
        state.metadata = snapshot.metadata;
        state.records = snapshot
            .records
            .into_iter()
            .map(|stored| (stored.record.record_id(), stored))
            .collect();
        info!(
            "Loaded {} records for collection '{}' from snapshot",
            state.records.len(),
            self.collection
        );
        Ok(())
    }

    #[inline]
    async fn health_check(&self) -> Result<()> {
        if let Some(dir) = self.snapshot_path.as_ref().and_then(|p| p.parent()) {
            if dir.exists() && !dir.is_dir() {
                return Err(WeaveError::VectorStore(format!(
                    "Snapshot location {} is not a directory",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    #[inline]
    async fn save_records(
        &self,
        records: &[ChunkRecord],
        metadata: &IndexMetadata,
    ) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let mut inserted = 0;

        for record in records {
            let id = record.record_id();
            if next.records.contains_key(&id) {
                continue;
            }
            let seq = next.next_seq;
            next.next_seq += 1;
            next.records.insert(
                id,
                StoredRecord {
                    seq,
                    record: record.clone(),
                },
            );
            inserted += 1;
        }
        next.metadata = Some(metadata.clone());

        // Only a persisted state becomes visible
        self.persist(&next).await?;
        *state = next;
        debug!(
            "Saved {} new of {} records into '{}'",
            inserted,
            records.len(),
            self.collection
        );
        Ok(inserted)
    }

    #[inline]
    async fn load_records(
        &self,
        repo_filter: Option<&str>,
    ) -> Result<(Vec<ChunkRecord>, Option<IndexMetadata>)> {
        let state = self.state.read().await;
        let records = state
            .ordered(repo_filter)
            .into_iter()
            .map(|s| s.record.clone())
            .collect();
        Ok((records, state.metadata.clone()))
    }

    #[inline]
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        repo_filter: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        let state = self.state.read().await;
        let scored = state
            .records
            .values()
            .filter(|s| repo_filter.is_none_or(|repo| s.record.repo_path == repo))
            .map(|s| {
                let hit = SearchHit {
                    score: cosine_similarity(query, &s.record.embedding),
                    record: s.record.clone(),
                };
                (hit, s.seq)
            })
            .collect();
        Ok(rank_hits(scored, top_k))
    }

    #[inline]
    async fn get_metadata(&self) -> Result<Option<IndexMetadata>> {
        Ok(self.state.read().await.metadata.clone())
    }

    #[inline]
    async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().await;

        if let Some(path) = &self.snapshot_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(WeaveError::VectorStore(format!(
                        "Failed to remove snapshot {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }
        *state = State::default();
        info!("Cleared collection '{}'", self.collection);
        Ok(())
    }

    #[inline]
    async fn exists(&self) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.metadata.is_some() || !state.records.is_empty())
    }

    #[inline]
    async fn count(&self, repo_filter: Option<&str>) -> Result<u64> {
        let state = self.state.read().await;
        let count = state
            .records
            .values()
            .filter(|s| repo_filter.is_none_or(|repo| s.record.repo_path == repo))
            .count();
        Ok(count as u64)
    }

    #[inline]
    async fn delete_by_filter(&self, filter: &RecordFilter) -> Result<u64> {
        filter.ensure_not_empty()?;

        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.records.retain(|_, s| !filter.matches(&s.record));
        let removed = (state.records.len() - next.records.len()) as u64;

        if removed > 0 {
            self.persist(&next).await?;
            *state = next;
        }
        Ok(removed)
    }
}
