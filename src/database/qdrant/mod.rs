// Qdrant vector store
// Server backend over gRPC; chunks live in one collection per subproject and the index metadata in a
// one-point side collection


use async_trait::async_trait;
use qdrant_client::{
    Qdrant, QdrantError,
    qdrant::{
        Condition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance,
        Filter, GetPointsBuilder, PointId, PointStruct, PointsIdsList, RetrievedPoint,
        ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParamsBuilder,
        point_id::PointIdOptions, vectors_output::VectorsOptions,
    },
};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ChunkRecord, IndexMetadata, RecordFilter, SearchHit, VectorStore, VectorStoreConfig, rank_hits,
    ties_resolved,
};
use crate::{Result, WeaveError};

const SCROLL_PAGE: u32 = 256;
const META_POINT_UUID: &str = "00000000-0000-0000-0000-000000000001";

/// Vector store backed by a Qdrant server
pub struct QdrantVectorStore {
    client: Qdrant,
    url: String,
    collection: String,
    meta_collection: String,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for QdrantVectorStore {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantVectorStore")
            .field("url", &self.url)
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

/// Connectivity failures are retryable, everything else is reported as is
fn classify(context: &str, error: &QdrantError) -> WeaveError {
    let detail = format!("{error:?}");
    let transient = ["Unavailable", "DeadlineExceeded", "transport error", "Connection refused"]
        .iter()
        .any(|marker| detail.contains(marker));

    if transient {
        WeaveError::StoreUnavailable(format!("{context}: {error}"))
    } else {
        WeaveError::VectorStore(format!("{context}: {error}"))
    }
}

/// Deterministic point id derived from the record key
fn point_uuid(record: &ChunkRecord) -> Uuid {
    let digest = Sha256::digest(record.record_id().as_bytes());
    let mut bytes = [0_u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

fn repo_filter_condition(repo_filter: Option<&str>) -> Option<Filter> {
    repo_filter.map(|repo| Filter::must([Condition::matches("repo_path", repo.to_string())]))
}

fn record_filter(filter: &RecordFilter) -> Filter {
    let mut conditions = Vec::new();
    if let Some(repo) = &filter.repo_path {
        conditions.push(Condition::matches("repo_path", repo.clone()));
    }
    if let Some(file) = &filter.file_path {
        conditions.push(Condition::matches("file_path", file.clone()));
    }
    Filter::must(conditions)
}

fn string_field(payload: &HashMap<String, Value>, field: &str) -> Result<String> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
        .ok_or_else(|| WeaveError::VectorStore(format!("Missing or invalid field: {field}")))
}

fn integer_field(payload: &HashMap<String, Value>, field: &str) -> Result<u64> {
    payload
        .get(field)
        .and_then(|v| v.as_integer())
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| WeaveError::VectorStore(format!("Missing or invalid field: {field}")))
}

fn record_from_payload(
    payload: &HashMap<String, Value>,
    embedding: Vec<f32>,
) -> Result<(ChunkRecord, u64)> {
    let record = ChunkRecord {
        repo_path: string_field(payload, "repo_path")?,
        file_path: string_field(payload, "file_path")?,
        start_line: integer_field(payload, "start_line")? as usize,
        end_line: integer_field(payload, "end_line")? as usize,
        file_hash: string_field(payload, "file_hash")?,
        chunk_hash: string_field(payload, "chunk_hash")?,
        text: string_field(payload, "text")?,
        embedding,
    };
    Ok((record, integer_field(payload, "seq")?))
}

fn vector_data(options: Option<VectorsOptions>) -> Vec<f32> {
    match options {
        Some(VectorsOptions::Vector(vector)) => vector.data,
        _ => Vec::new(),
    }
}

fn point_key(id: &PointId) -> Option<String> {
    match id.point_id_options.as_ref()? {
        PointIdOptions::Uuid(uuid) => Some(uuid.clone()),
        PointIdOptions::Num(num) => Some(num.to_string()),
    }
}

impl QdrantVectorStore {
    #[inline]
    pub fn new(config: &VectorStoreConfig, collection: &str) -> Result<Self> {
        let mut builder = Qdrant::from_url(&config.qdrant_url)
            .timeout(Duration::from_secs(config.qdrant_timeout_seconds));
        if let Some(api_key) = &config.qdrant_api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| WeaveError::Config(format!("Failed to create Qdrant client: {e}")))?;

        Ok(Self {
            client,
            url: config.qdrant_url.clone(),
            collection: collection.to_string(),
            meta_collection: format!("{collection}__meta"),
            next_seq: AtomicU64::new(0),
        })
    }

    /// Up to `limit` nearest points with their similarity and insertion sequence
    async fn nearest(
        &self,
        query: &[f32],
        limit: usize,
        repo_filter: Option<&str>,
    ) -> Result<Vec<(SearchHit, u64)>> {
        let mut request = SearchPointsBuilder::new(&self.collection, query.to_vec(), limit as u64)
            .with_payload(true)
            .with_vectors(true);
        if let Some(filter) = repo_filter_condition(repo_filter) {
            request = request.filter(filter);
        }

        let response = self
            .client
            .search_points(request)
            .await
            .map_err(|e| classify("Qdrant vector search failed", &e))?;

        let mut scored = Vec::with_capacity(response.result.len());
        for point in response.result {
            let embedding = vector_data(point.vectors.and_then(|v| v.vectors_options));
            let (record, seq) = record_from_payload(&point.payload, embedding)?;
            scored.push((
                SearchHit {
                    record,
                    score: point.score,
                },
                seq,
            ));
        }
        Ok(scored)
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        self.client
            .collection_exists(name)
            .await
            .map_err(|e| classify("Failed to check collection", &e))
    }

    async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()> {
        if self.collection_exists(name).await? {
            return Ok(());
        }
        info!("Creating Qdrant collection '{}' ({} dims)", name, dimension);
        self.client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine)),
            )
            .await
            .map_err(|e| classify("Failed to create collection", &e))?;
        Ok(())
    }

    async fn delete_collection_if_exists(&self, name: &str) -> Result<()> {
        if self.collection_exists(name).await? {
            self.client
                .delete_collection(name)
                .await
                .map_err(|e| classify("Failed to delete collection", &e))?;
        }
        Ok(())
    }

    /// Metadata payload plus the persisted sequence counter
    async fn read_meta_point(&self) -> Result<Option<(IndexMetadata, u64)>> {
        if !self.collection_exists(&self.meta_collection).await? {
            return Ok(None);
        }
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(
                    &self.meta_collection,
                    vec![PointId::from(META_POINT_UUID.to_string())],
                )
                .with_payload(true),
            )
            .await
            .map_err(|e| classify("Failed to read metadata", &e))?;

        let Some(point) = response.result.into_iter().next() else {
            return Ok(None);
        };
        let json = string_field(&point.payload, "json")?;
        let metadata = serde_json::from_str(&json)
            .map_err(|e| WeaveError::VectorStore(format!("Corrupt collection metadata: {e}")))?;
        let next_seq = integer_field(&point.payload, "next_seq").unwrap_or(0);
        Ok(Some((metadata, next_seq)))
    }

    async fn write_meta_point(&self, metadata: &IndexMetadata) -> Result<()> {
        self.ensure_collection(&self.meta_collection, 1).await?;

        let json = serde_json::to_string(metadata)
            .map_err(|e| WeaveError::VectorStore(format!("Failed to serialize metadata: {e}")))?;
        let next_seq = self.next_seq.load(Ordering::SeqCst);
        let payload: HashMap<String, Value> = HashMap::from([
            ("json".to_string(), Value::from(json)),
            (
                "next_seq".to_string(),
                Value::from(i64::try_from(next_seq).unwrap_or(i64::MAX)),
            ),
        ]);

        self.client
            .upsert_points(
                UpsertPointsBuilder::new(
                    &self.meta_collection,
                    vec![PointStruct::new(META_POINT_UUID.to_string(), vec![1.0_f32], payload)],
                )
                .wait(true),
            )
            .await
            .map_err(|e| classify("Failed to write metadata", &e))?;
        Ok(())
    }

    /// Point ids among `ids` that are already stored
    async fn existing_ids(&self, ids: &[Uuid]) -> Result<HashSet<String>> {
        if ids.is_empty() || !self.collection_exists(&self.collection).await? {
            return Ok(HashSet::new());
        }
        let point_ids: Vec<PointId> = ids.iter().map(|id| PointId::from(id.to_string())).collect();
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(&self.collection, point_ids)
                    .with_payload(false)
                    .with_vectors(false),
            )
            .await
            .map_err(|e| classify("Failed to look up existing points", &e))?;

        Ok(response
            .result
            .iter()
            .filter_map(|p| p.id.as_ref().and_then(point_key))
            .collect())
    }

    async fn scroll_all(&self, filter: Option<Filter>) -> Result<Vec<RetrievedPoint>> {
        let mut points = Vec::new();
        let mut offset: Option<PointId> = None;

        loop {
            let mut request = ScrollPointsBuilder::new(&self.collection)
                .limit(SCROLL_PAGE)
                .with_payload(true)
                .with_vectors(true);
            if let Some(filter) = filter.clone() {
                request = request.filter(filter);
            }
            if let Some(offset) = offset.take() {
                request = request.offset(offset);
            }

            let response = self
                .client
                .scroll(request)
                .await
                .map_err(|e| classify("Failed to scroll points", &e))?;
            points.extend(response.result);

            match response.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        Ok(points)
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    #[inline]
    fn backend_name(&self) -> &'static str {
        "qdrant"
    }

    #[inline]
    fn collection(&self) -> &str {
        &self.collection
    }

    #[inline]
    async fn connect(&self) -> Result<()> {
        if let Some((_, next_seq)) = self.read_meta_point().await? {
            self.next_seq.fetch_max(next_seq, Ordering::SeqCst);
        }
        Ok(())
    }

    #[inline]
    async fn health_check(&self) -> Result<()> {
        self.client
            .list_collections()
            .await
            .map(|_| ())
            .map_err(|e| classify(&format!("Qdrant at {} is unreachable", self.url), &e))
    }

    #[inline]
    async fn save_records(
        &self,
        records: &[ChunkRecord],
        metadata: &IndexMetadata,
    ) -> Result<usize> {
        let mut inserted = 0;

        if let Some(first) = records.first() {
            self.ensure_collection(&self.collection, first.embedding.len())
                .await?;

            let ids: Vec<Uuid> = records.iter().map(point_uuid).collect();
            let mut existing = self.existing_ids(&ids).await?;

            let mut points = Vec::new();
            for (record, id) in records.iter().zip(ids) {
                // Also skips duplicates inside this batch
                if !existing.insert(id.to_string()) {
                    continue;
                }
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                let payload: HashMap<String, Value> = HashMap::from([
                    ("repo_path".to_string(), Value::from(record.repo_path.clone())),
                    ("file_path".to_string(), Value::from(record.file_path.clone())),
                    ("start_line".to_string(), Value::from(record.start_line as i64)),
                    ("end_line".to_string(), Value::from(record.end_line as i64)),
                    ("file_hash".to_string(), Value::from(record.file_hash.clone())),
                    ("chunk_hash".to_string(), Value::from(record.chunk_hash.clone())),
                    ("text".to_string(), Value::from(record.text.clone())),
                    ("seq".to_string(), Value::from(seq as i64)),
                ]);
                points.push(PointStruct::new(
                    id.to_string(),
                    record.embedding.clone(),
                    payload,
                ));
            }

            inserted = points.len();
            if !points.is_empty() {
                self.client
                    .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
                    .await
                    .map_err(|e| classify("Failed to upsert points", &e))?;
            }
        }

        self.write_meta_point(metadata).await?;
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
        let metadata = self.get_metadata().await?;
        if !self.collection_exists(&self.collection).await? {
            return Ok((Vec::new(), metadata));
        }

        let mut rows = Vec::new();
        for point in self.scroll_all(repo_filter_condition(repo_filter)).await? {
            let embedding = vector_data(point.vectors.and_then(|v| v.vectors_options));
            rows.push(record_from_payload(&point.payload, embedding)?);
        }
        rows.sort_by_key(|(_, seq)| *seq);
        Ok((rows.into_iter().map(|(record, _)| record).collect(), metadata))
    }

    #[inline]
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        repo_filter: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        if !self.collection_exists(&self.collection).await? {
            return Ok(Vec::new());
        }

        // Over-fetch until ties at the cut are all present; `rank_hits` orders them by insertion
        let mut limit = top_k.saturating_add(1);
        loop {
            let scored = self.nearest(query, limit, repo_filter).await?;
            if ties_resolved(&scored, top_k, limit) {
                return Ok(rank_hits(scored, top_k));
            }
            limit = limit.saturating_mul(2);
        }
    }

    #[inline]
    async fn get_metadata(&self) -> Result<Option<IndexMetadata>> {
        Ok(self.read_meta_point().await?.map(|(metadata, _)| metadata))
    }

    #[inline]
    async fn clear(&self) -> Result<()> {
        self.delete_collection_if_exists(&self.collection).await?;
        self.delete_collection_if_exists(&self.meta_collection)
            .await?;
        self.next_seq.store(0, Ordering::SeqCst);
        info!("Cleared Qdrant collection '{}'", self.collection);
        Ok(())
    }

    #[inline]
    async fn exists(&self) -> Result<bool> {
        Ok(self.collection_exists(&self.meta_collection).await?
            || self.collection_exists(&self.collection).await?)
    }

    #[inline]
    async fn count(&self, repo_filter: Option<&str>) -> Result<u64> {
        if !self.collection_exists(&self.collection).await? {
            return Ok(0);
        }
        let mut request = CountPointsBuilder::new(&self.collection).exact(true);
        if let Some(filter) = repo_filter_condition(repo_filter) {
            request = request.filter(filter);
        }
        let response = self
            .client
            .count(request)
            .await
            .map_err(|e| classify("Failed to count points", &e))?;
        Ok(response.result.map_or(0, |r| r.count))
    }

    #[inline]
    async fn delete_by_filter(&self, filter: &RecordFilter) -> Result<u64> {
        filter.ensure_not_empty()?;
        if !self.collection_exists(&self.collection).await? {
            return Ok(0);
        }

        let points = self.scroll_all(Some(record_filter(filter))).await?;
        let ids: Vec<PointId> = points.into_iter().filter_map(|p| p.id).collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = ids.len() as u64;

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(PointsIdsList { ids })
                    .wait(true),
            )
            .await
            .map_err(|e| classify("Failed to delete points", &e))?;
        Ok(removed)
    }
}
