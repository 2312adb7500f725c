// LanceDB vector store
// Embedded columnar backend: one chunk table and one metadata table per collection

#[cfg(test)]
mod tests;

use ::lancedb::{
    Connection, DistanceType, Table,
    query::{ExecutableQuery, QueryBase, Select},
};
use arrow::array::{
    Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::TryStreamExt;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

use super::{
    ChunkRecord, IndexMetadata, RecordFilter, SearchHit, VectorStore, VectorStoreConfig, rank_hits,
    sql_literal, ties_resolved,
};
use crate::{Result, WeaveError};

const META_ROW_ID: &str = "meta";

fn db_error(context: &str, e: impl std::fmt::Display) -> WeaveError {
    WeaveError::VectorStore(format!("{context}: {e}"))
}

/// Vector store backed by a LanceDB directory
pub struct LanceVectorStore {
    connection: Connection,
    collection: String,
    meta_table: String,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for LanceVectorStore {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanceVectorStore")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl LanceVectorStore {
    /// Open the LanceDB directory configured in `lancedb_path`
    #[inline]
    pub async fn open(config: &VectorStoreConfig, collection: &str) -> Result<Self> {
        let db_path = config.lancedb_path.clone().ok_or_else(|| {
            WeaveError::Config("lancedb_path must be set for the lancedb backend".to_string())
        })?;
        Self::open_at(db_path, collection).await
    }

    #[inline]
    pub async fn open_at(db_path: PathBuf, collection: &str) -> Result<Self> {
        debug!("Initializing LanceDB at path: {:?}", db_path);

        std::fs::create_dir_all(&db_path).map_err(|e| {
            WeaveError::VectorStore(format!("Failed to create vector database directory: {e}"))
        })?;

        let uri = format!("file://{}", db_path.display());
        let connection = ::lancedb::connect(&uri).execute().await.map_err(|e| {
            error!("Failed to connect to LanceDB: {}", e);
            db_error("Failed to connect to LanceDB", e)
        })?;

        Ok(Self {
            connection,
            collection: collection.to_string(),
            meta_table: format!("{collection}__meta"),
            next_seq: AtomicU64::new(0),
        })
    }

    async fn table_exists(&self, name: &str) -> Result<bool> {
        let names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| db_error("Failed to list tables", e))?;
        Ok(names.iter().any(|n| n == name))
    }

    /// Chunk table, if anything was ever saved
    async fn chunk_table(&self) -> Result<Option<Table>> {
        if !self.table_exists(&self.collection).await? {
            return Ok(None);
        }
        let table = self
            .connection
            .open_table(&self.collection)
            .execute()
            .await
            .map_err(|e| db_error("Failed to open table", e))?;
        Ok(Some(table))
    }

    async fn chunk_table_for_dimension(&self, dimension: usize) -> Result<Table> {
        if let Some(table) = self.chunk_table().await? {
            let existing = detect_vector_dimension(&table).await?;
            if existing != dimension {
                return Err(WeaveError::VectorStore(format!(
                    "Collection '{}' stores {}-dimensional vectors, got {}; clear it before re-indexing",
                    self.collection, existing, dimension
                )));
            }
            return Ok(table);
        }

        info!(
            "Creating table '{}' with {} dimensions",
            self.collection, dimension
        );
        self.connection
            .create_empty_table(&self.collection, chunk_schema(dimension))
            .execute()
            .await
            .map_err(|e| db_error("Failed to create table", e))
    }

    async fn write_metadata(&self, metadata: &IndexMetadata) -> Result<()> {
        let json = serde_json::to_string(metadata)
            .map_err(|e| db_error("Failed to serialize metadata", e))?;
        let schema = meta_schema();
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(StringArray::from(vec![META_ROW_ID])),
                Arc::new(StringArray::from(vec![json.as_str()])),
            ],
        )
        .map_err(|e| db_error("Failed to create metadata batch", e))?;
        let reader = RecordBatchIterator::new(std::iter::once(Ok(batch)), schema);

        if self.table_exists(&self.meta_table).await? {
            let table = self
                .connection
                .open_table(&self.meta_table)
                .execute()
                .await
                .map_err(|e| db_error("Failed to open metadata table", e))?;
            table
                .delete(&format!("id = {}", sql_literal(META_ROW_ID)))
                .await
                .map_err(|e| db_error("Failed to replace metadata", e))?;
            table
                .add(reader)
                .execute()
                .await
                .map_err(|e| db_error("Failed to write metadata", e))?;
        } else {
            self.connection
                .create_table(&self.meta_table, reader)
                .execute()
                .await
                .map_err(|e| db_error("Failed to create metadata table", e))?;
        }
        Ok(())
    }

    async fn drop_table_if_exists(&self, name: &str) -> Result<()> {
        if self.table_exists(name).await? {
            info!("Dropping table '{}'", name);
            self.connection
                .drop_table(name)
                .await
                .map_err(|e| db_error("Failed to drop table", e))?;
        }
        Ok(())
    }

    /// Highest stored sequence number plus one
    async fn load_next_seq(&self) -> Result<u64> {
        let Some(table) = self.chunk_table().await? else {
            return Ok(0);
        };
        let mut stream = table
            .query()
            .select(Select::Columns(vec!["seq".to_string()]))
            .execute()
            .await
            .map_err(|e| db_error("Failed to scan sequence numbers", e))?;

        let mut next = 0;
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| db_error("Failed to read result stream", e))?
        {
            let seqs: &UInt64Array = column(&batch, "seq")?;
            if let Some(max) = arrow::compute::max(seqs) {
                next = next.max(max + 1);
            }
        }
        Ok(next)
    }

    fn record_batch(&self, records: &[&ChunkRecord], dimension: usize) -> Result<RecordBatch> {
        let len = records.len();
        let first_seq = self.next_seq.fetch_add(len as u64, Ordering::SeqCst);

        let ids: Vec<String> = records.iter().map(|r| r.record_id()).collect();
        let mut flat_values = Vec::with_capacity(len * dimension);
        for record in records {
            flat_values.extend_from_slice(&record.embedding);
        }
        let values_array = Float32Array::from(flat_values);
        let field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array =
            FixedSizeListArray::try_new(field, dimension as i32, Arc::new(values_array), None)
                .map_err(|e| db_error("Failed to create vector array", e))?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(vector_array),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.repo_path.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.file_path.as_str()),
            )),
            Arc::new(UInt64Array::from_iter_values(
                records.iter().map(|r| r.start_line as u64),
            )),
            Arc::new(UInt64Array::from_iter_values(
                records.iter().map(|r| r.end_line as u64),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.file_hash.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.chunk_hash.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.text.as_str()),
            )),
            Arc::new(UInt64Array::from_iter_values(
                (0..len as u64).map(|i| first_seq + i),
            )),
        ];

        RecordBatch::try_new(chunk_schema(dimension), arrays)
            .map_err(|e| db_error("Failed to create record batch", e))
    }

    async fn query_records(&self, predicate: Option<String>) -> Result<Vec<(ChunkRecord, u64)>> {
        let Some(table) = self.chunk_table().await? else {
            return Ok(Vec::new());
        };
        let mut query = table.query();
        if let Some(predicate) = predicate {
            query = query.only_if(predicate);
        }
        let stream = query
            .execute()
            .await
            .map_err(|e| db_error("Failed to execute query", e))?;
        let rows = collect_rows(stream).await?;
        Ok(rows.into_iter().map(|(record, seq, _)| (record, seq)).collect())
    }
}

fn chunk_schema(dimension: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, false)),
                dimension as i32,
            ),
            false,
        ),
        Field::new("repo_path", DataType::Utf8, false),
        Field::new("file_path", DataType::Utf8, false),
        Field::new("start_line", DataType::UInt64, false),
        Field::new("end_line", DataType::UInt64, false),
        Field::new("file_hash", DataType::Utf8, false),
        Field::new("chunk_hash", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("seq", DataType::UInt64, false),
    ]))
}

fn meta_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("json", DataType::Utf8, false),
    ]))
}

async fn detect_vector_dimension(table: &Table) -> Result<usize> {
    let schema = table
        .schema()
        .await
        .map_err(|e| db_error("Failed to get table schema", e))?;

    for field in schema.fields() {
        if field.name() == "vector" {
            if let DataType::FixedSizeList(_, size) = field.data_type() {
                return Ok(*size as usize);
            }
        }
    }

    Err(WeaveError::VectorStore(
        "Could not find vector column or determine dimension".to_string(),
    ))
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| WeaveError::VectorStore(format!("Missing {name} column")))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| WeaveError::VectorStore(format!("Invalid {name} column type")))
}

/// Up to `limit` nearest rows with their cosine similarity and insertion sequence
async fn nearest(
    table: &Table,
    query: &[f32],
    limit: usize,
    repo_filter: Option<&str>,
) -> Result<Vec<(SearchHit, u64)>> {
    let mut vector_query = table
        .vector_search(query)
        .map_err(|e| db_error("Failed to create vector search", e))?
        .column("vector")
        .distance_type(DistanceType::Cosine)
        .limit(limit);

    if let Some(predicate) = repo_predicate(repo_filter) {
        vector_query = vector_query.only_if(predicate);
    }

    let stream = vector_query
        .execute()
        .await
        .map_err(|e| db_error("Failed to execute search", e))?;

    Ok(collect_rows(stream)
        .await?
        .into_iter()
        .map(|(record, seq, distance)| {
            // Cosine distance to similarity
            let score = 1.0 - distance.unwrap_or(1.0);
            (SearchHit { record, score }, seq)
        })
        .collect())
}

/// Decode rows into records, their sequence number and the `_distance` column when present
async fn collect_rows(
    mut stream: ::lancedb::arrow::SendableRecordBatchStream,
) -> Result<Vec<(ChunkRecord, u64, Option<f32>)>> {
    let mut rows = Vec::new();

    while let Some(batch) = stream
        .try_next()
        .await
        .map_err(|e| db_error("Failed to read result stream", e))?
    {
        let vectors: &FixedSizeListArray = column(&batch, "vector")?;
        let repo_paths: &StringArray = column(&batch, "repo_path")?;
        let file_paths: &StringArray = column(&batch, "file_path")?;
        let start_lines: &UInt64Array = column(&batch, "start_line")?;
        let end_lines: &UInt64Array = column(&batch, "end_line")?;
        let file_hashes: &StringArray = column(&batch, "file_hash")?;
        let chunk_hashes: &StringArray = column(&batch, "chunk_hash")?;
        let texts: &StringArray = column(&batch, "text")?;
        let seqs: &UInt64Array = column(&batch, "seq")?;
        let distances = batch
            .column_by_name("_distance")
            .and_then(|col| col.as_any().downcast_ref::<Float32Array>());

        for row in 0..batch.num_rows() {
            let vector = vectors.value(row);
            let embedding = vector
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| WeaveError::VectorStore("Invalid vector item type".to_string()))?
                .values()
                .to_vec();

            let record = ChunkRecord {
                repo_path: repo_paths.value(row).to_string(),
                file_path: file_paths.value(row).to_string(),
                start_line: start_lines.value(row) as usize,
                end_line: end_lines.value(row) as usize,
                file_hash: file_hashes.value(row).to_string(),
                chunk_hash: chunk_hashes.value(row).to_string(),
                text: texts.value(row).to_string(),
                embedding,
            };
            let distance = distances.and_then(|d| (!d.is_null(row)).then(|| d.value(row)));
            rows.push((record, seqs.value(row), distance));
        }
    }

    Ok(rows)
}

fn repo_predicate(repo_filter: Option<&str>) -> Option<String> {
    repo_filter.map(|repo| format!("repo_path = {}", sql_literal(repo)))
}

fn filter_predicate(filter: &RecordFilter) -> String {
    let mut clauses = Vec::new();
    if let Some(repo) = &filter.repo_path {
        clauses.push(format!("repo_path = {}", sql_literal(repo)));
    }
    if let Some(file) = &filter.file_path {
        clauses.push(format!("file_path = {}", sql_literal(file)));
    }
    clauses.join(" AND ")
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    #[inline]
    fn backend_name(&self) -> &'static str {
        "lancedb"
    }

    #[inline]
    fn collection(&self) -> &str {
        &self.collection
    }

    #[inline]
    async fn connect(&self) -> Result<()> {
        let next = self.load_next_seq().await?;
        self.next_seq.fetch_max(next, Ordering::SeqCst);
        debug!(
            "Collection '{}' continues at sequence {}",
            self.collection, next
        );
        Ok(())
    }

    #[inline]
    async fn health_check(&self) -> Result<()> {
        self.connection
            .table_names()
            .execute()
            .await
            .map(|_| ())
            .map_err(|e| db_error("LanceDB health check failed", e))
    }

    #[inline]
    async fn save_records(
        &self,
        records: &[ChunkRecord],
        metadata: &IndexMetadata,
    ) -> Result<usize> {
        let mut seen = HashSet::new();
        let unique: Vec<&ChunkRecord> = records
            .iter()
            .filter(|r| seen.insert(r.record_id()))
            .collect();

        let mut inserted = 0;
        if let Some(first) = unique.first() {
            let dimension = first.embedding.len();
            if let Some(bad) = unique.iter().find(|r| r.embedding.len() != dimension) {
                return Err(WeaveError::VectorStore(format!(
                    "Mixed vector dimensions in one batch ({} and {})",
                    dimension,
                    bad.embedding.len()
                )));
            }

            let table = self.chunk_table_for_dimension(dimension).await?;
            let batch = self.record_batch(&unique, dimension)?;
            let schema = batch.schema();
            let reader = RecordBatchIterator::new(std::iter::once(Ok(batch)), schema);

            let before = table
                .count_rows(None)
                .await
                .map_err(|e| db_error("Failed to count rows", e))?;

            let mut merge = table.merge_insert(&["id"]);
            merge.when_not_matched_insert_all();
            merge
                .execute(Box::new(reader))
                .await
                .map_err(|e| db_error("Failed to insert records", e))?;

            let after = table
                .count_rows(None)
                .await
                .map_err(|e| db_error("Failed to count rows", e))?;
            inserted = after.saturating_sub(before);
        }

        self.write_metadata(metadata).await?;
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
        let mut rows = self.query_records(repo_predicate(repo_filter)).await?;
        rows.sort_by_key(|(_, seq)| *seq);
        let records = rows.into_iter().map(|(record, _)| record).collect();
        Ok((records, self.get_metadata().await?))
    }

    #[inline]
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        repo_filter: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        debug!("Searching for similar vectors with limit: {}", top_k);

        let Some(table) = self.chunk_table().await? else {
            return Ok(Vec::new());
        };

        // Fetch past the cut until the rows tied with the last kept score are all in hand,
        // so ties break by insertion order as on every other backend
        let mut limit = top_k.saturating_add(1);
        loop {
            let scored = nearest(&table, query, limit, repo_filter).await?;
            if ties_resolved(&scored, top_k, limit) {
                return Ok(rank_hits(scored, top_k));
            }
            limit = limit.saturating_mul(2);
        }
    }

    #[inline]
    async fn get_metadata(&self) -> Result<Option<IndexMetadata>> {
        if !self.table_exists(&self.meta_table).await? {
            return Ok(None);
        }
        let table = self
            .connection
            .open_table(&self.meta_table)
            .execute()
            .await
            .map_err(|e| db_error("Failed to open metadata table", e))?;
        let mut stream = table
            .query()
            .limit(1)
            .execute()
            .await
            .map_err(|e| db_error("Failed to read metadata", e))?;

        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| db_error("Failed to read result stream", e))?
        {
            let json: &StringArray = column(&batch, "json")?;
            if batch.num_rows() > 0 {
                let metadata = serde_json::from_str(json.value(0))
                    .map_err(|e| db_error("Corrupt collection metadata", e))?;
                return Ok(Some(metadata));
            }
        }
        Ok(None)
    }

    #[inline]
    async fn clear(&self) -> Result<()> {
        self.drop_table_if_exists(&self.collection).await?;
        self.drop_table_if_exists(&self.meta_table).await?;
        info!("Cleared collection '{}'", self.collection);
        Ok(())
    }

    #[inline]
    async fn exists(&self) -> Result<bool> {
        Ok(self.table_exists(&self.meta_table).await?
            || self.table_exists(&self.collection).await?)
    }

    #[inline]
    async fn count(&self, repo_filter: Option<&str>) -> Result<u64> {
        let Some(table) = self.chunk_table().await? else {
            return Ok(0);
        };
        let count = table
            .count_rows(repo_predicate(repo_filter))
            .await
            .map_err(|e| db_error("Failed to count rows", e))?;
        Ok(count as u64)
    }

    #[inline]
    async fn delete_by_filter(&self, filter: &RecordFilter) -> Result<u64> {
        filter.ensure_not_empty()?;
        let Some(table) = self.chunk_table().await? else {
            return Ok(0);
        };

        let predicate = filter_predicate(filter);
        let matching = table
            .count_rows(Some(predicate.clone()))
            .await
            .map_err(|e| db_error("Failed to count rows", e))?;
        if matching == 0 {
            return Ok(0);
        }

        table.delete(&predicate).await.map_err(|e| {
            warn!("Delete failed for '{}': {}", predicate, e);
            db_error("Failed to delete records", e)
        })?;
        Ok(matching as u64)
    }
}
