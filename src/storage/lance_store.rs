use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, Float32Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array,
    FixedSizeListArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use dashmap::DashSet;
use lancedb::query::{ExecutableQuery, QueryBase};

use super::{fit_dimension, VectorRecord, VectorStore};
use crate::error::{RagError, RagResult};
use crate::types::SearchMatch;

/// LanceDB-native `VectorStore`. One table per knowledge base
/// (`<prefix>_<kb_id>`), created lazily and idempotently on first use —
/// this mirrors the teacher's single-table `ensure_table` idiom, generalised
/// to a table-per-KB since collections must be KB-scoped.
pub struct LanceStore {
    db: lancedb::Connection,
    dimension: usize,
    collection_prefix: String,
    known_tables: DashSet<String>,
}

impl LanceStore {
    pub async fn new(path: &str, dimension: usize, collection_prefix: &str) -> Result<Self> {
        std::fs::create_dir_all(path).ok();
        let db = lancedb::connect(path)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        Ok(Self {
            db,
            dimension,
            collection_prefix: collection_prefix.to_string(),
            known_tables: DashSet::new(),
        })
    }

    fn table_name(&self, kb_id: &str) -> String {
        format!("{}_{}", self.collection_prefix, kb_id)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("doc_id", DataType::Utf8, false),
            Field::new("chunk_index", DataType::UInt32, false),
            Field::new("text", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
        ]))
    }

    /// Idempotent table creation, guarded by an in-process `known_tables` set
    /// so a hot path doesn't round-trip `table_names()` on every upsert; the
    /// underlying LanceDB create-if-missing check still tolerates a second
    /// caller racing to create the same table.
    async fn ensure_table(&self, table_name: &str) -> Result<()> {
        if self.known_tables.contains(table_name) {
            return Ok(());
        }

        let names = self.db.table_names().execute().await?;
        if !names.contains(&table_name.to_string()) {
            let schema = self.schema();
            let seed_vec = vec![0.0f32; self.dimension];
            let values = Float32Array::from(seed_vec);
            let vector_field = Field::new("item", DataType::Float32, true);
            let vector_array = FixedSizeListArray::new(
                Arc::new(vector_field),
                self.dimension as i32,
                Arc::new(values) as Arc<dyn Array>,
                None,
            );

            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(StringArray::from(vec!["__seed__"])) as Arc<dyn Array>,
                    Arc::new(StringArray::from(vec!["__seed__"])),
                    Arc::new(UInt32Array::from(vec![0u32])),
                    Arc::new(StringArray::from(vec![""])),
                    Arc::new(vector_array) as Arc<dyn Array>,
                ],
            )
            .context("Failed to create seed RecordBatch")?;

            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            self.db
                .create_table(table_name, Box::new(batches))
                .execute()
                .await
                .context("Failed to create KB vector table")?;

            let table = self.db.open_table(table_name).execute().await?;
            table.delete("id = '__seed__'").await.ok();
        }

        self.known_tables.insert(table_name.to_string());
        Ok(())
    }

    pub async fn create_index_if_needed(&self, kb_id: &str) -> Result<()> {
        let table_name = self.table_name(kb_id);
        self.ensure_table(&table_name).await?;
        let table = self.db.open_table(&table_name).execute().await?;
        let count = table.count_rows(None).await?;
        if count >= 1_000 {
            table
                .create_index(&["vector"], lancedb::index::Index::Auto)
                .execute()
                .await
                .context("Failed to create vector index")?;
            tracing::info!(kb_id = %kb_id, rows = count, "created ANN index");
        }
        Ok(())
    }

    pub async fn clear(&self, kb_id: &str) -> Result<()> {
        let table_name = self.table_name(kb_id);
        let names = self.db.table_names().execute().await?;
        if names.contains(&table_name) {
            self.db.drop_table(&table_name, &[]).await?;
            self.known_tables.remove(&table_name);
        }
        self.ensure_table(&table_name).await?;
        Ok(())
    }

    pub async fn count(&self, kb_id: &str) -> Result<usize> {
        let table_name = self.table_name(kb_id);
        self.ensure_table(&table_name).await?;
        let table = self.db.open_table(&table_name).execute().await?;
        Ok(table.count_rows(None).await?)
    }
}

#[async_trait]
impl VectorStore for LanceStore {
    async fn upsert(&self, kb_id: &str, record: VectorRecord) -> RagResult<String> {
        let table_name = self.table_name(kb_id);
        self.ensure_table(&table_name)
            .await
            .map_err(|e| RagError::upstream("vector_upsert", e))?;

        let vector = fit_dimension(record.vector, self.dimension, &record.chunk_id);

        // Upsert semantics: delete any existing row for this chunk_id, then insert.
        let table = self
            .db
            .open_table(&table_name)
            .execute()
            .await
            .map_err(|e| RagError::upstream("vector_upsert", e.into()))?;
        let predicate = format!("id = '{}'", record.chunk_id.replace('\'', "''"));
        table.delete(&predicate).await.ok();

        let schema = self.schema();
        let values = Float32Array::from(vector);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(
            Arc::new(vector_field),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![record.chunk_id.as_str()])) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec![record.document_id.as_str()])),
                Arc::new(UInt32Array::from(vec![record.chunk_index])),
                Arc::new(StringArray::from(vec![record.content.as_str()])),
                Arc::new(vector_array) as Arc<dyn Array>,
            ],
        )
        .context("Failed to build upsert RecordBatch")
        .map_err(|e| RagError::upstream("vector_upsert", e))?;

        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .context("Failed to insert chunk vector")
            .map_err(|e| RagError::upstream("vector_upsert", e))?;

        Ok(format!("lance_{}", record.chunk_id))
    }

    async fn delete_document(&self, kb_id: &str, document_id: &str) -> RagResult<usize> {
        let table_name = self.table_name(kb_id);
        self.ensure_table(&table_name)
            .await
            .map_err(|e| RagError::upstream("vector_delete", e))?;
        let table = self
            .db
            .open_table(&table_name)
            .execute()
            .await
            .map_err(|e| RagError::upstream("vector_delete", e.into()))?;
        let count_before = table.count_rows(None).await.unwrap_or(0);
        let predicate = format!("doc_id = '{}'", document_id.replace('\'', "''"));
        table
            .delete(&predicate)
            .await
            .map_err(|e| RagError::upstream("vector_delete", e.into()))?;
        let count_after = table.count_rows(None).await.unwrap_or(0);
        Ok(count_before.saturating_sub(count_after))
    }

    async fn search(
        &self,
        kb_id: &str,
        query_vec: &[f32],
        limit: usize,
        candidate_limit: usize,
        threshold: f32,
    ) -> RagResult<Vec<SearchMatch>> {
        let table_name = self.table_name(kb_id);
        self.ensure_table(&table_name)
            .await
            .map_err(|e| RagError::upstream("vector_search", e))?;
        let table = self
            .db
            .open_table(&table_name)
            .execute()
            .await
            .map_err(|e| RagError::upstream("vector_search", e.into()))?;

        let query_builder = table
            .query()
            .nearest_to(query_vec)
            .map_err(|e| RagError::upstream("vector_search", e.into()))?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(candidate_limit.max(limit));

        let results = query_builder
            .execute()
            .await
            .context("LanceDB vector search failed")
            .map_err(|e| RagError::upstream("vector_search", e))?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results)
            .await
            .map_err(|e: lancedb::Error| RagError::upstream("vector_search", e.into()))?;

        let mut hits = extract_hits_from_batches(&batches);
        hits.retain(|h| h.score >= threshold);
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(limit);
        Ok(hits.into_iter().map(Into::into).collect())
    }

    async fn get_neighbors(
        &self,
        kb_id: &str,
        document_id: &str,
        chunk_index: u32,
        window: u32,
    ) -> RagResult<Vec<SearchMatch>> {
        let table_name = self.table_name(kb_id);
        self.ensure_table(&table_name)
            .await
            .map_err(|e| RagError::upstream("vector_neighbors", e))?;
        let table = self
            .db
            .open_table(&table_name)
            .execute()
            .await
            .map_err(|e| RagError::upstream("vector_neighbors", e.into()))?;

        let low = chunk_index.saturating_sub(window);
        let high = chunk_index.saturating_add(window);
        let predicate = format!(
            "doc_id = '{}' AND chunk_index >= {} AND chunk_index <= {} AND chunk_index != {}",
            document_id.replace('\'', "''"),
            low,
            high,
            chunk_index
        );

        let results = table
            .query()
            .only_if(predicate)
            .execute()
            .await
            .context("LanceDB neighbor lookup failed")
            .map_err(|e| RagError::upstream("vector_neighbors", e))?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results)
            .await
            .map_err(|e: lancedb::Error| RagError::upstream("vector_neighbors", e.into()))?;

        let mut hits = extract_hits_from_batches(&batches);
        hits.sort_by_key(|h| h.chunk_index);
        Ok(hits.into_iter().map(Into::into).collect())
    }

    async fn ready(&self) -> bool {
        self.db.table_names().execute().await.is_ok()
    }
}

struct RawHit {
    chunk_id: String,
    doc_id: String,
    chunk_index: u32,
    text: String,
    score: f32,
}

impl From<RawHit> for SearchMatch {
    fn from(hit: RawHit) -> Self {
        SearchMatch {
            chunk_id: hit.chunk_id,
            document_id: hit.doc_id,
            content: hit.text,
            score: hit.score,
            metadata: HashMap::from([("chunk_index".to_string(), hit.chunk_index.to_string())]),
            highlight: None,
        }
    }
}

/// Centralises Arrow-column downcasting for both `search` and `get_neighbors`.
fn extract_hits_from_batches(batches: &[RecordBatch]) -> Vec<RawHit> {
    let mut hits = Vec::new();
    for batch in batches {
        let ids = batch.column_by_name("id").and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let texts = batch.column_by_name("text").and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let doc_ids = batch.column_by_name("doc_id").and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let chunk_indices = batch.column_by_name("chunk_index").and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
        let distances = batch.column_by_name("_distance").and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        let (Some(ids), Some(texts)) = (ids, texts) else {
            continue;
        };

        for i in 0..batch.num_rows() {
            if ids.value(i) == "__seed__" {
                continue;
            }
            let score = distances.map(|d| (1.0 - d.value(i)).max(0.0)).unwrap_or(0.0);
            hits.push(RawHit {
                chunk_id: ids.value(i).to_string(),
                doc_id: doc_ids.map(|d| d.value(i).to_string()).unwrap_or_default(),
                chunk_index: chunk_indices.map(|c| c.value(i)).unwrap_or(0),
                text: texts.value(i).to_string(),
                score,
            });
        }
    }
    hits
}
