pub mod json_store;
pub mod lance_store;

pub use json_store::JsonVectorStore;
pub use lance_store::LanceStore;

use async_trait::async_trait;

use crate::error::RagResult;
use crate::types::SearchMatch;

/// What gets persisted alongside a chunk's vector. `content` is kept
/// denormalised here (not just looked up via `chunk_id`) so vector-search
/// results can be returned without a second round-trip to the metadata store.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: u32,
    pub content: String,
    pub vector: Vec<f32>,
}

/// Persists chunk vectors and serves ANN search, one collection per
/// knowledge base (§4.4). Two adapters implement this: `LanceStore`
/// (primary, ANN-indexed) and `JsonVectorStore` (fallback, brute-force
/// cosine similarity, used in tests and when no LanceDB directory is
/// configured).
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotent on `record.chunk_id`. Returns an opaque vector_id.
    async fn upsert(&self, kb_id: &str, record: VectorRecord) -> RagResult<String>;

    async fn upsert_batch(&self, kb_id: &str, records: Vec<VectorRecord>) -> RagResult<Vec<String>> {
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(self.upsert(kb_id, record).await?);
        }
        Ok(ids)
    }

    /// Removes every vector belonging to `document_id`, returns the count removed.
    async fn delete_document(&self, kb_id: &str, document_id: &str) -> RagResult<usize>;

    /// Descending by score; entries below `threshold` are dropped.
    async fn search(
        &self,
        kb_id: &str,
        query_vec: &[f32],
        limit: usize,
        candidate_limit: usize,
        threshold: f32,
    ) -> RagResult<Vec<SearchMatch>>;

    /// Chunks within `[chunk_index - window, chunk_index + window]`, excluding
    /// the chunk itself, ordered by chunk_index.
    async fn get_neighbors(
        &self,
        kb_id: &str,
        document_id: &str,
        chunk_index: u32,
        window: u32,
    ) -> RagResult<Vec<SearchMatch>>;

    async fn ready(&self) -> bool;
}

/// Dimension mismatch policy (Open Question, decided in DESIGN.md): truncate
/// if the incoming vector is longer than `dim`, zero-pad if shorter, logging
/// either way. Dimension is pinned per KB at collection creation so this
/// never needs to reconcile vectors *across* backends.
pub fn fit_dimension(mut vector: Vec<f32>, dim: usize, chunk_id: &str) -> Vec<f32> {
    use std::cmp::Ordering;
    match vector.len().cmp(&dim) {
        Ordering::Greater => {
            tracing::warn!(
                chunk_id = %chunk_id,
                got = vector.len(),
                expected = dim,
                "embedding longer than collection dimension, truncating"
            );
            vector.truncate(dim);
            vector
        }
        Ordering::Less => {
            tracing::warn!(
                chunk_id = %chunk_id,
                got = vector.len(),
                expected = dim,
                "embedding shorter than collection dimension, zero-padding"
            );
            vector.resize(dim, 0.0);
            vector
        }
        Ordering::Equal => vector,
    }
}
