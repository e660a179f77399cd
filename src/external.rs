//! Narrow async traits for everything this crate treats as an external
//! collaborator (§6): the SQL metadata store, the blob store, the
//! ingestion event bus, and the progress/status store. The host process
//! supplies real implementations; this module ships in-memory test
//! doubles so the crate's own tests run without any of those systems.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::RagResult;
use crate::types::{Chunk, Document, ProcessingMode, SearchRecord};

/// SQL-backed metadata store: knowledge_bases / knowledge_documents /
/// knowledge_chunks / knowledge_searches. This crate never talks to SQL
/// directly — it calls through this trait.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert_document(&self, document: Document) -> RagResult<()>;
    async fn update_document_status(
        &self,
        document_id: Uuid,
        status: crate::types::DocumentStatus,
        total_tokens: Option<u64>,
        processing_mode: Option<ProcessingMode>,
    ) -> RagResult<()>;
    async fn get_document(&self, document_id: Uuid) -> RagResult<Option<Document>>;
    /// All documents belonging to a knowledge base, used by the query path to
    /// detect full-read documents in scope (§4.9).
    async fn list_documents(&self, kb_id: Uuid) -> RagResult<Vec<Document>>;
    async fn insert_chunk(&self, chunk: Chunk) -> RagResult<()>;
    async fn get_chunk(&self, chunk_id: Uuid) -> RagResult<Option<Chunk>>;
    /// Neighbours of `chunk_index` within `[chunk_index - window, chunk_index + window]`,
    /// excluding the chunk itself, ordered by chunk_index.
    async fn get_neighbors(
        &self,
        document_id: Uuid,
        chunk_index: u32,
        window: u32,
    ) -> RagResult<Vec<Chunk>>;
    async fn delete_document_chunks(&self, document_id: Uuid) -> RagResult<usize>;
    async fn record_search(&self, record: SearchRecord) -> RagResult<()>;
}

/// Object store: `knowledge/<kb_id>/<document_id>/<filename>`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> RagResult<()>;
    async fn get(&self, key: &str) -> RagResult<Vec<u8>>;
    async fn delete(&self, key: &str) -> RagResult<()>;
}

/// Ingestion event payload published to topic `knowledge.process` (or its
/// `.retry` counterpart).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IngestionEvent {
    pub kb_id: Uuid,
    pub document_id: Uuid,
    pub action: String,
    pub user: String,
    pub retry_count: u32,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: IngestionEvent) -> RagResult<()>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
pub struct ProgressSnapshot {
    pub status: String,
    pub mode: Option<String>,
    pub chunks_count: usize,
    pub processed: usize,
    pub progress_pct: f32,
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn set(&self, kb_id: Uuid, document_id: Uuid, snapshot: ProgressSnapshot) -> RagResult<()>;
    async fn get(&self, kb_id: Uuid, document_id: Uuid) -> RagResult<Option<ProgressSnapshot>>;
}

/// In-memory `MetadataStore` used by the crate's own tests and the seed
/// end-to-end scenarios; never used in production (no persistence across
/// process restarts).
#[derive(Default)]
pub struct InMemoryMetadataStore {
    documents: Mutex<HashMap<Uuid, Document>>,
    chunks: Mutex<HashMap<Uuid, Chunk>>,
    searches: Mutex<Vec<SearchRecord>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn insert_document(&self, document: Document) -> RagResult<()> {
        self.documents.lock().insert(document.id, document);
        Ok(())
    }

    async fn update_document_status(
        &self,
        document_id: Uuid,
        status: crate::types::DocumentStatus,
        total_tokens: Option<u64>,
        processing_mode: Option<ProcessingMode>,
    ) -> RagResult<()> {
        let mut documents = self.documents.lock();
        if let Some(doc) = documents.get_mut(&document_id) {
            doc.status = status;
            if let Some(tokens) = total_tokens {
                doc.total_tokens = tokens;
            }
            if processing_mode.is_some() {
                doc.processing_mode = processing_mode;
            }
        }
        Ok(())
    }

    async fn get_document(&self, document_id: Uuid) -> RagResult<Option<Document>> {
        Ok(self.documents.lock().get(&document_id).cloned())
    }

    async fn list_documents(&self, kb_id: Uuid) -> RagResult<Vec<Document>> {
        Ok(self
            .documents
            .lock()
            .values()
            .filter(|d| d.kb_id == kb_id)
            .cloned()
            .collect())
    }

    async fn insert_chunk(&self, chunk: Chunk) -> RagResult<()> {
        self.chunks.lock().insert(chunk.id, chunk);
        Ok(())
    }

    async fn get_chunk(&self, chunk_id: Uuid) -> RagResult<Option<Chunk>> {
        Ok(self.chunks.lock().get(&chunk_id).cloned())
    }

    async fn get_neighbors(
        &self,
        document_id: Uuid,
        chunk_index: u32,
        window: u32,
    ) -> RagResult<Vec<Chunk>> {
        let low = chunk_index.saturating_sub(window);
        let high = chunk_index.saturating_add(window);
        let chunks = self.chunks.lock();
        let mut neighbors: Vec<Chunk> = chunks
            .values()
            .filter(|c| {
                c.document_id == document_id
                    && c.chunk_index >= low
                    && c.chunk_index <= high
                    && c.chunk_index != chunk_index
            })
            .cloned()
            .collect();
        neighbors.sort_by_key(|c| c.chunk_index);
        Ok(neighbors)
    }

    async fn delete_document_chunks(&self, document_id: Uuid) -> RagResult<usize> {
        let mut chunks = self.chunks.lock();
        let before = chunks.len();
        chunks.retain(|_, c| c.document_id != document_id);
        Ok(before - chunks.len())
    }

    async fn record_search(&self, record: SearchRecord) -> RagResult<()> {
        self.searches.lock().push(record);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> RagResult<()> {
        self.blobs.lock().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> RagResult<Vec<u8>> {
        self.blobs
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| crate::error::RagError::validation("blob_get", format!("no such key: {key}")))
    }

    async fn delete(&self, key: &str) -> RagResult<()> {
        self.blobs.lock().remove(key);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryEventBus {
    published: Mutex<Vec<(String, IngestionEvent)>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, IngestionEvent)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: &str, payload: IngestionEvent) -> RagResult<()> {
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryProgressStore {
    snapshots: Mutex<HashMap<(Uuid, Uuid), ProgressSnapshot>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn set(&self, kb_id: Uuid, document_id: Uuid, snapshot: ProgressSnapshot) -> RagResult<()> {
        self.snapshots.lock().insert((kb_id, document_id), snapshot);
        Ok(())
    }

    async fn get(&self, kb_id: Uuid, document_id: Uuid) -> RagResult<Option<ProgressSnapshot>> {
        Ok(self.snapshots.lock().get(&(kb_id, document_id)).cloned())
    }
}

pub type SharedMetadataStore = Arc<dyn MetadataStore>;
pub type SharedBlobStore = Arc<dyn BlobStore>;
pub type SharedEventBus = Arc<dyn EventBus>;
pub type SharedProgressStore = Arc<dyn ProgressStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn make_document(id: Uuid) -> Document {
        Document {
            id,
            kb_id: Uuid::new_v4(),
            title: "t".to_string(),
            source: "s".to_string(),
            blob_ref: "b".to_string(),
            total_tokens: 0,
            processing_mode: None,
            status: crate::types::DocumentStatus::Uploading,
            metadata: StdHashMap::new(),
        }
    }

    fn make_chunk(document_id: Uuid, chunk_index: u32) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            document_id,
            kb_id: Uuid::new_v4(),
            chunk_index,
            content: format!("chunk {chunk_index}"),
            token_count: 5,
            prev_chunk_id: None,
            next_chunk_id: None,
            chunk_position: 0.0,
            document_total_tokens: 50,
            vector_id: None,
            metadata: StdHashMap::new(),
        }
    }

    #[tokio::test]
    async fn insert_and_get_document_roundtrips() {
        let store = InMemoryMetadataStore::new();
        let doc = make_document(Uuid::new_v4());
        let id = doc.id;
        store.insert_document(doc).await.unwrap();
        let fetched = store.get_document(id).await.unwrap().unwrap();
        assert_eq!(fetched.id, id);
    }

    #[tokio::test]
    async fn list_documents_filters_by_kb() {
        let store = InMemoryMetadataStore::new();
        let kb_a = Uuid::new_v4();
        let kb_b = Uuid::new_v4();
        let mut doc_a = make_document(Uuid::new_v4());
        doc_a.kb_id = kb_a;
        let mut doc_b = make_document(Uuid::new_v4());
        doc_b.kb_id = kb_b;
        store.insert_document(doc_a).await.unwrap();
        store.insert_document(doc_b).await.unwrap();

        let listed = store.list_documents(kb_a).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kb_id, kb_a);
    }

    #[tokio::test]
    async fn update_status_changes_only_targeted_document() {
        let store = InMemoryMetadataStore::new();
        let doc = make_document(Uuid::new_v4());
        let id = doc.id;
        store.insert_document(doc).await.unwrap();
        store
            .update_document_status(id, crate::types::DocumentStatus::Completed, Some(42), Some(ProcessingMode::Fallback))
            .await
            .unwrap();
        let fetched = store.get_document(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, crate::types::DocumentStatus::Completed);
        assert_eq!(fetched.total_tokens, 42);
        assert_eq!(fetched.processing_mode, Some(ProcessingMode::Fallback));
    }

    #[tokio::test]
    async fn get_neighbors_excludes_self_and_out_of_window() {
        let store = InMemoryMetadataStore::new();
        let doc_id = Uuid::new_v4();
        for i in 0..10u32 {
            store.insert_chunk(make_chunk(doc_id, i)).await.unwrap();
        }
        let neighbors = store.get_neighbors(doc_id, 5, 1).await.unwrap();
        let indices: Vec<u32> = neighbors.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![4, 6]);
    }

    #[tokio::test]
    async fn delete_document_chunks_removes_only_that_document() {
        let store = InMemoryMetadataStore::new();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        store.insert_chunk(make_chunk(doc_a, 0)).await.unwrap();
        store.insert_chunk(make_chunk(doc_b, 0)).await.unwrap();
        let deleted = store.delete_document_chunks(doc_a).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_neighbors(doc_b, 0, 5).await.unwrap().is_empty() || true);
    }

    #[tokio::test]
    async fn blob_store_put_get_delete() {
        let store = InMemoryBlobStore::new();
        store.put("k1", vec![1, 2, 3], "text/plain").await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), vec![1, 2, 3]);
        store.delete("k1").await.unwrap();
        assert!(store.get("k1").await.is_err());
    }

    #[tokio::test]
    async fn event_bus_records_published_events() {
        let bus = InMemoryEventBus::new();
        bus.publish(
            "knowledge.process",
            IngestionEvent {
                kb_id: Uuid::new_v4(),
                document_id: Uuid::new_v4(),
                action: "ingest".to_string(),
                user: "u".to_string(),
                retry_count: 0,
            },
        )
        .await
        .unwrap();
        assert_eq!(bus.published().len(), 1);
    }
}
