use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use uuid::Uuid;

use crate::cache::SearchResultCache;
use crate::config::RagConfig;
use crate::deadline::Deadline;
use crate::embeddings::Embedder;
use crate::error::{RagError, RagResult};
use crate::external::{
    BlobStore, EventBus, IngestionEvent, MetadataStore, ProgressSnapshot, ProgressStore,
};
use crate::processing::{DocumentParser, TextChunker};
use crate::processing::type_detector::TypeDetector;
use crate::router::ScenarioRouter;
use crate::search::FulltextIndexer;
use crate::storage::{fit_dimension, VectorRecord, VectorStore};
use crate::types::{Chunk, Document, DocumentStatus, ProcessingMode};

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Blob key a full-read document's extracted text is retained under, shared
/// with the query path (`Registry::query`) so it can load the text back
/// without re-parsing the original upload.
pub fn full_read_blob_key(kb_id: Uuid, document_id: Uuid) -> String {
    format!("knowledge/{kb_id}/{document_id}/extracted.txt")
}

/// Ingests one document end to end: parse, detect genre, chunk, embed, persist,
/// vector-upsert, lexical-index, link, report progress (§4.10). A single-flight
/// guard keyed on `(kb_id, document_id)` prevents duplicate concurrent runs for
/// the same document, mirroring the teacher's folder-level pause/cancel guard
/// (`IndexingState` in the original batch indexer) at document granularity.
pub struct IngestionPipeline {
    metadata_store: Arc<dyn MetadataStore>,
    blob_store: Arc<dyn BlobStore>,
    event_bus: Arc<dyn EventBus>,
    progress_store: Arc<dyn ProgressStore>,
    embedder: Arc<dyn Embedder>,
    vector_store: Arc<dyn VectorStore>,
    fulltext: Arc<dyn FulltextIndexer>,
    router: ScenarioRouter,
    config: Arc<RagConfig>,
    in_flight: DashMap<(Uuid, Uuid), ()>,
    /// Invalidated for the ingested document's kb_id on every successful
    /// completion, so a query issued right after ingest never serves a stale
    /// cached result (§5). `None` when the pipeline is used standalone
    /// without a shared cache (e.g. dry-run chunking tests).
    cache: Option<Arc<SearchResultCache>>,
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata_store: Arc<dyn MetadataStore>,
        blob_store: Arc<dyn BlobStore>,
        event_bus: Arc<dyn EventBus>,
        progress_store: Arc<dyn ProgressStore>,
        embedder: Arc<dyn Embedder>,
        vector_store: Arc<dyn VectorStore>,
        fulltext: Arc<dyn FulltextIndexer>,
        router: ScenarioRouter,
        config: Arc<RagConfig>,
    ) -> Self {
        Self {
            metadata_store,
            blob_store,
            event_bus,
            progress_store,
            embedder,
            vector_store,
            fulltext,
            router,
            config,
            in_flight: DashMap::new(),
            cache: None,
        }
    }

    /// Attach a search-result cache so completed ingests invalidate it for
    /// their knowledge base. Returns `self` for builder-style chaining.
    pub fn with_cache(mut self, cache: Arc<SearchResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Processes one document. Returns `Ok(())` once the document has reached
    /// a terminal state (`completed` or `failed`); `retry_count` comes from the
    /// triggering `IngestionEvent` and is re-published on failures that are
    /// still within the retry budget. `deadline` bounds every remote call this
    /// run makes (embed, vector upsert, lexical index, blob put); once it
    /// fires the in-flight call aborts and the document is left in whatever
    /// state already committed, eligible for retry (§5).
    pub async fn process_document(
        &self,
        kb_id: Uuid,
        document_id: Uuid,
        filename: &str,
        retry_count: u32,
        deadline: Deadline,
    ) -> RagResult<()> {
        let key = (kb_id, document_id);
        if self.in_flight.insert(key, ()).is_some() {
            return Err(RagError::consistency(format!(
                "document {document_id} is already being processed"
            )));
        }

        let result = AssertUnwindSafe(self.process_document_inner(kb_id, document_id, filename, retry_count, deadline))
            .catch_unwind()
            .await;

        self.in_flight.remove(&key);

        match result {
            Ok(inner) => inner,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(document_id = %document_id, panic = %message, "ingestion panicked");
                self.fail_and_maybe_retry(kb_id, document_id, retry_count, true, &message).await;
                Err(RagError::consistency(format!("ingestion panicked: {message}")))
            }
        }
    }

    async fn process_document_inner(
        &self,
        kb_id: Uuid,
        document_id: Uuid,
        filename: &str,
        retry_count: u32,
        deadline: Deadline,
    ) -> RagResult<()> {
        self.metadata_store
            .update_document_status(document_id, DocumentStatus::Processing, None, None)
            .await?;
        self.report_progress(kb_id, document_id, "processing", None, 0, 0, 0.0).await;

        let blob_key = format!("knowledge/{kb_id}/{document_id}/{filename}");
        let bytes = match self.blob_store.get(&blob_key).await {
            Ok(b) => b,
            Err(e) => {
                self.fail_and_maybe_retry(kb_id, document_id, retry_count, e.is_retryable(), &e.to_string()).await;
                return Err(e);
            }
        };

        let parsed = match self.parse(filename, &bytes) {
            Ok(p) => p,
            Err(e) => {
                self.fail_and_maybe_retry(kb_id, document_id, retry_count, e.is_retryable(), &e.to_string()).await;
                return Err(e);
            }
        };

        let total_tokens = self.embedder.count_tokens(&parsed).await.unwrap_or(0) as u64;
        let mode = self.router.route(total_tokens as usize);

        self.metadata_store
            .update_document_status(document_id, DocumentStatus::Processing, Some(total_tokens), Some(mode))
            .await?;

        if mode == ProcessingMode::FullRead {
            return self
                .complete_full_read(kb_id, document_id, &parsed, total_tokens, &deadline)
                .await;
        }

        let extension = std::path::Path::new(filename)
            .extension()
            .and_then(|e| e.to_str());
        let genre = TypeDetector::detect(extension, &parsed);
        let params = crate::processing::chunker::params_for_genre(genre, &self.config.chunking);
        let chunks = TextChunker::chunk_with_params(&parsed, params);
        if chunks.is_empty() {
            let message = "document produced no chunks".to_string();
            self.fail_and_maybe_retry(kb_id, document_id, retry_count, false, &message).await;
            return Err(RagError::validation("chunk", message));
        }

        let total = chunks.len();
        let mut prev_id: Option<Uuid> = None;
        let mut persisted_ids = Vec::with_capacity(total);

        for (idx, chunk) in chunks.iter().enumerate() {
            deadline.check()?;
            let chunk_id = chunk.id;
            let mut record = Chunk {
                id: chunk_id,
                document_id,
                kb_id,
                chunk_index: idx as u32,
                content: chunk.text.clone(),
                token_count: self.embedder.count_tokens(&chunk.text).await.unwrap_or(0) as u32,
                prev_chunk_id: prev_id,
                next_chunk_id: None,
                chunk_position: idx as f32 / total.max(1) as f32,
                document_total_tokens: total_tokens,
                vector_id: None,
                metadata: Default::default(),
            };

            match deadline.guard(self.embed_and_index(kb_id, &record)).await {
                Ok(Ok(vector_id)) => record.vector_id = Some(vector_id),
                Ok(Err(e)) => {
                    tracing::warn!(chunk_id = %chunk_id, error = %e, "chunk embed/index failed, persisting without vector");
                }
                Err(e) => {
                    tracing::warn!(chunk_id = %chunk_id, error = %e, "chunk embed/index aborted by deadline, persisting without vector");
                }
            }

            self.metadata_store.insert_chunk(record).await?;
            persisted_ids.push(chunk_id);
            prev_id = Some(chunk_id);

            let processed = idx + 1;
            self.report_progress(
                kb_id,
                document_id,
                "processing",
                Some(mode),
                total,
                processed,
                processed as f32 / total as f32 * 100.0,
            )
            .await;
        }

        self.link_neighbors(document_id, &persisted_ids).await?;

        self.metadata_store
            .update_document_status(document_id, DocumentStatus::Completed, Some(total_tokens), Some(mode))
            .await?;
        self.report_progress(kb_id, document_id, "completed", Some(mode), total, total, 100.0).await;
        if let Some(cache) = &self.cache {
            cache.invalidate_kb(&kb_id.to_string());
        }

        Ok(())
    }

    /// Full-read mode: no chunking, no embedding. The extracted text is
    /// retained under a well-known blob key so the query path can load it
    /// back without re-parsing (§4.9).
    async fn complete_full_read(
        &self,
        kb_id: Uuid,
        document_id: Uuid,
        content: &str,
        total_tokens: u64,
        deadline: &Deadline,
    ) -> RagResult<()> {
        let extracted_key = full_read_blob_key(kb_id, document_id);
        let put = self.blob_store.put(&extracted_key, content.as_bytes().to_vec(), "text/plain");
        if let Err(e) = deadline.guard(put).await.and_then(std::convert::identity) {
            tracing::warn!(document_id = %document_id, error = %e, "failed to retain extracted text for full_read document");
        }

        self.metadata_store
            .update_document_status(
                document_id,
                DocumentStatus::Completed,
                Some(total_tokens),
                Some(ProcessingMode::FullRead),
            )
            .await?;
        self.report_progress(kb_id, document_id, "completed", Some(ProcessingMode::FullRead), 0, 0, 100.0)
            .await;
        if let Some(cache) = &self.cache {
            cache.invalidate_kb(&kb_id.to_string());
        }

        Ok(())
    }

    fn parse(&self, filename: &str, bytes: &[u8]) -> RagResult<String> {
        let extension = std::path::Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("txt")
            .to_lowercase();

        if extension == "doc" || extension == "xls" {
            return Err(RagError::validation(
                "parse",
                format!("legacy format .{extension} is not supported"),
            ));
        }

        let tmp_dir = std::env::temp_dir();
        let tmp_path = tmp_dir.join(format!("{}-{}", Uuid::new_v4(), filename));
        std::fs::write(&tmp_path, bytes)
            .map_err(|e| RagError::upstream("parse", anyhow::Error::from(e)))?;

        let parser = DocumentParser::new();
        let parsed = parser
            .parse_file(&tmp_path)
            .map_err(|e| RagError::upstream("parse", e));
        let _ = std::fs::remove_file(&tmp_path);

        parsed.map(|p| p.content)
    }

    async fn embed_and_index(&self, kb_id: Uuid, chunk: &Chunk) -> RagResult<String> {
        let embedding = self.embedder.embed(&chunk.content).await?;
        let dimension = self.embedder.dimensions();
        let fitted = fit_dimension(embedding, dimension, &chunk.id.to_string());

        let vector_id = self
            .vector_store
            .upsert(
                &kb_id.to_string(),
                VectorRecord {
                    chunk_id: chunk.id.to_string(),
                    document_id: chunk.document_id.to_string(),
                    chunk_index: chunk.chunk_index,
                    content: chunk.content.clone(),
                    vector: fitted,
                },
            )
            .await?;

        self.fulltext
            .index(&kb_id.to_string(), &chunk.id.to_string(), &chunk.document_id.to_string(), &chunk.content)
            .await?;

        Ok(vector_id)
    }

    async fn link_neighbors(&self, document_id: Uuid, chunk_ids: &[Uuid]) -> RagResult<()> {
        for window in chunk_ids.windows(2) {
            let (prev, next) = (window[0], window[1]);
            if let Some(mut prev_chunk) = self.metadata_store.get_chunk(prev).await? {
                prev_chunk.next_chunk_id = Some(next);
                self.metadata_store.insert_chunk(prev_chunk).await?;
            }
        }
        let _ = document_id;
        Ok(())
    }

    /// Moves a document to `failed`, or reschedules it via the event bus if
    /// both the error is retryable (§7: only `Upstream`/`NotReady` kinds are)
    /// and the retry budget isn't exhausted.
    async fn fail_and_maybe_retry(
        &self,
        kb_id: Uuid,
        document_id: Uuid,
        retry_count: u32,
        retryable: bool,
        reason: &str,
    ) {
        let max_retries = self.config.vector_store.max_retries;
        if retryable && retry_count < max_retries {
            let event = IngestionEvent {
                kb_id,
                document_id,
                action: "ingest".to_string(),
                user: String::new(),
                retry_count: retry_count + 1,
            };
            if let Err(e) = self.event_bus.publish("knowledge.process.retry", event).await {
                tracing::error!(error = %e, "failed to publish retry event");
            }
            tracing::warn!(document_id = %document_id, reason, retry_count, "ingestion failed, scheduled retry");
        } else {
            let _ = self
                .metadata_store
                .update_document_status(document_id, DocumentStatus::Failed, None, None)
                .await;
            self.report_progress(kb_id, document_id, "failed", None, 0, 0, 0.0).await;
            if retryable {
                tracing::error!(document_id = %document_id, reason, "ingestion failed, retries exhausted");
            } else {
                tracing::error!(document_id = %document_id, reason, "ingestion failed, error is not retryable");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn report_progress(
        &self,
        kb_id: Uuid,
        document_id: Uuid,
        status: &str,
        mode: Option<ProcessingMode>,
        chunks_count: usize,
        processed: usize,
        progress_pct: f32,
    ) {
        let snapshot = ProgressSnapshot {
            status: status.to_string(),
            mode: mode.map(|m| match m {
                ProcessingMode::FullRead => "full_read".to_string(),
                ProcessingMode::Fallback => "fallback".to_string(),
            }),
            chunks_count,
            processed,
            progress_pct,
        };
        if let Err(e) = self.progress_store.set(kb_id, document_id, snapshot).await {
            tracing::warn!(error = %e, "failed to record ingestion progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RagConfig;
    use crate::embeddings::Embedder;
    use crate::error::RagResult;
    use crate::external::{InMemoryBlobStore, InMemoryEventBus, InMemoryMetadataStore, InMemoryProgressStore};
    use crate::search::SubstringIndex;
    use crate::storage::JsonVectorStore;
    use crate::types::SearchMatch;
    use async_trait::async_trait;

    struct FakeEmbedder;

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, text: &str) -> RagResult<Vec<f32>> {
            Ok(vec![text.len() as f32 % 7.0; 8])
        }

        async fn count_tokens(&self, text: &str) -> RagResult<usize> {
            Ok(text.split_whitespace().count().max(1))
        }

        fn dimensions(&self) -> usize {
            8
        }

        async fn ready(&self) -> bool {
            true
        }
    }

    fn build_pipeline() -> IngestionPipeline {
        let config = Arc::new(RagConfig::default());
        IngestionPipeline::new(
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(InMemoryEventBus::new()),
            Arc::new(InMemoryProgressStore::new()),
            Arc::new(FakeEmbedder),
            Arc::new(JsonVectorStore::new(std::env::temp_dir(), 8)),
            Arc::new(SubstringIndex::new()),
            ScenarioRouter::new(1_000_000),
            config,
        )
    }

    #[tokio::test]
    async fn processes_document_end_to_end() {
        let pipeline = build_pipeline();
        let kb_id = Uuid::new_v4();
        let document_id = Uuid::new_v4();

        pipeline
            .metadata_store
            .insert_document(Document {
                id: document_id,
                kb_id,
                title: "t".to_string(),
                source: "s".to_string(),
                blob_ref: "b".to_string(),
                total_tokens: 0,
                processing_mode: None,
                status: DocumentStatus::Uploading,
                metadata: Default::default(),
            })
            .await
            .unwrap();

        let content = "word ".repeat(500);
        pipeline
            .blob_store
            .put(
                &format!("knowledge/{kb_id}/{document_id}/doc.txt"),
                content.into_bytes(),
                "text/plain",
            )
            .await
            .unwrap();

        pipeline.process_document(kb_id, document_id, "doc.txt", 0, crate::deadline::Deadline::never()).await.unwrap();

        let doc = pipeline.metadata_store.get_document(document_id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
    }

    #[tokio::test]
    async fn rejects_concurrent_processing_of_same_document() {
        let pipeline = Arc::new(build_pipeline());
        let kb_id = Uuid::new_v4();
        let document_id = Uuid::new_v4();
        pipeline.in_flight.insert((kb_id, document_id), ());

        let err = pipeline.process_document(kb_id, document_id, "doc.txt", 0, crate::deadline::Deadline::never()).await.unwrap_err();
        assert!(matches!(err, RagError::Consistency { .. }));
    }

    #[tokio::test]
    async fn missing_blob_marks_document_failed_after_retries_exhausted() {
        let pipeline = build_pipeline();
        let kb_id = Uuid::new_v4();
        let document_id = Uuid::new_v4();
        pipeline
            .metadata_store
            .insert_document(Document {
                id: document_id,
                kb_id,
                title: "t".to_string(),
                source: "s".to_string(),
                blob_ref: "b".to_string(),
                total_tokens: 0,
                processing_mode: None,
                status: DocumentStatus::Uploading,
                metadata: Default::default(),
            })
            .await
            .unwrap();

        let result = pipeline.process_document(kb_id, document_id, "missing.txt", DEFAULT_MAX_RETRIES, crate::deadline::Deadline::never()).await;
        assert!(result.is_err());
        let doc = pipeline.metadata_store.get_document(document_id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
    }
}
