use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::cache::{CacheKey, SearchResultCache};
use crate::config::RagConfig;
use crate::context::{ContextAssembler, Generator, RemoteGenerator};
use crate::deadline::Deadline;
use crate::embeddings::{Embedder, RemoteEmbedder};
use crate::error::RagResult;
use crate::external::{
    BlobStore, EventBus, InMemoryBlobStore, InMemoryEventBus, InMemoryMetadataStore, InMemoryProgressStore,
    MetadataStore, ProgressStore,
};
use crate::ingestion::full_read_blob_key;
use crate::reranking::{DashScopeReranker, NoopReranker, Reranker};
use crate::router::ScenarioRouter;
use crate::search::{FulltextIndexer, HybridSearchEngine, SubstringIndex, TextSearch};
use crate::storage::{JsonVectorStore, LanceStore, VectorStore};
use crate::types::{DocumentStatus, ProcessingMode, SearchMatch, SearchMode};

/// Explicit construction/dependency-injection root: builds and owns the
/// concrete collaborator handles from a `RagConfig` and hands shared
/// references to the engine and the ingestion pipeline. Replaces the
/// notion of global singletons (§2).
///
/// No SQL crate appears anywhere in the reference corpus, so the
/// metadata/blob/event/progress stores default to the in-process
/// implementations from `external.rs` rather than a fabricated database
/// dependency; swap in a real backend by constructing `Registry` fields
/// directly if one becomes available.
pub struct Registry {
    pub config: Arc<RagConfig>,
    pub embedder: Arc<dyn Embedder>,
    pub vector_store: Arc<dyn VectorStore>,
    pub fulltext: Arc<dyn FulltextIndexer>,
    pub reranker: Arc<dyn Reranker>,
    pub generator: Option<Arc<dyn Generator>>,
    pub metadata_store: Arc<dyn MetadataStore>,
    pub blob_store: Arc<dyn BlobStore>,
    pub event_bus: Arc<dyn EventBus>,
    pub progress_store: Arc<dyn ProgressStore>,
    pub router: ScenarioRouter,
    pub engine: Arc<HybridSearchEngine>,
    pub context_assembler: Arc<ContextAssembler>,
    pub cache: Arc<SearchResultCache>,
}

impl Registry {
    pub async fn build(config: RagConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        std::fs::create_dir_all(&config.data_dir).ok();

        let embedder: Arc<dyn Embedder> = Arc::new(RemoteEmbedder::new(&config.embedder)?);

        let vector_store: Arc<dyn VectorStore> = match LanceStore::new(
            config.vector_store.path.to_str().unwrap_or("./lance_data"),
            config.embedder.dimensions,
            &config.vector_store.collection_prefix,
        )
        .await
        {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!(error = %e, "LanceDB unavailable, falling back to JSON vector store");
                Arc::new(JsonVectorStore::new(config.data_dir.clone(), config.embedder.dimensions))
            }
        };

        let fulltext: Arc<dyn FulltextIndexer> =
            match TextSearch::new(config.data_dir.to_str().unwrap_or("./data")) {
                Ok(index) => Arc::new(index),
                Err(e) => {
                    tracing::warn!(error = %e, "Tantivy unavailable, falling back to substring index");
                    Arc::new(SubstringIndex::new())
                }
            };

        let reranker: Arc<dyn Reranker> = if config.features.enable_reranking {
            match DashScopeReranker::new(&config.reranker) {
                Ok(r) => Arc::new(r),
                Err(e) => {
                    tracing::warn!(error = %e, "re-ranker unavailable, continuing without reranking");
                    Arc::new(NoopReranker)
                }
            }
        } else {
            Arc::new(NoopReranker)
        };

        let generator: Option<Arc<dyn Generator>> = match &config.generator {
            Some(cfg) => match RemoteGenerator::new(cfg) {
                Ok(g) => Some(Arc::new(g)),
                Err(e) => {
                    tracing::warn!(error = %e, "generator unavailable, continuing without generation");
                    None
                }
            },
            None => None,
        };

        let metadata_store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let blob_store: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let event_bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let progress_store: Arc<dyn ProgressStore> = Arc::new(InMemoryProgressStore::new());

        let router = ScenarioRouter::new(config.vector_store.full_read_budget_tokens as usize);

        let engine = Arc::new(HybridSearchEngine::new(
            vector_store.clone(),
            fulltext.clone(),
            embedder.clone(),
            Some(reranker.clone()),
            config.clone(),
        ));

        let context_assembler = Arc::new(ContextAssembler::new(generator.clone()));
        let cache = Arc::new(SearchResultCache::new(config.search.search_cache_ttl()));

        Ok(Self {
            config,
            embedder,
            vector_store,
            fulltext,
            reranker,
            generator,
            metadata_store,
            blob_store,
            event_bus,
            progress_store,
            router,
            engine,
            context_assembler,
            cache,
        })
    }

    /// Remove every trace of a document: its vectors, its lexical index
    /// entries, its chunk rows, and any cached search results for its
    /// knowledge base (§5 — cache invalidation on ingest/delete).
    pub async fn delete_document(&self, kb_id: Uuid, document_id: Uuid) -> RagResult<()> {
        self.vector_store
            .delete_document(&kb_id.to_string(), &document_id.to_string())
            .await?;
        self.fulltext
            .remove_document(&kb_id.to_string(), &document_id.to_string())
            .await?;
        self.metadata_store.delete_document_chunks(document_id).await?;
        self.cache.invalidate_kb(&kb_id.to_string());
        Ok(())
    }

    /// Top-level query entrypoint (§4.9). If the knowledge base has a
    /// completed full-read document in scope, the entire document is routed
    /// to the generator (or returned raw) as a single synthetic match;
    /// otherwise this runs ordinary hybrid search plus neighbour expansion.
    /// `deadline` bounds every remote call made along the way (blob fetch,
    /// generator, embedder/vector/lexical search); on expiry the call aborts
    /// and the query returns `RagError::Cancelled` (§5).
    pub async fn query(
        &self,
        kb_id: Uuid,
        query: &str,
        limit: usize,
        mode: SearchMode,
        vector_threshold: Option<f32>,
        deadline: Deadline,
    ) -> RagResult<Vec<SearchMatch>> {
        let documents = self.metadata_store.list_documents(kb_id).await?;
        let full_read_doc = documents.iter().find(|d| {
            d.status == DocumentStatus::Completed && d.processing_mode == Some(ProcessingMode::FullRead)
        });

        if let Some(doc) = full_read_doc {
            let key = full_read_blob_key(kb_id, doc.id);
            match deadline.guard(self.blob_store.get(&key)).await {
                Ok(Ok(bytes)) => {
                    let content = String::from_utf8_lossy(&bytes).into_owned();
                    return Ok(vec![self.full_read_match(query, &content, &deadline).await]);
                }
                Ok(Err(e)) => {
                    tracing::warn!(document_id = %doc.id, error = %e, "full_read content unavailable, falling back to chunked search");
                }
                Err(e) => {
                    tracing::warn!(document_id = %doc.id, error = %e, "full_read fetch aborted by deadline, falling back to chunked search");
                }
            }
        }

        self.chunked_query(kb_id, query, limit, mode, vector_threshold, &deadline).await
    }

    async fn full_read_match(&self, query: &str, content: &str, deadline: &Deadline) -> SearchMatch {
        let mut metadata = HashMap::from([("mode".to_string(), "full_read".to_string())]);
        let mut result_content = content.to_string();

        if let Some(generator) = &self.generator {
            let prompt =
                format!("Answer based on the following documents: {content}\n\nQuestion: {query}\n\nAnswer:");
            match deadline.guard(generator.generate(&prompt)).await {
                Ok(Ok(answer)) => {
                    result_content = answer;
                    metadata.insert("source".to_string(), "generator".to_string());
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "generator failed in full_read mode, returning raw content");
                    metadata.insert("source".to_string(), "raw_content".to_string());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "generator aborted by deadline, returning raw content");
                    metadata.insert("source".to_string(), "raw_content".to_string());
                }
            }
        } else {
            metadata.insert("source".to_string(), "raw_content".to_string());
        }

        SearchMatch {
            chunk_id: "full_read".to_string(),
            document_id: String::new(),
            content: result_content,
            score: 1.0,
            metadata,
            highlight: None,
        }
    }

    /// Fallback-mode query path (§4.9): hybrid search + neighbour expansion,
    /// then handed to the `ContextAssembler`, which collapses the ranked
    /// chunks into a single token-bounded synthetic match (generated, if a
    /// generator is configured, otherwise the raw assembled context).
    async fn chunked_query(
        &self,
        kb_id: Uuid,
        query: &str,
        limit: usize,
        mode: SearchMode,
        vector_threshold: Option<f32>,
        deadline: &Deadline,
    ) -> RagResult<Vec<SearchMatch>> {
        let threshold = vector_threshold.unwrap_or(self.config.search.vector_threshold);
        let cache_key = CacheKey::new(&kb_id.to_string(), query, mode, threshold, limit);

        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(cached);
        }

        let mut results = deadline
            .guard(self.engine.search(&kb_id.to_string(), query, limit, mode, vector_threshold))
            .await??;
        deadline
            .guard(self.engine.expand_neighbors(
                &kb_id.to_string(),
                &mut results,
                limit,
                self.config.chunking.related_chunk_size as u32,
            ))
            .await?;

        let assembled = deadline
            .guard(self.context_assembler.assemble(query, &results, self.config.search.context_token_budget))
            .await?;
        let assembled = vec![assembled];

        self.cache.insert(cache_key, assembled.clone());
        Ok(assembled)
    }
}
