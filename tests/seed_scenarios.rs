//! End-to-end seed scenarios driving the public ingestion pipeline and
//! hybrid search engine against in-memory/JSON-fallback test doubles, no
//! network or LanceDB/Tantivy directory required.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use shodh_rag::config::RagConfig;
use shodh_rag::embeddings::Embedder;
use shodh_rag::error::{RagError, RagResult};
use shodh_rag::external::{
    BlobStore, EventBus, InMemoryBlobStore, InMemoryEventBus, InMemoryMetadataStore, InMemoryProgressStore,
    MetadataStore, ProgressStore,
};
use shodh_rag::ingestion::IngestionPipeline;
use shodh_rag::reranking::{NoopReranker, RerankedMatch, Reranker};
use shodh_rag::router::ScenarioRouter;
use shodh_rag::search::{FulltextIndexer, HybridSearchEngine, SubstringIndex};
use shodh_rag::storage::{JsonVectorStore, VectorRecord, VectorStore};
use shodh_rag::types::{Document, DocumentStatus, ProcessingMode, SearchMatch, SearchMode};

const KEYWORDS: [&str; 8] = [
    "photosynthesis",
    "light",
    "energy",
    "chemical",
    "banana",
    "yellow",
    "purr",
    "bark",
];

/// Deterministic stand-in for a real embedding model: one dimension per
/// marker keyword, 1.0 if the keyword appears in the text, else 0.0. Lets
/// cosine similarity separate topically distinct chunks without a network
/// round-trip.
struct FakeEmbedder;

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> RagResult<Vec<f32>> {
        let lower = text.to_lowercase();
        Ok(KEYWORDS.iter().map(|k| if lower.contains(k) { 1.0 } else { 0.0 }).collect())
    }

    async fn count_tokens(&self, text: &str) -> RagResult<usize> {
        Ok(text.split_whitespace().count().max(1))
    }

    fn dimensions(&self) -> usize {
        KEYWORDS.len()
    }

    async fn ready(&self) -> bool {
        true
    }
}

fn make_document(id: Uuid, kb_id: Uuid) -> Document {
    Document {
        id,
        kb_id,
        title: "t".to_string(),
        source: "s".to_string(),
        blob_ref: "b".to_string(),
        total_tokens: 0,
        processing_mode: None,
        status: DocumentStatus::Uploading,
        metadata: Default::default(),
    }
}

fn temp_vector_store(dim: usize) -> JsonVectorStore {
    let dir = std::env::temp_dir().join(format!("seed-scenario-{}", Uuid::new_v4()));
    JsonVectorStore::new(dir, dim)
}

#[tokio::test]
async fn ingest_short_txt_produces_one_fallback_chunk() {
    let mut cfg = RagConfig::default();
    cfg.chunking.chunk_size = 800;
    let config = Arc::new(cfg);

    let metadata_store = Arc::new(InMemoryMetadataStore::new());
    let blob_store = Arc::new(InMemoryBlobStore::new());
    let vector_store = Arc::new(temp_vector_store(8));
    let fulltext = Arc::new(SubstringIndex::new());

    let pipeline = IngestionPipeline::new(
        metadata_store.clone() as Arc<dyn MetadataStore>,
        blob_store.clone() as Arc<dyn BlobStore>,
        Arc::new(InMemoryEventBus::new()) as Arc<dyn EventBus>,
        Arc::new(InMemoryProgressStore::new()) as Arc<dyn ProgressStore>,
        Arc::new(FakeEmbedder) as Arc<dyn Embedder>,
        vector_store.clone() as Arc<dyn VectorStore>,
        fulltext.clone() as Arc<dyn FulltextIndexer>,
        // A zero full-read budget forces this short document into fallback
        // mode so the chunking/embedding/indexing path is actually exercised.
        ScenarioRouter::new(0),
        config,
    );

    let kb_id = Uuid::new_v4();
    let document_id = Uuid::new_v4();
    metadata_store.insert_document(make_document(document_id, kb_id)).await.unwrap();
    blob_store
        .put(
            &format!("knowledge/{kb_id}/{document_id}/doc.txt"),
            b"Cats purr. Dogs bark.".to_vec(),
            "text/plain",
        )
        .await
        .unwrap();

    pipeline.process_document(kb_id, document_id, "doc.txt", 0, shodh_rag::deadline::Deadline::never()).await.unwrap();

    let doc = metadata_store.get_document(document_id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.processing_mode, Some(ProcessingMode::Fallback));
    assert!(doc.total_tokens > 0);

    let matches = vector_store.search(&kb_id.to_string(), &[0.0; 8], 10, 10, -1.0).await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].metadata.get("chunk_index").map(String::as_str), Some("0"));

    let lexical = fulltext.search(&kb_id.to_string(), "cats", 10).await.unwrap();
    assert_eq!(lexical.len(), 1);
}

#[tokio::test]
async fn ingest_within_budget_routes_full_read_and_query_returns_synthetic_match() {
    let config = Arc::new(RagConfig::default()); // full_read_budget_tokens = 1_000_000, generous

    let metadata_store = Arc::new(InMemoryMetadataStore::new());
    let blob_store = Arc::new(InMemoryBlobStore::new());
    let vector_store = Arc::new(temp_vector_store(8));
    let fulltext = Arc::new(SubstringIndex::new());

    let pipeline = IngestionPipeline::new(
        metadata_store.clone() as Arc<dyn MetadataStore>,
        blob_store.clone() as Arc<dyn BlobStore>,
        Arc::new(InMemoryEventBus::new()) as Arc<dyn EventBus>,
        Arc::new(InMemoryProgressStore::new()) as Arc<dyn ProgressStore>,
        Arc::new(FakeEmbedder) as Arc<dyn Embedder>,
        vector_store.clone() as Arc<dyn VectorStore>,
        fulltext.clone() as Arc<dyn FulltextIndexer>,
        ScenarioRouter::new(1_000_000),
        config.clone(),
    );

    let kb_id = Uuid::new_v4();
    let document_id = Uuid::new_v4();
    metadata_store.insert_document(make_document(document_id, kb_id)).await.unwrap();
    blob_store
        .put(
            &format!("knowledge/{kb_id}/{document_id}/doc.txt"),
            b"A short note well within the context budget.".to_vec(),
            "text/plain",
        )
        .await
        .unwrap();

    pipeline.process_document(kb_id, document_id, "doc.txt", 0, shodh_rag::deadline::Deadline::never()).await.unwrap();

    let doc = metadata_store.get_document(document_id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.processing_mode, Some(ProcessingMode::FullRead));

    let vector_upserts = vector_store.search(&kb_id.to_string(), &[0.0; 8], 10, 10, -1.0).await.unwrap();
    assert!(vector_upserts.is_empty(), "full_read documents must not be chunked or embedded");

    let engine = Arc::new(HybridSearchEngine::new(
        vector_store.clone() as Arc<dyn VectorStore>,
        fulltext.clone() as Arc<dyn FulltextIndexer>,
        Arc::new(FakeEmbedder) as Arc<dyn Embedder>,
        Some(Arc::new(NoopReranker)),
        config.clone(),
    ));
    let context_assembler = Arc::new(shodh_rag::context::ContextAssembler::new(None));

    let registry = shodh_rag::registry::Registry {
        config,
        embedder: Arc::new(FakeEmbedder),
        vector_store: vector_store.clone() as Arc<dyn VectorStore>,
        fulltext: fulltext.clone() as Arc<dyn FulltextIndexer>,
        reranker: Arc::new(NoopReranker),
        generator: None,
        metadata_store: metadata_store.clone() as Arc<dyn MetadataStore>,
        blob_store: blob_store.clone() as Arc<dyn BlobStore>,
        event_bus: Arc::new(InMemoryEventBus::new()),
        progress_store: Arc::new(InMemoryProgressStore::new()),
        router: ScenarioRouter::new(1_000_000),
        engine,
        context_assembler,
        cache: Arc::new(shodh_rag::cache::SearchResultCache::new(
            std::time::Duration::from_secs(300),
        )),
    };

    let results = registry.query(kb_id, "what does the note say?", 5, SearchMode::Hybrid, None, shodh_rag::deadline::Deadline::never()).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].metadata.get("mode").map(String::as_str), Some("full_read"));
}

#[tokio::test]
async fn hybrid_question_query_ranks_matching_chunk_first_with_high_vector_weight() {
    use shodh_rag::search::{QueryAnalyzer, QueryClass, WeightAdjuster};

    let config = Arc::new(RagConfig::default());
    let vector_store = Arc::new(temp_vector_store(8));
    let fulltext = Arc::new(SubstringIndex::new());
    let kb_id = Uuid::new_v4();

    vector_store
        .upsert(
            &kb_id.to_string(),
            VectorRecord {
                chunk_id: "c1".to_string(),
                document_id: "d1".to_string(),
                chunk_index: 0,
                content: "Photosynthesis converts light to chemical energy.".to_string(),
                vector: FakeEmbedder.embed("Photosynthesis converts light to chemical energy.").await.unwrap(),
            },
        )
        .await
        .unwrap();
    vector_store
        .upsert(
            &kb_id.to_string(),
            VectorRecord {
                chunk_id: "c2".to_string(),
                document_id: "d1".to_string(),
                chunk_index: 1,
                content: "Bananas are yellow.".to_string(),
                vector: FakeEmbedder.embed("Bananas are yellow.").await.unwrap(),
            },
        )
        .await
        .unwrap();
    fulltext
        .index(&kb_id.to_string(), "c1", "d1", "Photosynthesis converts light to chemical energy.")
        .await
        .unwrap();
    fulltext.index(&kb_id.to_string(), "c2", "d1", "Bananas are yellow.").await.unwrap();

    let engine = HybridSearchEngine::new(
        vector_store as Arc<dyn VectorStore>,
        fulltext as Arc<dyn FulltextIndexer>,
        Arc::new(FakeEmbedder),
        Some(Arc::new(NoopReranker)),
        config,
    );

    let query = "What is photosynthesis?";
    let results = engine.search(&kb_id.to_string(), query, 2, SearchMode::Hybrid, Some(0.0)).await.unwrap();

    assert_eq!(results[0].chunk_id, "c1");
    assert!(results[0].score > results[1].score);

    assert_eq!(QueryAnalyzer::classify(query), QueryClass::Question);
    let (w_v, _) = WeightAdjuster::adjust(QueryClass::Question, 0.6, 0.4);
    assert!(w_v >= 0.7);
}

struct AlwaysFailsVectorStore;

#[async_trait]
impl VectorStore for AlwaysFailsVectorStore {
    async fn upsert(&self, _kb_id: &str, _record: VectorRecord) -> RagResult<String> {
        Ok("unused".to_string())
    }

    async fn delete_document(&self, _kb_id: &str, _document_id: &str) -> RagResult<usize> {
        Ok(0)
    }

    async fn search(
        &self,
        _kb_id: &str,
        _query_vec: &[f32],
        _limit: usize,
        _candidate_limit: usize,
        _threshold: f32,
    ) -> RagResult<Vec<SearchMatch>> {
        Err(RagError::upstream("vector_search", anyhow::anyhow!("vector backend unavailable")))
    }

    async fn get_neighbors(
        &self,
        _kb_id: &str,
        _document_id: &str,
        _chunk_index: u32,
        _window: u32,
    ) -> RagResult<Vec<SearchMatch>> {
        Ok(Vec::new())
    }

    async fn ready(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn hybrid_search_falls_back_to_lexical_when_vector_store_errors() {
    let config = Arc::new(RagConfig::default());
    let fulltext = Arc::new(SubstringIndex::new());
    let kb_id = Uuid::new_v4();

    fulltext.index(&kb_id.to_string(), "c1", "d1", "Photosynthesis converts light to energy.").await.unwrap();

    let engine = HybridSearchEngine::new(
        Arc::new(AlwaysFailsVectorStore) as Arc<dyn VectorStore>,
        fulltext as Arc<dyn FulltextIndexer>,
        Arc::new(FakeEmbedder),
        Some(Arc::new(NoopReranker)),
        config,
    );

    let results = engine
        .search(&kb_id.to_string(), "What is photosynthesis?", 5, SearchMode::Hybrid, None)
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk_id, "c1");
}

/// Fixed re-ranker exercising scenario 5: overrides the incoming fused order
/// [c1, c2, c3] with scores {c2: 0.9, c1: 0.5, c3: 0.1}.
struct FixedReranker;

#[async_trait]
impl Reranker for FixedReranker {
    async fn rerank(&self, _query: &str, _candidates: &[String]) -> RagResult<Vec<RerankedMatch>> {
        Ok(vec![
            RerankedMatch { index: 1, score: 0.9, rank: 1 },
            RerankedMatch { index: 0, score: 0.5, rank: 2 },
            RerankedMatch { index: 2, score: 0.1, rank: 3 },
        ])
    }

    async fn ready(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn rerank_overrides_fused_order() {
    let config = Arc::new(RagConfig::default());
    let vector_store = Arc::new(temp_vector_store(3));
    let fulltext = Arc::new(SubstringIndex::new());
    let kb_id = Uuid::new_v4();

    // Cosine similarity to query [1,0,0] decreases strictly: c1 > c2 > c3,
    // so the pre-rerank fused order is exactly [c1, c2, c3].
    for (chunk_id, chunk_index, vector) in [
        ("c1", 0u32, vec![1.0, 0.0, 0.0]),
        ("c2", 1u32, vec![1.0, 1.0, 0.0]),
        ("c3", 2u32, vec![1.0, 2.0, 0.0]),
    ] {
        vector_store
            .upsert(
                &kb_id.to_string(),
                VectorRecord {
                    chunk_id: chunk_id.to_string(),
                    document_id: "d1".to_string(),
                    chunk_index,
                    content: format!("content {chunk_id}"),
                    vector,
                },
            )
            .await
            .unwrap();
    }

    let engine = HybridSearchEngine::new(
        vector_store as Arc<dyn VectorStore>,
        fulltext as Arc<dyn FulltextIndexer>,
        Arc::new(FakeEmbedder),
        Some(Arc::new(FixedReranker)),
        config,
    );

    let results = engine.search(&kb_id.to_string(), "query", 3, SearchMode::Vector, Some(-1.0)).await.unwrap();

    assert_eq!(results.iter().map(|m| m.chunk_id.as_str()).collect::<Vec<_>>(), vec!["c2", "c1", "c3"]);
    assert_eq!(results[0].score, 0.9);
    assert_eq!(results[1].score, 0.5);
    assert_eq!(results[2].score, 0.1);
}

#[tokio::test]
async fn neighbor_expansion_dedupes_when_both_hits_are_adjacent() {
    let vector_store = temp_vector_store(3);
    let kb_id = Uuid::new_v4();

    // c5 and c6 both score 1.0 against the query and are returned as the
    // top-2 hits; c4 sits outside similarity range but within the window.
    for (chunk_id, chunk_index, vector) in [
        ("c4", 4u32, vec![0.0, 1.0, 0.0]),
        ("c5", 5u32, vec![1.0, 0.0, 0.0]),
        ("c6", 6u32, vec![1.0, 0.0, 0.0]),
    ] {
        vector_store
            .upsert(
                &kb_id.to_string(),
                VectorRecord {
                    chunk_id: chunk_id.to_string(),
                    document_id: "d1".to_string(),
                    chunk_index,
                    content: format!("content {chunk_id}"),
                    vector,
                },
            )
            .await
            .unwrap();
    }

    let config = Arc::new(RagConfig::default());
    let fulltext = Arc::new(SubstringIndex::new());
    let vector_store = Arc::new(vector_store);
    let engine = HybridSearchEngine::new(
        vector_store as Arc<dyn VectorStore>,
        fulltext as Arc<dyn FulltextIndexer>,
        Arc::new(FakeEmbedder),
        Some(Arc::new(NoopReranker)),
        config,
    );

    let mut results =
        engine.search(&kb_id.to_string(), "query", 2, SearchMode::Vector, Some(0.05)).await.unwrap();
    assert_eq!(results.iter().map(|m| m.chunk_id.as_str()).collect::<Vec<_>>(), vec!["c5", "c6"]);

    engine.expand_neighbors(&kb_id.to_string(), &mut results, 2, 1).await;

    let mut ids: Vec<&str> = results.iter().map(|m| m.chunk_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["c4", "c5", "c6"]);

    let unique: std::collections::HashSet<&str> = results.iter().map(|m| m.chunk_id.as_str()).collect();
    assert_eq!(unique.len(), results.len(), "neighbour expansion must not duplicate an already-present hit");
}
