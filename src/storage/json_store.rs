use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{fit_dimension, VectorRecord, VectorStore};
use crate::error::{RagError, RagResult};
use crate::types::SearchMatch;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVector {
    chunk_id: String,
    document_id: String,
    chunk_index: u32,
    content: String,
    vector: Vec<f32>,
}

/// Database-backed fallback `VectorStore`: vectors persisted as JSON
/// alongside chunks, cosine similarity computed in-process. Used in tests
/// and whenever no LanceDB directory is configured. One file per KB under
/// `data_dir/<kb_id>.json`; `candidate_limit` bounds how much of the
/// collection is scanned per search.
pub struct JsonVectorStore {
    data_dir: PathBuf,
    dimension: usize,
    collections: RwLock<HashMap<String, Vec<StoredVector>>>,
}

impl JsonVectorStore {
    pub fn new(data_dir: PathBuf, dimension: usize) -> Self {
        Self {
            data_dir,
            dimension,
            collections: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, kb_id: &str) -> PathBuf {
        self.data_dir.join(format!("{kb_id}.json"))
    }

    fn load(&self, kb_id: &str) {
        let mut collections = self.collections.write();
        if collections.contains_key(kb_id) {
            return;
        }
        let path = self.path_for(kb_id);
        let records = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        collections.insert(kb_id.to_string(), records);
    }

    fn persist(&self, kb_id: &str) -> RagResult<()> {
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| RagError::upstream("vector_persist", e.into()))?;
        let collections = self.collections.read();
        if let Some(records) = collections.get(kb_id) {
            let json = serde_json::to_string(records)
                .map_err(|e| RagError::upstream("vector_persist", e.into()))?;
            std::fs::write(self.path_for(kb_id), json)
                .map_err(|e| RagError::upstream("vector_persist", e.into()))?;
        }
        Ok(())
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }
}

#[async_trait]
impl VectorStore for JsonVectorStore {
    async fn upsert(&self, kb_id: &str, record: VectorRecord) -> RagResult<String> {
        self.load(kb_id);
        let vector = fit_dimension(record.vector, self.dimension, &record.chunk_id);
        {
            let mut collections = self.collections.write();
            let records = collections.entry(kb_id.to_string()).or_default();
            records.retain(|r| r.chunk_id != record.chunk_id);
            records.push(StoredVector {
                chunk_id: record.chunk_id.clone(),
                document_id: record.document_id,
                chunk_index: record.chunk_index,
                content: record.content,
                vector,
            });
        }
        self.persist(kb_id)?;
        Ok(format!("json_{}", record.chunk_id))
    }

    async fn delete_document(&self, kb_id: &str, document_id: &str) -> RagResult<usize> {
        self.load(kb_id);
        let removed = {
            let mut collections = self.collections.write();
            let records = collections.entry(kb_id.to_string()).or_default();
            let before = records.len();
            records.retain(|r| r.document_id != document_id);
            before - records.len()
        };
        if removed > 0 {
            self.persist(kb_id)?;
        }
        Ok(removed)
    }

    async fn search(
        &self,
        kb_id: &str,
        query_vec: &[f32],
        limit: usize,
        candidate_limit: usize,
        threshold: f32,
    ) -> RagResult<Vec<SearchMatch>> {
        self.load(kb_id);
        let collections = self.collections.read();
        let Some(records) = collections.get(kb_id) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(f32, &StoredVector)> = records
            .iter()
            .take(candidate_limit)
            .map(|r| (Self::cosine_similarity(query_vec, &r.vector), r))
            .filter(|(score, _)| *score >= threshold)
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.chunk_id.cmp(&b.1.chunk_id))
        });
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(score, r)| SearchMatch {
                chunk_id: r.chunk_id.clone(),
                document_id: r.document_id.clone(),
                content: r.content.clone(),
                score,
                metadata: HashMap::from([("chunk_index".to_string(), r.chunk_index.to_string())]),
                highlight: None,
            })
            .collect())
    }

    async fn get_neighbors(
        &self,
        kb_id: &str,
        document_id: &str,
        chunk_index: u32,
        window: u32,
    ) -> RagResult<Vec<SearchMatch>> {
        self.load(kb_id);
        let collections = self.collections.read();
        let Some(records) = collections.get(kb_id) else {
            return Ok(Vec::new());
        };

        let low = chunk_index.saturating_sub(window);
        let high = chunk_index.saturating_add(window);

        let mut neighbors: Vec<&StoredVector> = records
            .iter()
            .filter(|r| {
                r.document_id == document_id
                    && r.chunk_index >= low
                    && r.chunk_index <= high
                    && r.chunk_index != chunk_index
            })
            .collect();
        neighbors.sort_by_key(|r| r.chunk_index);

        Ok(neighbors
            .into_iter()
            .map(|r| SearchMatch {
                chunk_id: r.chunk_id.clone(),
                document_id: r.document_id.clone(),
                content: r.content.clone(),
                score: 0.0,
                metadata: HashMap::from([("chunk_index".to_string(), r.chunk_index.to_string())]),
                highlight: None,
            })
            .collect())
    }

    async fn ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(chunk_id: &str, document_id: &str, chunk_index: u32, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            chunk_id: chunk_id.to_string(),
            document_id: document_id.to_string(),
            chunk_index,
            content: format!("content for {chunk_id}"),
            vector,
        }
    }

    fn temp_store(dim: usize) -> JsonVectorStore {
        let dir = std::env::temp_dir().join(format!("rag-json-store-test-{}", uuid::Uuid::new_v4()));
        JsonVectorStore::new(dir, dim)
    }

    #[tokio::test]
    async fn upsert_then_search_returns_top_match() {
        let store = temp_store(3);
        store.upsert("kb1", make_record("c1", "d1", 0, vec![1.0, 0.0, 0.0])).await.unwrap();
        store.upsert("kb1", make_record("c2", "d1", 1, vec![0.0, 1.0, 0.0])).await.unwrap();

        let results = store.search("kb1", &[1.0, 0.0, 0.0], 10, 100, 0.0).await.unwrap();
        assert_eq!(results[0].chunk_id, "c1");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn search_respects_threshold() {
        let store = temp_store(3);
        store.upsert("kb1", make_record("c1", "d1", 0, vec![1.0, 0.0, 0.0])).await.unwrap();
        store.upsert("kb1", make_record("c2", "d1", 1, vec![-1.0, 0.0, 0.0])).await.unwrap();

        let results = store.search("kb1", &[1.0, 0.0, 0.0], 10, 100, 0.5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "c1");
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_chunk_id() {
        let store = temp_store(3);
        store.upsert("kb1", make_record("c1", "d1", 0, vec![1.0, 0.0, 0.0])).await.unwrap();
        store.upsert("kb1", make_record("c1", "d1", 0, vec![0.0, 0.0, 1.0])).await.unwrap();

        let results = store.search("kb1", &[0.0, 0.0, 1.0], 10, 100, 0.0).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn delete_document_removes_only_its_chunks() {
        let store = temp_store(3);
        store.upsert("kb1", make_record("c1", "d1", 0, vec![1.0, 0.0, 0.0])).await.unwrap();
        store.upsert("kb1", make_record("c2", "d2", 0, vec![0.0, 1.0, 0.0])).await.unwrap();

        let removed = store.delete_document("kb1", "d1").await.unwrap();
        assert_eq!(removed, 1);

        let results = store.search("kb1", &[1.0, 1.0, 0.0], 10, 100, -1.0).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "c2");
    }

    #[tokio::test]
    async fn delete_document_is_idempotent() {
        let store = temp_store(3);
        store.upsert("kb1", make_record("c1", "d1", 0, vec![1.0, 0.0, 0.0])).await.unwrap();
        store.delete_document("kb1", "d1").await.unwrap();
        let second = store.delete_document("kb1", "d1").await.unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn get_neighbors_excludes_self_and_respects_window() {
        let store = temp_store(3);
        for i in 0..5u32 {
            store
                .upsert("kb1", make_record(&format!("c{i}"), "d1", i, vec![1.0, 0.0, 0.0]))
                .await
                .unwrap();
        }
        let neighbors = store.get_neighbors("kb1", "d1", 2, 1).await.unwrap();
        let ids: Vec<&str> = neighbors.iter().map(|m| m.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c3"]);
    }

    #[tokio::test]
    async fn fit_dimension_applied_on_upsert() {
        let store = temp_store(2);
        store.upsert("kb1", make_record("c1", "d1", 0, vec![1.0, 2.0, 3.0])).await.unwrap();
        let results = store.search("kb1", &[1.0, 2.0], 10, 100, -1.0).await.unwrap();
        assert_eq!(results.len(), 1);
    }
}
