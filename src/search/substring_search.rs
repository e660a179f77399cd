use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{highlight_snippet, FulltextIndexer};
use crate::error::RagResult;
use crate::types::SearchMatch;

#[derive(Debug, Clone)]
struct IndexedChunk {
    chunk_id: String,
    document_id: String,
    content: String,
}

/// Fallback `FulltextIndexer`: case-insensitive substring matching with a
/// constant score, used when Tantivy is unavailable. Scoped per KB, same
/// as `TextSearch`.
pub struct SubstringIndex {
    collections: RwLock<HashMap<String, Vec<IndexedChunk>>>,
}

const SUBSTRING_MATCH_SCORE: f32 = 0.6;

impl SubstringIndex {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for SubstringIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FulltextIndexer for SubstringIndex {
    async fn index(&self, kb_id: &str, chunk_id: &str, document_id: &str, content: &str) -> RagResult<()> {
        let mut collections = self.collections.write();
        let chunks = collections.entry(kb_id.to_string()).or_default();
        chunks.retain(|c| c.chunk_id != chunk_id);
        chunks.push(IndexedChunk {
            chunk_id: chunk_id.to_string(),
            document_id: document_id.to_string(),
            content: content.to_string(),
        });
        Ok(())
    }

    async fn remove_document(&self, kb_id: &str, document_id: &str) -> RagResult<usize> {
        let mut collections = self.collections.write();
        let Some(chunks) = collections.get_mut(kb_id) else {
            return Ok(0);
        };
        let before = chunks.len();
        chunks.retain(|c| c.document_id != document_id);
        Ok(before - chunks.len())
    }

    async fn search(&self, kb_id: &str, query: &str, limit: usize) -> RagResult<Vec<SearchMatch>> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let collections = self.collections.read();
        let Some(chunks) = collections.get(kb_id) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<SearchMatch> = chunks
            .iter()
            .filter(|c| {
                let lower = c.content.to_lowercase();
                terms.iter().any(|t| lower.contains(t.as_str()))
            })
            .map(|c| SearchMatch {
                chunk_id: c.chunk_id.clone(),
                document_id: c.document_id.clone(),
                content: c.content.clone(),
                score: SUBSTRING_MATCH_SCORE,
                metadata: HashMap::new(),
                highlight: highlight_snippet(&c.content, query, 40),
            })
            .collect();

        matches.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn search_matches_case_insensitively() {
        let idx = SubstringIndex::new();
        idx.index("kb1", "c1", "d1", "The Quick Brown Fox").await.unwrap();

        let results = idx.search("kb1", "quick", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, SUBSTRING_MATCH_SCORE);
    }

    #[tokio::test]
    async fn search_is_scoped_to_kb_id() {
        let idx = SubstringIndex::new();
        idx.index("kb1", "c1", "d1", "alpha").await.unwrap();
        idx.index("kb2", "c2", "d2", "alpha").await.unwrap();

        let results = idx.search("kb1", "alpha", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "c1");
    }

    #[tokio::test]
    async fn remove_document_removes_only_its_chunks() {
        let idx = SubstringIndex::new();
        idx.index("kb1", "c1", "d1", "alpha").await.unwrap();
        idx.index("kb1", "c2", "d2", "alpha").await.unwrap();

        let removed = idx.remove_document("kb1", "d1").await.unwrap();
        assert_eq!(removed, 1);

        let results = idx.search("kb1", "alpha", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "c2");
    }

    #[tokio::test]
    async fn index_is_idempotent_on_chunk_id() {
        let idx = SubstringIndex::new();
        idx.index("kb1", "c1", "d1", "alpha").await.unwrap();
        idx.index("kb1", "c1", "d1", "beta").await.unwrap();

        let results = idx.search("kb1", "beta", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        let none = idx.search("kb1", "alpha", 10).await.unwrap();
        assert!(none.is_empty());
    }
}
