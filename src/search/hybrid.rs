use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{QueryAnalyzer, QueryClass, WeightAdjuster};
use crate::config::RagConfig;
use crate::embeddings::Embedder;
use crate::error::{RagError, RagResult};
use crate::reranking::Reranker;
use crate::search::FulltextIndexer;
use crate::storage::VectorStore;
use crate::types::{SearchMatch, SearchMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HybridSource {
    Vector,
    TextSearch,
    Both,
}

/// Asymmetric weighted-linear fusion (§4.8). Lexical scores are min-max
/// normalised by the maximum lexical score in the current result set; vector
/// scores are used as-is. `seed = vector_score·w_v (+ normalised_lexical·w_f)`.
/// Content/highlight are filled from whichever leg provides them first
/// (vector leg preferred). Sorted descending, tie-break by lower chunk_id.
pub fn fuse_hybrid(
    vector_results: &[SearchMatch],
    lexical_results: &[SearchMatch],
    w_v: f32,
    w_f: f32,
) -> Vec<(SearchMatch, HybridSource)> {
    let max_lexical = lexical_results
        .iter()
        .map(|m| m.score)
        .fold(f32::MIN, f32::max);

    let normalize_lexical = |score: f32| -> f32 {
        if max_lexical > 0.0 {
            (score / max_lexical).clamp(0.0, 1.0)
        } else {
            0.0
        }
    };

    let mut fused: HashMap<String, (f32, HybridSource, SearchMatch)> = HashMap::new();

    for m in vector_results {
        let score = m.score * w_v;
        fused.insert(m.chunk_id.clone(), (score, HybridSource::Vector, m.clone()));
    }

    for m in lexical_results {
        let contribution = normalize_lexical(m.score) * w_f;
        fused
            .entry(m.chunk_id.clone())
            .and_modify(|(score, source, existing)| {
                *score += contribution;
                *source = HybridSource::Both;
                if existing.highlight.is_none() {
                    existing.highlight = m.highlight.clone();
                }
            })
            .or_insert((contribution, HybridSource::TextSearch, m.clone()));
    }

    let mut merged: Vec<(SearchMatch, HybridSource)> = fused
        .into_iter()
        .map(|(_, (score, source, mut m))| {
            m.score = score;
            (m, source)
        })
        .collect();

    merged.sort_by(|a, b| {
        b.0.score
            .partial_cmp(&a.0.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.chunk_id.cmp(&b.0.chunk_id))
    });

    merged
}

struct RetrievalLegs {
    enable_vector: bool,
    enable_lexical: bool,
    document_filter: Option<Vec<String>>,
}

/// Fans out a query to the vector and lexical indices, fuses their results,
/// optionally re-ranks, and leaves neighbour expansion to the caller (§4.8).
/// Stateless aside from a swappable configuration reference.
pub struct HybridSearchEngine {
    vector_store: Arc<dyn VectorStore>,
    fulltext: Arc<dyn FulltextIndexer>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    config: RwLock<Arc<RagConfig>>,
}

impl HybridSearchEngine {
    pub fn new(
        vector_store: Arc<dyn VectorStore>,
        fulltext: Arc<dyn FulltextIndexer>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        config: Arc<RagConfig>,
    ) -> Self {
        Self {
            vector_store,
            fulltext,
            embedder,
            reranker,
            config: RwLock::new(config),
        }
    }

    /// Atomically swaps the configuration; in-flight searches keep their
    /// already-captured `Arc<RagConfig>` clone.
    pub fn set_config(&self, config: Arc<RagConfig>) {
        *self.config.write() = config;
    }

    fn current_config(&self) -> Arc<RagConfig> {
        self.config.read().clone()
    }

    fn plan_legs(mode: SearchMode, class: QueryClass) -> RetrievalLegs {
        match mode {
            SearchMode::Vector => RetrievalLegs {
                enable_vector: true,
                enable_lexical: false,
                document_filter: None,
            },
            SearchMode::Fulltext => RetrievalLegs {
                enable_vector: false,
                enable_lexical: true,
                document_filter: None,
            },
            SearchMode::Hybrid => RetrievalLegs {
                enable_vector: true,
                enable_lexical: true,
                document_filter: None,
            },
            // All `auto` sub-strategies (lexical-first, vector-first-with-probe,
            // plain hybrid) run both legs; they differ in weighting (WeightAdjuster)
            // and, for Question/LongForm, an added document-id probe filter
            // applied by the caller in `search()`.
            SearchMode::Auto => {
                let _ = class;
                RetrievalLegs {
                    enable_vector: true,
                    enable_lexical: true,
                    document_filter: None,
                }
            }
        }
    }

    /// `{kb_id, query, limit, mode, vector_threshold}` → fused `SearchMatch`es (§4.8).
    pub async fn search(
        &self,
        kb_id: &str,
        query: &str,
        limit: usize,
        mode: SearchMode,
        vector_threshold: Option<f32>,
    ) -> RagResult<Vec<SearchMatch>> {
        let config = self.current_config();
        let class = QueryAnalyzer::classify(query);
        let legs = Self::plan_legs(mode, class);

        if !legs.enable_vector && !legs.enable_lexical {
            return Err(RagError::validation("hybrid_search", "both retrieval legs disabled"));
        }

        let candidate_limit = limit * config.search.candidate_multiplier;
        let threshold = vector_threshold.unwrap_or(config.search.vector_threshold);

        // For auto-mode long/question queries, probe the lexical leg over the
        // top-3 keywords first to restrict vector search to relevant documents.
        if legs.enable_vector
            && legs.enable_lexical
            && matches!(mode, SearchMode::Auto)
            && matches!(class, QueryClass::Question | QueryClass::LongForm)
        {
            let keywords: Vec<&str> = query.split_whitespace().take(3).collect();
            if !keywords.is_empty() {
                if let Ok(probe) = self.fulltext.search(kb_id, &keywords.join(" "), candidate_limit).await {
                    let doc_ids: Vec<String> = probe.iter().map(|m| m.document_id.clone()).collect();
                    if !doc_ids.is_empty() {
                        let mut legs = legs;
                        legs.document_filter = Some(doc_ids);
                        return self
                            .retrieve_and_fuse(kb_id, query, limit, candidate_limit, threshold, &legs, class, &config)
                            .await;
                    }
                }
            }
        }

        self.retrieve_and_fuse(kb_id, query, limit, candidate_limit, threshold, &legs, class, &config)
            .await
    }

    async fn retrieve_and_fuse(
        &self,
        kb_id: &str,
        query: &str,
        limit: usize,
        candidate_limit: usize,
        threshold: f32,
        legs: &RetrievalLegs,
        class: QueryClass,
        config: &RagConfig,
    ) -> RagResult<Vec<SearchMatch>> {
        let vector_fut = async {
            if !legs.enable_vector {
                return Ok(Vec::new());
            }
            let query_vec = self.embedder.embed(query).await?;
            self.vector_store
                .search(kb_id, &query_vec, candidate_limit, candidate_limit, threshold)
                .await
        };
        let lexical_fut = async {
            if !legs.enable_lexical {
                return Ok(Vec::new());
            }
            self.fulltext.search(kb_id, query, candidate_limit).await
        };

        let (vector_res, lexical_res) = tokio::join!(vector_fut, lexical_fut);

        let (mut vector_results, vector_failed) = match vector_res {
            Ok(r) => (r, false),
            Err(e) => {
                if legs.enable_lexical {
                    tracing::warn!(error = %e, "vector leg failed, continuing with lexical only");
                    (Vec::new(), true)
                } else {
                    return Err(e);
                }
            }
        };
        let (lexical_results, lexical_failed) = match lexical_res {
            Ok(r) => (r, false),
            Err(e) => {
                if legs.enable_vector {
                    tracing::warn!(error = %e, "lexical leg failed, continuing with vector only");
                    (Vec::new(), true)
                } else {
                    return Err(e);
                }
            }
        };

        if vector_failed && lexical_failed {
            return Err(RagError::upstream("hybrid_search", anyhow::anyhow!("both retrieval legs failed")));
        }

        if let Some(doc_ids) = &legs.document_filter {
            let allowed: std::collections::HashSet<&String> = doc_ids.iter().collect();
            vector_results.retain(|m| allowed.contains(&m.document_id));
        }

        let (w_v, w_f) = WeightAdjuster::adjust(class, config.search.vector_weight, config.search.fulltext_weight);

        let mut fused: Vec<SearchMatch> = if legs.enable_vector && legs.enable_lexical {
            fuse_hybrid(&vector_results, &lexical_results, w_v, w_f)
                .into_iter()
                .map(|(m, _)| m)
                .collect()
        } else if legs.enable_vector {
            vector_results
        } else {
            lexical_results
        };

        fused.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });

        self.maybe_rerank(query, &mut fused, limit, config.search.rerank_top_n_cap).await;

        fused.truncate(limit);
        Ok(fused)
    }

    async fn maybe_rerank(&self, query: &str, fused: &mut [SearchMatch], limit: usize, top_n_cap: usize) {
        let Some(reranker) = &self.reranker else { return };
        if fused.len() < 2 || !reranker.ready().await {
            return;
        }

        let rerank_count = (5 * limit).min(top_n_cap).min(fused.len());
        let candidates: Vec<String> = fused[..rerank_count].iter().map(|m| m.content.clone()).collect();

        match reranker.rerank(query, &candidates).await {
            Ok(mut reranked) => {
                reranked.sort_by_key(|r| r.rank);
                let head: Vec<SearchMatch> = reranked
                    .iter()
                    .filter_map(|r| fused.get(r.index).cloned().map(|mut m| {
                        m.score = r.score;
                        m
                    }))
                    .collect();
                let tail = fused[rerank_count..].to_vec();
                let mut rebuilt = head;
                rebuilt.extend(tail);
                fused[..rebuilt.len()].clone_from_slice(&rebuilt);
            }
            Err(e) => {
                tracing::warn!(error = %e, "re-ranking failed, keeping fused scores");
            }
        }
    }

    /// Attaches up to `window` previous/next neighbours to each of the
    /// first `limit` results via the chunk linked list, deduplicating by
    /// chunk_id. Content augmentation only — never changes scores.
    pub async fn expand_neighbors(&self, kb_id: &str, results: &mut Vec<SearchMatch>, limit: usize, window: u32) {
        if window == 0 {
            return;
        }
        let mut seen: std::collections::HashSet<String> = results.iter().map(|m| m.chunk_id.clone()).collect();
        let mut expansions = Vec::new();

        for result in results.iter().take(limit) {
            let chunk_index: u32 = result
                .metadata
                .get("chunk_index")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            if let Ok(neighbors) = self
                .vector_store
                .get_neighbors(kb_id, &result.document_id, chunk_index, window)
                .await
            {
                for neighbor in neighbors {
                    if seen.insert(neighbor.chunk_id.clone()) {
                        expansions.push(neighbor);
                    }
                }
            }
        }

        results.extend(expansions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_match(chunk_id: &str, score: f32, highlight: Option<&str>) -> SearchMatch {
        SearchMatch {
            chunk_id: chunk_id.to_string(),
            document_id: "d1".to_string(),
            content: format!("content {chunk_id}"),
            score,
            metadata: HashMap::new(),
            highlight: highlight.map(|s| s.to_string()),
        }
    }

    #[test]
    fn fuse_hybrid_combines_both_legs() {
        let vector = vec![make_match("c1", 0.9, None)];
        let lexical = vec![make_match("c1", 10.0, Some("hl")), make_match("c2", 5.0, None)];

        let fused = fuse_hybrid(&vector, &lexical, 0.6, 0.4);
        let c1 = fused.iter().find(|(m, _)| m.chunk_id == "c1").unwrap();
        assert!((c1.0.score - (0.9 * 0.6 + 1.0 * 0.4)).abs() < 1e-5);
        assert_eq!(c1.1, HybridSource::Both);
        assert_eq!(c1.0.highlight.as_deref(), Some("hl"));

        let c2 = fused.iter().find(|(m, _)| m.chunk_id == "c2").unwrap();
        assert_eq!(c2.1, HybridSource::TextSearch);
    }

    #[test]
    fn fuse_hybrid_sorts_descending_with_chunk_id_tiebreak() {
        let vector = vec![make_match("b", 0.5, None), make_match("a", 0.5, None)];
        let fused = fuse_hybrid(&vector, &[], 1.0, 0.0);
        assert_eq!(fused[0].0.chunk_id, "a");
        assert_eq!(fused[1].0.chunk_id, "b");
    }

    #[test]
    fn fuse_hybrid_handles_empty_lexical_leg() {
        let vector = vec![make_match("c1", 0.8, None)];
        let fused = fuse_hybrid(&vector, &[], 0.6, 0.4);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].0.score - 0.8 * 0.6).abs() < 1e-5);
    }
}
