use async_trait::async_trait;

use super::{Reranker, RerankedMatch};
use crate::error::RagResult;

/// Pass-through re-ranker: preserves the incoming candidate order and rank,
/// scoring each by its distance from the front (higher = earlier). Used when
/// no re-ranker is configured or the primary one fails to initialize (§4.6).
pub struct NoopReranker;

#[async_trait]
impl Reranker for NoopReranker {
    async fn rerank(&self, _query: &str, candidates: &[String]) -> RagResult<Vec<RerankedMatch>> {
        Ok(candidates
            .iter()
            .enumerate()
            .map(|(index, _)| RerankedMatch {
                index,
                score: 1.0 - (index as f32 * 1e-6),
                rank: index + 1,
            })
            .collect())
    }

    async fn ready(&self) -> bool {
        true
    }
}
