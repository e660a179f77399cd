pub mod dashscope_reranker;
pub mod noop;

pub use dashscope_reranker::DashScopeReranker;
pub use noop::NoopReranker;

use async_trait::async_trait;

use crate::error::RagResult;

/// A single re-ranked candidate: the original index into the request slice,
/// the re-ranker's score, and its 1-based rank in the returned ordering.
#[derive(Debug, Clone)]
pub struct RerankedMatch {
    pub index: usize,
    pub score: f32,
    pub rank: usize,
}

/// Re-scores a (query, candidate) set, returning results ordered best-first
/// (§4.6). Implementations: `DashScopeReranker` (remote HTTP, primary) and
/// `NoopReranker` (pass-through, preserves incoming order, used when no
/// re-ranker is configured or one fails to initialize).
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, candidates: &[String]) -> RagResult<Vec<RerankedMatch>>;

    async fn ready(&self) -> bool;
}
