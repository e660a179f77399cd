pub mod remote;

pub use remote::RemoteEmbedder;

use async_trait::async_trait;

use crate::error::RagResult;

/// Remote embedding collaborator (§4.3). Requests are serialized per-client
/// through a mutex to honor provider rate limits implicitly. Empty input is
/// rejected; failure is surfaced and the caller decides retry.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> RagResult<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Token count bound to this embedder's tokenization, used as the single
    /// source of truth for `document.total_tokens` and full-read routing (§9).
    async fn count_tokens(&self, text: &str) -> RagResult<usize>;

    fn dimensions(&self) -> usize;

    async fn ready(&self) -> bool;
}
