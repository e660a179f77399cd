use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::GeneratorConfig;
use crate::embeddings::remote::heuristic_token_count;
use crate::error::{RagError, RagResult};
use crate::types::SearchMatch;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Invoked by the `ContextAssembler` (fallback mode) and directly by the
/// engine (full-read mode) to produce a generated answer from assembled
/// context. No local/ONNX inference is in scope; this is always a network
/// collaborator, mirroring the embedder/reranker clients.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> RagResult<String>;

    async fn ready(&self) -> bool;
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<CompletionMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct CompletionMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessageOut,
}

#[derive(Debug, Deserialize)]
struct CompletionMessageOut {
    content: String,
}

/// Remote OpenAI-compatible chat-completion client, serialized like the
/// embedder/re-ranker clients through a mutex.
pub struct RemoteGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    call_lock: Mutex<()>,
}

impl RemoteGenerator {
    pub fn new(config: &GeneratorConfig) -> RagResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RagError::upstream("generator_client_build", e.into()))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            call_lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl Generator for RemoteGenerator {
    async fn generate(&self, prompt: &str) -> RagResult<String> {
        let _guard = self.call_lock.lock().await;

        let body = CompletionRequest {
            model: &self.model,
            messages: vec![CompletionMessage { role: "user", content: prompt }],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::upstream("generate", e.into()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::upstream("generate", anyhow::anyhow!("generator returned {status}: {text}")));
        }

        let mut parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| RagError::upstream("generate", e.into()))?;

        parsed
            .choices
            .pop()
            .map(|c| c.message.content)
            .ok_or_else(|| RagError::upstream("generate", anyhow::anyhow!("generator returned no choices")))
    }

    async fn ready(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Builds a token-bounded prompt context from ranked (and neighbour-expanded)
/// chunks, optionally invoking a `Generator` over it (§4.9 fallback mode).
pub struct ContextAssembler {
    generator: Option<std::sync::Arc<dyn Generator>>,
}

impl ContextAssembler {
    pub fn new(generator: Option<std::sync::Arc<dyn Generator>>) -> Self {
        Self { generator }
    }

    /// Concatenates `results` in document order (merging adjacent chunks by
    /// `chunk_index` to remove duplication), greedily including until
    /// `token_budget` is hit, then optionally hands the assembled context to
    /// the generator. Always returns a single synthetic `SearchMatch`.
    pub async fn assemble(&self, query: &str, results: &[SearchMatch], token_budget: usize) -> SearchMatch {
        let ordered = Self::order_and_dedup(results);

        let mut context = String::new();
        let mut chunk_ids = Vec::new();
        let mut token_count = 0usize;

        for m in &ordered {
            let piece_tokens = heuristic_token_count(&m.content);
            if token_count > 0 && token_count + piece_tokens > token_budget {
                break;
            }
            if !context.is_empty() {
                context.push_str("\n\n");
            }
            context.push_str(&m.content);
            chunk_ids.push(m.chunk_id.clone());
            token_count += piece_tokens;
        }

        let context_size = chunk_ids.len();
        let mut metadata = std::collections::HashMap::from([
            ("mode".to_string(), "fallback".to_string()),
            ("source".to_string(), "context_assembler".to_string()),
            ("token_count".to_string(), token_count.to_string()),
            ("chunk_ids".to_string(), chunk_ids.join(",")),
            ("context_size".to_string(), context_size.to_string()),
        ]);

        let mut content = context.clone();

        if let Some(generator) = &self.generator {
            let prompt = format!("Answer based on the following documents: {context}\n\nQuestion: {query}\n\nAnswer:");
            match generator.generate(&prompt).await {
                Ok(answer) => {
                    content = answer;
                    metadata.insert("source".to_string(), "generator".to_string());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "generator failed, returning raw assembled context");
                }
            }
        }

        SearchMatch {
            chunk_id: "context".to_string(),
            document_id: String::new(),
            content,
            score: 1.0,
            metadata,
            highlight: None,
        }
    }

    fn order_and_dedup(results: &[SearchMatch]) -> Vec<SearchMatch> {
        let mut ordered: Vec<&SearchMatch> = results.iter().collect();
        ordered.sort_by(|a, b| {
            a.document_id.cmp(&b.document_id).then_with(|| {
                let a_idx: u32 = a.metadata.get("chunk_index").and_then(|s| s.parse().ok()).unwrap_or(0);
                let b_idx: u32 = b.metadata.get("chunk_index").and_then(|s| s.parse().ok()).unwrap_or(0);
                a_idx.cmp(&b_idx)
            })
        });

        let mut deduped: Vec<SearchMatch> = Vec::with_capacity(ordered.len());
        for m in ordered {
            if deduped.last().is_some_and(|prev| prev.chunk_id == m.chunk_id) {
                continue;
            }
            deduped.push(m.clone());
        }
        deduped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_match(chunk_id: &str, document_id: &str, chunk_index: u32, content: &str) -> SearchMatch {
        SearchMatch {
            chunk_id: chunk_id.to_string(),
            document_id: document_id.to_string(),
            content: content.to_string(),
            score: 0.9,
            metadata: HashMap::from([("chunk_index".to_string(), chunk_index.to_string())]),
            highlight: None,
        }
    }

    #[tokio::test]
    async fn assembles_context_without_generator() {
        let assembler = ContextAssembler::new(None);
        let results = vec![
            make_match("c2", "d1", 1, "second chunk"),
            make_match("c1", "d1", 0, "first chunk"),
        ];
        let assembled = assembler.assemble("what happened?", &results, 10_000).await;
        assert_eq!(assembled.metadata["source"], "context_assembler");
        assert!(assembled.content.starts_with("first chunk"));
        assert!(assembled.content.contains("second chunk"));
    }

    #[tokio::test]
    async fn deduplicates_same_chunk_id() {
        let assembler = ContextAssembler::new(None);
        let results = vec![
            make_match("c1", "d1", 0, "first chunk"),
            make_match("c1", "d1", 0, "first chunk"),
        ];
        let assembled = assembler.assemble("q", &results, 10_000).await;
        assert_eq!(assembled.metadata["chunk_ids"], "c1");
    }

    #[tokio::test]
    async fn respects_token_budget() {
        let assembler = ContextAssembler::new(None);
        let results = vec![
            make_match("c1", "d1", 0, &"a".repeat(100)),
            make_match("c2", "d1", 1, &"b".repeat(100)),
        ];
        let assembled = assembler.assemble("q", &results, 5).await;
        assert_eq!(assembled.metadata["context_size"], "1");
    }
}
