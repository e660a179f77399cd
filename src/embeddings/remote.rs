use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::Embedder;
use crate::config::EmbedderConfig;
use crate::error::{RagError, RagResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// OpenAI-compatible / DashScope-style remote embedding client. Both
/// provider families speak the same `{model, input} -> {data: [{embedding}]}`
/// shape over HTTPS, so one client covers §4.3's two concrete
/// implementations. Calls are serialized through a mutex to honor
/// per-client rate limits.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
    call_lock: Mutex<()>,
}

impl RemoteEmbedder {
    pub fn new(config: &EmbedderConfig) -> RagResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RagError::upstream("embedder_client_build", e.into()))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimensions: config.dimensions,
            call_lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, text: &str) -> RagResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(RagError::validation("embed", "input text must not be empty"));
        }

        let _guard = self.call_lock.lock().await;

        let body = EmbeddingRequest {
            model: &self.model,
            input: text,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::upstream("embed", e.into()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::upstream(
                "embed",
                anyhow::anyhow!("embedder returned {status}: {text}"),
            ));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RagError::upstream("embed", e.into()))?;

        parsed
            .data
            .pop()
            .map(|d| d.embedding)
            .ok_or_else(|| RagError::upstream("embed", anyhow::anyhow!("embedder returned no embedding")))
    }

    async fn count_tokens(&self, text: &str) -> RagResult<usize> {
        Ok(heuristic_token_count(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn ready(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Whitespace/byte heuristic bound to the active embedder (Open Question,
/// decided in DESIGN.md): CJK char ≈1.0, Latin word ≈0.65, digit ≈1.0,
/// punctuation ≈0.8 tokens, floored at `len/6` and capped at `2·len`.
pub fn heuristic_token_count(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let mut estimate = 0.0f64;
    for word in text.split_whitespace() {
        for ch in word.chars() {
            if ch.is_ascii_digit() {
                estimate += 1.0;
            } else if ch.is_ascii_punctuation() {
                estimate += 0.8;
            } else if is_cjk(ch) {
                estimate += 1.0;
            }
        }
        if word.chars().any(|c| c.is_alphabetic() && !is_cjk(c)) {
            estimate += 0.65;
        }
    }

    let len = text.len();
    let floor = (len as f64 / 6.0).ceil();
    let ceiling = (len as f64) * 2.0;
    estimate.max(floor).min(ceiling).round() as usize
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x4E00..=0x9FFF | 0x3040..=0x30FF | 0xAC00..=0xD7A3
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_counts_latin_words() {
        let count = heuristic_token_count("the quick brown fox");
        assert!(count > 0);
    }

    #[test]
    fn heuristic_counts_cjk_chars() {
        let count = heuristic_token_count("你好世界");
        assert_eq!(count, 4);
    }

    #[test]
    fn heuristic_empty_text_is_zero() {
        assert_eq!(heuristic_token_count(""), 0);
    }

    #[test]
    fn heuristic_respects_floor_and_ceiling() {
        let text = "a".repeat(1000);
        let count = heuristic_token_count(&text);
        let len = text.len();
        assert!(count as f64 >= (len as f64 / 6.0).floor());
        assert!(count as f64 <= (len as f64) * 2.0);
    }
}
