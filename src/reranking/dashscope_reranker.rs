use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{Reranker, RerankedMatch};
use crate::config::RerankerConfig;
use crate::error::{RagError, RagResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResultItem>,
}

#[derive(Debug, Deserialize)]
struct RerankResultItem {
    index: usize,
    relevance_score: f32,
}

/// Remote DashScope-native rerank endpoint. Requests are serialized through
/// a mutex, mirroring the embedder client's rate-limit discipline (§5).
pub struct DashScopeReranker {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    call_lock: Mutex<()>,
}

impl DashScopeReranker {
    pub fn new(config: &RerankerConfig) -> RagResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RagError::upstream("reranker_client_build", e.into()))?;

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
impl Reranker for DashScopeReranker {
    async fn rerank(&self, query: &str, candidates: &[String]) -> RagResult<Vec<RerankedMatch>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.call_lock.lock().await;

        let body = RerankRequest {
            model: &self.model,
            query,
            documents: candidates,
        };

        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::upstream("reranker_request", e.into()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::upstream(
                "reranker_request",
                anyhow::anyhow!("reranker returned {status}: {text}"),
            ));
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| RagError::upstream("reranker_parse", e.into()))?;

        let mut results: Vec<RerankedMatch> = parsed
            .results
            .into_iter()
            .map(|r| RerankedMatch {
                index: r.index,
                score: r.relevance_score,
                rank: 0,
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        for (rank, result) in results.iter_mut().enumerate() {
            result.rank = rank + 1;
        }

        Ok(results)
    }

    async fn ready(&self) -> bool {
        !self.api_key.is_empty()
    }
}
