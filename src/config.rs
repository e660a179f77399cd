use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level, validated options record for the crate (§5.3/§9). Every nested
/// struct rejects unknown keys so a typo in a deployed config surfaces at
/// load time rather than silently falling back to a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RagConfig {
    pub data_dir: PathBuf,
    pub chunking: ChunkingConfig,
    pub search: SearchConfig,
    pub embedder: EmbedderConfig,
    pub reranker: RerankerConfig,
    pub generator: Option<GeneratorConfig>,
    pub vector_store: VectorStoreConfig,
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub related_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchConfig {
    pub default_k: usize,
    pub candidate_multiplier: usize,
    pub vector_weight: f32,
    pub fulltext_weight: f32,
    pub vector_threshold: f32,
    pub rerank_top_n_cap: usize,
    pub search_cache_ttl_secs: u64,
    /// Token budget the `ContextAssembler` greedily fills for fallback-mode
    /// queries (§4.9); distinct from `vector_store.full_read_budget_tokens`,
    /// which gates the ingest-time full_read/fallback routing decision.
    pub context_token_budget: usize,
}

impl SearchConfig {
    pub fn search_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.search_cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbedderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub dimensions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RerankerConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VectorStoreConfig {
    /// Directory for the LanceDB database, or the JSON-fallback store's data dir.
    pub path: PathBuf,
    pub collection_prefix: String,
    pub full_read_budget_tokens: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureFlags {
    pub enable_reranking: bool,
}

impl RagConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedder.dimensions == 0 {
            return Err("embedder.dimensions must be > 0".into());
        }
        if self.chunking.chunk_size < 50 {
            return Err("chunking.chunk_size must be >= 50".into());
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err("chunking.chunk_overlap must be < chunk_size".into());
        }
        if self.chunking.min_chunk_size >= self.chunking.chunk_size {
            return Err("chunking.min_chunk_size must be < chunk_size".into());
        }
        if self.chunking.max_chunk_size < self.chunking.chunk_size {
            return Err("chunking.max_chunk_size must be >= chunk_size".into());
        }
        if self.search.default_k == 0 {
            return Err("search.default_k must be > 0".into());
        }
        if self.search.candidate_multiplier == 0 {
            return Err("search.candidate_multiplier must be > 0".into());
        }
        let weight_sum = self.search.vector_weight + self.search.fulltext_weight;
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(format!(
                "search.vector_weight + search.fulltext_weight must sum to 1.0 (got {})",
                weight_sum
            ));
        }
        if !(0.0..=1.0).contains(&self.search.vector_threshold) {
            return Err("search.vector_threshold must be in [0.0, 1.0]".into());
        }
        if self.vector_store.full_read_budget_tokens == 0 {
            return Err("vector_store.full_read_budget_tokens must be > 0".into());
        }
        if self.search.context_token_budget == 0 {
            return Err("search.context_token_budget must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file. Unknown keys are rejected (see module docs).
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, String> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rag-engine");

        Self {
            vector_store: VectorStoreConfig {
                path: data_dir.join("lancedb"),
                collection_prefix: "kb".to_string(),
                full_read_budget_tokens: 1_000_000,
                max_retries: 3,
            },
            data_dir,
            chunking: ChunkingConfig {
                chunk_size: 900,
                chunk_overlap: 225,
                min_chunk_size: 100,
                max_chunk_size: 1400,
                related_chunk_size: 1,
            },
            search: SearchConfig {
                default_k: 10,
                candidate_multiplier: 2,
                vector_weight: 0.6,
                fulltext_weight: 0.4,
                vector_threshold: 0.1,
                rerank_top_n_cap: 50,
                search_cache_ttl_secs: 300,
                context_token_budget: 8_000,
            },
            embedder: EmbedderConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: String::new(),
                model: "text-embedding-3-small".to_string(),
                dimensions: 1536,
            },
            reranker: RerankerConfig {
                base_url: "https://dashscope.aliyuncs.com/api/v1".to_string(),
                api_key: String::new(),
                model: "gte-rerank".to_string(),
            },
            generator: None,
            features: FeatureFlags {
                enable_reranking: true,
            },
        }
    }
}
