use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Domain entities (§3 of the design). These are the crate's public, persistence-agnostic
/// view of a knowledge base; `MetadataStore` implementations map them onto SQL rows.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    /// Free-form JSON config: model choice, fusion weights, thresholds.
    pub config: serde_json::Value,
    pub visibility: KnowledgeBaseVisibility,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeBaseVisibility {
    Private,
    Shared,
    Public,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    FullRead,
    Fallback,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploading,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub kb_id: Uuid,
    pub title: String,
    pub source: String,
    pub blob_ref: String,
    pub total_tokens: u64,
    pub processing_mode: Option<ProcessingMode>,
    pub status: DocumentStatus,
    pub metadata: HashMap<String, String>,
}

/// A contiguous text fragment of a document — the unit of retrieval.
/// `prev_chunk_id`/`next_chunk_id` are arena-style references (Uuid values
/// into the chunks table), never owning pointers, so a document's chunks
/// form a linked list without ever constructing an in-memory cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub kb_id: Uuid,
    pub chunk_index: u32,
    pub content: String,
    pub token_count: u32,
    pub prev_chunk_id: Option<Uuid>,
    pub next_chunk_id: Option<Uuid>,
    pub chunk_position: f32,
    pub document_total_tokens: u64,
    pub vector_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRecord {
    pub kb_id: Uuid,
    pub user: String,
    pub query: String,
    pub result_snapshot: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Search mode requested by the caller (§4.8).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Auto,
    Vector,
    Fulltext,
    Hybrid,
}

/// A single retrieval hit, as returned by `VectorStore::search`, `FulltextIndexer::search`,
/// and the fused output of `HybridSearchEngine::search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchMatch {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub score: f32,
    pub metadata: HashMap<String, String>,
    pub highlight: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum DocumentFormat {
    TXT,
    MD,
    PDF,
    DOCX,
    Spreadsheet,
}

impl DocumentFormat {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "txt" => Self::TXT,
            "md" | "markdown" => Self::MD,
            "pdf" => Self::PDF,
            "docx" => Self::DOCX,
            "xlsx" => Self::Spreadsheet,
            _ => Self::TXT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_format_dispatches_by_extension() {
        assert_eq!(DocumentFormat::from_extension("PDF"), DocumentFormat::PDF);
        assert_eq!(DocumentFormat::from_extension("docx"), DocumentFormat::DOCX);
        assert_eq!(DocumentFormat::from_extension("xlsx"), DocumentFormat::Spreadsheet);
        assert_eq!(DocumentFormat::from_extension("unknown_ext"), DocumentFormat::TXT);
    }
}
