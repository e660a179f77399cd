//! Hybrid retrieval engine: vector + lexical search fused and re-ranked per
//! knowledge base, with an ingestion pipeline that parses, chunks, embeds,
//! and indexes documents, and a fallback/full-read router for answer
//! generation over the retrieved context.

pub mod cache;
pub mod config;
pub mod context;
pub mod deadline;
pub mod embeddings;
pub mod error;
pub mod external;
pub mod ingestion;
pub mod processing;
pub mod registry;
pub mod reranking;
pub mod router;
pub mod search;
pub mod storage;
pub mod types;

pub use config::RagConfig;
pub use error::{RagError, RagResult};
pub use ingestion::IngestionPipeline;
pub use registry::Registry;
pub use router::ScenarioRouter;
pub use search::HybridSearchEngine;
pub use types::{Document, DocumentStatus, ProcessingMode, SearchMatch, SearchMode};
