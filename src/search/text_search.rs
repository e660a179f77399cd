use anyhow::Context;
use async_trait::async_trait;
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{self, Schema, STORED, STRING, TEXT, Value as TantivyValue};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};

use super::{highlight_snippet, FulltextIndexer};
use crate::error::{RagError, RagResult};
use crate::types::SearchMatch;

pub struct TextSearch {
    index: Index,
    reader: IndexReader,
    writer: parking_lot::Mutex<IndexWriter>,
    id_field: schema::Field,
    text_field: schema::Field,
    document_field: schema::Field,
    kb_field: schema::Field,
}

impl TextSearch {
    /// Build the canonical schema. `id` must be STRING (indexed, not tokenized)
    /// so that `delete_term` and `TermQuery` lookups work correctly. `kb_id`
    /// is likewise STRING so it can be used as an exact-match scoping filter
    /// without the query parser tokenizing it.
    fn build_schema() -> (Schema, schema::Field, schema::Field, schema::Field, schema::Field) {
        let mut sb = Schema::builder();
        let id_field = sb.add_text_field("id", STRING | STORED);
        let text_field = sb.add_text_field("text", TEXT | STORED);
        let document_field = sb.add_text_field("document_id", STRING | STORED);
        let kb_field = sb.add_text_field("kb_id", STRING | STORED);
        (sb.build(), id_field, text_field, document_field, kb_field)
    }

    /// Check whether an existing index has `id` indexed (STRING).
    /// Old indices created `id` as STORED-only, which makes delete_term a no-op.
    fn needs_schema_migration(index: &Index) -> bool {
        let schema = index.schema();
        let id_field = match schema.get_field("id") {
            Ok(f) => f,
            Err(_) => return true,
        };
        let entry = schema.get_field_entry(id_field);
        !entry.is_indexed() || schema.get_field("kb_id").is_err()
    }

    pub fn new(path: &str) -> anyhow::Result<Self> {
        let index_path = Path::new(path).join("tantivy_index");
        std::fs::create_dir_all(&index_path).ok();

        let (schema, id_field, text_field, document_field, kb_field) = Self::build_schema();

        let needs_rebuild = {
            let dir = tantivy::directory::MmapDirectory::open(&index_path)?;
            if Index::exists(&dir)? {
                let existing = Index::open_in_dir(&index_path)?;
                let migrate = Self::needs_schema_migration(&existing);
                drop(existing);
                migrate
            } else {
                false
            }
        }; // dir dropped here — releases mmap handles on Windows

        let index = if needs_rebuild {
            tracing::warn!(
                "Tantivy index schema is stale (missing kb_id or unindexed id) — rebuilding. \
                 Existing full-text data will be re-indexed on next ingest."
            );
            std::fs::remove_dir_all(&index_path).ok();
            std::fs::create_dir_all(&index_path)?;
            Index::create_in_dir(&index_path, schema.clone())?
        } else {
            let dir = tantivy::directory::MmapDirectory::open(&index_path)?;
            if Index::exists(&dir)? {
                Index::open_in_dir(&index_path)?
            } else {
                Index::create_in_dir(&index_path, schema.clone())?
            }
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("Failed to create Tantivy reader")?;

        let writer = index
            .writer(50_000_000)
            .context("Failed to create Tantivy writer")?;

        Ok(Self {
            index,
            reader,
            writer: parking_lot::Mutex::new(writer),
            id_field,
            text_field,
            document_field,
            kb_field,
        })
    }

    fn index_one(&self, kb_id: &str, chunk_id: &str, document_id: &str, content: &str) -> anyhow::Result<()> {
        let writer = self.writer.lock();
        writer.add_document(doc!(
            self.id_field => chunk_id,
            self.text_field => content,
            self.document_field => document_id,
            self.kb_field => kb_id,
        ))?;
        writer.commit().context("Tantivy commit failed")?;
        drop(writer);
        self.reader.reload()?;
        Ok(())
    }

    fn search_scoped(&self, kb_id: &str, query: &str, limit: usize) -> anyhow::Result<Vec<SearchMatch>> {
        let searcher = self.reader.searcher();
        let query_parser = QueryParser::for_index(&self.index, vec![self.text_field]);

        let parsed_query = match query_parser.parse_query(query) {
            Ok(q) => q,
            Err(_) => {
                let escaped_query = query.replace('"', "");
                let fallback_parser = QueryParser::for_index(&self.index, vec![self.text_field]);
                fallback_parser.parse_query(&format!("\"{}\"", escaped_query))?
            }
        };

        // Over-fetch since kb_id is an exact-match field applied after scoring,
        // not part of the parsed full-text query.
        let fetch_limit = limit * 3 + 10;
        let top_docs = searcher.search(&parsed_query, &TopDocs::with_limit(fetch_limit))?;

        let mut results = Vec::with_capacity(limit);
        for (score, doc_address) in top_docs {
            let Ok(doc) = searcher.doc::<TantivyDocument>(doc_address) else {
                continue;
            };
            let doc_kb = doc
                .get_first(self.kb_field)
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if doc_kb != kb_id {
                continue;
            }
            let Some(id_text) = doc.get_first(self.id_field).and_then(|v| v.as_str()) else {
                continue;
            };
            let document_id = doc
                .get_first(self.document_field)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let content = doc
                .get_first(self.text_field)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let highlight = highlight_snippet(&content, query, 40);
            results.push(SearchMatch {
                chunk_id: id_text.to_string(),
                document_id,
                content,
                score,
                metadata: Default::default(),
                highlight,
            });
            if results.len() >= limit {
                break;
            }
        }

        Ok(results)
    }

    fn remove_document_sync(&self, kb_id: &str, document_id: &str) -> anyhow::Result<usize> {
        // Reload reader first to get the latest committed state.
        self.reader.reload().ok();
        let searcher = self.reader.searcher();
        let mut writer = self.writer.lock();
        let mut deleted_count = 0usize;

        for segment_reader in searcher.segment_readers() {
            let store_reader = segment_reader.get_store_reader(64)?;
            for doc_id in 0..segment_reader.max_doc() {
                if segment_reader.is_deleted(doc_id) {
                    continue;
                }
                let Ok(doc) = store_reader.get::<TantivyDocument>(doc_id) else {
                    continue;
                };
                let doc_kb = doc
                    .get_first(self.kb_field)
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let doc_document = doc
                    .get_first(self.document_field)
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if doc_kb == kb_id && doc_document == document_id {
                    if let Some(id_text) = doc.get_first(self.id_field).and_then(|v| v.as_str()) {
                        let term = tantivy::Term::from_field_text(self.id_field, id_text);
                        writer.delete_term(term);
                        deleted_count += 1;
                    }
                }
            }
        }

        if deleted_count > 0 {
            writer.commit().context("Tantivy commit after delete failed")?;
            self.reader.reload()?;
            tracing::info!(
                kb_id = %kb_id,
                document_id = %document_id,
                deleted = deleted_count,
                "Tantivy: deleted and committed documents"
            );
        }

        Ok(deleted_count)
    }

    pub fn count(&self) -> anyhow::Result<usize> {
        let searcher = self.reader.searcher();
        Ok(searcher.num_docs() as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.count().unwrap_or(0) == 0
    }
}

#[async_trait]
impl FulltextIndexer for TextSearch {
    async fn index(&self, kb_id: &str, chunk_id: &str, document_id: &str, content: &str) -> RagResult<()> {
        self.index_one(kb_id, chunk_id, document_id, content)
            .map_err(|e| RagError::upstream("fulltext_index", e))
    }

    async fn remove_document(&self, kb_id: &str, document_id: &str) -> RagResult<usize> {
        self.remove_document_sync(kb_id, document_id)
            .map_err(|e| RagError::upstream("fulltext_remove_document", e))
    }

    async fn search(&self, kb_id: &str, query: &str, limit: usize) -> RagResult<Vec<SearchMatch>> {
        self.search_scoped(kb_id, query, limit)
            .map_err(|e| RagError::upstream("fulltext_search", e))
    }

    async fn ready(&self) -> bool {
        true
    }
}
