pub mod hybrid;
pub mod query_analyzer;
pub mod substring_search;
pub mod text_search;

pub use hybrid::{fuse_hybrid, HybridSearchEngine, HybridSource};
pub use query_analyzer::{QueryAnalyzer, QueryClass, WeightAdjuster};
pub use substring_search::SubstringIndex;
pub use text_search::TextSearch;

use async_trait::async_trait;

use crate::error::RagResult;
use crate::types::SearchMatch;

/// Maintains a lexical index over chunk content, scoped by `kb_id` (§4.5).
/// Two adapters implement this: `TextSearch` (Tantivy-backed, primary) and
/// `SubstringIndex` (case-insensitive substring fallback, constant score).
#[async_trait]
pub trait FulltextIndexer: Send + Sync {
    async fn index(&self, kb_id: &str, chunk_id: &str, document_id: &str, content: &str) -> RagResult<()>;

    /// Removes every indexed chunk belonging to `document_id`, returns the count removed.
    async fn remove_document(&self, kb_id: &str, document_id: &str) -> RagResult<usize>;

    async fn search(&self, kb_id: &str, query: &str, limit: usize) -> RagResult<Vec<SearchMatch>>;

    async fn ready(&self) -> bool;
}

/// Wraps the first occurrence of any term in `query` with `<mark>…</mark>`,
/// keeping up to `context_chars` characters of surrounding text on each side.
/// Shared by both `FulltextIndexer` adapters so highlight behaviour is identical.
pub fn highlight_snippet(content: &str, query: &str, context_chars: usize) -> Option<String> {
    let lower_content = content.to_lowercase();
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    let mut best: Option<usize> = None;
    let mut best_len = 0usize;
    for term in &terms {
        if let Some(pos) = lower_content.find(term.as_str()) {
            if best.is_none_or(|b| pos < b) {
                best = Some(pos);
                best_len = term.len();
            }
        }
    }

    let byte_pos = best?;

    // Snap to char boundaries so we never slice inside a multi-byte character.
    let mut start = byte_pos.saturating_sub(context_chars);
    while start > 0 && !content.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (byte_pos + best_len + context_chars).min(content.len());
    while end < content.len() && !content.is_char_boundary(end) {
        end += 1;
    }

    let prefix = if start > 0 { "…" } else { "" };
    let suffix = if end < content.len() { "…" } else { "" };
    let before = &content[start..byte_pos];
    let matched = &content[byte_pos..byte_pos + best_len];
    let after = &content[byte_pos + best_len..end];

    Some(format!("{prefix}{before}<mark>{matched}</mark>{after}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highlight_wraps_first_match() {
        let snippet = highlight_snippet("the quick brown fox jumps", "quick", 5).unwrap();
        assert!(snippet.contains("<mark>quick</mark>"));
    }

    #[test]
    fn highlight_returns_none_when_no_term_matches() {
        assert!(highlight_snippet("hello world", "zzz", 10).is_none());
    }

    #[test]
    fn highlight_truncates_with_ellipsis() {
        let content = "a".repeat(100) + "needle" + &"b".repeat(100);
        let snippet = highlight_snippet(&content, "needle", 10).unwrap();
        assert!(snippet.starts_with('…'));
        assert!(snippet.ends_with('…'));
        assert!(snippet.contains("<mark>needle</mark>"));
    }
}
