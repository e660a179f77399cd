use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::RwLock;

use crate::types::{SearchMatch, SearchMode};

/// Cap on the number of distinct cache keys retained regardless of TTL, so a
/// knowledge base with heavy query churn cannot grow the cache unbounded
/// between sweeps.
const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Key identifying a cached search result: everything that affects the
/// returned ranking. Two searches with the same key are guaranteed to
/// produce the same result set, so it is safe to serve one from the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kb_id: String,
    pub query_fingerprint: String,
    pub mode: SearchModeKey,
    pub threshold_bits: u32,
    pub top_k: usize,
}

/// `SearchMode` isn't `Hash`/`Eq` by itself (kept serde-friendly instead); this
/// mirrors it for cache-key purposes only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchModeKey {
    Auto,
    Vector,
    Fulltext,
    Hybrid,
}

impl From<SearchMode> for SearchModeKey {
    fn from(m: SearchMode) -> Self {
        match m {
            SearchMode::Auto => Self::Auto,
            SearchMode::Vector => Self::Vector,
            SearchMode::Fulltext => Self::Fulltext,
            SearchMode::Hybrid => Self::Hybrid,
        }
    }
}

impl CacheKey {
    pub fn new(kb_id: &str, query: &str, mode: SearchMode, threshold: f32, top_k: usize) -> Self {
        Self {
            kb_id: kb_id.to_string(),
            query_fingerprint: query.trim().to_lowercase(),
            mode: mode.into(),
            threshold_bits: threshold.to_bits(),
            top_k,
        }
    }
}

/// Bounded-TTL cache of fused search results, keyed on (kb_id, query, mode,
/// threshold, top_k). No caching crate appears anywhere in the reference
/// corpus for the TTL/invalidation behaviour itself, so that part is
/// hand-rolled, matching the `parking_lot`-guarded in-process state seen
/// elsewhere in this crate; entry-count bounding is delegated to the
/// teacher's own `lru` dependency rather than reimplementing LRU eviction.
pub struct SearchResultCache {
    ttl: Duration,
    entries: RwLock<LruCache<CacheKey, (Instant, Vec<SearchMatch>)>>,
}

impl SearchResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(ttl: Duration, max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            ttl,
            entries: RwLock::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Vec<SearchMatch>> {
        let mut entries = self.entries.write();
        let (inserted_at, matches) = entries.get(key)?;
        if inserted_at.elapsed() > self.ttl {
            entries.pop(key);
            return None;
        }
        Some(matches.clone())
    }

    pub fn insert(&self, key: CacheKey, matches: Vec<SearchMatch>) {
        let mut entries = self.entries.write();
        entries.put(key, (Instant::now(), matches));
        sweep_expired(&mut entries, self.ttl);
    }

    /// Drop every cached entry for a knowledge base. Called after any
    /// ingest/delete affecting that kb_id so stale results are never served.
    pub fn invalidate_kb(&self, kb_id: &str) {
        let mut entries = self.entries.write();
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| key.kb_id == kb_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sweep_expired(entries: &mut LruCache<CacheKey, (Instant, Vec<SearchMatch>)>, ttl: Duration) {
    let expired: Vec<CacheKey> = entries
        .iter()
        .filter(|(_, (inserted_at, _))| inserted_at.elapsed() > ttl)
        .map(|(key, _)| key.clone())
        .collect();
    for key in expired {
        entries.pop(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn make_match(id: &str) -> SearchMatch {
        SearchMatch {
            chunk_id: id.to_string(),
            document_id: "doc1".to_string(),
            content: "hello".to_string(),
            score: 0.9,
            metadata: StdHashMap::new(),
            highlight: None,
        }
    }

    #[test]
    fn returns_none_for_missing_key() {
        let cache = SearchResultCache::new(Duration::from_secs(60));
        let key = CacheKey::new("kb1", "hello", SearchMode::Hybrid, 0.1, 10);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn returns_cached_entry_before_ttl() {
        let cache = SearchResultCache::new(Duration::from_secs(60));
        let key = CacheKey::new("kb1", "hello", SearchMode::Hybrid, 0.1, 10);
        cache.insert(key.clone(), vec![make_match("c1")]);
        let hit = cache.get(&key).unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].chunk_id, "c1");
    }

    #[test]
    fn expires_after_ttl() {
        let cache = SearchResultCache::new(Duration::from_millis(1));
        let key = CacheKey::new("kb1", "hello", SearchMode::Hybrid, 0.1, 10);
        cache.insert(key.clone(), vec![make_match("c1")]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn invalidate_kb_drops_only_that_kb() {
        let cache = SearchResultCache::new(Duration::from_secs(60));
        let key_a = CacheKey::new("kb-a", "q", SearchMode::Hybrid, 0.1, 10);
        let key_b = CacheKey::new("kb-b", "q", SearchMode::Hybrid, 0.1, 10);
        cache.insert(key_a.clone(), vec![make_match("c1")]);
        cache.insert(key_b.clone(), vec![make_match("c2")]);
        cache.invalidate_kb("kb-a");
        assert!(cache.get(&key_a).is_none());
        assert!(cache.get(&key_b).is_some());
    }

    #[test]
    fn query_fingerprint_is_case_and_whitespace_insensitive() {
        let key1 = CacheKey::new("kb1", "  Hello World  ", SearchMode::Hybrid, 0.1, 10);
        let key2 = CacheKey::new("kb1", "hello world", SearchMode::Hybrid, 0.1, 10);
        assert_eq!(key1, key2);
    }
}
