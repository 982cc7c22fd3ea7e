use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use crawlserver_types::CacheEntry;
use dashmap::DashMap;
use lru::LruCache;
use regex::Regex;

/// Spec §9 design note: "no eviction is specified... implementers SHOULD
/// add an LRU cap (recommend 10k entries) to bound memory; cache semantics
/// above are unaffected." TTL expiry still governs freshness; this cap only
/// bounds the entry count, independent of TTL.
pub const MAX_ENTRIES: usize = 10_000;

/// In-memory render cache, keyed by the full request URL (path + "?" +
/// query, verbatim — an empty query still gets a trailing "?").
///
/// Entries are overwritten on re-render and expire by TTL; on top of that,
/// `recency` tracks insertion/access order so the cache can evict the least
/// recently used entry once it holds more than [`MAX_ENTRIES`] keys. The
/// map and the recency tracker are separate structures (a `DashMap` for
/// concurrent lookup/fill, a `Mutex<LruCache>` purely for eviction order)
/// rather than using `LruCache` as the map itself, since `LruCache` needs
/// `&mut self` for a lookup and would serialize every read behind one lock.
pub struct RenderCache {
    entries: DashMap<String, CacheEntry>,
    recency: Mutex<LruCache<String, ()>>,
}

fn id_attr_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\sid=(["']).*?\1"#).expect("valid regex"))
}

/// Outcome of comparing a cache lookup against the request's conditional
/// headers.
pub enum Lookup {
    /// No fresh entry for this key; the coordinator must dispatch a render.
    Miss,
    /// A fresh entry exists and its ETag matches `If-None-Match`.
    NotModified { etag: String },
    /// A fresh entry exists; return it in full.
    Hit(CacheEntry),
}

impl RenderCache {
    pub fn new() -> Self {
        Self::with_capacity(MAX_ENTRIES)
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            recency: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("cache capacity must be nonzero"),
            )),
        }
    }

    /// Strips `id="..."` / `id='...'` attributes, since the embedded
    /// runtime generates non-deterministic element ids per run. Stripping
    /// feeds both the stored/served body and the ETag, so identical
    /// semantic content under different runs yields the same cache entry.
    pub fn strip_ids(body: &str) -> String {
        id_attr_pattern().replace_all(body, "").into_owned()
    }

    pub fn etag_of(stripped_body: &str) -> String {
        format!("{:x}", md5::compute(stripped_body.as_bytes()))
    }

    pub fn lookup(&self, key: &str, now_ms: u64, if_none_match: Option<&str>) -> Lookup {
        let Some(entry) = self.entries.get(key) else {
            return Lookup::Miss;
        };
        if !entry.is_fresh(now_ms) {
            return Lookup::Miss;
        }
        self.recency.lock().unwrap().promote(key);
        if let Some(inm) = if_none_match {
            if inm == entry.etag {
                return Lookup::NotModified { etag: entry.etag.clone() };
            }
        }
        Lookup::Hit(entry.clone())
    }

    pub fn fill(
        &self,
        key: String,
        body: String,
        now_ms: u64,
        expires_in_secs: u64,
        last_modified_at: Option<DateTime<Utc>>,
    ) -> CacheEntry {
        let stripped = Self::strip_ids(&body);
        let etag = Self::etag_of(&stripped);
        let entry = CacheEntry::new(stripped, etag, now_ms, expires_in_secs, last_modified_at);
        self.entries.insert(key.clone(), entry.clone());
        if let Some((evicted, _)) = self.recency.lock().unwrap().push(key, ()) {
            self.entries.remove(&evicted);
        }
        entry
    }
}

impl Default for RenderCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_ignores_generated_ids() {
        let a = r#"<div id="x-1">hello</div>"#;
        let b = r#"<div id='x-2'>hello</div>"#;
        assert_eq!(
            RenderCache::etag_of(&RenderCache::strip_ids(a)),
            RenderCache::etag_of(&RenderCache::strip_ids(b))
        );
    }

    #[test]
    fn stored_body_has_ids_stripped() {
        let cache = RenderCache::new();
        let entry = cache.fill(
            "/a?".to_string(),
            r#"<div id="x-1">hello</div>"#.to_string(),
            0,
            60,
            None,
        );
        assert_eq!(entry.body, "<div>hello</div>");
    }

    #[test]
    fn zero_ttl_means_thirty_days() {
        let cache = RenderCache::new();
        let entry = cache.fill("/a?".to_string(), "<html/>".to_string(), 0, 0, None);
        assert_eq!(entry.expires_at_ms, crawlserver_types::ZERO_TTL_MS);
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = RenderCache::new();
        cache.fill("/a?".to_string(), "<html/>".to_string(), 0, 5, None);
        match cache.lookup("/a?", 10_000, None) {
            Lookup::Miss => {}
            _ => panic!("expected expired entry to miss"),
        }
    }

    #[test]
    fn matching_etag_is_not_modified() {
        let cache = RenderCache::new();
        let entry = cache.fill("/a?".to_string(), "<html/>".to_string(), 0, 60, None);
        match cache.lookup("/a?", 0, Some(&entry.etag)) {
            Lookup::NotModified { etag } => assert_eq!(etag, entry.etag),
            _ => panic!("expected a 304"),
        }
    }

    #[test]
    fn evicts_least_recently_used_past_capacity() {
        let cache = RenderCache::with_capacity(2);
        cache.fill("/a?".to_string(), "<html/>".to_string(), 0, 60, None);
        cache.fill("/b?".to_string(), "<html/>".to_string(), 0, 60, None);
        // touch "/a?" so "/b?" becomes the least recently used
        assert!(matches!(cache.lookup("/a?", 0, None), Lookup::Hit(_)));
        cache.fill("/c?".to_string(), "<html/>".to_string(), 0, 60, None);

        assert!(matches!(cache.lookup("/a?", 0, None), Lookup::Hit(_)));
        assert!(matches!(cache.lookup("/c?", 0, None), Lookup::Hit(_)));
        assert!(matches!(cache.lookup("/b?", 0, None), Lookup::Miss));
    }
}
