use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cached, fully-rendered page. Keyed externally by the full request URL
/// (path + "?" + query, verbatim) — see crawlserver's `cache` module.
///
/// Invariants:
/// - `expires_at_ms > created_at_ms` always.
/// - the ETag is deterministic over the id-stripped body, so identical
///   semantic content under different runs yields the same ETag.
/// - a cache hit whose `expires_at_ms <= now` must be treated as a miss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub body: String,
    pub etag: String,
    /// absolute monotonic-clock milliseconds.
    pub expires_at_ms: u64,
    /// app-supplied wall-clock timestamp, if the render provided one.
    pub last_modified_at: Option<DateTime<Utc>>,
}

/// A TTL of zero seconds is treated as this many milliseconds (30 days).
pub const ZERO_TTL_MS: u64 = 30 * 24 * 60 * 60 * 1000;

impl CacheEntry {
    pub fn new(
        body: String,
        etag: String,
        now_ms: u64,
        expires_in_secs: u64,
        last_modified_at: Option<DateTime<Utc>>,
    ) -> Self {
        let ttl_ms = if expires_in_secs == 0 {
            ZERO_TTL_MS
        } else {
            expires_in_secs.saturating_mul(1000)
        };
        Self {
            body,
            etag,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
            last_modified_at,
        }
    }

    pub fn is_fresh(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }
}
