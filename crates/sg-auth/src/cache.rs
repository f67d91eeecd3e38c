//! Bounded TTL+LRU cache of token snapshots.
//!
//! # Concurrency contract
//!
//! - `get` runs under the read lock and never promotes recency, so
//!   concurrent readers do not serialize on the LRU list; `set`,
//!   `invalidate`, and expired-entry eviction take the write lock.
//! - Hit/miss counters are atomic adds outside the lock.
//! - Evicting an entry that looked expired under the read lock re-reads it
//!   under the write lock and removes it only if still expired. Without the
//!   re-check, a `set` that refreshed the entry between the two locks would
//!   be clobbered by the eviction.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::RwLock;
use serde::Serialize;

use sg_types::TokenInfo;

/// Capacity fallback for non-positive configured sizes.
pub const DEFAULT_CACHE_SIZE: usize = 10_000;
/// TTL fallback for non-positive configured TTLs.
pub const FALLBACK_TTL: Duration = Duration::from_secs(5);

/// Counters reported by [`TokenCache::stats`]. `hit_rate` is a percentage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

struct CachedEntry {
    info: Arc<TokenInfo>,
    inserted_at: Instant,
}

/// TTL+LRU token cache. Entries are immutable snapshots; a refresh replaces
/// the entry wholesale rather than mutating it in place.
pub struct TokenCache {
    entries: RwLock<LruCache<String, CachedEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TokenCache {
    /// Build a cache from configured capacity and TTL seconds. Non-positive
    /// capacity falls back to 10 000 entries; non-positive TTL to 5 s.
    pub fn new(max_size: i64, ttl_secs: i64) -> Self {
        let ttl = if ttl_secs <= 0 {
            FALLBACK_TTL
        } else {
            Duration::from_secs(ttl_secs as u64)
        };
        Self::with_ttl(max_size, ttl)
    }

    /// Build a cache with an explicit TTL. Non-positive capacity falls back
    /// to 10 000 entries.
    pub fn with_ttl(max_size: i64, ttl: Duration) -> Self {
        let capacity = if max_size <= 0 {
            DEFAULT_CACHE_SIZE
        } else {
            max_size as usize
        };
        Self {
            entries: RwLock::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a fresh snapshot. Expired entries count as misses and are
    /// evicted unless a concurrent `set` refreshed them first.
    pub fn get(&self, token_hash: &str) -> Option<Arc<TokenInfo>> {
        {
            let entries = self.entries.read();
            match entries.peek(token_hash) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(Arc::clone(&entry.info));
                }
                Some(_) => {}
            }
        }

        // Looked expired under the read lock: re-read under the write lock
        // and remove only if still expired.
        let mut entries = self.entries.write();
        if let Some(entry) = entries.peek(token_hash) {
            if entry.inserted_at.elapsed() > self.ttl {
                entries.pop(token_hash);
            }
        }
        drop(entries);

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or refresh a snapshot, recording LRU recency.
    pub fn set(&self, token_hash: impl Into<String>, info: Arc<TokenInfo>) {
        let mut entries = self.entries.write();
        entries.put(
            token_hash.into(),
            CachedEntry {
                info,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop one entry.
    pub fn invalidate(&self, token_hash: &str) {
        self.entries.write().pop(token_hash);
    }

    /// Drop everything.
    pub fn invalidate_all(&self) {
        self.entries.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64 * 100.0
        };
        CacheStats {
            size: self.entries.read().len(),
            hits,
            misses,
            hit_rate,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("size", &self.entries.read().len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(hash: &str) -> Arc<TokenInfo> {
        Arc::new(TokenInfo {
            token_hash: hash.to_string(),
            ..TokenInfo::default()
        })
    }

    #[test]
    fn capacity_and_ttl_fall_back_on_non_positive() {
        let cache = TokenCache::new(0, -1);
        assert_eq!(cache.ttl(), FALLBACK_TTL);
        cache.set("k", info("k"));
        assert!(cache.get("k").is_some());
    }

    #[test]
    fn lru_evicts_least_recently_written() {
        let cache = TokenCache::new(2, 60);
        cache.set("a", info("a"));
        cache.set("b", info("b"));
        cache.set("c", info("c"));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().size, 2);
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = TokenCache::new(10, 60);
        cache.set("k", info("k"));
        assert!(cache.get("k").is_some());
        assert!(cache.get("absent").is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn invalidate_is_total() {
        let cache = TokenCache::new(10, 60);
        cache.invalidate("never-inserted");
        cache.set("k", info("k"));
        cache.invalidate("k");
        assert!(cache.get("k").is_none());
        cache.invalidate_all();
        assert_eq!(cache.stats().size, 0);
    }
}
