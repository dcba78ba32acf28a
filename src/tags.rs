//! Tag identity and the admission cache
//!
//! Every distinct tagset gets a stable 64-bit identity derived from its
//! canonical form, so concurrent writers and restarted processes agree on
//! tag-table keys without coordination. The admission cache remembers which
//! identities this process has already persisted; a miss is never a
//! correctness problem, it just costs an idempotent merge.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use xxhash_rust::xxh3::Xxh3;

/// Derive the stable identity of a tagset.
///
/// Canonical form: tags sorted by key (the map's natural order), each
/// name and value terminated by a NUL separator, hashed with xxh3. The
/// result is reinterpreted as `i64` to match the `bigint` tag_id column.
/// Two tagsets produce the same identity exactly when they are element-wise
/// equal.
pub fn tag_id(tags: &BTreeMap<String, String>) -> i64 {
    let mut hasher = Xxh3::new();
    for (name, value) in tags {
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
        hasher.update(value.as_bytes());
        hasher.update(&[0]);
    }
    hasher.digest() as i64
}

/// Snapshot of admission-cache counters.
#[derive(Debug, Clone, Copy)]
pub struct TagCacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Bounded set of tag identities known to have been persisted.
///
/// Admission is monotonic from the callers' perspective: entries are never
/// explicitly removed, and eviction under capacity pressure only means the
/// next batch re-merges a tag row the database already has.
pub struct TagCache {
    cache: moka::sync::Cache<i64, ()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TagCache {
    /// Create a cache bounded to approximately `capacity` entries.
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: moka::sync::Cache::builder().max_capacity(capacity).build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether `id` is known to have been persisted by this process.
    pub fn admitted(&self, id: i64) -> bool {
        let hit = self.cache.get(&id).is_some();
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Record that `id` has been persisted.
    pub fn admit(&self, id: i64) {
        self.cache.insert(id, ());
    }

    pub fn stats(&self) -> TagCacheStats {
        TagCacheStats {
            entries: self.cache.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Reset hit/miss counters, typically after reporting them.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}
