//! Sharded per-entity cache of flag results.
//!
//! Each entity owns one [`CacheEntry`] holding every cached flag result for
//! it. Entities hash onto a fixed number of shards, each behind its own
//! mutex, so concurrent requests for different entities rarely contend.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use cohort_engine::{CalcResult, CalculationName, EntityId};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::info;

/// Default number of shards.
pub const DEFAULT_SHARDS: usize = 16;

/// Configuration for the [`ResultCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ResultCacheConfig {
    /// Number of independently locked shards.
    pub shards: usize,
    /// LRU bound per shard. `None` keeps entries until invalidated.
    pub max_entries_per_shard: Option<usize>,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            shards: DEFAULT_SHARDS,
            max_entries_per_shard: None,
        }
    }
}

impl ResultCacheConfig {
    /// Creates a config with a per-shard LRU bound.
    pub fn bounded(max_entries_per_shard: usize) -> Self {
        Self {
            max_entries_per_shard: Some(max_entries_per_shard),
            ..Self::default()
        }
    }

    /// Sets the shard count.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }
}

/// Cached flag results for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Results keyed by flag calculation name.
    pub results: BTreeMap<CalculationName, CalcResult>,
    /// When the entry was last written.
    pub last_updated: DateTime<Utc>,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultCacheStats {
    /// Cached entities.
    pub entries: usize,
    /// Number of shards.
    pub shards: usize,
}

/// Concurrent per-entity flag cache.
///
/// Keys are scoped per entity; nothing is shared across entities. There is
/// no expiry: entries stay until [`invalidate`](Self::invalidate), unless a
/// per-shard bound is configured.
pub struct ResultCache {
    shards: Box<[Mutex<LruCache<EntityId, CacheEntry>>]>,
}

impl ResultCache {
    /// Creates a cache from configuration. A shard count of zero is treated as one.
    pub fn new(config: &ResultCacheConfig) -> Self {
        let shards = (0..config.shards.max(1))
            .map(|_| {
                let shard = match config.max_entries_per_shard {
                    Some(max) => LruCache::new(NonZeroUsize::new(max).unwrap_or(NonZeroUsize::MIN)),
                    None => LruCache::unbounded(),
                };
                Mutex::new(shard)
            })
            .collect();
        Self { shards }
    }

    fn shard(&self, entity: EntityId) -> &Mutex<LruCache<EntityId, CacheEntry>> {
        // Fibonacci hashing spreads sequential ids across shards.
        let mixed = entity.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
        &self.shards[(mixed as usize) % self.shards.len()]
    }

    /// Returns a copy of the entity's cached entry.
    pub fn get(&self, entity: EntityId) -> Option<CacheEntry> {
        self.shard(entity).lock().get(&entity).cloned()
    }

    /// Replaces the entity's entry, stamped with the current wall clock.
    pub fn put(&self, entity: EntityId, results: BTreeMap<CalculationName, CalcResult>) {
        self.put_at(entity, results, Utc::now());
    }

    /// Replaces the entity's entry with an explicit timestamp.
    pub fn put_at(
        &self,
        entity: EntityId,
        results: BTreeMap<CalculationName, CalcResult>,
        last_updated: DateTime<Utc>,
    ) {
        self.shard(entity).lock().put(
            entity,
            CacheEntry {
                results,
                last_updated,
            },
        );
    }

    /// Merges freshly computed results into an existing entry.
    ///
    /// Values in `fresh` overwrite cached ones and names in `remove` are
    /// dropped; every other cached value is kept. Does nothing if the entity
    /// has no entry (it may have been invalidated concurrently).
    ///
    /// # Returns
    ///
    /// The updated entry, or `None` if the entity was not cached.
    pub fn merge(
        &self,
        entity: EntityId,
        fresh: BTreeMap<CalculationName, CalcResult>,
        remove: &[CalculationName],
        at: DateTime<Utc>,
    ) -> Option<CacheEntry> {
        let mut shard = self.shard(entity).lock();
        let entry = shard.get_mut(&entity)?;
        for name in remove {
            entry.results.remove(name);
        }
        entry.results.extend(fresh);
        entry.last_updated = at;
        Some(entry.clone())
    }

    /// Drops the entity's entry. Returns true if one existed.
    pub fn invalidate(&self, entity: EntityId) -> bool {
        let removed = self.shard(entity).lock().pop(&entity).is_some();
        if removed {
            info!(entity, "invalidated cached flags");
        }
        removed
    }

    /// Drops every entry.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.lock().clear();
        }
        info!(shards = self.shards.len(), "cleared flag cache");
    }

    /// Number of cached entities.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.lock().is_empty())
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> ResultCacheStats {
        ResultCacheStats {
            entries: self.len(),
            shards: self.shards.len(),
        }
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(&ResultCacheConfig::default())
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ResultCache")
            .field("entries", &stats.entries)
            .field("shards", &stats.shards)
            .finish()
    }
}
