//! Parsed composition expression caching.
//!
//! Provides an LRU cache of parsed [`CompositionExpression`]s keyed by the
//! normalized expression text, so a composition string is parsed once and
//! reused across evaluations.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cohort_expr::CompositionExpression;
use lru::LruCache;
use parking_lot::Mutex;

use crate::config::ExpressionCacheConfig;
use crate::error::EngineResult;

/// Thread-safe LRU cache of parsed composition expressions.
///
/// # Example
///
/// ```rust
/// use cohort_engine::{ExpressionCache, ExpressionCacheConfig};
///
/// let cache = ExpressionCache::new(ExpressionCacheConfig { max_entries: 16 });
/// let first = cache.get_or_parse("onArt AND NOT pregnant").unwrap();
/// let second = cache.get_or_parse("onArt   AND NOT  pregnant").unwrap();
///
/// assert_eq!(first, second);
/// assert_eq!(cache.stats().hits, 1);
/// ```
pub struct ExpressionCache {
    inner: Mutex<LruCache<String, Arc<CompositionExpression>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ExpressionCache {
    /// Creates a new expression cache with the given configuration.
    pub fn new(config: ExpressionCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Gets a cached expression.
    pub fn get(&self, expression: &str) -> Option<Arc<CompositionExpression>> {
        let key = normalize_cache_key(expression);
        let found = self.inner.lock().get(&key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Gets a cached expression or parses and caches it.
    ///
    /// Parse errors are returned and not cached.
    pub fn get_or_parse(&self, expression: &str) -> EngineResult<Arc<CompositionExpression>> {
        if let Some(parsed) = self.get(expression) {
            return Ok(parsed);
        }
        let parsed = Arc::new(cohort_expr::parse(expression)?);
        self.inner
            .lock()
            .put(normalize_cache_key(expression), Arc::clone(&parsed));
        Ok(parsed)
    }

    /// Returns the number of cached expressions.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears all entries from the cache.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> ExpressionCacheStats {
        ExpressionCacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ExpressionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ExpressionCache")
            .field("entries", &stats.entries)
            .field("hits", &stats.hits)
            .field("misses", &stats.misses)
            .finish()
    }
}

/// Statistics about the expression cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpressionCacheStats {
    /// Number of cached expressions.
    pub entries: usize,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that had to parse.
    pub misses: u64,
}

/// Normalizes a composition string for consistent cache keys.
///
/// Collapses runs of whitespace to a single space and trims both ends.
/// Identifiers are case-sensitive, so case is preserved.
///
/// # Example
///
/// ```ignore
/// assert_eq!(normalize_cache_key("  a   AND\tb "), "a AND b");
/// ```
pub fn normalize_cache_key(expression: &str) -> String {
    let mut result = String::with_capacity(expression.len());
    let mut prev_was_space = true;

    for ch in expression.chars() {
        if ch.is_whitespace() {
            if !prev_was_space {
                result.push(' ');
                prev_was_space = true;
            }
        } else {
            result.push(ch);
            prev_was_space = false;
        }
    }

    if result.ends_with(' ') {
        result.pop();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_cache(max_entries: usize) -> ExpressionCache {
        ExpressionCache::new(ExpressionCacheConfig { max_entries })
    }

    #[test]
    fn test_cache_new() {
        let cache = create_test_cache(10);
        assert!(cache.is_empty());
        assert_eq!(cache.stats(), ExpressionCacheStats::default());
    }

    #[test]
    fn test_get_or_parse_caches() {
        let cache = create_test_cache(10);
        let first = cache.get_or_parse("a AND b").unwrap();
        let second = cache.get_or_parse("a AND b").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_whitespace_variants_share_entry() {
        let cache = create_test_cache(10);
        cache.get_or_parse("a AND NOT b").unwrap();
        cache.get_or_parse("  a\tAND   NOT b  ").unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_parse_error_not_cached() {
        let cache = create_test_cache(10);
        assert!(cache.get_or_parse("a AND").is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = create_test_cache(2);
        cache.get_or_parse("a").unwrap();
        cache.get_or_parse("b").unwrap();
        let _ = cache.get("a");
        cache.get_or_parse("c").unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = create_test_cache(0);
        cache.get_or_parse("a").unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear() {
        let cache = create_test_cache(10);
        cache.get_or_parse("a OR b").unwrap();
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_normalize_cache_key() {
        assert_eq!(normalize_cache_key("a AND b"), "a AND b");
        assert_eq!(normalize_cache_key("  a   AND\tb "), "a AND b");
        assert_eq!(normalize_cache_key("(a OR b)"), "(a OR b)");
        assert_eq!(normalize_cache_key("onArt"), "onArt");
        assert_eq!(normalize_cache_key(""), "");
    }
}
