//! Semantic cache: a TTL+LRU map keyed by the full request shape, guarding
//! against stale or low-quality cached summaries (SPEC_FULL.md §4.9).

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::config::SearchConfig;

/// The mode a lookup resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemCacheMode {
    /// Caller opted out (`use_cache=false`, `only_unscanned_from_trace_id`,
    /// `include_claim_graph`, or the compact public path).
    Bypass,
    /// Key hit, payload fresh.
    Exact,
    /// Reserved: only fires when `SEM_CACHE_EMBEDDING_PROVIDER` names a real
    /// provider. In the shipped `none` profile this variant is never produced.
    Semantic,
    Miss,
    /// Key hit, but the stored payload's gap or conflict count exceeds its
    /// configured ceiling — treated as a miss and re-executed.
    GuardRevalidate,
}

/// Inputs hashed into a cache key (SPEC_FULL.md §4.9): `H(manuals_fingerprint
/// ‖ normalize(query) ‖ sorted(required_terms) ‖ budget ‖ scope_bits)`.
pub struct SemCacheKeyInput<'a> {
    pub manuals_fingerprint: &'a str,
    pub normalized_query: &'a str,
    pub required_terms: &'a [String],
    pub budget_time_ms: u64,
    pub budget_max_candidates: usize,
    pub scope_bits: u64,
}

#[must_use]
pub fn compute_key(input: &SemCacheKeyInput<'_>) -> String {
    let mut sorted_terms: Vec<&str> = input.required_terms.iter().map(String::as_str).collect();
    sorted_terms.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(input.manuals_fingerprint.as_bytes());
    hasher.update(b"\0");
    hasher.update(input.normalized_query.as_bytes());
    hasher.update(b"\0");
    hasher.update(sorted_terms.join(",").as_bytes());
    hasher.update(b"\0");
    hasher.update(input.budget_time_ms.to_le_bytes());
    hasher.update(input.budget_max_candidates.to_le_bytes());
    hasher.update(input.scope_bits.to_le_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    created_at_ms: i64,
    last_accessed_ms: i64,
    access_count: u64,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now_ms: i64, ttl_sec: u64) -> bool {
        let ttl_ms = i64::try_from(ttl_sec.saturating_mul(1000)).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.created_at_ms) > ttl_ms
    }

    fn touch(&mut self, now_ms: i64) {
        self.last_accessed_ms = now_ms;
        self.access_count += 1;
    }
}

/// Hit/miss/eviction counters, process-lifetime cumulative.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheMetrics {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl_sec: u64,
    pub enabled: bool,
}

impl CacheConfig {
    #[must_use]
    pub fn from_search_config(config: &SearchConfig) -> Self {
        Self {
            max_entries: config.sem_cache_max_keep,
            ttl_sec: config.sem_cache_ttl_sec,
            enabled: config.sem_cache_enabled,
        }
    }
}

struct CacheState<T> {
    entries: HashMap<String, CacheEntry<T>>,
    /// Least-recently-used ordering, oldest first.
    order: Vec<String>,
    metrics: CacheMetrics,
}

/// A process-memory-only TTL+LRU cache. Single mutex, O(1) amortized critical
/// sections, no I/O while holding the lock (SPEC_FULL.md §5).
pub struct SemanticCache<T: Clone> {
    config: CacheConfig,
    state: Mutex<CacheState<T>>,
}

impl<T: Clone> SemanticCache<T> {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: Vec::new(),
                metrics: CacheMetrics::default(),
            }),
        }
    }

    fn bump_lru(order: &mut Vec<String>, key: &str) {
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
        order.push(key.to_owned());
    }

    /// Look up `key` at caller-supplied time `now_ms` (SPEC_FULL.md §4.12: the
    /// core never reads the wall clock directly). Returns `None` on miss,
    /// expiry, or when the cache is disabled; never blocks on I/O.
    pub fn get_at(&self, key: &str, now_ms: i64) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let expired = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_expired(now_ms, self.config.ttl_sec));
        if expired {
            state.entries.remove(key);
            if let Some(pos) = state.order.iter().position(|k| k == key) {
                state.order.remove(pos);
            }
            state.metrics.misses += 1;
            return None;
        }
        let Some(entry) = state.entries.get_mut(key) else {
            state.metrics.misses += 1;
            return None;
        };
        entry.touch(now_ms);
        let value = entry.value.clone();
        Self::bump_lru(&mut state.order, key);
        state.metrics.hits += 1;
        Some(value)
    }

    /// Insert or replace `key`, evicting the least-recently-used entry if the
    /// cache is at capacity.
    pub fn put_at(&self, key: String, value: T, now_ms: i64) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                created_at_ms: now_ms,
                last_accessed_ms: now_ms,
                access_count: 0,
            },
        );
        Self::bump_lru(&mut state.order, &key);
        while state.entries.len() > self.config.max_entries {
            if state.order.is_empty() {
                break;
            }
            let evicted = state.order.remove(0);
            state.entries.remove(&evicted);
            state.metrics.evictions += 1;
        }
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).metrics
    }

    pub fn invalidate_all(&self) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.entries.clear();
        state.order.clear();
    }

    /// Drop exactly the listed keys, used by `Pipeline::invalidate(manual_id)`
    /// to evict a single manual's cache entries without clearing the whole
    /// cache (the cache itself has no notion of which manual a key belongs
    /// to; the caller tracks that association).
    pub fn invalidate_keys(&self, keys: &[String]) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for key in keys {
            state.entries.remove(key);
            if let Some(pos) = state.order.iter().position(|k| k == key) {
                state.order.remove(pos);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_entries: usize, ttl_sec: u64) -> CacheConfig {
        CacheConfig { max_entries, ttl_sec, enabled: true }
    }

    #[test]
    fn key_is_stable_regardless_of_required_term_order() {
        let a = SemCacheKeyInput {
            manuals_fingerprint: "fp",
            normalized_query: "q",
            required_terms: &["b".to_owned(), "a".to_owned()],
            budget_time_ms: 100,
            budget_max_candidates: 10,
            scope_bits: 0,
        };
        let b = SemCacheKeyInput {
            manuals_fingerprint: "fp",
            normalized_query: "q",
            required_terms: &["a".to_owned(), "b".to_owned()],
            budget_time_ms: 100,
            budget_max_candidates: 10,
            scope_bits: 0,
        };
        assert_eq!(compute_key(&a), compute_key(&b));
    }

    #[test]
    fn key_changes_with_fingerprint() {
        let input = |fp: &'static str| SemCacheKeyInput {
            manuals_fingerprint: fp,
            normalized_query: "q",
            required_terms: &[],
            budget_time_ms: 100,
            budget_max_candidates: 10,
            scope_bits: 0,
        };
        assert_ne!(compute_key(&input("fp1")), compute_key(&input("fp2")));
    }

    #[test]
    fn put_then_get_returns_value_and_counts_as_hit() {
        let cache: SemanticCache<String> = SemanticCache::new(cfg(10, 1800));
        cache.put_at("k".to_owned(), "v".to_owned(), 0);
        assert_eq!(cache.get_at("k", 10), Some("v".to_owned()));
        assert_eq!(cache.metrics().hits, 1);
    }

    #[test]
    fn expired_entry_is_a_miss_and_is_evicted() {
        let cache: SemanticCache<String> = SemanticCache::new(cfg(10, 1));
        cache.put_at("k".to_owned(), "v".to_owned(), 0);
        assert_eq!(cache.get_at("k", 5_000), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_eviction_drops_the_least_recently_used_entry() {
        let cache: SemanticCache<String> = SemanticCache::new(cfg(2, 1800));
        cache.put_at("a".to_owned(), "1".to_owned(), 0);
        cache.put_at("b".to_owned(), "2".to_owned(), 0);
        cache.get_at("a", 1); // touch a, so b becomes LRU
        cache.put_at("c".to_owned(), "3".to_owned(), 0);
        assert_eq!(cache.get_at("b", 2), None);
        assert_eq!(cache.get_at("a", 2), Some("1".to_owned()));
    }

    #[test]
    fn disabled_cache_never_stores_anything() {
        let cache: SemanticCache<String> = SemanticCache::new(CacheConfig { enabled: false, ..cfg(10, 1800) });
        cache.put_at("k".to_owned(), "v".to_owned(), 0);
        assert_eq!(cache.get_at("k", 0), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_keys_drops_only_the_named_keys() {
        let cache: SemanticCache<String> = SemanticCache::new(cfg(10, 1800));
        cache.put_at("a".to_owned(), "1".to_owned(), 0);
        cache.put_at("b".to_owned(), "2".to_owned(), 0);
        cache.invalidate_keys(&["a".to_owned()]);
        assert_eq!(cache.get_at("a", 1), None);
        assert_eq!(cache.get_at("b", 1), Some("2".to_owned()));
    }

    #[test]
    fn invalidate_all_clears_everything() {
        let cache: SemanticCache<String> = SemanticCache::new(cfg(10, 1800));
        cache.put_at("k".to_owned(), "v".to_owned(), 0);
        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
