//! Trace store: a bounded `trace_id -> TracePayload` map backing the `hits`
//! paging contract (SPEC_FULL.md §4.10).
//!
//! Structurally the same TTL+LRU shape as [`crate::cache::SemanticCache`], but
//! kept as its own type: SPEC_FULL.md draws an explicit ownership line
//! between the trace store and the semantic cache (each exclusively owns its
//! own payloads), and a lookup here has a distinct failure contract — it must
//! return `not_found` rather than silently falling back to a fresh scan.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::SearchCoreError;

struct TraceEntry<T> {
    value: T,
    created_at_ms: i64,
    last_accessed_ms: i64,
}

impl<T> TraceEntry<T> {
    fn is_expired(&self, now_ms: i64, ttl_sec: u64) -> bool {
        let ttl_ms = i64::try_from(ttl_sec.saturating_mul(1000)).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.created_at_ms) > ttl_ms
    }
}

struct TraceState<T> {
    entries: HashMap<String, TraceEntry<T>>,
    order: Vec<String>,
}

/// Bounded, TTL+LRU `trace_id -> T` store.
pub struct TraceStore<T: Clone> {
    max_keep: usize,
    ttl_sec: u64,
    state: Mutex<TraceState<T>>,
}

impl<T: Clone> TraceStore<T> {
    #[must_use]
    pub fn new(max_keep: usize, ttl_sec: u64) -> Self {
        Self {
            max_keep,
            ttl_sec,
            state: Mutex::new(TraceState {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    fn bump_lru(order: &mut Vec<String>, key: &str) {
        if let Some(pos) = order.iter().position(|k| k == key) {
            order.remove(pos);
        }
        order.push(key.to_owned());
    }

    /// Insert a new payload under `trace_id`, evicting the least-recently-used
    /// entry if over capacity.
    pub fn insert_at(&self, trace_id: String, value: T, now_ms: i64) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.entries.insert(
            trace_id.clone(),
            TraceEntry {
                value,
                created_at_ms: now_ms,
                last_accessed_ms: now_ms,
            },
        );
        Self::bump_lru(&mut state.order, &trace_id);
        while state.entries.len() > self.max_keep {
            if state.order.is_empty() {
                break;
            }
            let evicted = state.order.remove(0);
            state.entries.remove(&evicted);
        }
    }

    /// Fetch the payload for `trace_id`. Returns `not_found` (never a
    /// fallback scan) when the id is unknown or the entry has expired.
    pub fn get_at(&self, trace_id: &str, now_ms: i64) -> Result<T, SearchCoreError> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let expired = state
            .entries
            .get(trace_id)
            .is_some_and(|entry| entry.is_expired(now_ms, self.ttl_sec));
        if expired {
            state.entries.remove(trace_id);
            if let Some(pos) = state.order.iter().position(|k| k == trace_id) {
                state.order.remove(pos);
            }
            return Err(SearchCoreError::not_found_expired_trace(trace_id));
        }
        let Some(entry) = state.entries.get_mut(trace_id) else {
            return Err(SearchCoreError::not_found_unknown_trace(trace_id));
        };
        entry.last_accessed_ms = now_ms;
        let value = entry.value.clone();
        Self::bump_lru(&mut state.order, trace_id);
        Ok(value)
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
