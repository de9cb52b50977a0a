//! Collaborator traits: the narrow seams the pipeline depends on instead of a
//! concrete clock, id source, or transport (SPEC_FULL.md §4.12).
//!
//! Grounded on `engine.rs`'s `DocumentSource`/`SearchEngine`/`IndexLifecycle`
//! trait seam — the same "narrow interface, swappable shipped implementation,
//! test double substitutes freely" shape, applied to the two collaborators
//! SPEC_FULL.md adds beyond what the teacher's own traits cover.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock access, abstracted so budget deadlines, TTL expiry, and trace/
/// cache timestamps never read `SystemTime::now()` directly — tests
/// substitute a deterministic clock instead.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// The shipped [`Clock`]: wraps `SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// Mints fresh trace ids, including the "always a new id on a cache hit"
/// invariant (SPEC_FULL.md §4.9).
pub trait IdGenerator: Send + Sync {
    fn next_trace_id(&self) -> String;
}

/// The shipped [`IdGenerator`]: a process-lifetime monotonic counter seeded
/// from the time the generator was created, so ids are unique within a
/// process without pulling in a dedicated randomness crate.
pub struct CounterIdGenerator {
    seed: u64,
    counter: AtomicU64,
}

impl CounterIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self { seed, counter: AtomicU64::new(0) }
    }
}

impl Default for CounterIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for CounterIdGenerator {
    fn next_trace_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("trace-{:016x}-{n:08x}", self.seed)
    }
}

/// A deterministic, test-only [`Clock`] that returns a fixed or
/// externally-advanced value.
#[cfg(any(test, feature = "test-support"))]
pub struct FixedClock {
    now_ms: std::sync::atomic::AtomicI64,
}

#[cfg(any(test, feature = "test-support"))]
impl FixedClock {
    #[must_use]
    pub fn new(now_ms: i64) -> Self {
        Self { now_ms: std::sync::atomic::AtomicI64::new(now_ms) }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::Relaxed)
    }
}

/// A deterministic, test-only [`IdGenerator`] yielding a preset sequence.
#[cfg(any(test, feature = "test-support"))]
pub struct SequentialIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

#[cfg(any(test, feature = "test-support"))]
impl SequentialIdGenerator {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
impl IdGenerator for SequentialIdGenerator {
    fn next_trace_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_id_generator_never_repeats() {
        let gen = CounterIdGenerator::new();
        let a = gen.next_trace_id();
        let b = gen.next_trace_id();
        assert_ne!(a, b);
    }

    #[test]
    fn fixed_clock_holds_steady_until_advanced() {
        let clock = FixedClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
    }

    #[test]
    fn sequential_id_generator_yields_preset_sequence() {
        let gen = SequentialIdGenerator::new("t");
        assert_eq!(gen.next_trace_id(), "t-0");
        assert_eq!(gen.next_trace_id(), "t-1");
    }
}
