//! Lock-free counter and gauge storage, keyed by metric name.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// A monotonic counter. `add` uses a plain atomic fetch-add — no CAS loop
/// needed since counters never need a read-modify-write over arbitrary
/// functions, only accumulation.
#[derive(Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    /// Subtracts `delta`, saturating at zero. The result is never negative
    /// (§4.11 precondition): a `decrement` past zero stops at zero rather
    /// than wrapping.
    pub fn decrement(&self, delta: u64) -> u64 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let proposed = current.saturating_sub(delta);
            match self.0.compare_exchange_weak(
                current,
                proposed,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return proposed,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Atomically reads the current value and resets it to zero.
    pub fn get_and_reset(&self) -> u64 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

/// A gauge backed by a bit-cast `f64`. Updates that need to read-then-write
/// (e.g. "set only if greater") go through a CAS loop since floats have no
/// native atomic add/sub.
pub struct AtomicGauge(AtomicU64);

impl AtomicGauge {
    pub fn new(initial: f64) -> Self {
        Self(AtomicU64::new(initial.to_bits()))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Applies `update` to the current value via a CAS loop, retrying on
    /// concurrent writers.
    pub fn update(&self, update: impl Fn(f64) -> f64) -> f64 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let proposed = update(f64::from_bits(current)).to_bits();
            match self.0.compare_exchange_weak(
                current,
                proposed,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return f64::from_bits(proposed),
                Err(actual) => current = actual,
            }
        }
    }

    /// Unconditionally stores `value`, returning the value that was replaced.
    pub fn exchange(&self, value: f64) -> f64 {
        f64::from_bits(self.0.swap(value.to_bits(), Ordering::AcqRel))
    }

    /// True compare-and-swap: stores `desired` only if the current value is
    /// bit-exactly `expected`, failing (without retrying) otherwise. Unlike
    /// [`Self::update`], a mismatch is reported to the caller instead of
    /// being silently retried.
    pub fn compare_exchange(&self, expected: f64, desired: f64) -> bool {
        self.0
            .compare_exchange(
                expected.to_bits(),
                desired.to_bits(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}

impl Default for AtomicGauge {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Per-name counter/gauge storage shared across producers.
#[derive(Default)]
pub struct AtomicStorage {
    counters: DashMap<String, AtomicCounter>,
    gauges: DashMap<String, AtomicGauge>,
}

impl AtomicStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, delta: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(AtomicCounter::new)
            .add(delta);
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters.get(name).map(|c| c.get()).unwrap_or(0)
    }

    /// Decrements a named counter, creating it at zero first if absent.
    pub fn decrement_counter(&self, name: &str, delta: u64) -> u64 {
        self.counters
            .entry(name.to_string())
            .or_insert_with(AtomicCounter::new)
            .decrement(delta)
    }

    pub fn reset_counter(&self, name: &str) -> u64 {
        self.counters
            .entry(name.to_string())
            .or_insert_with(AtomicCounter::new)
            .get_and_reset()
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(AtomicGauge::default)
            .set(value);
    }

    pub fn update_gauge(&self, name: &str, update: impl Fn(f64) -> f64) -> f64 {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(AtomicGauge::default)
            .update(update)
    }

    pub fn exchange_gauge(&self, name: &str, value: f64) -> f64 {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(AtomicGauge::default)
            .exchange(value)
    }

    pub fn compare_exchange_gauge(&self, name: &str, expected: f64, desired: f64) -> bool {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(AtomicGauge::default)
            .compare_exchange(expected, desired)
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).map(|g| g.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter_accumulates_across_clones() {
        let storage = Arc::new(AtomicStorage::new());
        for _ in 0..100 {
            storage.increment_counter("requests", 1);
        }
        assert_eq!(storage.counter_value("requests"), 100);
    }

    #[test]
    fn gauge_update_is_cas_correct_under_contention() {
        let storage = Arc::new(AtomicStorage::new());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let storage = Arc::clone(&storage);
                scope.spawn(move || {
                    for _ in 0..1000 {
                        storage.update_gauge("inflight", |v| v + 1.0);
                    }
                });
            }
        });
        assert_eq!(storage.gauge_value("inflight"), Some(8000.0));
    }

    #[test]
    fn decrement_saturates_at_zero_and_never_goes_negative() {
        let counter = AtomicCounter::new();
        counter.add(5);
        assert_eq!(counter.decrement(3), 2);
        assert_eq!(counter.decrement(10), 0);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn get_and_reset_reads_then_zeroes() {
        let counter = AtomicCounter::new();
        counter.add(7);
        assert_eq!(counter.get_and_reset(), 7);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn gauge_exchange_returns_previous_value() {
        let gauge = AtomicGauge::new(1.0);
        assert_eq!(gauge.exchange(2.0), 1.0);
        assert_eq!(gauge.get(), 2.0);
    }

    #[test]
    fn gauge_compare_exchange_only_succeeds_on_exact_match() {
        let gauge = AtomicGauge::new(1.0);
        assert!(!gauge.compare_exchange(99.0, 2.0));
        assert_eq!(gauge.get(), 1.0);
        assert!(gauge.compare_exchange(1.0, 2.0));
        assert_eq!(gauge.get(), 2.0);
    }
}
