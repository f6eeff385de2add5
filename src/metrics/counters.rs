//! Counter metrics for monotonically increasing values.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the counter help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter split by a fixed set of label values.
#[derive(Debug)]
pub struct LabeledCounter<const N: usize> {
    name: &'static str,
    label_names: [&'static str; N],
    counters: RwLock<HashMap<[String; N], AtomicU64>>,
}

impl<const N: usize> LabeledCounter<N> {
    /// Create a new labeled counter.
    pub fn new(name: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            label_names,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the label names.
    pub fn label_names(&self) -> &[&'static str; N] {
        &self.label_names
    }

    /// Increment the counter for the given label values.
    pub fn inc(&self, labels: [&str; N]) {
        let key: [String; N] = labels.map(|s| s.to_string());

        if let Some(counter) = self.counters.read().get(&key) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Get the value for specific label values.
    pub fn get(&self, labels: [&str; N]) -> u64 {
        let key: [String; N] = labels.map(|s| s.to_string());
        self.counters
            .read()
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum over all label values.
    pub fn total(&self) -> u64 {
        self.counters
            .read()
            .values()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }
}

/// A counter with one slot per worker, merged on read.
///
/// Workers that bump the counter on hot paths write to their own slot so they
/// never contend on a shared cache line.
#[derive(Debug)]
pub struct ShardedCounter {
    name: &'static str,
    slots: Box<[AtomicU64]>,
}

impl ShardedCounter {
    /// Create a counter with `shards` slots (at least one).
    pub fn new(name: &'static str, shards: usize) -> Self {
        let slots = (0..shards.max(1)).map(|_| AtomicU64::new(0)).collect();
        Self { name, slots }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of slots.
    pub fn shards(&self) -> usize {
        self.slots.len()
    }

    /// Add `n` to the slot owned by `worker`. Indexes wrap around.
    pub fn add(&self, worker: usize, n: u64) {
        self.slots[worker % self.slots.len()].fetch_add(n, Ordering::Relaxed);
    }

    /// Sum of all slots.
    pub fn sum(&self) -> u64 {
        self.slots.iter().map(|s| s.load(Ordering::Relaxed)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "A test counter");
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
        assert_eq!(counter.name(), "test_counter");
    }

    #[test]
    fn test_labeled_counter() {
        let counter = LabeledCounter::<1>::new("fallbacks", ["reason"]);

        counter.inc(["corruption"]);
        counter.inc(["corruption"]);
        counter.inc(["io"]);

        assert_eq!(counter.get(["corruption"]), 2);
        assert_eq!(counter.get(["io"]), 1);
        assert_eq!(counter.get(["range_unavailable"]), 0);
        assert_eq!(counter.total(), 3);
    }

    #[test]
    fn test_sharded_counter_merges_slots() {
        let counter = Arc::new(ShardedCounter::new("applied", 4));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        counter.add(worker, 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.sum(), 800);
        assert_eq!(counter.shards(), 4);
    }
}
