//! Per-transaction counter accumulation.

use crate::counters::tracker::UpdateCounterTracker;
use crate::counters::update_counter::CounterRange;
use crate::error::CounterError;
use crate::types::GroupPartition;
use std::collections::HashMap;

/// Update counter bookkeeping for one transaction.
///
/// Updates are counted per partition while the transaction runs. On commit
/// [`TxCounters::finalize`] reserves one contiguous range per touched
/// partition, and [`TxCounters::generate_next_counter`] hands out the values
/// of that range to the individual entries in order.
#[derive(Debug, Default)]
pub struct TxCounters {
    accumulated: HashMap<GroupPartition, u64>,
    ranges: HashMap<GroupPartition, CounterRange>,
    generated: HashMap<GroupPartition, u64>,
}

impl TxCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `delta` more updates for the partition.
    pub fn accumulate(&mut self, id: GroupPartition, delta: u64) {
        *self.accumulated.entry(id).or_insert(0) += delta;
    }

    pub fn increment(&mut self, id: GroupPartition) {
        self.accumulate(id, 1);
    }

    /// Take back one counted update.
    pub fn decrement(&mut self, id: GroupPartition) -> Result<(), CounterError> {
        match self.accumulated.get_mut(&id) {
            Some(acc) if *acc > 0 => {
                *acc -= 1;
                Ok(())
            }
            _ => Err(CounterError::NegativeDelta {
                group: id.group,
                partition: id.partition,
            }),
        }
    }

    pub fn accumulated(&self, id: GroupPartition) -> u64 {
        self.accumulated.get(&id).copied().unwrap_or(0)
    }

    /// Reserve a range for every touched partition.
    ///
    /// Returns the reserved ranges sorted by partition.
    pub fn finalize(
        &mut self,
        tracker: &UpdateCounterTracker,
    ) -> Result<Vec<(GroupPartition, CounterRange)>, CounterError> {
        let mut touched: Vec<_> = self
            .accumulated
            .iter()
            .filter(|(_, delta)| **delta > 0)
            .map(|(id, delta)| (*id, *delta))
            .collect();
        touched.sort_unstable_by_key(|(id, _)| *id);

        let mut out = Vec::with_capacity(touched.len());
        for (id, delta) in touched {
            let start = tracker.reserve_range(id, delta)?;
            let range = CounterRange::new(start, delta);
            self.ranges.insert(id, range);
            self.generated.insert(id, start);
            out.push((id, range));
        }
        Ok(out)
    }

    /// Reserved range of a partition, after `finalize`.
    pub fn range(&self, id: GroupPartition) -> Option<CounterRange> {
        self.ranges.get(&id).copied()
    }

    /// Next counter of the partition's reserved range.
    pub fn generate_next_counter(&mut self, id: GroupPartition) -> Result<u64, CounterError> {
        let range = self.ranges.get(&id).ok_or(CounterError::NotReserved {
            group: id.group,
            partition: id.partition,
        })?;
        let current = self.generated.get(&id).copied().unwrap_or(range.start);
        let next = current.checked_add(1).ok_or(CounterError::Overflow {
            group: id.group,
            partition: id.partition,
            value: current,
        })?;
        if next > range.end() {
            return Err(CounterError::RangeExhausted {
                group: id.group,
                partition: id.partition,
            });
        }
        self.generated.insert(id, next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::history::CheckpointHistory;
    use std::sync::Arc;

    fn tracker() -> UpdateCounterTracker {
        UpdateCounterTracker::new(Arc::new(CheckpointHistory::new()))
    }

    #[test]
    fn test_finalize_and_generate() {
        let tracker = tracker();
        let p0 = GroupPartition::new(1, 0);
        let p1 = GroupPartition::new(1, 1);

        let mut tx = TxCounters::new();
        tx.increment(p0);
        tx.increment(p0);
        tx.increment(p1);

        let ranges = tx.finalize(&tracker).unwrap();
        assert_eq!(
            ranges,
            vec![(p0, CounterRange::new(0, 2)), (p1, CounterRange::new(0, 1))]
        );

        assert_eq!(tx.generate_next_counter(p0).unwrap(), 1);
        assert_eq!(tx.generate_next_counter(p0).unwrap(), 2);
        assert!(matches!(
            tx.generate_next_counter(p0),
            Err(CounterError::RangeExhausted { .. })
        ));
    }

    #[test]
    fn test_two_transactions_get_disjoint_ranges() {
        let tracker = tracker();
        let p = GroupPartition::new(1, 0);

        let mut a = TxCounters::new();
        a.accumulate(p, 3);
        let mut b = TxCounters::new();
        b.accumulate(p, 2);

        let ra = a.finalize(&tracker).unwrap()[0].1;
        let rb = b.finalize(&tracker).unwrap()[0].1;
        assert_eq!(ra, CounterRange::new(0, 3));
        assert_eq!(rb, CounterRange::new(3, 2));

        tracker.apply_final(p, rb).unwrap();
        assert_eq!(tracker.get(p), 0);
        tracker.apply_final(p, ra).unwrap();
        assert_eq!(tracker.get(p), 5);
    }

    #[test]
    fn test_decrement_below_zero() {
        let p = GroupPartition::new(1, 0);
        let mut tx = TxCounters::new();
        assert!(matches!(
            tx.decrement(p),
            Err(CounterError::NegativeDelta { .. })
        ));
        tx.increment(p);
        tx.decrement(p).unwrap();
        assert_eq!(tx.accumulated(p), 0);
    }

    #[test]
    fn test_generate_without_finalize() {
        let mut tx = TxCounters::new();
        assert!(matches!(
            tx.generate_next_counter(GroupPartition::new(1, 0)),
            Err(CounterError::NotReserved { .. })
        ));
    }

    #[test]
    fn test_generate_overflow_is_checked() {
        let tracker = tracker();
        let p = GroupPartition::new(1, 0);
        tracker.update_initial(p, u64::MAX - 1);

        let mut tx = TxCounters::new();
        tx.increment(p);
        tx.finalize(&tracker).unwrap();
        assert_eq!(tx.generate_next_counter(p).unwrap(), u64::MAX);
        assert!(matches!(
            tx.generate_next_counter(p),
            Err(CounterError::Overflow { .. })
        ));
    }
}
