//! Per-partition update counter with out-of-order tracking.

use crate::error::CounterError;
use crate::types::GroupPartition;
use std::collections::BTreeMap;
use std::fmt;

/// A contiguous counter range `(start, start + delta]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterRange {
    pub start: u64,
    pub delta: u64,
}

impl CounterRange {
    pub fn new(start: u64, delta: u64) -> Self {
        Self { start, delta }
    }

    /// Highest counter in the range.
    pub fn end(&self) -> u64 {
        self.start + self.delta
    }

    pub fn contains(&self, counter: u64) -> bool {
        counter > self.start && counter <= self.end()
    }
}

impl fmt::Display for CounterRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.start, self.end())
    }
}

/// Update counter of one partition.
///
/// `lwm` is the low-water mark: every counter up to and including it has been
/// applied. `reserved` is the highest counter handed out to an update in
/// progress. Ranges applied above the low-water mark wait in `out_of_order`
/// until the hole below them is filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionUpdateCounter {
    id: GroupPartition,
    lwm: u64,
    reserved: u64,
    /// start -> end of ranges applied above `lwm`.
    out_of_order: BTreeMap<u64, u64>,
}

impl PartitionUpdateCounter {
    pub fn new(id: GroupPartition) -> Self {
        Self {
            id,
            lwm: 0,
            reserved: 0,
            out_of_order: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> GroupPartition {
        self.id
    }

    /// Low-water mark.
    pub fn get(&self) -> u64 {
        self.lwm
    }

    /// Highest counter known to the partition, reserved or applied.
    pub fn hwm(&self) -> u64 {
        let applied = self.out_of_order.values().next_back().copied().unwrap_or(self.lwm);
        self.reserved.max(applied)
    }

    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    /// Reserve `delta` counters and return the range start.
    pub fn reserve(&mut self, delta: u64) -> Result<u64, CounterError> {
        let start = self.hwm();
        let end = start.checked_add(delta).ok_or(CounterError::Overflow {
            group: self.id.group,
            partition: self.id.partition,
            value: start,
        })?;
        self.reserved = end;
        Ok(start)
    }

    /// Mark `(start, start + delta]` as applied.
    ///
    /// Returns `false` if the range was applied before.
    pub fn update(&mut self, start: u64, delta: u64) -> Result<bool, CounterError> {
        if delta == 0 {
            return Err(CounterError::InvalidRange { start, delta });
        }
        let end = start.checked_add(delta).ok_or(CounterError::Overflow {
            group: self.id.group,
            partition: self.id.partition,
            value: start,
        })?;

        if end <= self.lwm {
            return Ok(false);
        }

        if start <= self.lwm {
            self.lwm = end;
            self.absorb();
        } else {
            let overlaps = self
                .out_of_order
                .range(..end)
                .next_back()
                .is_some_and(|(_, e)| *e > start);
            if overlaps {
                return Ok(false);
            }
            self.out_of_order.insert(start, end);
        }

        if end > self.reserved {
            self.reserved = end;
        }
        Ok(true)
    }

    fn absorb(&mut self) {
        while let Some((&start, &end)) = self.out_of_order.iter().next() {
            if start > self.lwm {
                break;
            }
            self.out_of_order.remove(&start);
            self.lwm = self.lwm.max(end);
        }
    }

    /// Holes between the low-water mark and the highest known counter.
    pub fn gaps(&self) -> Vec<CounterRange> {
        let mut gaps = Vec::new();
        let mut cursor = self.lwm;
        for (&start, &end) in &self.out_of_order {
            if start > cursor {
                gaps.push(CounterRange::new(cursor, start - cursor));
            }
            cursor = end;
        }
        if self.reserved > cursor {
            gaps.push(CounterRange::new(cursor, self.reserved - cursor));
        }
        gaps
    }

    /// Whether any counter below the high-water mark is missing.
    pub fn has_gaps(&self) -> bool {
        self.hwm() > self.lwm
    }

    /// Reset to a known applied counter, as after loading a checkpoint or a
    /// full partition transfer.
    pub fn update_initial(&mut self, counter: u64) {
        self.lwm = counter;
        self.reserved = counter;
        self.out_of_order.clear();
    }
}

impl fmt::Display for PartitionUpdateCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Counter[{}, lwm={}, hwm={}, holes={}]",
            self.id,
            self.lwm,
            self.hwm(),
            self.out_of_order.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> PartitionUpdateCounter {
        PartitionUpdateCounter::new(GroupPartition::new(1, 0))
    }

    #[test]
    fn test_in_order_updates() {
        let mut c = counter();
        for i in 0..10 {
            assert_eq!(c.reserve(1).unwrap(), i);
            assert!(c.update(i, 1).unwrap());
        }
        assert_eq!(c.get(), 10);
        assert!(!c.has_gaps());
    }

    #[test]
    fn test_out_of_order_commit_fills_hole() {
        let mut c = counter();
        let a = c.reserve(3).unwrap();
        let b = c.reserve(2).unwrap();
        assert_eq!((a, b), (0, 3));

        assert!(c.update(b, 2).unwrap());
        assert_eq!(c.get(), 0);
        assert_eq!(c.gaps(), vec![CounterRange::new(0, 3)]);

        assert!(c.update(a, 3).unwrap());
        assert_eq!(c.get(), 5);
        assert!(c.gaps().is_empty());
    }

    #[test]
    fn test_duplicate_update_rejected() {
        let mut c = counter();
        assert!(c.update(0, 2).unwrap());
        assert!(!c.update(0, 2).unwrap());
        assert!(!c.update(1, 1).unwrap());

        assert!(c.update(5, 1).unwrap());
        assert!(!c.update(5, 1).unwrap());
        assert_eq!(c.get(), 2);
    }

    #[test]
    fn test_reserved_but_unapplied_is_gap() {
        let mut c = counter();
        c.update(0, 4).unwrap();
        c.reserve(2).unwrap();
        assert_eq!(c.gaps(), vec![CounterRange::new(4, 2)]);
        assert!(c.has_gaps());

        c.update(4, 2).unwrap();
        assert!(!c.has_gaps());
    }

    #[test]
    fn test_overflow_detected() {
        let mut c = counter();
        c.update_initial(u64::MAX - 1);
        assert_eq!(c.reserve(1).unwrap(), u64::MAX - 1);
        assert!(matches!(c.reserve(1), Err(CounterError::Overflow { .. })));
        assert!(matches!(
            c.update(u64::MAX, 1),
            Err(CounterError::Overflow { .. })
        ));
    }

    #[test]
    fn test_update_initial_clears_holes() {
        let mut c = counter();
        c.update(10, 1).unwrap();
        c.update_initial(20);
        assert_eq!(c.get(), 20);
        assert_eq!(c.hwm(), 20);
        assert!(c.gaps().is_empty());
    }
}
