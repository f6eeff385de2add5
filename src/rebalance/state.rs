//! Per-partition rebalance state machine.

use crate::error::RebalanceError;
use crate::types::PartitionId;
use std::fmt;

/// Where one partition is within one rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionRebalanceState {
    NeedsAssignment,
    AwaitingSupplier,
    HistoricalInProgress,
    FullInProgress,
    /// Terminal: all data applied and the counter reached the supplier's.
    Owning,
    /// Terminal: redone under a later reassignment or topology.
    Cancelled,
}

impl PartitionRebalanceState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PartitionRebalanceState::Owning | PartitionRebalanceState::Cancelled
        )
    }

    pub fn can_transition_to(self, to: PartitionRebalanceState) -> bool {
        use PartitionRebalanceState::*;
        matches!(
            (self, to),
            (NeedsAssignment, AwaitingSupplier)
                | (NeedsAssignment, Cancelled)
                | (AwaitingSupplier, HistoricalInProgress)
                | (AwaitingSupplier, FullInProgress)
                | (AwaitingSupplier, Cancelled)
                | (HistoricalInProgress, Owning)
                | (HistoricalInProgress, Cancelled)
                | (FullInProgress, Owning)
                | (FullInProgress, Cancelled)
        )
    }

    /// Validate and return the new state.
    pub fn transition(
        self,
        partition: PartitionId,
        to: PartitionRebalanceState,
    ) -> Result<PartitionRebalanceState, RebalanceError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(RebalanceError::InvalidTransition {
                partition,
                from: self,
                to,
            })
        }
    }
}

impl fmt::Display for PartitionRebalanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionRebalanceState::NeedsAssignment => "NEEDS_ASSIGNMENT",
            PartitionRebalanceState::AwaitingSupplier => "AWAITING_SUPPLIER",
            PartitionRebalanceState::HistoricalInProgress => "HISTORICAL_IN_PROGRESS",
            PartitionRebalanceState::FullInProgress => "FULL_IN_PROGRESS",
            PartitionRebalanceState::Owning => "OWNING",
            PartitionRebalanceState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::PartitionRebalanceState::*;
    use super::*;

    #[test]
    fn test_historical_path() {
        let s = NeedsAssignment.transition(0, AwaitingSupplier).unwrap();
        let s = s.transition(0, HistoricalInProgress).unwrap();
        let s = s.transition(0, Owning).unwrap();
        assert!(s.is_terminal());
    }

    #[test]
    fn test_full_path_and_cancel() {
        let s = AwaitingSupplier.transition(3, FullInProgress).unwrap();
        assert_eq!(s.transition(3, Cancelled), Ok(Cancelled));
    }

    #[test]
    fn test_invalid_transitions() {
        assert_eq!(
            NeedsAssignment.transition(7, Owning),
            Err(RebalanceError::InvalidTransition {
                partition: 7,
                from: NeedsAssignment,
                to: Owning,
            })
        );
        assert!(Owning.transition(0, Cancelled).is_err());
        assert!(Cancelled.transition(0, AwaitingSupplier).is_err());
        assert!(HistoricalInProgress.transition(0, FullInProgress).is_err());
    }
}
