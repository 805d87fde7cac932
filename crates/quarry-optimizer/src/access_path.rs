//! Access paths: how one unit is scanned and joined at one position.
//!
//! Every unit carries four path slots with strict roles: `current` is the
//! candidate being costed and is the only slot costing may write through,
//! `best` is the cheapest complete candidate seen at the unit's current
//! join position, `best_sort_avoidance` is the cheapest candidate that also
//! preserves the required ordering, and `truly_best` is the frozen copy of
//! whichever slot was part of the best complete join order found so far.

use quarry_types::{CostEstimate, LockGranularity};
use serde::{Deserialize, Serialize};

use crate::strategy::StrategyId;

/// The physical shape a unit is read through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoragePath {
    /// The table's heap, or a non-base unit's natural materialization.
    Heap,
    /// An index, by position in the unit's index list.
    Index(usize),
}

/// Which best-cost slot a remembered plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinPlanKind {
    Normal,
    SortAvoidance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPath {
    pub storage: StoragePath,
    pub strategy: StrategyId,
    pub lock_granularity: LockGranularity,
    pub covering_index_scan: bool,
    pub non_matching_index_scan: bool,
    /// `None` until costing has produced an estimate for this slot.
    pub cost: Option<CostEstimate>,
}

impl AccessPath {
    /// A fresh, uncosted heap path using `strategy`.
    #[must_use]
    pub fn with_strategy(strategy: StrategyId) -> Self {
        Self {
            storage: StoragePath::Heap,
            strategy,
            lock_granularity: LockGranularity::Row,
            covering_index_scan: false,
            non_matching_index_scan: true,
            cost: None,
        }
    }

    #[must_use]
    pub fn is_costed(&self) -> bool {
        self.cost.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_path_is_uncosted_heap() {
        let p = AccessPath::with_strategy(StrategyId(0));
        assert_eq!(p.storage, StoragePath::Heap);
        assert!(!p.is_costed());
        assert!(p.non_matching_index_scan);
        assert!(!p.covering_index_scan);
        assert_eq!(p.lock_granularity, LockGranularity::Row);
    }
}
