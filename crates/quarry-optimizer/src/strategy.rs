//! Join strategies.
//!
//! A strategy describes how an inner unit is combined with the rows already
//! flowing from the outer part of the join order. Strategies are consulted
//! three ways during the search: feasibility (can this strategy work for
//! this unit at all), costing (scale a single-scan estimate by the outer
//! cost), and memory (how much must be held resident per scan).
//!
//! The registry owns the strategy set for one optimizer. Index 0 must be a
//! strategy that is always feasible, because fresh access paths start there.

use quarry_types::{CostEstimate, TableSet};
use serde::{Deserialize, Serialize};

use crate::predicate::{PredicateKind, PredicateList};
use crate::stats::CostModel;

/// Position of a strategy in its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategyId(pub usize);

pub trait JoinStrategy: std::fmt::Debug + Send + Sync {
    /// Lowercase name, matched case-insensitively against user overrides.
    fn name(&self) -> &'static str;

    /// Whether this strategy can join `unit` given the predicates currently
    /// hosted on it. `referenced` is the unit's referenced-table map.
    fn feasible(&self, referenced: &TableSet, hosted: &PredicateList) -> bool;

    /// True when the inner unit is scanned once per outer row.
    fn multiplies_base_cost_by_outer_rows(&self) -> bool;

    /// True when the inner unit is materialized before joining, which
    /// destroys any ordering its access path would otherwise contribute.
    fn materializes_inner(&self) -> bool;

    /// Total cost of joining the inner unit (costed at `base` for one scan)
    /// beneath `outer`.
    fn estimate_cost(
        &self,
        base: &CostEstimate,
        outer: &CostEstimate,
        model: &CostModel,
    ) -> CostEstimate;

    /// Resident bytes needed per scan of the inner unit.
    fn memory_usage(&self, per_row_bytes: f64, rows_per_scan: f64) -> f64;
}

// ---------------------------------------------------------------------------
// Nested loop
// ---------------------------------------------------------------------------

/// Rescans the inner unit for every outer row. Always feasible, never holds
/// anything resident, and preserves whatever ordering the inner scan has.
#[derive(Debug, Default)]
pub struct NestedLoopJoin;

impl JoinStrategy for NestedLoopJoin {
    fn name(&self) -> &'static str {
        "nestedloop"
    }

    fn feasible(&self, _referenced: &TableSet, _hosted: &PredicateList) -> bool {
        true
    }

    fn multiplies_base_cost_by_outer_rows(&self) -> bool {
        true
    }

    fn materializes_inner(&self) -> bool {
        false
    }

    fn estimate_cost(
        &self,
        base: &CostEstimate,
        outer: &CostEstimate,
        _model: &CostModel,
    ) -> CostEstimate {
        base.scaled(outer.row_count.max(1.0))
    }

    fn memory_usage(&self, _per_row_bytes: f64, _rows_per_scan: f64) -> f64 {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Hash join
// ---------------------------------------------------------------------------

/// Builds a hash table over the inner unit once, then probes it per outer
/// row. Needs an equijoin between the inner unit and some outer table to
/// serve as the hash key.
#[derive(Debug, Default)]
pub struct HashJoin;

impl JoinStrategy for HashJoin {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn feasible(&self, referenced: &TableSet, hosted: &PredicateList) -> bool {
        hosted.iter().any(|p| match &p.kind {
            PredicateKind::Equijoin { left, right } => {
                referenced.contains(left.0) != referenced.contains(right.0)
            }
            _ => false,
        })
    }

    fn multiplies_base_cost_by_outer_rows(&self) -> bool {
        false
    }

    fn materializes_inner(&self) -> bool {
        true
    }

    fn estimate_cost(
        &self,
        base: &CostEstimate,
        outer: &CostEstimate,
        model: &CostModel,
    ) -> CostEstimate {
        let outer_rows = outer.row_count.max(1.0);
        let total_rows = base.row_count * outer_rows;
        let cost = base.cost
            + base.row_count * model.build_cpu
            + outer_rows * model.probe_cpu
            + total_rows * model.row_cpu;
        CostEstimate::new(cost, total_rows, base.row_count)
    }

    fn memory_usage(&self, per_row_bytes: f64, rows_per_scan: f64) -> f64 {
        per_row_bytes * rows_per_scan.max(0.0)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct StrategyRegistry {
    strategies: Vec<Box<dyn JoinStrategy>>,
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.strategies.iter().map(|s| s.name()))
            .finish()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self {
            strategies: vec![Box::new(NestedLoopJoin), Box::new(HashJoin)],
        }
    }
}

impl StrategyRegistry {
    #[must_use]
    pub fn new(strategies: Vec<Box<dyn JoinStrategy>>) -> Self {
        debug_assert!(!strategies.is_empty(), "registry needs at least one strategy");
        Self { strategies }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: StrategyId) -> &dyn JoinStrategy {
        &*self.strategies[id.0]
    }

    /// The strategy fresh access paths start with.
    #[must_use]
    pub fn initial(&self) -> StrategyId {
        StrategyId(0)
    }

    /// Case-insensitive lookup, for user strategy overrides.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<StrategyId> {
        self.strategies
            .iter()
            .position(|s| s.name().eq_ignore_ascii_case(name))
            .map(StrategyId)
    }
}

#[cfg(test)]
mod tests {
    use quarry_types::{ColumnId, TableNum};

    use super::*;
    use crate::predicate::{PredId, Predicate, RestrictionOp};

    fn hosted_with_equijoin() -> PredicateList {
        [Predicate::equijoin(
            PredId(0),
            4,
            (TableNum(1), ColumnId(0)),
            (TableNum(2), ColumnId(0)),
        )]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_hash_needs_equijoin_crossing_the_unit_boundary() {
        let hash = HashJoin;
        let unit = TableSet::single(4, TableNum(2));
        assert!(hash.feasible(&unit, &hosted_with_equijoin()));

        // A restriction is no hash key.
        let restriction: PredicateList = [Predicate::restriction(
            PredId(1),
            4,
            TableNum(2),
            ColumnId(0),
            RestrictionOp::Equals,
            None,
        )]
        .into_iter()
        .collect();
        assert!(!hash.feasible(&unit, &restriction));

        // An equijoin entirely inside the unit is no hash key either.
        let mut both = TableSet::new(4);
        both.insert(TableNum(1));
        both.insert(TableNum(2));
        assert!(!hash.feasible(&both, &hosted_with_equijoin()));
    }

    #[test]
    fn test_nested_loop_scales_by_outer_rows() {
        let model = CostModel::default();
        let base = CostEstimate::new(10.0, 5.0, 5.0);
        let outer = CostEstimate::new(100.0, 40.0, 40.0);
        let est = NestedLoopJoin.estimate_cost(&base, &outer, &model);
        assert_eq!(est.cost, 400.0);
        assert_eq!(est.row_count, 200.0);
        assert_eq!(est.single_scan_row_count, 5.0);
    }

    #[test]
    fn test_hash_beats_nested_loop_for_large_outer() {
        let model = CostModel::default();
        let base = CostEstimate::new(50.0, 10.0, 10.0);
        let outer = CostEstimate::new(1000.0, 10_000.0, 10_000.0);
        let nl = NestedLoopJoin.estimate_cost(&base, &outer, &model);
        let hash = HashJoin.estimate_cost(&base, &outer, &model);
        assert!(hash.cost < nl.cost);
        assert_eq!(hash.row_count, nl.row_count);
    }

    #[test]
    fn test_memory_usage() {
        assert_eq!(NestedLoopJoin.memory_usage(100.0, 5000.0), 0.0);
        assert_eq!(HashJoin.memory_usage(100.0, 5000.0), 500_000.0);
    }

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let reg = StrategyRegistry::default();
        assert_eq!(reg.find("HASH"), Some(StrategyId(1)));
        assert_eq!(reg.find("NestedLoop"), Some(StrategyId(0)));
        assert_eq!(reg.find("mergesort"), None);
        assert_eq!(reg.get(reg.initial()).name(), "nestedloop");
    }
}
