//! Exhaustive plan oracle.
//!
//! Enumerates every dependency-legal complete join order of a block and
//! prices each position with the cheapest feasible access path, using plain
//! left-to-right summation over the block's spec. No pruning, no timeout,
//! no incremental accounting: on blocks small enough to enumerate, the
//! cheapest order found here is the floor the real search must land on.
//!
//! The oracle prices the pure join stream. A required ordering adds a sort
//! term the search accounts separately, so differential checks on ordered
//! blocks go through the replay simulator instead.

use std::cmp::Ordering;

use quarry_optimizer::{
    CostModel, PredicateList, StoragePath, StrategyId, StrategyRegistry,
};
use quarry_types::{CostEstimate, TableNum, TableSet};
use serde::Serialize;

use crate::catalog::{BlockSpec, TableSpec};

/// Knobs the oracle shares with the search it checks.
#[derive(Debug)]
pub struct OracleConfig {
    pub model: CostModel,
    pub registry: StrategyRegistry,
    pub max_memory_per_table: usize,
    pub outermost_rows: f64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            model: CostModel::default(),
            registry: StrategyRegistry::default(),
            max_memory_per_table: 1024 * 1024,
            outermost_rows: 1.0,
        }
    }
}

/// One fully priced join order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OraclePlan {
    /// Units outermost first.
    pub order: Vec<TableNum>,
    /// The winning estimate at each position, in `order`.
    pub position_costs: Vec<CostEstimate>,
    /// Summed cost with the innermost position's row counts.
    pub cost: CostEstimate,
}

/// The oracle's verdict over a whole block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OracleReport {
    pub best: OraclePlan,
    pub orders_explored: usize,
}

impl OracleReport {
    /// Serializes the report to pretty JSON, for golden files next to
    /// [`quarry_optimizer::Plan::to_json`] output.
    ///
    /// # Errors
    ///
    /// Propagates serializer failures.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Every complete join order whose every placement respects unit
/// dependencies, in lexicographic order of positions.
#[must_use]
pub fn legal_orders(block: &BlockSpec) -> Vec<Vec<TableNum>> {
    let n = block.tables.len();
    let mut out = Vec::new();
    let mut order = Vec::with_capacity(n);
    let mut placed = TableSet::new(n.max(1));
    walk_orders(block, &mut order, &mut placed, &mut out);
    out
}

fn walk_orders(
    block: &BlockSpec,
    order: &mut Vec<TableNum>,
    placed: &mut TableSet,
    out: &mut Vec<Vec<TableNum>>,
) {
    if order.len() == block.tables.len() {
        out.push(order.clone());
        return;
    }
    for spec in &block.tables {
        if placed.contains(spec.table_num) {
            continue;
        }
        if !spec.dependencies.iter().all(|&d| placed.contains(d)) {
            continue;
        }
        placed.insert(spec.table_num);
        order.push(spec.table_num);
        walk_orders(block, order, placed, out);
        order.pop();
        placed.remove(spec.table_num);
    }
}

/// Prices one complete order: predicates land on the first position that
/// covers them, each position takes its cheapest feasible path, costs sum
/// left to right, and the innermost estimate supplies the row counts.
#[must_use]
pub fn price_order(block: &BlockSpec, config: &OracleConfig, order: &[TableNum]) -> OraclePlan {
    let capacity = block.capacity();
    let mut claimed = vec![false; block.predicates.len()];
    let mut prefix = TableSet::new(capacity);
    let mut outer = CostEstimate::new(0.0, config.outermost_rows, 1.0);
    let mut total = 0.0;
    let mut position_costs = Vec::with_capacity(order.len());

    for &table in order {
        let spec = block.table(table);
        prefix.insert(table);

        let mut hosted = PredicateList::new();
        for (i, pred) in block.predicates.iter().enumerate() {
            if claimed[i] || !pred.pushable || !prefix.contains_all(&pred.referenced) {
                continue;
            }
            if let Some(scope) = &pred.scope {
                if !scope.target_tables.contains(table) {
                    continue;
                }
            }
            claimed[i] = true;
            hosted.push(pred.clone());
        }

        let est = cheapest_path(spec, &hosted, &outer, config, capacity);
        total += est.cost;
        position_costs.push(est);
        outer = est;
    }

    OraclePlan {
        order: order.to_vec(),
        position_costs,
        cost: CostEstimate::new(total, outer.row_count, outer.single_scan_row_count),
    }
}

/// Minimum over storage paths and join strategies for one placement,
/// honoring feasibility and the per-table memory budget.
fn cheapest_path(
    spec: &TableSpec,
    hosted: &PredicateList,
    outer: &CostEstimate,
    config: &OracleConfig,
    capacity: usize,
) -> CostEstimate {
    let referenced = TableSet::single(capacity, spec.table_num);
    let stats = spec.stats();
    let mut best: Option<CostEstimate> = None;

    for storage in storage_paths(spec) {
        let base = match storage {
            StoragePath::Heap => config.model.full_scan(&stats, hosted.combined_selectivity()),
            StoragePath::Index(i) => {
                let index = &spec.indexes[i];
                let matched = hosted.matched_prefix(spec.table_num, index);
                let residual = hosted.residual_selectivity(&matched.consumed);
                config.model.index_scan(
                    &stats,
                    index,
                    matched.prefix_selectivity,
                    residual,
                    spec.covered_by(index),
                )
            }
        };
        for s in 0..config.registry.len() {
            let strategy = config.registry.get(StrategyId(s));
            if !strategy.feasible(&referenced, hosted) {
                continue;
            }
            let est = strategy.estimate_cost(&base, outer, &config.model);
            let rows_per_scan = if outer.row_count > 0.0 {
                est.row_count / outer.row_count
            } else {
                est.row_count
            };
            if strategy.memory_usage(spec.row_width, rows_per_scan)
                > config.max_memory_per_table as f64
            {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => est.compare(&b) == Ordering::Less,
            };
            if better {
                best = Some(est);
            }
        }
    }

    // The heap scanned by a nested loop is always feasible and within
    // budget, so a block built from the catalog never lands here.
    best.unwrap_or(CostEstimate::WORST)
}

fn storage_paths(spec: &TableSpec) -> impl Iterator<Item = StoragePath> + '_ {
    std::iter::once(StoragePath::Heap)
        .chain((0..spec.indexes.len()).map(StoragePath::Index))
}

/// Prices every legal order and returns the cheapest. `None` on an empty
/// block.
#[must_use]
pub fn exhaustive_best(block: &BlockSpec, config: &OracleConfig) -> Option<OracleReport> {
    debug_assert!(
        block.required.is_none(),
        "the oracle prices unordered blocks; ordered plans go through replay"
    );
    let orders = legal_orders(block);
    let mut best: Option<OraclePlan> = None;
    for order in &orders {
        let plan = price_order(block, config, order);
        let better = match &best {
            None => true,
            Some(b) => plan.cost.compare(&b.cost) == Ordering::Less,
        };
        if better {
            best = Some(plan);
        }
    }
    let best = best?;
    tracing::debug!(
        target: "quarry.harness",
        orders = orders.len(),
        order = ?best.order,
        cost = %best.cost,
        "exhaustively priced block"
    );
    Some(OracleReport {
        best,
        orders_explored: orders.len(),
    })
}
