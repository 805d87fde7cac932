//! Row-order replay simulator.
//!
//! Synthesizes deterministic rows for a block's tables and replays a
//! committed plan's access paths in committed order, reporting the exact
//! sequence in which composite rows reach the client. Tests use it to check
//! that a sort-avoidance plan really emits rows in the required ordering
//! with no sort step, and that a normal plan over the same block does not.
//!
//! Predicates filter rows but never reorder survivors, so the simulator
//! replays the unfiltered cross join: orderedness of the full stream
//! implies orderedness of every filtered substream.
//!
//! Cell values follow a small linear recurrence modulo a prime, chosen so
//! heap generation order wraps within any four consecutive rows. Heap scans
//! are therefore never accidentally sorted, while index scans sort by their
//! key columns and stay sorted by construction.

use std::cmp::Ordering;

use quarry_optimizer::{Direction, Plan, RequiredOrdering};
use quarry_types::{ColumnId, TableNum};

use crate::catalog::{BlockSpec, TableSpec};

/// Columns synthesized per row. Catalog columns at or past this count have
/// no replay values and cannot appear in a replayed required ordering.
pub const NUM_COLUMNS: usize = 8;

/// One synthesized row.
pub type Row = Vec<i64>;

/// One emitted result row: the current row of every table, indexed by
/// table number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composite {
    pub cells: Vec<Row>,
}

impl Composite {
    #[must_use]
    pub fn value(&self, table: TableNum, column: ColumnId) -> i64 {
        self.cells[table.index()][column.index()]
    }
}

fn cell(table: TableNum, row: usize, column: usize) -> i64 {
    ((row * 37 + column * 11 + table.index() * 13) % 97) as i64
}

fn row_budget(spec: &TableSpec, rows_per_table: usize) -> usize {
    (spec.rows as usize).clamp(1, rows_per_table)
}

/// The table's rows in heap generation order.
#[must_use]
pub fn table_rows(spec: &TableSpec, rows_per_table: usize) -> Vec<Row> {
    (0..row_budget(spec, rows_per_table))
        .map(|r| (0..NUM_COLUMNS).map(|c| cell(spec.table_num, r, c)).collect())
        .collect()
}

/// The table's rows in the emission order of one storage path: generation
/// order off the heap, key order off an index. The label is a committed
/// [`quarry_optimizer::PlanChoice::storage`] string.
#[must_use]
pub fn scan_rows(spec: &TableSpec, storage: &str, rows_per_table: usize) -> Vec<Row> {
    let mut rows = table_rows(spec, rows_per_table);
    if storage == "heap" {
        return rows;
    }
    let index = spec.indexes.iter().find(|ix| ix.name == storage);
    debug_assert!(index.is_some(), "unknown storage label {storage}");
    if let Some(index) = index {
        rows.sort_by(|a, b| {
            index
                .key_columns
                .iter()
                .map(|c| a[c.index()].cmp(&b[c.index()]))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
    }
    rows
}

/// Replays a committed plan over synthesized rows and returns the emitted
/// composites, outermost scan driving. A materializing strategy reads its
/// build side in generation order whatever storage fed it, since the hash
/// table forgets arrival order.
#[must_use]
pub fn replay_plan(block: &BlockSpec, plan: &Plan, rows_per_table: usize) -> Vec<Composite> {
    let mut out = Vec::new();
    let mut current = vec![Row::new(); block.capacity()];
    emit(block, plan, 0, rows_per_table, &mut current, &mut out);
    tracing::debug!(
        target: "quarry.harness",
        order = ?plan.order,
        composites = out.len(),
        "replayed committed plan"
    );
    out
}

fn emit(
    block: &BlockSpec,
    plan: &Plan,
    depth: usize,
    rows_per_table: usize,
    current: &mut Vec<Row>,
    out: &mut Vec<Composite>,
) {
    if depth == plan.choices.len() {
        out.push(Composite {
            cells: current.clone(),
        });
        return;
    }
    let choice = &plan.choices[depth];
    let spec = block.table(choice.table_num);
    let stream = if choice.strategy == "hash" {
        table_rows(spec, rows_per_table)
    } else {
        scan_rows(spec, &choice.storage, rows_per_table)
    };
    for row in stream {
        current[choice.table_num.index()] = row;
        emit(block, plan, depth + 1, rows_per_table, current, out);
    }
    current[choice.table_num.index()] = Row::new();
}

/// Whether consecutive emitted composites never step backwards on the
/// required columns.
#[must_use]
pub fn is_emitted_in_order(rows: &[Composite], required: &RequiredOrdering) -> bool {
    rows.windows(2).all(|w| pair_in_order(&w[0], &w[1], required))
}

fn pair_in_order(a: &Composite, b: &Composite, required: &RequiredOrdering) -> bool {
    for rc in required.columns() {
        let av = a.value(rc.table, rc.column);
        let bv = b.value(rc.table, rc.column);
        let step = match rc.direction {
            Direction::Ascending => av.cmp(&bv),
            Direction::Descending => bv.cmp(&av),
        };
        match step {
            Ordering::Less => return true,
            Ordering::Greater => return false,
            Ordering::Equal => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use quarry_optimizer::{IndexInfo, JoinPlanKind, PlanChoice};
    use quarry_types::{CostEstimate, LockGranularity};

    use super::*;

    fn spec() -> TableSpec {
        TableSpec::new("t0", TableNum(0), 8.0)
            .with_index(IndexInfo::new("ix_t0", vec![ColumnId(0)], false))
    }

    fn nl_choice(spec: &TableSpec, storage: &str) -> PlanChoice {
        PlanChoice {
            unit: spec.name.clone(),
            table_num: spec.table_num,
            storage: storage.to_owned(),
            strategy: "nestedloop".to_owned(),
            lock_granularity: LockGranularity::Row,
            cost: CostEstimate::ZERO,
        }
    }

    #[test]
    fn test_heap_emission_wraps_inside_four_rows() {
        let rows = scan_rows(&spec(), "heap", 8);
        let col0: Vec<i64> = rows.iter().map(|r| r[0]).collect();
        assert_eq!(&col0[..4], &[0, 37, 74, 14], "37r mod 97 wraps at the fourth row");
        assert!(
            col0.windows(2).any(|w| w[0] > w[1]),
            "heap order must not be sorted: {col0:?}"
        );
    }

    #[test]
    fn test_index_emission_sorts_by_key_column() {
        let rows = scan_rows(&spec(), "ix_t0", 8);
        let col0: Vec<i64> = rows.iter().map(|r| r[0]).collect();
        assert!(
            col0.windows(2).all(|w| w[0] <= w[1]),
            "index order must be sorted: {col0:?}"
        );
    }

    #[test]
    fn test_nested_loop_replay_is_outer_major() {
        let outer = TableSpec::new("a", TableNum(0), 3.0);
        let inner = TableSpec::new("b", TableNum(1), 2.0);
        let block = BlockSpec::new(vec![outer.clone(), inner.clone()]);
        let plan = Plan {
            order: vec![TableNum(0), TableNum(1)],
            kind: JoinPlanKind::Normal,
            cost: CostEstimate::ZERO,
            choices: vec![nl_choice(&outer, "heap"), nl_choice(&inner, "heap")],
        };

        let emitted = replay_plan(&block, &plan, 8);
        assert_eq!(emitted.len(), 6);
        let a_rows = table_rows(&outer, 8);
        // The outer row holds still while the inner scan drains.
        assert_eq!(emitted[0].cells[0], a_rows[0]);
        assert_eq!(emitted[1].cells[0], a_rows[0]);
        assert_eq!(emitted[2].cells[0], a_rows[1]);
    }

    #[test]
    fn test_hash_probe_stream_ignores_index_order() {
        let outer = TableSpec::new("one", TableNum(0), 1.0);
        let inner = TableSpec::new("t1", TableNum(1), 8.0)
            .with_index(IndexInfo::new("ix_t1", vec![ColumnId(0)], false));
        let block = BlockSpec::new(vec![outer.clone(), inner.clone()]);
        let mut hashed = nl_choice(&inner, "ix_t1");
        hashed.strategy = "hash".to_owned();
        let plan = Plan {
            order: vec![TableNum(0), TableNum(1)],
            kind: JoinPlanKind::Normal,
            cost: CostEstimate::ZERO,
            choices: vec![nl_choice(&outer, "heap"), hashed],
        };

        let required = RequiredOrdering::ascending(vec![(TableNum(1), ColumnId(0))]);
        let emitted = replay_plan(&block, &plan, 8);
        assert_eq!(emitted.len(), 8);
        assert!(
            !is_emitted_in_order(&emitted, &required),
            "the hash table forgets the sorted arrival order"
        );

        let sorted = scan_rows(&inner, "ix_t1", 8);
        assert!(sorted.windows(2).all(|w| w[0][0] <= w[1][0]));
    }

    #[test]
    fn test_order_check_honors_direction() {
        let mk = |v: i64| Composite {
            cells: vec![vec![v; NUM_COLUMNS]],
        };
        let falling = vec![mk(9), mk(7), mk(7), mk(2)];
        let asc = RequiredOrdering::ascending(vec![(TableNum(0), ColumnId(0))]);
        let desc = RequiredOrdering::new(vec![quarry_optimizer::RequiredColumn {
            table: TableNum(0),
            column: ColumnId(0),
            direction: Direction::Descending,
        }]);

        assert!(!is_emitted_in_order(&falling, &asc));
        assert!(is_emitted_in_order(&falling, &desc));
    }
}
