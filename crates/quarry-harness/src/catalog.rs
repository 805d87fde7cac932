//! Synthetic catalogs for optimizer verification.
//!
//! A [`BlockSpec`] describes one query block the way a bound statement
//! would: base tables with statistics and indexes, the predicates over
//! them, and an optional required output ordering. The spec is plain data,
//! cheap to clone, and builds fresh optimizer inputs on demand, so a single
//! spec can feed the real search, the exhaustive oracle, and the replay
//! simulator inside one test. Derived units (subqueries, unions, table
//! functions) are out of scope here; those carry their own coverage next to
//! their implementations.

use quarry_optimizer::{
    BaseTable, IndexInfo, Optimizable, OptimizableList, Optimizer, OptimizerEnv, PredId,
    Predicate, PredicateList, RequiredOrdering, RestrictionOp, TableStats,
};
use quarry_types::{ColumnId, TableNum, TableSet};

/// One base table of a synthetic schema.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    pub table_num: TableNum,
    pub rows: f64,
    pub pages: f64,
    pub row_width: f64,
    pub indexes: Vec<IndexInfo>,
    /// Columns the statement reads from this table; drives covering checks.
    pub referenced_columns: Vec<ColumnId>,
    /// Tables that must already be placed before this one.
    pub dependencies: Vec<TableNum>,
}

impl TableSpec {
    /// A gathered-statistics table with a heap sized at one page per
    /// hundred rows and a 40-byte row.
    #[must_use]
    pub fn new(name: impl Into<String>, table_num: TableNum, rows: f64) -> Self {
        Self {
            name: name.into(),
            table_num,
            rows,
            pages: (rows / 100.0).max(1.0),
            row_width: 40.0,
            indexes: Vec::new(),
            referenced_columns: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_pages(mut self, pages: f64) -> Self {
        self.pages = pages;
        self
    }

    #[must_use]
    pub fn with_row_width(mut self, row_width: f64) -> Self {
        self.row_width = row_width;
        self
    }

    #[must_use]
    pub fn with_index(mut self, index: IndexInfo) -> Self {
        self.indexes.push(index);
        self
    }

    #[must_use]
    pub fn with_referenced_columns(mut self, columns: Vec<ColumnId>) -> Self {
        self.referenced_columns = columns;
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<TableNum>) -> Self {
        self.dependencies = dependencies;
        self
    }

    #[must_use]
    pub fn stats(&self) -> TableStats {
        TableStats::gathered(self.rows, self.pages, self.row_width)
    }

    /// Whether `index` alone answers every referenced column.
    #[must_use]
    pub fn covered_by(&self, index: &IndexInfo) -> bool {
        !self.referenced_columns.is_empty()
            && self
                .referenced_columns
                .iter()
                .all(|c| index.key_columns.contains(c))
    }

    fn build(&self, capacity: usize) -> BaseTable {
        let mut table = BaseTable::new(self.name.clone(), self.table_num, capacity, self.stats())
            .with_referenced_columns(self.referenced_columns.clone());
        for index in &self.indexes {
            table = table.with_index(index.clone());
        }
        if !self.dependencies.is_empty() {
            let mut deps = TableSet::new(capacity);
            for &d in &self.dependencies {
                deps.insert(d);
            }
            table = table.with_dependencies(deps);
        }
        table
    }
}

// ---------------------------------------------------------------------------
// Whole-block specs
// ---------------------------------------------------------------------------

/// One query block: tables, predicates, and the required output ordering.
///
/// Table numbers must be dense and match each table's position, which is
/// what the real binder produces and what lets the oracle and the replay
/// simulator use positions and numbers interchangeably.
#[derive(Debug, Clone)]
pub struct BlockSpec {
    pub tables: Vec<TableSpec>,
    pub predicates: Vec<Predicate>,
    pub required: Option<RequiredOrdering>,
}

impl BlockSpec {
    #[must_use]
    pub fn new(tables: Vec<TableSpec>) -> Self {
        debug_assert!(
            tables
                .iter()
                .enumerate()
                .all(|(i, t)| t.table_num.index() == i),
            "table numbers must be dense and in position order"
        );
        Self {
            tables,
            predicates: Vec::new(),
            required: None,
        }
    }

    /// Number of joinable units, which is also the bitmap capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tables.len()
    }

    /// Adds an equality join between two columns. Ids are assigned in
    /// insertion order.
    #[must_use]
    pub fn with_equijoin(
        mut self,
        left: (TableNum, ColumnId),
        right: (TableNum, ColumnId),
    ) -> Self {
        let pred = Predicate::equijoin(self.next_id(), self.capacity(), left, right);
        self.predicates.push(pred);
        self
    }

    /// Adds a single-table restriction with the default selectivity for
    /// its operator.
    #[must_use]
    pub fn with_restriction(mut self, table: TableNum, column: ColumnId, op: RestrictionOp) -> Self {
        let pred = Predicate::restriction(self.next_id(), self.capacity(), table, column, op, None);
        self.predicates.push(pred);
        self
    }

    /// Adds an already-built predicate, reassigning its id to keep ids
    /// dense.
    #[must_use]
    pub fn with_predicate(mut self, mut pred: Predicate) -> Self {
        pred.id = self.next_id();
        self.predicates.push(pred);
        self
    }

    #[must_use]
    pub fn with_required(mut self, required: RequiredOrdering) -> Self {
        self.required = Some(required);
        self
    }

    fn next_id(&self) -> PredId {
        PredId(self.predicates.len())
    }

    #[must_use]
    pub fn table(&self, table: TableNum) -> &TableSpec {
        &self.tables[table.index()]
    }

    /// Builds the unit list the optimizer searches over.
    #[must_use]
    pub fn units(&self) -> OptimizableList {
        let capacity = self.capacity();
        let units: Vec<Box<dyn Optimizable>> = self
            .tables
            .iter()
            .map(|t| Box::new(t.build(capacity)) as Box<dyn Optimizable>)
            .collect();
        OptimizableList::new(units)
    }

    /// Builds the statement predicate list.
    #[must_use]
    pub fn predicate_list(&self) -> PredicateList {
        let mut list = PredicateList::new();
        for pred in &self.predicates {
            list.push(pred.clone());
        }
        list
    }

    /// Builds a ready-to-run optimizer over this block. The env's required
    /// ordering is overwritten with the spec's.
    ///
    /// # Errors
    ///
    /// Propagates construction failures, e.g. a forced index no table has.
    pub fn optimizer(&self, mut env: OptimizerEnv) -> quarry_error::Result<Optimizer> {
        env.required_ordering = self.required.clone();
        Optimizer::new(self.units(), self.predicate_list(), env)
    }
}

/// A block of `rows.len()` tables chained by equijoins on column 0, the
/// bread-and-butter shape for join-order tests.
#[must_use]
pub fn chain_block(rows: &[f64]) -> BlockSpec {
    let tables = rows
        .iter()
        .enumerate()
        .map(|(i, &r)| TableSpec::new(format!("t{i}"), TableNum(i), r))
        .collect();
    let mut block = BlockSpec::new(tables);
    for i in 1..rows.len() {
        block = block.with_equijoin(
            (TableNum(i - 1), ColumnId(0)),
            (TableNum(i), ColumnId(0)),
        );
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_spec_defaults_follow_row_count() {
        let spec = TableSpec::new("orders", TableNum(0), 25_000.0);
        let stats = spec.stats();
        assert_eq!(stats.row_count, 25_000.0);
        assert_eq!(stats.page_count, 250.0);
        assert_eq!(stats.row_width, 40.0);

        let tiny = TableSpec::new("dual", TableNum(1), 1.0);
        assert_eq!(tiny.stats().page_count, 1.0, "heaps never drop below one page");
    }

    #[test]
    fn test_chain_block_wires_dense_predicate_ids() {
        let block = chain_block(&[100.0, 200.0, 300.0]);
        assert_eq!(block.capacity(), 3);
        assert_eq!(block.predicates.len(), 2);
        for (i, pred) in block.predicates.iter().enumerate() {
            assert_eq!(pred.id, PredId(i));
            assert!(pred.referenced.contains(TableNum(i)));
            assert!(pred.referenced.contains(TableNum(i + 1)));
        }
    }

    #[test]
    fn test_build_units_carries_dependencies_and_indexes() {
        let block = BlockSpec::new(vec![
            TableSpec::new("a", TableNum(0), 500.0)
                .with_index(IndexInfo::new("ix_a", vec![ColumnId(0)], false)),
            TableSpec::new("b", TableNum(1), 50.0).with_dependencies(vec![TableNum(0)]),
        ]);
        let units = block.units();
        assert_eq!(units.len(), 2);
        assert_eq!(
            units.get(0).storage_label(quarry_optimizer::StoragePath::Index(0)),
            "ix_a"
        );

        let mut assigned = TableSet::new(2);
        assert!(
            !units.get(1).legal_join_order(&assigned),
            "b depends on a and cannot lead"
        );
        assigned.insert(TableNum(0));
        assert!(units.get(1).legal_join_order(&assigned));
    }

    #[test]
    fn test_covered_by_requires_referenced_columns() {
        let ix = IndexInfo::new("ix", vec![ColumnId(0), ColumnId(1)], false);
        let bare = TableSpec::new("t", TableNum(0), 10.0);
        assert!(!bare.covered_by(&ix), "no referenced columns means no covering claim");

        let narrow = bare.clone().with_referenced_columns(vec![ColumnId(1)]);
        assert!(narrow.covered_by(&ix));

        let wide = bare.with_referenced_columns(vec![ColumnId(1), ColumnId(5)]);
        assert!(!wide.covered_by(&ix));
    }
}
