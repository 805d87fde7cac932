//! Table statistics and the scan cost model.
//!
//! Costs are abstract work units, not milliseconds. The model charges:
//!
//! ```text
//! full scan    cost = pages * PAGE_IO + rows * ROW_CPU
//! index scan   cost = height * PAGE_IO                   (descent)
//!                   + pages(ix) * prefix_sel * PAGE_IO   (leaf walk)
//!                   + rows * prefix_sel * PAGE_IO        (row fetch, unless covering)
//!                   + rows * prefix_sel * ROW_CPU        (qualification)
//! sort         cost = rows * log2(rows + 2) * SORT_CPU
//! ```
//!
//! Selectivities come from predicate shape when no gathered statistics are
//! available: equality keeps one row in ten, a range keeps one in three,
//! anything opaque keeps one in two. A statement can supply measured
//! selectivities on individual predicates; those always win over defaults.

use quarry_types::{ColumnId, CostEstimate};
use serde::{Deserialize, Serialize};

/// Default fraction of rows kept by an equality predicate.
pub const EQUALITY_SELECTIVITY: f64 = 0.1;
/// Default fraction of rows kept by a range predicate.
pub const RANGE_SELECTIVITY: f64 = 0.33;
/// Default fraction of rows kept by a predicate the planner cannot decompose.
pub const DEFAULT_SELECTIVITY: f64 = 0.5;

/// Where a table's statistics came from.
///
/// Units whose statistics are merely assumed are costed with the rule-based
/// access-path selection, since their estimates are not trustworthy enough
/// to compare numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatsSource {
    /// Measured by a statistics gatherer; row and page counts are real.
    Gathered,
    /// Fabricated defaults; only ordinal comparisons are meaningful.
    Assumed,
}

/// Per-table statistics, as the storage layer reports them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    pub row_count: f64,
    pub page_count: f64,
    /// Average row width in bytes, for in-memory join sizing.
    pub row_width: f64,
    pub source: StatsSource,
}

impl TableStats {
    #[must_use]
    pub fn gathered(row_count: f64, page_count: f64, row_width: f64) -> Self {
        Self {
            row_count,
            page_count,
            row_width,
            source: StatsSource::Gathered,
        }
    }

    /// Stand-in statistics for a table that has never been analyzed.
    #[must_use]
    pub fn assumed() -> Self {
        Self {
            row_count: 1000.0,
            page_count: 20.0,
            row_width: 64.0,
            source: StatsSource::Assumed,
        }
    }
}

/// One index over a table: key columns in significant order, plus the
/// statistics needed to cost a scan of it. All key columns sort ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub key_columns: Vec<ColumnId>,
    pub unique: bool,
    pub page_count: f64,
    /// Levels traversed from root to leaf, at least 1.
    pub height: f64,
}

impl IndexInfo {
    #[must_use]
    pub fn new(name: impl Into<String>, key_columns: Vec<ColumnId>, unique: bool) -> Self {
        Self {
            name: name.into(),
            key_columns,
            unique,
            page_count: 10.0,
            height: 2.0,
        }
    }

    #[must_use]
    pub fn with_pages(mut self, page_count: f64, height: f64) -> Self {
        self.page_count = page_count;
        self.height = height;
        self
    }
}

// ---------------------------------------------------------------------------
// Cost model
// ---------------------------------------------------------------------------

/// Work-unit charges for the scan shapes the optimizer considers, plus the
/// costing-related thresholds that are properties of the model rather than
/// of the search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Cost of reading one page.
    pub page_io: f64,
    /// Cost of qualifying one row.
    pub row_cpu: f64,
    /// Cost of one hash-table probe.
    pub probe_cpu: f64,
    /// Cost of inserting one row while building a hash table.
    pub build_cpu: f64,
    /// Per-row, per-comparison-level cost of sorting.
    pub sort_cpu: f64,
    /// Rows per scan at which the chosen path escalates to a table lock.
    pub table_lock_threshold: f64,
    /// When false, gathered statistics are not trusted for numeric
    /// comparison and every unit falls back to rule-based path selection.
    pub use_statistics: bool,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            page_io: 1.0,
            row_cpu: 0.01,
            probe_cpu: 0.001,
            build_cpu: 0.005,
            sort_cpu: 0.02,
            table_lock_threshold: 5000.0,
            use_statistics: true,
        }
    }
}

impl CostModel {
    /// Cost of one full scan of the heap, qualifying every row and keeping
    /// `selectivity` of them.
    #[must_use]
    pub fn full_scan(&self, stats: &TableStats, selectivity: f64) -> CostEstimate {
        let base_rows = stats.row_count.max(1.0);
        let cost = stats.page_count * self.page_io + base_rows * self.row_cpu;
        let rows = (base_rows * selectivity).max(1.0);
        CostEstimate::new(cost, rows, rows)
    }

    /// Cost of one scan of `index`, descending to the first qualifying key
    /// and walking `prefix_selectivity` of the leaf range. Non-covering
    /// scans pay a row fetch per qualifying key. `residual_selectivity`
    /// covers predicates evaluated after the fetch.
    #[must_use]
    pub fn index_scan(
        &self,
        stats: &TableStats,
        index: &IndexInfo,
        prefix_selectivity: f64,
        residual_selectivity: f64,
        covering: bool,
    ) -> CostEstimate {
        let base_rows = stats.row_count.max(1.0);
        let touched = base_rows * prefix_selectivity;
        let mut cost = index.height * self.page_io
            + index.page_count * prefix_selectivity * self.page_io
            + touched * self.row_cpu;
        if !covering {
            cost += touched * self.page_io;
        }
        let rows = (touched * residual_selectivity).max(1.0);
        CostEstimate::new(cost, rows, rows)
    }

    /// Cost of sorting `rows` rows. Cardinality is unchanged by sorting.
    #[must_use]
    pub fn sort(&self, rows: f64) -> CostEstimate {
        let n = rows.max(1.0);
        let cost = n * (n + 2.0).log2() * self.sort_cpu;
        CostEstimate::new(cost, rows.max(1.0), rows.max(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_scan_charges_pages_and_rows() {
        let model = CostModel::default();
        let stats = TableStats::gathered(10_000.0, 100.0, 40.0);
        let est = model.full_scan(&stats, EQUALITY_SELECTIVITY);
        assert_eq!(est.cost, 100.0 + 10_000.0 * 0.01);
        assert_eq!(est.row_count, 1000.0);
        assert_eq!(est.single_scan_row_count, 1000.0);
    }

    #[test]
    fn test_index_scan_cheaper_than_full_scan_for_selective_prefix() {
        let model = CostModel::default();
        let stats = TableStats::gathered(100_000.0, 1000.0, 40.0);
        let ix = IndexInfo::new("ix_a", vec![ColumnId(0)], false).with_pages(120.0, 3.0);
        let indexed = model.index_scan(&stats, &ix, 0.001, 1.0, false);
        let full = model.full_scan(&stats, 0.001);
        assert!(indexed.compare(&full).is_lt());
    }

    #[test]
    fn test_covering_drops_row_fetch_charge() {
        let model = CostModel::default();
        let stats = TableStats::gathered(50_000.0, 500.0, 40.0);
        let ix = IndexInfo::new("ix_a", vec![ColumnId(0)], false).with_pages(80.0, 3.0);
        let covered = model.index_scan(&stats, &ix, 0.01, 1.0, true);
        let fetched = model.index_scan(&stats, &ix, 0.01, 1.0, false);
        assert!(covered.cost < fetched.cost);
        assert_eq!(covered.row_count, fetched.row_count);
    }

    #[test]
    fn test_row_estimates_floor_at_one() {
        let model = CostModel::default();
        let stats = TableStats::gathered(10.0, 1.0, 40.0);
        let est = model.full_scan(&stats, 0.0001);
        assert_eq!(est.row_count, 1.0);
    }

    #[test]
    fn test_sort_cost_grows_superlinearly() {
        let model = CostModel::default();
        let small = model.sort(100.0);
        let big = model.sort(10_000.0);
        assert!(big.cost > small.cost * 100.0);
        assert_eq!(big.row_count, 10_000.0);
    }
}
