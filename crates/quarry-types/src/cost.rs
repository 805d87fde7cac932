//! The three-field cost estimate the join optimizer trades in.
//!
//! An estimate carries:
//!
//! * `cost` - abstract work units for producing the full result once,
//! * `row_count` - estimated rows in the full result, and
//! * `single_scan_row_count` - estimated rows produced by one scan of the
//!   unit (for an inner table, the rows per probe rather than the total
//!   across all probes).
//!
//! Comparison is a deliberate cascade: cheaper cost wins, ties fall through
//! to fewer rows, then to fewer rows per scan. That keeps plan choice
//! deterministic even when two paths cost the same.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub cost: f64,
    pub row_count: f64,
    pub single_scan_row_count: f64,
}

impl CostEstimate {
    /// Sentinel used to seed "best so far" slots: worse than any estimate a
    /// cost model can produce, so the first real candidate always wins.
    pub const WORST: CostEstimate = CostEstimate {
        cost: f64::MAX,
        row_count: f64::MAX,
        single_scan_row_count: f64::MAX,
    };

    /// A zero-cost, zero-row estimate. The outermost cost of a join order
    /// starts here unless an enclosing query supplies one.
    pub const ZERO: CostEstimate = CostEstimate {
        cost: 0.0,
        row_count: 0.0,
        single_scan_row_count: 0.0,
    };

    /// Builds an estimate, flooring each field at zero. Negative inputs only
    /// arise from floating-point drift in subtract-heavy callers.
    #[must_use]
    pub fn new(cost: f64, row_count: f64, single_scan_row_count: f64) -> Self {
        debug_assert!(!cost.is_nan() && !row_count.is_nan() && !single_scan_row_count.is_nan());
        Self {
            cost: cost.max(0.0),
            row_count: row_count.max(0.0),
            single_scan_row_count: single_scan_row_count.max(0.0),
        }
    }

    #[must_use]
    pub fn is_worst(&self) -> bool {
        self.cost == f64::MAX
    }

    /// Cascade comparison: `cost`, then `row_count`, then
    /// `single_scan_row_count`.
    #[must_use]
    pub fn compare(&self, other: &CostEstimate) -> Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then_with(|| self.row_count.total_cmp(&other.row_count))
            .then_with(|| {
                self.single_scan_row_count
                    .total_cmp(&other.single_scan_row_count)
            })
    }

    /// Sum of two estimates. Costs and row counts add; the single-scan row
    /// count stays `self`'s, since adding an inner unit's cost does not
    /// change how many rows one scan of `self` produces.
    #[must_use]
    pub fn add(&self, other: &CostEstimate) -> Self {
        Self::new(
            self.cost + other.cost,
            self.row_count + other.row_count,
            self.single_scan_row_count,
        )
    }

    /// Difference of two estimates, floored at zero per field. Repeated
    /// add/subtract of the same estimate can drift below zero in floating
    /// point; the floor keeps every estimate non-negative.
    #[must_use]
    pub fn subtract(&self, other: &CostEstimate) -> Self {
        Self::new(
            self.cost - other.cost,
            self.row_count - other.row_count,
            self.single_scan_row_count,
        )
    }

    /// Scales total cost and total rows by `factor` (for example, by an
    /// outer row count). Rows per scan are unchanged.
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(
            self.cost * factor,
            self.row_count * factor,
            self.single_scan_row_count,
        )
    }
}

impl fmt::Display for CostEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_worst() {
            return write!(f, "worst");
        }
        write!(
            f,
            "cost={:.2} rows={:.2} scan={:.2}",
            self.cost, self.row_count, self.single_scan_row_count
        )
    }
}
