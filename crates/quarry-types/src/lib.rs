//! Shared primitive types for the Quarry query compiler.
//!
//! Everything in this crate is small and `Copy`-friendly on purpose: table
//! and column identifiers, the fixed-capacity bitmap used to track sets of
//! tables inside one query block, and the three-field cost estimate that the
//! join optimizer trades in. Heavier planner state lives in
//! `quarry-optimizer`; this crate must stay dependency-light so every layer
//! (binder, optimizer, executor, tooling) can speak the same vocabulary.

pub mod cost;
pub mod table_set;

pub use cost::CostEstimate;
pub use table_set::TableSet;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Zero-based number assigned to each joinable unit of a query block at bind
/// time. Numbers are dense within one statement: a query with `n` tables uses
/// exactly `0..n`, which is what lets [`TableSet`] be a plain bitmap.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TableNum(pub usize);

impl TableNum {
    /// The raw zero-based index, for bitmap and array addressing.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TableNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Zero-based position of a column within its table's row layout.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ColumnId(pub usize);

impl ColumnId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock granularity chosen for one access path.
///
/// The optimizer escalates from row to table locking when the estimated
/// number of rows touched in a single scan crosses the configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockGranularity {
    Row,
    Table,
}

impl fmt::Display for LockGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockGranularity::Row => write!(f, "row"),
            LockGranularity::Table => write!(f, "table"),
        }
    }
}
