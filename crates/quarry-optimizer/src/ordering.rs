//! Row-ordering bookkeeping for sort avoidance.
//!
//! A `RowOrdering` describes how rows flow out of a partial join order: an
//! ordered list of positions, each holding the columns known to be mutually
//! equal and sorted at that position, plus columns pinned to constants
//! (ordered trivially, in any direction) and units known to produce at most
//! one row (ordered on every column). Units that contribute no usable order,
//! or whose join strategy materializes and re-emits them, are listed as
//! unordered; once one is present, no later unit may extend the ordered
//! positions, since rows behind a multi-row unordered producer interleave.
//!
//! A `RequiredOrdering` is the statement's ORDER BY. Matching one against a
//! `RowOrdering` answers the only question the optimizer asks: can this
//! access path satisfy the ordering without a sort?

use std::fmt;

use quarry_types::{ColumnId, TableNum, TableSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

/// One level of an ordering: every column here is mutually equal, so rows
/// are sorted by any of them.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPosition {
    pub direction: Direction,
    pub columns: Vec<(TableNum, ColumnId)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowOrdering {
    positions: Vec<OrderPosition>,
    constant_columns: Vec<(TableNum, ColumnId)>,
    always_ordered: Vec<TableNum>,
    unordered: Vec<TableNum>,
}

impl RowOrdering {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.constant_columns.clear();
        self.always_ordered.clear();
        self.unordered.clear();
    }

    /// Opens a new ordering position. Columns added next belong to it.
    ///
    /// A no-op once any unit has been recorded as unordered: rows behind a
    /// multi-row unordered producer interleave, so no later access path can
    /// promise a global order.
    pub fn next_order_position(&mut self, direction: Direction) {
        if !self.unordered.is_empty() {
            return;
        }
        self.positions.push(OrderPosition {
            direction,
            columns: Vec::new(),
        });
    }

    /// Adds a column to the most recently opened position. A no-op while
    /// any unit is recorded as unordered, matching `next_order_position`.
    pub fn add_ordered_column(&mut self, table: TableNum, column: ColumnId) {
        if !self.unordered.is_empty() {
            return;
        }
        debug_assert!(
            !self.positions.is_empty(),
            "add_ordered_column before next_order_position"
        );
        if let Some(pos) = self.positions.last_mut() {
            if !pos.columns.contains(&(table, column)) {
                pos.columns.push((table, column));
            }
        }
    }

    /// Records that a column is pinned to a single value, making it ordered
    /// in every direction without consuming a position.
    pub fn add_constant_column(&mut self, table: TableNum, column: ColumnId) {
        if !self.constant_columns.contains(&(table, column)) {
            self.constant_columns.push((table, column));
        }
    }

    /// Records that a unit produces at most one row.
    pub fn add_always_ordered(&mut self, table: TableNum) {
        if !self.always_ordered.contains(&table) {
            self.always_ordered.push(table);
        }
    }

    /// Records that a unit contributes no usable ordering.
    pub fn add_unordered(&mut self, table: TableNum) {
        if !self.unordered.contains(&table) {
            self.unordered.push(table);
        }
    }

    #[must_use]
    pub fn is_always_ordered(&self, table: TableNum) -> bool {
        self.always_ordered.contains(&table)
    }

    #[must_use]
    pub fn is_constant_column(&self, table: TableNum, column: ColumnId) -> bool {
        self.constant_columns.contains(&(table, column))
    }

    /// True when rows are ordered on `(table, column)` at any position, or
    /// trivially because the column is constant or its unit is one-row.
    #[must_use]
    pub fn ordered_on_column(
        &self,
        direction: Direction,
        table: TableNum,
        column: ColumnId,
    ) -> bool {
        if self.is_constant_column(table, column) || self.is_always_ordered(table) {
            return true;
        }
        self.positions.iter().any(|p| {
            p.direction == direction && p.columns.contains(&(table, column))
        })
    }

    /// True when position `index` orders on `(table, column)` in the given
    /// direction.
    #[must_use]
    pub fn ordered_at_position(
        &self,
        index: usize,
        direction: Direction,
        table: TableNum,
        column: ColumnId,
    ) -> bool {
        self.positions.get(index).is_some_and(|p| {
            p.direction == direction && p.columns.contains(&(table, column))
        })
    }

    #[must_use]
    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Removes every trace of `table` from the ordering. If removing its
    /// columns empties a position, that position and all later ones are
    /// discarded: ordering beyond a broken level means nothing.
    pub fn remove_contribution(&mut self, table: TableNum) {
        self.always_ordered.retain(|t| *t != table);
        self.unordered.retain(|t| *t != table);
        self.constant_columns.retain(|(t, _)| *t != table);

        let mut truncate_at = None;
        for (i, pos) in self.positions.iter_mut().enumerate() {
            pos.columns.retain(|(t, _)| *t != table);
            if pos.columns.is_empty() {
                truncate_at = Some(i);
                break;
            }
        }
        if let Some(i) = truncate_at {
            self.positions.truncate(i);
        }
    }
}

impl fmt::Display for RowOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, p) in self.positions.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            let dir = match p.direction {
                Direction::Ascending => "+",
                Direction::Descending => "-",
            };
            write!(f, "{dir}(")?;
            for (j, (t, c)) in p.columns.iter().enumerate() {
                if j > 0 {
                    write!(f, "=")?;
                }
                write!(f, "{t}.{c}")?;
            }
            write!(f, ")")?;
        }
        write!(f, "]")
    }
}

// ---------------------------------------------------------------------------
// Required ordering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredColumn {
    pub table: TableNum,
    pub column: ColumnId,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortNeed {
    NothingRequired,
    SortRequired,
}

/// The ordering a statement requires of its final result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredOrdering {
    columns: Vec<RequiredColumn>,
}

impl RequiredOrdering {
    #[must_use]
    pub fn new(columns: Vec<RequiredColumn>) -> Self {
        Self { columns }
    }

    #[must_use]
    pub fn ascending(columns: Vec<(TableNum, ColumnId)>) -> Self {
        Self::new(
            columns
                .into_iter()
                .map(|(table, column)| RequiredColumn {
                    table,
                    column,
                    direction: Direction::Ascending,
                })
                .collect(),
        )
    }

    /// The required columns, outermost first. The execution layer reads
    /// these to build the sort when the committed plan does not avoid it.
    #[must_use]
    pub fn columns(&self) -> &[RequiredColumn] {
        &self.columns
    }

    /// Whether `ordering` satisfies this requirement outright.
    #[must_use]
    pub fn sort_required(&self, ordering: &RowOrdering) -> SortNeed {
        self.walk(ordering, None)
    }

    /// Whether `ordering` satisfies this requirement as far as the assigned
    /// tables go. A required column on a table not yet in the join order
    /// ends the check without demanding a sort: the rest of the requirement
    /// may still be satisfied once that table is placed.
    #[must_use]
    pub fn sort_required_within(
        &self,
        ordering: &RowOrdering,
        assigned: &TableSet,
    ) -> SortNeed {
        self.walk(ordering, Some(assigned))
    }

    fn walk(&self, ordering: &RowOrdering, assigned: Option<&TableSet>) -> SortNeed {
        let mut position = 0;
        for rc in &self.columns {
            if ordering.is_constant_column(rc.table, rc.column)
                || ordering.is_always_ordered(rc.table)
            {
                continue;
            }
            if let Some(assigned) = assigned {
                if !assigned.contains(rc.table) {
                    break;
                }
            }
            if ordering.ordered_at_position(position, rc.direction, rc.table, rc.column) {
                position += 1;
                continue;
            }
            return SortNeed::SortRequired;
        }
        SortNeed::NothingRequired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(n: usize) -> TableNum {
        TableNum(n)
    }

    fn c(n: usize) -> ColumnId {
        ColumnId(n)
    }

    #[test]
    fn test_index_feed_satisfies_matching_requirement() {
        let mut ro = RowOrdering::new();
        ro.next_order_position(Direction::Ascending);
        ro.add_ordered_column(t(0), c(1));
        ro.next_order_position(Direction::Ascending);
        ro.add_ordered_column(t(0), c(2));

        let req = RequiredOrdering::ascending(vec![(t(0), c(1)), (t(0), c(2))]);
        assert_eq!(req.sort_required(&ro), SortNeed::NothingRequired);

        let wrong_order = RequiredOrdering::ascending(vec![(t(0), c(2)), (t(0), c(1))]);
        assert_eq!(wrong_order.sort_required(&ro), SortNeed::SortRequired);
    }

    #[test]
    fn test_direction_must_match() {
        let mut ro = RowOrdering::new();
        ro.next_order_position(Direction::Descending);
        ro.add_ordered_column(t(0), c(1));

        let req = RequiredOrdering::ascending(vec![(t(0), c(1))]);
        assert_eq!(req.sort_required(&ro), SortNeed::SortRequired);

        let req = RequiredOrdering::new(vec![RequiredColumn {
            table: t(0),
            column: c(1),
            direction: Direction::Descending,
        }]);
        assert_eq!(req.sort_required(&ro), SortNeed::NothingRequired);
    }

    #[test]
    fn test_constant_columns_consume_no_position() {
        let mut ro = RowOrdering::new();
        ro.add_constant_column(t(0), c(1));
        ro.next_order_position(Direction::Ascending);
        ro.add_ordered_column(t(1), c(0));

        // Ordered on (0,1) then (1,0): the constant skips straight through.
        let req = RequiredOrdering::ascending(vec![(t(0), c(1)), (t(1), c(0))]);
        assert_eq!(req.sort_required(&ro), SortNeed::NothingRequired);
    }

    #[test]
    fn test_one_row_unit_is_ordered_on_everything() {
        let mut ro = RowOrdering::new();
        ro.add_always_ordered(t(2));
        let req = RequiredOrdering::ascending(vec![(t(2), c(9)), (t(2), c(3))]);
        assert_eq!(req.sort_required(&ro), SortNeed::NothingRequired);
    }

    #[test]
    fn test_partial_check_stops_at_unassigned_table() {
        let mut ro = RowOrdering::new();
        ro.next_order_position(Direction::Ascending);
        ro.add_ordered_column(t(0), c(0));

        let req = RequiredOrdering::ascending(vec![(t(0), c(0)), (t(1), c(0))]);
        let mut assigned = TableSet::new(2);
        assigned.insert(t(0));

        // Table 1 is not assigned yet, so no verdict on its column.
        assert_eq!(
            req.sort_required_within(&ro, &assigned),
            SortNeed::NothingRequired
        );
        // The full check insists on it.
        assert_eq!(req.sort_required(&ro), SortNeed::SortRequired);
    }

    #[test]
    fn test_unordered_unit_blocks_later_ordered_columns() {
        let mut ro = RowOrdering::new();
        ro.add_unordered(t(1));
        // An index behind a multi-row heap scan orders nothing globally.
        ro.next_order_position(Direction::Ascending);
        ro.add_ordered_column(t(0), c(0));
        assert_eq!(ro.position_count(), 0);

        let req = RequiredOrdering::ascending(vec![(t(0), c(0))]);
        assert_eq!(req.sort_required(&ro), SortNeed::SortRequired);

        // A one-row unit does not block: it is always ordered, not unordered.
        let mut ro = RowOrdering::new();
        ro.add_always_ordered(t(1));
        ro.next_order_position(Direction::Ascending);
        ro.add_ordered_column(t(0), c(0));
        assert_eq!(req.sort_required(&ro), SortNeed::NothingRequired);

        // Pulling the unordered unit re-opens the ordering.
        let mut ro = RowOrdering::new();
        ro.add_unordered(t(1));
        ro.remove_contribution(t(1));
        ro.next_order_position(Direction::Ascending);
        ro.add_ordered_column(t(0), c(0));
        assert_eq!(req.sort_required(&ro), SortNeed::NothingRequired);
    }

    #[test]
    fn test_remove_contribution_truncates_broken_levels() {
        let mut ro = RowOrdering::new();
        ro.next_order_position(Direction::Ascending);
        ro.add_ordered_column(t(0), c(0));
        ro.next_order_position(Direction::Ascending);
        ro.add_ordered_column(t(1), c(0));
        ro.next_order_position(Direction::Ascending);
        ro.add_ordered_column(t(0), c(1));

        ro.remove_contribution(t(1));
        assert_eq!(ro.position_count(), 1);
        assert!(ro.ordered_on_column(Direction::Ascending, t(0), c(0)));
        assert!(!ro.ordered_on_column(Direction::Ascending, t(0), c(1)));
    }

    #[test]
    fn test_equivalence_class_orders_on_every_member() {
        let mut ro = RowOrdering::new();
        ro.next_order_position(Direction::Ascending);
        ro.add_ordered_column(t(0), c(0));
        ro.add_ordered_column(t(1), c(4));

        let by_left = RequiredOrdering::ascending(vec![(t(0), c(0))]);
        let by_right = RequiredOrdering::ascending(vec![(t(1), c(4))]);
        assert_eq!(by_left.sort_required(&ro), SortNeed::NothingRequired);
        assert_eq!(by_right.sort_required(&ro), SortNeed::NothingRequired);
    }

    #[test]
    fn test_display_shape() {
        let mut ro = RowOrdering::new();
        ro.next_order_position(Direction::Ascending);
        ro.add_ordered_column(t(0), c(0));
        ro.add_ordered_column(t(1), c(2));
        ro.next_order_position(Direction::Descending);
        ro.add_ordered_column(t(1), c(3));
        assert_eq!(ro.to_string(), "[+(0.0=1.2) -(1.3)]");
    }
}
