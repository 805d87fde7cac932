//! Predicates as the optimizer sees them.
//!
//! The optimizer does not evaluate predicates; it only needs their shape:
//! which tables they reference, whether they can be pushed into a unit, how
//! selective they are, and whether they can drive an index. Everything else
//! about a predicate stays in the binder's tree.
//!
//! Predicates move between exactly two homes during the search: the
//! statement-level list held by the optimizer, and the hosted list of
//! whichever unit they are currently pushed to. A predicate is pushed the
//! moment every table it references is available at the current join
//! position, and pulled back when that position is backed out.

use quarry_types::{ColumnId, TableNum, TableSet};
use serde::{Deserialize, Serialize};

use crate::stats::{DEFAULT_SELECTIVITY, EQUALITY_SELECTIVITY, IndexInfo, RANGE_SELECTIVITY};

/// Statement-unique predicate identity, stable across push and pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PredId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestrictionOp {
    Equals,
    Range,
}

/// What the optimizer knows about a predicate's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PredicateKind {
    /// `left = right` across two tables; drives index lookups and hash keys.
    Equijoin {
        left: (TableNum, ColumnId),
        right: (TableNum, ColumnId),
    },
    /// Single-table comparison against a constant.
    Restriction {
        table: TableNum,
        column: ColumnId,
        op: RestrictionOp,
        /// Measured fraction of rows kept, when the binder knows one.
        selectivity: Option<f64>,
    },
    /// An expression the optimizer cannot decompose. Never matches an index.
    Opaque,
}

/// Push target restriction for a scoped copy of a join predicate.
///
/// When a join predicate is copied into the branches of a set-operation
/// subtree, each copy may only land on a unit that can actually reach one of
/// the target base tables; pushing it anywhere else would apply the filter
/// to the wrong rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeInfo {
    pub target_tables: TableSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub id: PredId,
    /// Every table number the predicate mentions, in statement numbering.
    pub referenced: TableSet,
    /// False when the predicate hangs onto a non-materializable subquery or
    /// a side-effecting call; such predicates never leave the statement list.
    pub pushable: bool,
    pub kind: PredicateKind,
    pub scope: Option<ScopeInfo>,
}

impl Predicate {
    #[must_use]
    pub fn equijoin(
        id: PredId,
        capacity: usize,
        left: (TableNum, ColumnId),
        right: (TableNum, ColumnId),
    ) -> Self {
        let mut referenced = TableSet::new(capacity);
        referenced.insert(left.0);
        referenced.insert(right.0);
        Self {
            id,
            referenced,
            pushable: true,
            kind: PredicateKind::Equijoin { left, right },
            scope: None,
        }
    }

    #[must_use]
    pub fn restriction(
        id: PredId,
        capacity: usize,
        table: TableNum,
        column: ColumnId,
        op: RestrictionOp,
        selectivity: Option<f64>,
    ) -> Self {
        Self {
            id,
            referenced: TableSet::single(capacity, table),
            pushable: true,
            kind: PredicateKind::Restriction {
                table,
                column,
                op,
                selectivity,
            },
            scope: None,
        }
    }

    #[must_use]
    pub fn opaque(id: PredId, referenced: TableSet) -> Self {
        Self {
            id,
            referenced,
            pushable: true,
            kind: PredicateKind::Opaque,
            scope: None,
        }
    }

    /// Marks the predicate as tied to an unsupported subquery or a
    /// side-effecting call, pinning it to the statement list.
    #[must_use]
    pub fn non_pushable(mut self) -> Self {
        self.pushable = false;
        self
    }

    /// Turns this predicate into a scoped copy restricted to units that can
    /// reach one of `target_tables`.
    #[must_use]
    pub fn scoped_to(mut self, target_tables: TableSet) -> Self {
        self.scope = Some(ScopeInfo { target_tables });
        self
    }

    /// Fraction of rows this predicate keeps.
    #[must_use]
    pub fn selectivity(&self) -> f64 {
        match &self.kind {
            PredicateKind::Equijoin { .. } => EQUALITY_SELECTIVITY,
            PredicateKind::Restriction {
                op, selectivity, ..
            } => selectivity.unwrap_or(match op {
                RestrictionOp::Equals => EQUALITY_SELECTIVITY,
                RestrictionOp::Range => RANGE_SELECTIVITY,
            }),
            PredicateKind::Opaque => DEFAULT_SELECTIVITY,
        }
    }

    /// True when this predicate pins `(table, column)` to a single value,
    /// making the column usable as an index start and stop key.
    #[must_use]
    pub fn is_equality_on(&self, table: TableNum, column: ColumnId) -> bool {
        match &self.kind {
            PredicateKind::Equijoin { left, right } => {
                *left == (table, column) || *right == (table, column)
            }
            PredicateKind::Restriction {
                table: t,
                column: c,
                op: RestrictionOp::Equals,
                ..
            } => *t == table && *c == column,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_range_on(&self, table: TableNum, column: ColumnId) -> bool {
        matches!(
            &self.kind,
            PredicateKind::Restriction {
                table: t,
                column: c,
                op: RestrictionOp::Range,
                ..
            } if *t == table && *c == column
        )
    }
}

// ---------------------------------------------------------------------------
// Predicate lists
// ---------------------------------------------------------------------------

/// How far a predicate list can drive one index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    /// Leading key columns with usable predicates.
    pub matched_columns: usize,
    /// Combined selectivity of the matched prefix.
    pub prefix_selectivity: f64,
    /// Every key column is pinned by an equality predicate.
    pub all_columns_equality: bool,
    /// Predicates consumed by the prefix; excluded from residual costing.
    pub consumed: Vec<PredId>,
}

/// An ordered list of predicates. The same type serves as the optimizer's
/// statement-level list and as each unit's hosted list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredicateList {
    preds: Vec<Predicate>,
}

impl PredicateList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.preds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.preds.is_empty()
    }

    pub fn push(&mut self, pred: Predicate) {
        self.preds.push(pred);
    }

    #[must_use]
    pub fn get(&self, i: usize) -> &Predicate {
        &self.preds[i]
    }

    pub fn remove(&mut self, i: usize) -> Predicate {
        self.preds.remove(i)
    }

    pub fn insert(&mut self, i: usize, pred: Predicate) {
        self.preds.insert(i, pred);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Predicate> {
        self.preds.iter()
    }

    /// Moves every predicate from `self` to the back of `into`, preserving
    /// order. Used when a unit is pulled from the join order.
    pub fn drain_into(&mut self, into: &mut PredicateList) {
        into.preds.append(&mut self.preds);
    }

    #[must_use]
    pub fn contains_id(&self, id: PredId) -> bool {
        self.preds.iter().any(|p| p.id == id)
    }

    /// True when some predicate pins `(table, column)` to a single value.
    #[must_use]
    pub fn equality_on(&self, table: TableNum, column: ColumnId) -> bool {
        self.preds.iter().any(|p| p.is_equality_on(table, column))
    }

    /// Matches this list against an index's key columns, left to right:
    /// equality predicates extend the prefix and keep matching, a range
    /// predicate extends it one last column, anything else stops the match.
    #[must_use]
    pub fn matched_prefix(&self, table: TableNum, index: &IndexInfo) -> IndexMatch {
        let mut matched_columns = 0;
        let mut prefix_selectivity = 1.0;
        let mut all_columns_equality = !index.key_columns.is_empty();
        let mut consumed = Vec::new();

        for &col in &index.key_columns {
            if let Some(p) = self.preds.iter().find(|p| p.is_equality_on(table, col)) {
                matched_columns += 1;
                prefix_selectivity *= p.selectivity();
                consumed.push(p.id);
                continue;
            }
            all_columns_equality = false;
            if let Some(p) = self.preds.iter().find(|p| p.is_range_on(table, col)) {
                matched_columns += 1;
                prefix_selectivity *= p.selectivity();
                consumed.push(p.id);
            }
            break;
        }

        IndexMatch {
            matched_columns,
            prefix_selectivity,
            all_columns_equality,
            consumed,
        }
    }

    /// Whether anything in the list can limit a scan of `index`.
    #[must_use]
    pub fn is_useful_for(&self, table: TableNum, index: &IndexInfo) -> bool {
        self.matched_prefix(table, index).matched_columns > 0
    }

    /// Combined selectivity of every predicate in the list.
    #[must_use]
    pub fn combined_selectivity(&self) -> f64 {
        self.preds.iter().map(Predicate::selectivity).product()
    }

    /// Combined selectivity of predicates not consumed by an index prefix.
    #[must_use]
    pub fn residual_selectivity(&self, consumed: &[PredId]) -> f64 {
        self.preds
            .iter()
            .filter(|p| !consumed.contains(&p.id))
            .map(Predicate::selectivity)
            .product()
    }

    /// True when `index` is unique and every one of its key columns is
    /// pinned by an equality predicate: the scan returns at most one row.
    #[must_use]
    pub fn pins_unique_index(&self, table: TableNum, index: &IndexInfo) -> bool {
        index.unique
            && !index.key_columns.is_empty()
            && index
                .key_columns
                .iter()
                .all(|&c| self.equality_on(table, c))
    }
}

impl FromIterator<Predicate> for PredicateList {
    fn from_iter<I: IntoIterator<Item = Predicate>>(iter: I) -> Self {
        Self {
            preds: iter.into_iter().collect(),
        }
    }
}
