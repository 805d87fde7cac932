//! Fixed-capacity bitmap over the table numbers of one query block.
//!
//! The optimizer manipulates sets of tables constantly: the tables assigned
//! so far in a join order, the tables a predicate references, the tables a
//! unit requires to its left. All of those are dense `0..n` indexes for a
//! block of `n` joinable units, so a word-array bitmap beats any general set
//! type. Capacity is fixed at construction; combining sets from different
//! query blocks is a logic error and is caught by debug assertions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::TableNum;

/// A set of table numbers, `0..capacity`.
///
/// All bits at positions `>= capacity` are kept at zero, which makes derived
/// equality exact and lets set relations work word-by-word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSet {
    capacity: usize,
    words: Vec<u64>,
}

impl TableSet {
    /// An empty set able to hold table numbers `0..capacity`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            words: vec![0; capacity.div_ceil(64)],
        }
    }

    /// An empty set with the same capacity as `self`.
    #[must_use]
    pub fn empty_like(&self) -> Self {
        Self::new(self.capacity)
    }

    /// A set containing exactly `table`.
    #[must_use]
    pub fn single(capacity: usize, table: TableNum) -> Self {
        let mut s = Self::new(capacity);
        s.insert(table);
        s
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn insert(&mut self, table: TableNum) {
        let i = table.index();
        debug_assert!(i < self.capacity, "table {i} out of range {}", self.capacity);
        self.words[i / 64] |= 1 << (i % 64);
    }

    pub fn remove(&mut self, table: TableNum) {
        let i = table.index();
        debug_assert!(i < self.capacity, "table {i} out of range {}", self.capacity);
        self.words[i / 64] &= !(1 << (i % 64));
    }

    #[must_use]
    pub fn contains(&self, table: TableNum) -> bool {
        let i = table.index();
        if i >= self.capacity {
            return false;
        }
        self.words[i / 64] & (1 << (i % 64)) != 0
    }

    pub fn clear(&mut self) {
        for w in &mut self.words {
            *w = 0;
        }
    }

    /// `self |= other`.
    pub fn union_with(&mut self, other: &TableSet) {
        debug_assert_eq!(self.capacity, other.capacity);
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
    }

    /// `self &= other`.
    pub fn intersect_with(&mut self, other: &TableSet) {
        debug_assert_eq!(self.capacity, other.capacity);
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= o;
        }
    }

    /// `self &= !other`.
    pub fn subtract(&mut self, other: &TableSet) {
        debug_assert_eq!(self.capacity, other.capacity);
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= !o;
        }
    }

    /// True when every member of `other` is also in `self`.
    #[must_use]
    pub fn contains_all(&self, other: &TableSet) -> bool {
        debug_assert_eq!(self.capacity, other.capacity);
        self.words.iter().zip(&other.words).all(|(w, o)| o & !w == 0)
    }

    /// True when `self` and `other` share at least one member.
    #[must_use]
    pub fn intersects(&self, other: &TableSet) -> bool {
        debug_assert_eq!(self.capacity, other.capacity);
        self.words.iter().zip(&other.words).any(|(w, o)| w & o != 0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Smallest member, if any.
    #[must_use]
    pub fn first(&self) -> Option<TableNum> {
        for (wi, w) in self.words.iter().enumerate() {
            if *w != 0 {
                return Some(TableNum(wi * 64 + w.trailing_zeros() as usize));
            }
        }
        None
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = TableNum> + '_ {
        let capacity = self.capacity;
        self.words.iter().enumerate().flat_map(move |(wi, w)| {
            (0..64).filter_map(move |b| {
                let i = wi * 64 + b;
                (i < capacity && w & (1 << b) != 0).then_some(TableNum(i))
            })
        })
    }
}

impl fmt::Display for TableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (n, t) in self.iter().enumerate() {
            if n > 0 {
                write!(f, ",")?;
            }
            write!(f, "{t}")?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<TableNum> for TableSet {
    /// Collects table numbers into a set sized to hold the largest of them.
    /// Mostly a test convenience; production code sizes sets to the query
    /// block via [`TableSet::new`].
    fn from_iter<I: IntoIterator<Item = TableNum>>(iter: I) -> Self {
        let members: Vec<TableNum> = iter.into_iter().collect();
        let capacity = members.iter().map(|t| t.index() + 1).max().unwrap_or(0);
        let mut s = TableSet::new(capacity);
        for t in members {
            s.insert(t);
        }
        s
    }
}
