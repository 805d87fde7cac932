//! Error type shared across the Quarry query compiler.
//!
//! Planner errors are rare by design: costing and search always produce
//! *some* answer, so the variants here cover genuinely unrecoverable
//! statement states (an illegal user-forced join order, a search that never
//! completed one join order) and bad user directives caught at setup.

use quarry_types::TableNum;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QuarryError>;

#[derive(Debug, Error)]
pub enum QuarryError {
    /// A user-forced join order placed a unit before one of its
    /// dependencies. Fixed orders are never silently repaired.
    #[error("forced join order is illegal: unit {unit} depends on tables placed after it")]
    IllegalForcedJoinOrder { unit: TableNum },

    /// Plan commit was requested but the search never completed a single
    /// join order, so there is no plan to commit.
    #[error("no best plan found for query block")]
    NoBestPlanFound,

    /// A join-strategy override named a strategy the registry does not know.
    #[error("unknown join strategy '{name}'")]
    UnknownJoinStrategy { name: String },

    /// An index override named an index the table does not have.
    #[error("unknown index '{index}' forced for table '{table}'")]
    UnknownForcedIndex { table: String, index: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_lowercase_and_specific() {
        let e = QuarryError::IllegalForcedJoinOrder { unit: TableNum(2) };
        assert_eq!(
            e.to_string(),
            "forced join order is illegal: unit 2 depends on tables placed after it"
        );

        let e = QuarryError::UnknownForcedIndex {
            table: "orders".to_owned(),
            index: "ix_missing".to_owned(),
        };
        assert_eq!(
            e.to_string(),
            "unknown index 'ix_missing' forced for table 'orders'"
        );
    }
}
