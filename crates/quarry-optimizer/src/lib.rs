//! Cost-based join planning for one query block.
//!
//! The crate plans one query block at a time: the binder hands over a list
//! of joinable units (base tables, table functions, derived tables, join
//! subtrees) plus the block's predicates, and the [`Optimizer`] searches
//! join orders and per-unit access paths for the cheapest complete plan.
//! The search is depth-first over join-order prefixes with cost-based
//! pruning, predicates pushed as deep as their table references allow, and
//! an optional required ordering driving a parallel sort-avoidance plan.
//!
//! The expected call shape is one [`Optimizer::optimize`] per block, which
//! runs a full search round and commits the winner into the units. Callers
//! planning a block under an enclosing context can run extra rounds with
//! [`Optimizer::optimize_round`] after adjusting the outer row count, then
//! commit once.

pub mod access_path;
pub mod clock;
pub mod optimizable;
pub mod optimizer;
pub mod ordering;
pub mod predicate;
pub mod stats;
pub mod strategy;
pub mod trace;

#[cfg(test)]
mod search_invariant_tests;

pub use access_path::{AccessPath, JoinPlanKind, StoragePath};
pub use clock::{Clock, ManualClock, SystemClock};
pub use optimizable::{
    BaseTable, BestPlanAction, DerivedBranch, DerivedTable, JoinUnit, Optimizable,
    OptimizableList, PlanChoice, PlanContext, ProjectRestrict, PushOutcome, TableFunction,
    UnitCore,
};
pub use optimizer::{Optimizer, OptimizerConfig, OptimizerEnv, Plan};
pub use ordering::{
    Direction, RequiredColumn, RequiredOrdering, RowOrdering, SortNeed,
};
pub use predicate::{
    IndexMatch, PredId, Predicate, PredicateKind, PredicateList, RestrictionOp, ScopeInfo,
};
pub use stats::{CostModel, IndexInfo, StatsSource, TableStats};
pub use strategy::{HashJoin, JoinStrategy, NestedLoopJoin, StrategyId, StrategyRegistry};
pub use trace::{PlanEvent, PlanTrace};
