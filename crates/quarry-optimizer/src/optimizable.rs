//! The joinable units of a query block and their optimizer contract.
//!
//! Anything that can occupy a position in a join order implements
//! [`Optimizable`]: base tables, table functions, derived tables, joins of
//! two units, and the project-restrict wrapper, which forwards the whole
//! contract to its child. The trait carries default implementations for the
//! bookkeeping every unit shares (path slots, hosted predicates, saved
//! plans); variants override enumeration and costing.
//!
//! Path-slot discipline: costing writes only through `current`. The `best`
//! and `best_sort_avoidance` slots are updated by the optimizer's selection
//! step, and `truly_best` only when a complete join order is remembered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use quarry_error::{QuarryError, Result};
use quarry_types::{ColumnId, CostEstimate, LockGranularity, TableNum, TableSet};
use serde::Serialize;

use crate::access_path::{AccessPath, JoinPlanKind, StoragePath};
use crate::ordering::RowOrdering;
use crate::predicate::{Predicate, PredicateKind, PredicateList, RestrictionOp};
use crate::stats::{CostModel, IndexInfo, TableStats};
use crate::strategy::{StrategyId, StrategyRegistry};

// ---------------------------------------------------------------------------
// Plan memory across optimizer contexts
// ---------------------------------------------------------------------------

static NEXT_PLAN_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Identity of one optimizer over one unit list. A unit optimized under
/// several enclosing plans keeps one saved plan per context, so an outer
/// optimizer revisiting a subtree can restore the decisions made for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PlanContext(pub u64);

impl PlanContext {
    /// A process-unique context.
    #[must_use]
    pub fn fresh() -> Self {
        Self(NEXT_PLAN_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BestPlanAction {
    /// Snapshot the unit's truly-best path under the given context.
    Add,
    /// Restore the snapshot taken under the given context, if any.
    Load,
    /// Drop the snapshot for the given context.
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavedPlan {
    pub path: AccessPath,
    pub kind: JoinPlanKind,
}

/// Outcome of offering a predicate to a unit.
#[derive(Debug)]
pub enum PushOutcome {
    Accepted,
    /// The unit cannot evaluate this predicate; it stays on the statement
    /// list.
    Rejected(Predicate),
}

/// One unit's final access-path decision, as reported by plan commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanChoice {
    pub unit: String,
    pub table_num: TableNum,
    pub storage: String,
    pub strategy: String,
    pub lock_granularity: LockGranularity,
    pub cost: CostEstimate,
}

// ---------------------------------------------------------------------------
// Shared unit state
// ---------------------------------------------------------------------------

/// State common to every unit variant.
#[derive(Debug)]
pub struct UnitCore {
    name: String,
    table_num: TableNum,
    referenced: TableSet,
    correlation: TableSet,
    dependencies: TableSet,
    current: AccessPath,
    best: AccessPath,
    best_sort_avoidance: AccessPath,
    truly_best: AccessPath,
    truly_best_kind: JoinPlanKind,
    hosted: PredicateList,
    consider_sort_avoidance: bool,
    forced_strategy: Option<String>,
    forced_strategy_id: Option<StrategyId>,
    strategy_cursor: Option<usize>,
    best_plans: HashMap<PlanContext, SavedPlan>,
}

impl UnitCore {
    #[must_use]
    pub fn new(name: impl Into<String>, table_num: TableNum, capacity: usize) -> Self {
        let initial = StrategyId(0);
        Self {
            name: name.into(),
            table_num,
            referenced: TableSet::single(capacity, table_num),
            correlation: TableSet::new(capacity),
            dependencies: TableSet::new(capacity),
            current: AccessPath::with_strategy(initial),
            best: AccessPath::with_strategy(initial),
            best_sort_avoidance: AccessPath::with_strategy(initial),
            truly_best: AccessPath::with_strategy(initial),
            truly_best_kind: JoinPlanKind::Normal,
            hosted: PredicateList::new(),
            consider_sort_avoidance: false,
            forced_strategy: None,
            forced_strategy_id: None,
            strategy_cursor: None,
            best_plans: HashMap::new(),
        }
    }

    pub fn add_referenced(&mut self, tables: &TableSet) {
        self.referenced.union_with(tables);
    }

    pub fn set_dependencies(&mut self, dependencies: TableSet) {
        self.dependencies = dependencies;
    }

    pub fn set_correlation(&mut self, correlation: TableSet) {
        self.correlation = correlation;
    }

    pub fn set_forced_strategy(&mut self, name: impl Into<String>) {
        self.forced_strategy = Some(name.into());
    }

    pub(crate) fn resolve_forced_strategy(&mut self, registry: &StrategyRegistry) -> Result<()> {
        if let Some(name) = &self.forced_strategy {
            let id = registry
                .find(name)
                .ok_or_else(|| QuarryError::UnknownJoinStrategy { name: name.clone() })?;
            self.forced_strategy_id = Some(id);
        }
        Ok(())
    }

    fn init_paths(&mut self, initial: StrategyId) {
        self.current = AccessPath::with_strategy(initial);
        self.best = AccessPath::with_strategy(initial);
        self.best_sort_avoidance = AccessPath::with_strategy(initial);
        self.truly_best = AccessPath::with_strategy(initial);
        self.truly_best_kind = JoinPlanKind::Normal;
    }

    /// Start-of-placement reset. Costed best slots are pushed to the worst
    /// possible estimate so any real candidate looks cheaper.
    fn start(&mut self) {
        self.strategy_cursor = None;
        self.consider_sort_avoidance = false;
        if self.best.cost.is_some() {
            self.best.cost = Some(CostEstimate::WORST);
        }
        if self.best_sort_avoidance.cost.is_some() {
            self.best_sort_avoidance.cost = Some(CostEstimate::WORST);
        }
    }

    fn apply_best_plan_action(&mut self, action: BestPlanAction, context: PlanContext) {
        match action {
            BestPlanAction::Add => {
                self.best_plans.insert(
                    context,
                    SavedPlan {
                        path: self.truly_best.clone(),
                        kind: self.truly_best_kind,
                    },
                );
            }
            BestPlanAction::Load => {
                if let Some(saved) = self.best_plans.get(&context) {
                    self.truly_best = saved.path.clone();
                    self.truly_best_kind = saved.kind;
                }
            }
            BestPlanAction::Remove => {
                self.best_plans.remove(&context);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// The unit contract
// ---------------------------------------------------------------------------

pub trait Optimizable: std::fmt::Debug {
    fn core(&self) -> &UnitCore;
    fn core_mut(&mut self) -> &mut UnitCore;

    fn name(&self) -> &str {
        &self.core().name
    }

    fn table_num(&self) -> TableNum {
        self.core().table_num
    }

    /// Every table this unit brings into the join order, in statement
    /// numbering, including tables nested inside it.
    fn referenced_map(&self) -> &TableSet {
        &self.core().referenced
    }

    fn correlation_map(&self) -> &TableSet {
        &self.core().correlation
    }

    /// The base tables transitively reachable through this unit. Scoped
    /// predicates may only be pushed to units that reach one of their
    /// target tables.
    fn base_table_set(&self) -> TableSet;

    /// Whether scans of this unit can contribute a usable row ordering.
    fn can_be_ordered(&self) -> bool {
        false
    }

    fn is_base_table(&self) -> bool {
        false
    }

    /// Whether this unit's cost estimates rest on gathered statistics.
    /// Units without them are selected by rule rather than by cost.
    fn uses_gathered_stats(&self) -> bool {
        false
    }

    /// Bytes one row of this unit occupies when held resident.
    fn memory_per_row(&self) -> f64;

    /// Whether this unit may be placed given the tables already assigned.
    /// Correlated references count as available: they are supplied by the
    /// enclosing query at run time.
    fn legal_join_order(&self, assigned: &TableSet) -> bool {
        let core = self.core();
        if core.dependencies.is_empty() {
            return true;
        }
        let mut available = assigned.clone();
        available.union_with(&core.correlation);
        available.contains_all(&core.dependencies)
    }

    /// Resolves user overrides against the registry. Bad names are caught
    /// here, before the search starts.
    fn resolve_overrides(&mut self, registry: &StrategyRegistry) -> Result<()> {
        self.core_mut().resolve_forced_strategy(registry)
    }

    fn init_paths(&mut self, registry: &StrategyRegistry) {
        let initial = registry.initial();
        self.core_mut().init_paths(initial);
    }

    /// Called when this unit is placed at a join position, before its
    /// access paths are enumerated.
    fn start_optimizing(&mut self, ordering: &mut RowOrdering) {
        self.core_mut().start();
        if !self.can_be_ordered() {
            ordering.add_unordered(self.table_num());
        }
    }

    /// Steps to the unit's next access path, rewriting `current` and this
    /// unit's ordering contribution. Returns false when the paths for this
    /// placement are exhausted.
    ///
    /// The default covers units with nothing to enumerate but a join
    /// strategy. A forced strategy collapses the enumeration to one step.
    fn next_access_path(
        &mut self,
        ordering: &mut RowOrdering,
        registry: &StrategyRegistry,
    ) -> Result<bool> {
        ordering.remove_contribution(self.table_num());
        ordering.add_unordered(self.table_num());

        let core = self.core_mut();
        if let Some(forced) = core.forced_strategy_id {
            if core.strategy_cursor.is_none() {
                core.strategy_cursor = Some(0);
                core.current.strategy = forced;
                core.current.cost = None;
                return Ok(true);
            }
            core.strategy_cursor = None;
            return Ok(false);
        }

        let next = match core.strategy_cursor {
            None => 0,
            Some(i) => i + 1,
        };
        if next < registry.len() {
            core.strategy_cursor = Some(next);
            core.current.strategy = StrategyId(next);
            core.current.cost = None;
            Ok(true)
        } else {
            core.strategy_cursor = None;
            Ok(false)
        }
    }

    /// One scan of this unit in isolation: no outer rows, no strategy.
    fn standalone_estimate(&self, model: &CostModel) -> CostEstimate;

    /// Costs `current` beneath `outer`, records the estimate and lock
    /// granularity on `current`, and returns the estimate.
    fn estimate_cost(
        &mut self,
        outer: &CostEstimate,
        model: &CostModel,
        registry: &StrategyRegistry,
    ) -> Result<CostEstimate> {
        let base = self.standalone_estimate(model);
        let strategy = registry.get(self.current_path().strategy);
        let estimate = strategy.estimate_cost(&base, outer, model);
        let lock = if base.row_count >= model.table_lock_threshold {
            LockGranularity::Table
        } else {
            LockGranularity::Row
        };
        let path = self.current_path_mut();
        path.cost = Some(estimate);
        path.lock_granularity = lock;
        Ok(estimate)
    }

    fn push_predicate(&mut self, pred: Predicate) -> PushOutcome {
        self.core_mut().hosted.push(pred);
        PushOutcome::Accepted
    }

    fn pull_predicates(&mut self, into: &mut PredicateList) {
        self.core_mut().hosted.drain_into(into);
    }

    fn hosted_predicates(&self) -> &PredicateList {
        &self.core().hosted
    }

    fn current_path(&self) -> &AccessPath {
        &self.core().current
    }

    fn current_path_mut(&mut self) -> &mut AccessPath {
        &mut self.core_mut().current
    }

    fn best_path(&self) -> &AccessPath {
        &self.core().best
    }

    fn best_path_mut(&mut self) -> &mut AccessPath {
        &mut self.core_mut().best
    }

    fn best_sort_avoidance_path(&self) -> &AccessPath {
        &self.core().best_sort_avoidance
    }

    fn truly_best_path(&self) -> &AccessPath {
        &self.core().truly_best
    }

    fn truly_best_kind(&self) -> JoinPlanKind {
        self.core().truly_best_kind
    }

    fn consider_sort_avoidance(&self) -> bool {
        self.core().consider_sort_avoidance
    }

    /// Copies `current` into `best` with the given estimate.
    fn update_best_from_current(&mut self, estimate: CostEstimate) {
        let core = self.core_mut();
        core.best = core.current.clone();
        core.best.cost = Some(estimate);
    }

    /// Copies `current` into `best_sort_avoidance` and marks this unit as
    /// carrying a live sort-avoidance path.
    fn update_best_sort_avoidance_from_current(&mut self, estimate: CostEstimate) {
        let core = self.core_mut();
        core.best_sort_avoidance = core.current.clone();
        core.best_sort_avoidance.cost = Some(estimate);
        core.consider_sort_avoidance = true;
    }

    /// Freezes the winning slot into `truly_best` when a complete join
    /// order beats the best one seen so far.
    fn remember_as_best(&mut self, kind: JoinPlanKind) {
        let core = self.core_mut();
        core.truly_best = match kind {
            JoinPlanKind::Normal => core.best.clone(),
            JoinPlanKind::SortAvoidance => core.best_sort_avoidance.clone(),
        };
        core.truly_best_kind = kind;
    }

    fn update_best_plan(&mut self, action: BestPlanAction, context: PlanContext) {
        self.core_mut().apply_best_plan_action(action, context);
    }

    #[must_use]
    fn has_saved_plan(&self, context: PlanContext) -> bool {
        self.core().best_plans.contains_key(&context)
    }

    /// Human-readable label for a storage path of this unit.
    fn storage_label(&self, storage: StoragePath) -> String {
        let _ = storage;
        "heap".to_owned()
    }

    /// Finalizes this unit on its truly-best path and reports the decision.
    fn commit_access_path(&mut self, registry: &StrategyRegistry) -> Result<PlanChoice> {
        let chosen = self.truly_best_path().clone();
        let Some(cost) = chosen.cost else {
            return Err(QuarryError::NoBestPlanFound);
        };
        let choice = PlanChoice {
            unit: self.name().to_owned(),
            table_num: self.table_num(),
            storage: self.storage_label(chosen.storage),
            strategy: registry.get(chosen.strategy).name().to_owned(),
            lock_granularity: chosen.lock_granularity,
            cost,
        };
        *self.current_path_mut() = chosen;
        Ok(choice)
    }
}

// ---------------------------------------------------------------------------
// Base table
// ---------------------------------------------------------------------------

/// A stored table with a heap and any number of indexes. The only unit kind
/// whose access-path enumeration walks storage paths as well as join
/// strategies: every (storage, strategy) pair is a candidate.
#[derive(Debug)]
pub struct BaseTable {
    core: UnitCore,
    stats: TableStats,
    indexes: Vec<IndexInfo>,
    referenced_columns: Vec<ColumnId>,
    forced_index: Option<String>,
    forced_index_pos: Option<usize>,
    storage_cursor: Option<usize>,
}

impl BaseTable {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        table_num: TableNum,
        capacity: usize,
        stats: TableStats,
    ) -> Self {
        Self {
            core: UnitCore::new(name, table_num, capacity),
            stats,
            indexes: Vec::new(),
            referenced_columns: Vec::new(),
            forced_index: None,
            forced_index_pos: None,
            storage_cursor: None,
        }
    }

    #[must_use]
    pub fn with_index(mut self, index: IndexInfo) -> Self {
        self.indexes.push(index);
        self
    }

    /// Columns of this table the statement reads; used for covering checks.
    #[must_use]
    pub fn with_referenced_columns(mut self, columns: Vec<ColumnId>) -> Self {
        self.referenced_columns = columns;
        self
    }

    #[must_use]
    pub fn with_forced_index(mut self, name: impl Into<String>) -> Self {
        self.forced_index = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_forced_strategy(mut self, name: impl Into<String>) -> Self {
        self.core.set_forced_strategy(name);
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: TableSet) -> Self {
        self.core.set_dependencies(dependencies);
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation: TableSet) -> Self {
        self.core.set_correlation(correlation);
        self
    }

    #[must_use]
    pub fn stats(&self) -> &TableStats {
        &self.stats
    }

    fn num_storages(&self) -> usize {
        1 + self.indexes.len()
    }

    fn storage_at(cursor: usize) -> StoragePath {
        if cursor == 0 {
            StoragePath::Heap
        } else {
            StoragePath::Index(cursor - 1)
        }
    }

    fn is_covering(&self, storage: StoragePath) -> bool {
        match storage {
            StoragePath::Heap => false,
            StoragePath::Index(i) => {
                !self.referenced_columns.is_empty()
                    && self
                        .referenced_columns
                        .iter()
                        .all(|c| self.indexes[i].key_columns.contains(c))
            }
        }
    }

    /// At most one row comes back when any unique index is fully pinned by
    /// equality predicates, whatever storage path is scanned.
    fn one_row_scan(&self) -> bool {
        self.indexes
            .iter()
            .any(|ix| self.core.hosted.pins_unique_index(self.core.table_num, ix))
    }

    fn feed_ordering(
        &self,
        ordering: &mut RowOrdering,
        storage: StoragePath,
        strategy: StrategyId,
        registry: &StrategyRegistry,
    ) {
        let t = self.core.table_num;
        for p in self.core.hosted.iter() {
            if let PredicateKind::Restriction {
                table,
                column,
                op: RestrictionOp::Equals,
                ..
            } = &p.kind
            {
                if *table == t {
                    ordering.add_constant_column(t, *column);
                }
            }
        }

        if registry.get(strategy).materializes_inner() {
            ordering.add_unordered(t);
            return;
        }
        if self.one_row_scan() {
            ordering.add_always_ordered(t);
            return;
        }
        match storage {
            StoragePath::Heap => ordering.add_unordered(t),
            StoragePath::Index(i) => {
                for &col in &self.indexes[i].key_columns {
                    if ordering.is_constant_column(t, col) {
                        continue;
                    }
                    ordering.next_order_position(crate::ordering::Direction::Ascending);
                    ordering.add_ordered_column(t, col);
                }
            }
        }
    }
}

impl Optimizable for BaseTable {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore {
        &mut self.core
    }

    fn base_table_set(&self) -> TableSet {
        TableSet::single(self.core.referenced.capacity(), self.core.table_num)
    }

    fn can_be_ordered(&self) -> bool {
        true
    }

    fn is_base_table(&self) -> bool {
        true
    }

    fn uses_gathered_stats(&self) -> bool {
        self.stats.source == crate::stats::StatsSource::Gathered
    }

    fn memory_per_row(&self) -> f64 {
        self.stats.row_width
    }

    fn resolve_overrides(&mut self, registry: &StrategyRegistry) -> Result<()> {
        self.core.resolve_forced_strategy(registry)?;
        if let Some(name) = &self.forced_index {
            let pos = self
                .indexes
                .iter()
                .position(|ix| ix.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| QuarryError::UnknownForcedIndex {
                    table: self.core.name.clone(),
                    index: name.clone(),
                })?;
            self.forced_index_pos = Some(pos);
        }
        Ok(())
    }

    fn start_optimizing(&mut self, ordering: &mut RowOrdering) {
        self.core.start();
        self.storage_cursor = None;
        let _ = ordering;
    }

    fn next_access_path(
        &mut self,
        ordering: &mut RowOrdering,
        registry: &StrategyRegistry,
    ) -> Result<bool> {
        ordering.remove_contribution(self.core.table_num);

        let (first_storage, last_storage) = match self.forced_index_pos {
            Some(i) => (i + 1, i + 1),
            None => (0, self.num_storages() - 1),
        };
        let strategies: Vec<StrategyId> = match self.core.forced_strategy_id {
            Some(id) => vec![id],
            None => (0..registry.len()).map(StrategyId).collect(),
        };

        let next_pair = match (self.storage_cursor, self.core.strategy_cursor) {
            (None, _) => Some((first_storage, 0)),
            (Some(s), Some(j)) => {
                if j + 1 < strategies.len() {
                    Some((s, j + 1))
                } else if s < last_storage {
                    Some((s + 1, 0))
                } else {
                    None
                }
            }
            (Some(_), None) => None,
        };

        let Some((s, j)) = next_pair else {
            self.storage_cursor = None;
            self.core.strategy_cursor = None;
            return Ok(false);
        };

        self.storage_cursor = Some(s);
        self.core.strategy_cursor = Some(j);
        let storage = Self::storage_at(s);
        let strategy = strategies[j];
        let covering = self.is_covering(storage);
        {
            let current = &mut self.core.current;
            current.storage = storage;
            current.strategy = strategy;
            current.cost = None;
            current.covering_index_scan = covering;
            current.non_matching_index_scan = true;
        }
        self.feed_ordering(ordering, storage, strategy, registry);
        Ok(true)
    }

    fn standalone_estimate(&self, model: &CostModel) -> CostEstimate {
        model.full_scan(&self.stats, self.core.hosted.combined_selectivity())
    }

    fn estimate_cost(
        &mut self,
        outer: &CostEstimate,
        model: &CostModel,
        registry: &StrategyRegistry,
    ) -> Result<CostEstimate> {
        let t = self.core.table_num;
        let storage = self.core.current.storage;
        let (base, matched_columns, rows_scanned) = match storage {
            StoragePath::Heap => (
                model.full_scan(&self.stats, self.core.hosted.combined_selectivity()),
                0,
                self.stats.row_count,
            ),
            StoragePath::Index(i) => {
                let index = &self.indexes[i];
                let matched = self.core.hosted.matched_prefix(t, index);
                let residual = self.core.hosted.residual_selectivity(&matched.consumed);
                let covering = self.core.current.covering_index_scan;
                let est = model.index_scan(
                    &self.stats,
                    index,
                    matched.prefix_selectivity,
                    residual,
                    covering,
                );
                (
                    est,
                    matched.matched_columns,
                    self.stats.row_count * matched.prefix_selectivity,
                )
            }
        };

        let strategy = registry.get(self.core.current.strategy);
        let estimate = strategy.estimate_cost(&base, outer, model);
        let lock = if rows_scanned >= model.table_lock_threshold {
            LockGranularity::Table
        } else {
            LockGranularity::Row
        };
        let current = &mut self.core.current;
        current.cost = Some(estimate);
        current.lock_granularity = lock;
        current.non_matching_index_scan = matched_columns == 0;
        Ok(estimate)
    }

    fn storage_label(&self, storage: StoragePath) -> String {
        match storage {
            StoragePath::Heap => "heap".to_owned(),
            StoragePath::Index(i) => self.indexes[i].name.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Table function
// ---------------------------------------------------------------------------

/// A function invoked as a table. Produces rows in call order (never a
/// usable ordering) and evaluates only predicates over its own columns;
/// join predicates must stay outside and are rejected on push.
#[derive(Debug)]
pub struct TableFunction {
    core: UnitCore,
    estimated_rows: f64,
    invocation_cost: f64,
    row_width: f64,
}

impl TableFunction {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        table_num: TableNum,
        capacity: usize,
        estimated_rows: f64,
    ) -> Self {
        Self {
            core: UnitCore::new(name, table_num, capacity),
            estimated_rows,
            invocation_cost: 1.0,
            row_width: 64.0,
        }
    }

    /// Tables that must be placed to the left because the function's
    /// arguments reference them.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: TableSet) -> Self {
        self.core.set_dependencies(dependencies);
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation: TableSet) -> Self {
        self.core.set_correlation(correlation);
        self
    }

    #[must_use]
    pub fn with_forced_strategy(mut self, name: impl Into<String>) -> Self {
        self.core.set_forced_strategy(name);
        self
    }
}

impl Optimizable for TableFunction {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore {
        &mut self.core
    }

    fn base_table_set(&self) -> TableSet {
        TableSet::new(self.core.referenced.capacity())
    }

    fn memory_per_row(&self) -> f64 {
        self.row_width
    }

    fn standalone_estimate(&self, model: &CostModel) -> CostEstimate {
        let rows = (self.estimated_rows * self.core.hosted.combined_selectivity()).max(1.0);
        let cost = self.invocation_cost + self.estimated_rows.max(1.0) * model.row_cpu;
        CostEstimate::new(cost, rows, rows)
    }

    fn push_predicate(&mut self, pred: Predicate) -> PushOutcome {
        let own_only = pred.referenced.len() == 1
            && pred.referenced.contains(self.core.table_num)
            && pred.scope.is_none();
        if own_only {
            self.core.hosted.push(pred);
            PushOutcome::Accepted
        } else {
            PushOutcome::Rejected(pred)
        }
    }
}

// ---------------------------------------------------------------------------
// Derived table
// ---------------------------------------------------------------------------

/// One branch of a derived table's set operation.
#[derive(Debug, Clone)]
pub struct DerivedBranch {
    pub base_tables: TableSet,
    pub row_count: f64,
}

/// A materialized subquery, possibly a union of several branches. Scoped
/// predicates pushed here prune only the branches whose base tables they
/// target; ordinary predicates filter every branch.
#[derive(Debug)]
pub struct DerivedTable {
    core: UnitCore,
    branches: Vec<DerivedBranch>,
    row_width: f64,
}

impl DerivedTable {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        table_num: TableNum,
        capacity: usize,
        branches: Vec<DerivedBranch>,
    ) -> Self {
        let mut core = UnitCore::new(name, table_num, capacity);
        for b in &branches {
            core.add_referenced(&b.base_tables);
        }
        Self {
            core,
            branches,
            row_width: 48.0,
        }
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: TableSet) -> Self {
        self.core.set_dependencies(dependencies);
        self
    }

    #[must_use]
    pub fn with_forced_strategy(mut self, name: impl Into<String>) -> Self {
        self.core.set_forced_strategy(name);
        self
    }
}

impl Optimizable for DerivedTable {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore {
        &mut self.core
    }

    fn base_table_set(&self) -> TableSet {
        let mut set = TableSet::new(self.core.referenced.capacity());
        for b in &self.branches {
            set.union_with(&b.base_tables);
        }
        set
    }

    fn memory_per_row(&self) -> f64 {
        self.row_width
    }

    fn standalone_estimate(&self, model: &CostModel) -> CostEstimate {
        let general: f64 = self
            .core
            .hosted
            .iter()
            .filter(|p| p.scope.is_none())
            .map(Predicate::selectivity)
            .product();

        let mut input_rows = 0.0;
        let mut output_rows = 0.0;
        for b in &self.branches {
            input_rows += b.row_count;
            let mut selectivity = general;
            for p in self.core.hosted.iter() {
                if let Some(scope) = &p.scope {
                    if scope.target_tables.intersects(&b.base_tables) {
                        selectivity *= p.selectivity();
                    }
                }
            }
            output_rows += b.row_count * selectivity;
        }
        let output_rows = output_rows.max(1.0);
        let cost = input_rows * model.row_cpu + output_rows * model.row_cpu;
        CostEstimate::new(cost, output_rows, output_rows)
    }
}

// ---------------------------------------------------------------------------
// Join of two units
// ---------------------------------------------------------------------------

/// A pre-grouped join of two units occupying one position in the outer join
/// order, as a parenthesized join does. Saved-plan actions reach through to
/// both children so an enclosing optimizer restores the whole subtree.
#[derive(Debug)]
pub struct JoinUnit {
    core: UnitCore,
    left: Box<dyn Optimizable>,
    right: Box<dyn Optimizable>,
    join_selectivity: f64,
}

impl JoinUnit {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        table_num: TableNum,
        capacity: usize,
        left: Box<dyn Optimizable>,
        right: Box<dyn Optimizable>,
        join_selectivity: f64,
    ) -> Self {
        let mut core = UnitCore::new(name, table_num, capacity);
        core.add_referenced(left.referenced_map());
        core.add_referenced(right.referenced_map());

        let mut correlation = left.correlation_map().clone();
        correlation.union_with(right.correlation_map());
        core.set_correlation(correlation);

        Self {
            core,
            left,
            right,
            join_selectivity,
        }
    }
}

impl Optimizable for JoinUnit {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut UnitCore {
        &mut self.core
    }

    fn base_table_set(&self) -> TableSet {
        let mut set = self.left.base_table_set();
        set.union_with(&self.right.base_table_set());
        set
    }

    fn memory_per_row(&self) -> f64 {
        self.left.memory_per_row() + self.right.memory_per_row()
    }

    fn standalone_estimate(&self, model: &CostModel) -> CostEstimate {
        let left = self.left.standalone_estimate(model);
        let right = self.right.standalone_estimate(model);
        let hosted_selectivity = self.core.hosted.combined_selectivity();
        let rows =
            (left.row_count * right.row_count * self.join_selectivity * hosted_selectivity)
                .max(1.0);
        let cost = left.cost + left.row_count * right.cost;
        CostEstimate::new(cost, rows, rows)
    }

    fn update_best_plan(&mut self, action: BestPlanAction, context: PlanContext) {
        self.core.apply_best_plan_action(action, context);
        self.left.update_best_plan(action, context);
        self.right.update_best_plan(action, context);
    }
}

// ---------------------------------------------------------------------------
// Project-restrict wrapper
// ---------------------------------------------------------------------------

/// Projection and residual restriction above another unit. The wrapper is
/// transparent to the search: every contract method, including unit-number
/// lookups, resolves against the child. Only costing differs, applying the
/// wrapper's own restriction on top of the child's estimate.
#[derive(Debug)]
pub struct ProjectRestrict {
    child: Box<dyn Optimizable>,
    restriction_selectivity: f64,
}

impl ProjectRestrict {
    #[must_use]
    pub fn new(child: Box<dyn Optimizable>, restriction_selectivity: f64) -> Self {
        Self {
            child,
            restriction_selectivity,
        }
    }

    fn apply_restriction(&self, estimate: CostEstimate, model: &CostModel) -> CostEstimate {
        CostEstimate::new(
            estimate.cost + estimate.row_count * model.row_cpu,
            (estimate.row_count * self.restriction_selectivity).max(1.0),
            (estimate.single_scan_row_count * self.restriction_selectivity).max(1.0),
        )
    }
}

impl Optimizable for ProjectRestrict {
    fn core(&self) -> &UnitCore {
        self.child.core()
    }

    fn core_mut(&mut self) -> &mut UnitCore {
        self.child.core_mut()
    }

    fn base_table_set(&self) -> TableSet {
        self.child.base_table_set()
    }

    fn can_be_ordered(&self) -> bool {
        self.child.can_be_ordered()
    }

    fn is_base_table(&self) -> bool {
        self.child.is_base_table()
    }

    fn uses_gathered_stats(&self) -> bool {
        self.child.uses_gathered_stats()
    }

    fn memory_per_row(&self) -> f64 {
        self.child.memory_per_row()
    }

    fn legal_join_order(&self, assigned: &TableSet) -> bool {
        self.child.legal_join_order(assigned)
    }

    fn resolve_overrides(&mut self, registry: &StrategyRegistry) -> Result<()> {
        self.child.resolve_overrides(registry)
    }

    fn init_paths(&mut self, registry: &StrategyRegistry) {
        self.child.init_paths(registry);
    }

    fn start_optimizing(&mut self, ordering: &mut RowOrdering) {
        self.child.start_optimizing(ordering);
    }

    fn next_access_path(
        &mut self,
        ordering: &mut RowOrdering,
        registry: &StrategyRegistry,
    ) -> Result<bool> {
        self.child.next_access_path(ordering, registry)
    }

    fn standalone_estimate(&self, model: &CostModel) -> CostEstimate {
        self.apply_restriction(self.child.standalone_estimate(model), model)
    }

    fn estimate_cost(
        &mut self,
        outer: &CostEstimate,
        model: &CostModel,
        registry: &StrategyRegistry,
    ) -> Result<CostEstimate> {
        let child_estimate = self.child.estimate_cost(outer, model, registry)?;
        let estimate = self.apply_restriction(child_estimate, model);
        self.child.current_path_mut().cost = Some(estimate);
        Ok(estimate)
    }

    fn push_predicate(&mut self, pred: Predicate) -> PushOutcome {
        self.child.push_predicate(pred)
    }

    fn pull_predicates(&mut self, into: &mut PredicateList) {
        self.child.pull_predicates(into);
    }

    fn update_best_plan(&mut self, action: BestPlanAction, context: PlanContext) {
        self.child.update_best_plan(action, context);
    }

    fn storage_label(&self, storage: StoragePath) -> String {
        self.child.storage_label(storage)
    }

    fn commit_access_path(&mut self, registry: &StrategyRegistry) -> Result<PlanChoice> {
        self.child.commit_access_path(registry)
    }
}

// ---------------------------------------------------------------------------
// The unit list
// ---------------------------------------------------------------------------

/// The joinable units of one query block, in current join order.
#[derive(Debug, Default)]
pub struct OptimizableList {
    units: Vec<Box<dyn Optimizable>>,
    fixed_order: bool,
}

impl OptimizableList {
    #[must_use]
    pub fn new(units: Vec<Box<dyn Optimizable>>) -> Self {
        Self {
            units,
            fixed_order: false,
        }
    }

    /// Marks the current list order as user-forced: the search costs it,
    /// validates it, and considers nothing else.
    #[must_use]
    pub fn with_fixed_order(mut self) -> Self {
        self.fixed_order = true;
        self
    }

    #[must_use]
    pub fn fixed_order(&self) -> bool {
        self.fixed_order
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    #[must_use]
    pub fn get(&self, i: usize) -> &dyn Optimizable {
        self.units[i].as_ref()
    }

    pub fn get_mut(&mut self, i: usize) -> &mut dyn Optimizable {
        self.units[i].as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Optimizable> {
        self.units.iter().map(Box::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Optimizable>> {
        self.units.iter_mut()
    }

    /// Capacity of the table sets carried by these units, which is the
    /// number of tables in the whole statement.
    #[must_use]
    pub fn table_capacity(&self) -> usize {
        self.units
            .iter()
            .map(|u| u.referenced_map().capacity())
            .max()
            .unwrap_or(0)
    }

    /// Permutes the list into `order` (list positions, best-first). Indexes
    /// not named by `order` keep their relative order at the back.
    pub fn reorder(&mut self, order: &[usize]) {
        let mut slots: Vec<Option<Box<dyn Optimizable>>> =
            self.units.drain(..).map(Some).collect();
        for &i in order {
            if let Some(unit) = slots.get_mut(i).and_then(Option::take) {
                self.units.push(unit);
            }
        }
        for slot in &mut slots {
            if let Some(unit) = slot.take() {
                self.units.push(unit);
            }
        }
    }

    /// First unit whose dependencies are not satisfied by the units before
    /// it in the current list order, if any.
    #[must_use]
    pub fn order_violation(&self) -> Option<TableNum> {
        let mut assigned = TableSet::new(self.table_capacity());
        for unit in self.iter() {
            if !unit.legal_join_order(&assigned) {
                return Some(unit.table_num());
            }
            assigned.union_with(unit.referenced_map());
        }
        None
    }

    /// Whether the list's current order is legal: every unit's dependencies
    /// are satisfied by the units before it.
    #[must_use]
    pub fn legal_whole_order(&self) -> bool {
        self.order_violation().is_none()
    }
}
