//! The join-order search.
//!
//! One [`Optimizer`] plans one query block: it owns the block's joinable
//! units, the block's predicate list, and the running state of a
//! depth-first walk over join orders. Join orders are built left to right.
//! At each position the search places a candidate unit, pushes it every
//! predicate that is now fully covered, and lets the unit enumerate its
//! access paths underneath the cost of the outer prefix. Completed orders
//! compete on estimated cost; the cheapest complete order seen so far is
//! remembered, and any prefix that already costs more than that is cut off
//! without being extended.
//!
//! Queries with many units get two extra guards. A time budget ties the
//! elapsed optimization time to the best cost found so far, so the search
//! only keeps running while it is still plausibly worth it. And once the
//! first complete order has been costed, the search may jump straight to a
//! join order ranked by per-unit row counts, walking the orders above it,
//! then those below it, so a good region of the search space is reached
//! without grinding through every permutation in between.
//!
//! The caller drives the search through three methods, nested like loops:
//! [`Optimizer::next_join_order`] advances the join order,
//! [`Optimizer::next_access_path`] steps the innermost unit through its
//! access paths, and [`Optimizer::cost_current_path`] prices one such path.
//! [`Optimizer::optimize`] wraps the whole dance and commits the winner.

use std::cmp::Ordering;

use quarry_error::{QuarryError, Result};
use quarry_types::{CostEstimate, TableNum, TableSet};
use serde::Serialize;

use crate::access_path::{AccessPath, JoinPlanKind, StoragePath};
use crate::clock::{Clock, SystemClock};
use crate::optimizable::{
    BestPlanAction, OptimizableList, PlanChoice, PlanContext, PushOutcome,
};
use crate::ordering::{RequiredOrdering, RowOrdering, SortNeed};
use crate::predicate::PredicateList;
use crate::stats::CostModel;
use crate::strategy::StrategyRegistry;
use crate::trace::{PlanEvent, PlanTrace};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Knobs for one optimizer instance. The defaults are production values;
/// tests tighten them to force specific search behavior.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Ceiling on the estimated working set of a single unit's join
    /// strategy, in bytes. Paths that would exceed it are not considered.
    pub max_memory_per_table: usize,
    /// When true, the search never gives up on time and visits every
    /// permutation the pruning leaves alive.
    pub no_timeout: bool,
    /// When true, every unit is selected by the rule-based peck order even
    /// if its statistics are trustworthy.
    pub rule_based: bool,
    /// Time-based abandonment only applies to queries with more tables
    /// than this. Small queries always finish their search.
    pub timeout_check_threshold: usize,
    /// Jumping to a row-count-ranked join order only applies to queries
    /// with more tables than this.
    pub jump_threshold: usize,
    /// When true, the optimizer appends a [`PlanEvent`] per decision to
    /// its [`PlanTrace`].
    pub trace: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_memory_per_table: 1024 * 1024,
            no_timeout: false,
            rule_based: false,
            timeout_check_threshold: 6,
            jump_threshold: 6,
            trace: false,
        }
    }
}

/// Everything an optimizer needs besides the units and predicates: the
/// cost model, the strategy registry, the clock the time budget reads,
/// and the shape of the enclosing context.
#[derive(Debug)]
pub struct OptimizerEnv {
    pub model: CostModel,
    pub registry: StrategyRegistry,
    pub config: OptimizerConfig,
    pub clock: Box<dyn Clock>,
    /// Ordering the block's output must satisfy, if any. Drives the
    /// sort-avoidance side of the search.
    pub required_ordering: Option<RequiredOrdering>,
    /// Row count of the enclosing context. 1.0 for a top-level block; an
    /// enclosing optimizer sets its own estimate when planning a subquery.
    pub outermost_rows: f64,
}

impl Default for OptimizerEnv {
    fn default() -> Self {
        Self {
            model: CostModel::default(),
            registry: StrategyRegistry::default(),
            config: OptimizerConfig::default(),
            clock: Box::new(SystemClock::default()),
            required_ordering: None,
            outermost_rows: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// The committed plan
// ---------------------------------------------------------------------------

/// The winner of the search, as committed into the units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    /// Units in execution order, outermost first.
    pub order: Vec<TableNum>,
    /// Whether the plan feeds the required ordering without a sort.
    pub kind: JoinPlanKind,
    /// Estimated cost of the whole join order, sort included when one is
    /// needed.
    pub cost: CostEstimate,
    /// Per-unit storage, strategy, and locking decisions, in `order`.
    pub choices: Vec<PlanChoice>,
}

impl Plan {
    /// Serializes the plan to pretty JSON for golden files and debugging.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails, which only happens when a
    /// cost estimate holds a non-finite float.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

// ---------------------------------------------------------------------------
// Jump bookkeeping
// ---------------------------------------------------------------------------

/// Where the search stands relative to the one jump it is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JumpState {
    /// Eligible to jump once the first complete order has been costed.
    ReadyToJump,
    /// Descending into the jump target order.
    Jumping,
    /// Walking the orders lexicographically above the jump target.
    WalkingHigh,
    /// Walking the orders below the jump target, from the bottom up.
    WalkingLow,
    /// Jumping is off: the query is small, or the jump was found useless.
    NoJump,
}

// ---------------------------------------------------------------------------
// The optimizer
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Optimizer {
    units: OptimizableList,
    predicates: PredicateList,
    model: CostModel,
    registry: StrategyRegistry,
    config: OptimizerConfig,
    clock: Box<dyn Clock>,
    required_ordering: Option<RequiredOrdering>,
    context: PlanContext,

    /// Table-set capacity of the statement, which bounds every set here.
    num_tables_in_query: usize,
    /// Union of all units' referenced tables. A predicate whose references
    /// fall outside this set is correlated to an enclosing block and never
    /// blocks a push.
    non_correlated: TableSet,
    /// Cost of one scan of the enclosing context.
    outermost_cost: CostEstimate,

    /// Position being filled, -1 before the first placement.
    join_position: isize,
    /// Proposed join order. Position i holds a unit's list index; `None`
    /// past `join_position`.
    current_order: Vec<Option<usize>>,
    /// Tables referenced by the units placed so far.
    assigned: TableSet,
    current_cost: CostEstimate,
    current_sort_avoidance_cost: CostEstimate,
    best_cost: CostEstimate,
    found_best_plan: bool,
    /// Join order of the best plan, as unit list indexes.
    best_order: Vec<usize>,
    best_kind: JoinPlanKind,
    /// Ordering produced by the candidate paths under trial.
    current_ordering: RowOrdering,
    /// Ordering produced by the best paths chosen so far.
    best_ordering: RowOrdering,
    /// Sort estimate for the latest complete order, when one is required.
    sort_cost: Option<CostEstimate>,
    desired_order_found: bool,
    time_exceeded: bool,
    jump_state: JumpState,
    /// The jump target order, filled when a jump is prepared.
    first_look: Vec<Option<usize>>,
    round: usize,
    round_started_ms: f64,
    trace: PlanTrace,
}

impl Optimizer {
    /// Builds an optimizer over `units` and `predicates`. User overrides
    /// naming unknown strategies or indexes are rejected here, before any
    /// search runs.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::UnknownJoinStrategy`] or
    /// [`QuarryError::UnknownForcedIndex`] for a bad override.
    pub fn new(
        units: OptimizableList,
        predicates: PredicateList,
        env: OptimizerEnv,
    ) -> Result<Self> {
        let n = units.len();
        let num_tables_in_query = units.table_capacity();
        let mut non_correlated = TableSet::new(num_tables_in_query);
        for unit in units.iter() {
            non_correlated.union_with(unit.referenced_map());
        }
        let jump_state = if num_tables_in_query > env.config.jump_threshold {
            JumpState::ReadyToJump
        } else {
            JumpState::NoJump
        };
        let trace = if env.config.trace {
            PlanTrace::enabled()
        } else {
            PlanTrace::disabled()
        };

        let mut optimizer = Self {
            units,
            predicates,
            model: env.model,
            registry: env.registry,
            config: env.config,
            clock: env.clock,
            required_ordering: env.required_ordering,
            context: PlanContext::fresh(),
            num_tables_in_query,
            non_correlated,
            outermost_cost: CostEstimate::new(0.0, env.outermost_rows, 1.0),
            join_position: -1,
            current_order: vec![None; n],
            assigned: TableSet::new(num_tables_in_query),
            current_cost: CostEstimate::ZERO,
            current_sort_avoidance_cost: CostEstimate::ZERO,
            best_cost: CostEstimate::WORST,
            found_best_plan: false,
            best_order: vec![0; n],
            best_kind: JoinPlanKind::Normal,
            current_ordering: RowOrdering::new(),
            best_ordering: RowOrdering::new(),
            sort_cost: None,
            desired_order_found: false,
            time_exceeded: false,
            jump_state,
            first_look: vec![None; n],
            round: 0,
            round_started_ms: 0.0,
            trace,
        };

        {
            let Self {
                units, registry, ..
            } = &mut optimizer;
            for unit in units.iter_mut() {
                unit.resolve_overrides(registry)?;
                unit.init_paths(registry);
            }
        }

        Ok(optimizer)
    }

    // -- accessors ----------------------------------------------------------

    #[must_use]
    pub fn units(&self) -> &OptimizableList {
        &self.units
    }

    /// Predicates never pushed to any unit. After [`Optimizer::commit_plan`]
    /// these are the block's residual predicates.
    #[must_use]
    pub fn residual_predicates(&self) -> &PredicateList {
        &self.predicates
    }

    /// Cost of the best complete join order found so far. Worst-possible
    /// until one completes.
    #[must_use]
    pub fn best_cost(&self) -> CostEstimate {
        self.best_cost
    }

    #[must_use]
    pub fn found_best_plan(&self) -> bool {
        self.found_best_plan
    }

    #[must_use]
    pub fn best_plan_kind(&self) -> JoinPlanKind {
        self.best_kind
    }

    /// The best join order found so far, outermost first. Meaningful only
    /// before [`Optimizer::commit_plan`] reorders the unit list.
    #[must_use]
    pub fn best_join_order(&self) -> Vec<TableNum> {
        self.best_order
            .iter()
            .map(|&i| self.units.get(i).table_num())
            .collect()
    }

    /// The join order under construction, one slot per position, as indexes
    /// into the unit list. Slots past the current position are `None`.
    #[must_use]
    pub fn proposed_join_order(&self) -> &[Option<usize>] {
        &self.current_order
    }

    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.time_exceeded
    }

    #[must_use]
    pub fn round(&self) -> usize {
        self.round
    }

    #[must_use]
    pub fn plan_trace(&self) -> &PlanTrace {
        &self.trace
    }

    /// Replaces the enclosing context's row count before another round.
    pub fn set_outermost_rows(&mut self, rows: f64) {
        self.outermost_cost = CostEstimate::new(
            self.outermost_cost.cost,
            rows,
            self.outermost_cost.single_scan_row_count,
        );
    }

    // -- the driver ---------------------------------------------------------

    /// Runs one round of search and commits the winner.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::IllegalForcedJoinOrder`] for a fixed order
    /// that violates dependencies, and [`QuarryError::NoBestPlanFound`]
    /// when no complete join order was ever costed.
    pub fn optimize(&mut self) -> Result<Plan> {
        self.optimize_round()?;
        self.commit_plan()
    }

    /// Runs one complete round of the search: every join order the pruning
    /// leaves alive, every access path of every placement. The best plan
    /// found is retained across rounds.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::IllegalForcedJoinOrder`] for a fixed order
    /// that violates dependencies.
    pub fn optimize_round(&mut self) -> Result<()> {
        self.start_round();
        let span = tracing::debug_span!(
            target: "quarry.optimizer",
            "optimize_round",
            round = self.round,
            units = self.units.len(),
        );
        let _guard = span.entered();

        while self.next_join_order()? {
            while self.next_access_path()? {
                self.cost_current_path()?;
            }
        }
        Ok(())
    }

    fn start_round(&mut self) {
        self.round += 1;
        self.join_position = -1;
        for slot in &mut self.current_order {
            *slot = None;
        }
        self.assigned.clear();
        self.current_cost = CostEstimate::ZERO;
        self.current_sort_avoidance_cost = CostEstimate::ZERO;
        self.current_ordering.clear();
        self.best_ordering.clear();
        self.sort_cost = None;
        self.desired_order_found = false;
        self.time_exceeded = false;
        self.round_started_ms = self.clock.elapsed_ms();
        self.jump_state = if self.num_tables_in_query > self.config.jump_threshold {
            JumpState::ReadyToJump
        } else {
            JumpState::NoJump
        };
    }

    /// Re-syncs every unit with the best plan, permutes the unit list into
    /// the winning order, and commits each unit's remembered access path.
    /// Predicates are re-pushed along the way so each unit ends up hosting
    /// exactly the clauses it will evaluate.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::NoBestPlanFound`] when the search never
    /// completed a join order.
    pub fn commit_plan(&mut self) -> Result<Plan> {
        if !self.found_best_plan {
            return Err(QuarryError::NoBestPlanFound);
        }

        let ctx = self.context;
        for unit in self.units.iter_mut() {
            unit.update_best_plan(BestPlanAction::Load, ctx);
            unit.update_best_plan(BestPlanAction::Remove, ctx);
        }

        self.units.reorder(&self.best_order);

        // List position now equals join position. Predicates are pushed
        // against the tables up to and including each unit, exactly as the
        // winning walk pushed them.
        let mut outer_tables = TableSet::new(self.num_tables_in_query);
        let mut choices = Vec::with_capacity(self.units.len());
        for i in 0..self.units.len() {
            outer_tables.union_with(self.units.get(i).referenced_map());
            {
                let Self {
                    units,
                    predicates,
                    non_correlated,
                    ..
                } = self;
                push_eligible_predicates(units, predicates, non_correlated, &outer_tables, i);
            }
            let Self {
                units, registry, ..
            } = self;
            choices.push(units.get_mut(i).commit_access_path(registry)?);
        }

        let order: Vec<TableNum> = choices.iter().map(|c| c.table_num).collect();
        let plan = Plan {
            order: order.clone(),
            kind: self.best_kind,
            cost: self.best_cost,
            choices,
        };
        tracing::debug!(
            target: "quarry.optimizer",
            cost = %self.best_cost,
            kind = ?self.best_kind,
            "committed plan"
        );
        let kind = self.best_kind;
        let cost = self.best_cost;
        self.trace
            .record(|| PlanEvent::Committed { kind, order, cost });
        Ok(plan)
    }

    // -- the join-order walk ------------------------------------------------

    /// Advances to the next join order worth costing. Returns false when
    /// the round is over: every order was seen, pruned, or abandoned on
    /// time. After a true return, the order's innermost unit is placed and
    /// ready for access-path enumeration.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::IllegalForcedJoinOrder`] in fixed-order mode
    /// when a unit precedes one of its dependencies.
    pub fn next_join_order(&mut self) -> Result<bool> {
        let n = self.units.len();
        if n == 0 {
            return Ok(false);
        }

        self.check_timeout();

        // Deepen the current order if the prefix is still worth extending:
        // a prefix at or above the best complete cost can only get worse.
        let within = self.join_position < n as isize - 1;
        let mut advanced = false;
        if within && !self.time_exceeded {
            let current_viable = self.current_cost.compare(&self.best_cost) == Ordering::Less;
            let avoidance_viable = self.sort_avoidance_live()
                && self.current_sort_avoidance_cost.compare(&self.best_cost) == Ordering::Less;
            if current_viable || avoidance_viable {
                let position_costed = self.join_position < 0 || {
                    let pos = self.join_position as usize;
                    match self.current_order[pos] {
                        Some(u) => self.units.get(u).best_path().cost.is_some(),
                        None => false,
                    }
                };
                if position_costed {
                    self.join_position += 1;
                    advanced = true;
                    self.current_ordering = self.best_ordering.clone();
                }
            } else {
                tracing::debug!(
                    target: "quarry.optimizer",
                    position = self.join_position,
                    current = %self.current_cost,
                    best = %self.best_cost,
                    "pruning join order prefix: already at or above the best complete cost"
                );
            }
        }

        // A jump that could not deepen has nothing left to try on this
        // descent; rewind and resume the plain walk.
        if self.jump_state == JumpState::Jumping && !advanced && self.join_position >= 0 {
            self.rewind_join_order();
            self.jump_state = JumpState::NoJump;
        }

        'walk: while self.join_position >= 0 {
            let pos = self.join_position as usize;

            // Pull the occupant first so candidates are judged against
            // exactly the tables at earlier positions.
            let previous = self.pull_current_position();

            let candidate: Option<usize> = if self.desired_order_found || self.time_exceeded {
                None
            } else if self.jump_state == JumpState::Jumping {
                let Some(target) = self.first_look[pos] else {
                    self.jump_state = JumpState::NoJump;
                    continue 'walk;
                };
                if !self.units.get(target).legal_join_order(&self.assigned) {
                    // The ranked unit is blocked here. Swap in the first
                    // not-yet-placed unit that is legal at this position and
                    // retry the descent; with no such unit the target order
                    // has no legal completion, so the jump is abandoned.
                    let swap_with = (pos + 1..n).find(|&j| match self.first_look[j] {
                        Some(u) => self.units.get(u).legal_join_order(&self.assigned),
                        None => false,
                    });
                    match swap_with {
                        Some(j) => self.first_look.swap(pos, j),
                        None => self.jump_state = JumpState::NoJump,
                    }
                    if pos > 0 {
                        self.join_position -= 1;
                        self.rewind_join_order();
                    }
                    continue 'walk;
                }
                if pos == n - 1 {
                    self.jump_state = JumpState::WalkingHigh;
                }
                Some(target)
            } else {
                self.scan_candidate(pos, previous)?
            };

            let Some(next_unit) = candidate else {
                // Every candidate at this position has been tried.
                if self.units.fixed_order() && !self.desired_order_found {
                    if let Some(unit) = self.units.order_violation() {
                        return Err(QuarryError::IllegalForcedJoinOrder { unit });
                    }
                    self.desired_order_found = true;
                }

                if self.jump_state == JumpState::ReadyToJump
                    && !self.desired_order_found
                    && pos > 0
                    && pos == n - 1
                    && self.prepare_jump()
                {
                    continue 'walk;
                }

                self.join_position -= 1;
                if self.join_position < 0 && self.jump_state == JumpState::WalkingHigh {
                    // Every order above the jump target has been walked.
                    // Restart from the bottom and stop at the target.
                    self.join_position = 0;
                    self.jump_state = JumpState::WalkingLow;
                }
                continue 'walk;
            };

            self.current_order[pos] = Some(next_unit);

            if self.jump_state == JumpState::WalkingLow && self.order_reached_jump_target() {
                // The low walk has met the jump target, so every order has
                // now been seen exactly once. Undo the placement and stop.
                self.current_order[pos] = None;
                self.join_position -= 1;
                if self.join_position >= 0 {
                    self.rewind_join_order();
                    self.join_position = -1;
                }
                self.jump_state = JumpState::ReadyToJump;
                return Ok(false);
            }

            self.place_unit(pos, next_unit);
            return Ok(true);
        }

        Ok(false)
    }

    /// Whether the sort-avoidance total is still comparable: an ordering is
    /// required and every placed unit so far kept a sort-avoiding path.
    fn sort_avoidance_live(&self) -> bool {
        if self.required_ordering.is_none() {
            return false;
        }
        if self.join_position < 0 {
            return true;
        }
        match self.current_order[self.join_position as usize] {
            Some(u) => self.units.get(u).consider_sort_avoidance(),
            None => true,
        }
    }

    fn check_timeout(&mut self) {
        if self.time_exceeded || self.config.no_timeout {
            return;
        }
        if self.num_tables_in_query <= self.config.timeout_check_threshold {
            return;
        }
        let elapsed_ms = self.clock.elapsed_ms() - self.round_started_ms;
        // The budget is the best cost itself: once finding a better plan
        // would take longer than the best plan is estimated to run, stop.
        // Until a first order completes the budget is unbounded.
        if elapsed_ms > self.best_cost.cost {
            self.time_exceeded = true;
            tracing::debug!(
                target: "quarry.optimizer",
                elapsed_ms,
                best = %self.best_cost,
                "optimization time budget exhausted"
            );
            self.trace.record(|| PlanEvent::TimedOut { elapsed_ms });
        }
    }

    /// Next untried unit legal at `pos`, scanning list order upward from
    /// just past the previous occupant.
    ///
    /// # Errors
    ///
    /// In fixed-order mode an illegal candidate is a user error, not a
    /// unit to skip.
    fn scan_candidate(&self, pos: usize, previous: Option<usize>) -> Result<Option<usize>> {
        let start = previous.map_or(0, |p| p + 1);
        for candidate in start..self.units.len() {
            let used = self.current_order[..pos]
                .iter()
                .any(|slot| *slot == Some(candidate));
            if used {
                continue;
            }
            if !self.units.get(candidate).legal_join_order(&self.assigned) {
                let unit = self.units.get(candidate).table_num();
                tracing::trace!(
                    target: "quarry.optimizer",
                    unit = %unit,
                    position = pos,
                    "skipping candidate with unplaced dependencies"
                );
                if self.units.fixed_order() {
                    return Err(QuarryError::IllegalForcedJoinOrder { unit });
                }
                continue;
            }
            return Ok(Some(candidate));
        }
        Ok(None)
    }

    /// Empties the current position, backing the occupant's contribution
    /// out of the running costs and reclaiming its pushed predicates.
    /// Returns the occupant's list index.
    fn pull_current_position(&mut self) -> Option<usize> {
        let pos = self.join_position as usize;
        let pulled = self.current_order[pos].take()?;
        let table = self.units.get(pulled).table_num();

        // Rewind the running cost to what it was before this placement:
        // subtract the pulled unit's best cost, and take row counts from
        // the unit one position out.
        let (prev_rows, prev_single) = if pos == 0 {
            (
                self.outermost_cost.row_count,
                self.outermost_cost.single_scan_row_count,
            )
        } else {
            self.best_path_rows(pos - 1)
        };
        let new_cost = if pos == 0 {
            self.outermost_cost.cost
        } else {
            let mut cost = self.current_cost.cost;
            if let Some(pulled_best) = self.units.get(pulled).best_path().cost {
                cost -= pulled_best.cost;
            }
            if cost <= 0.0 {
                // Floating-point drift from repeated add and subtract can
                // push the total through zero; rebuild it from the prefix
                // instead of trusting the subtraction.
                cost = self.resummed_prefix_cost(pos);
            }
            cost
        };
        self.current_cost = CostEstimate::new(new_cost, prev_rows, prev_single);

        if self.required_ordering.is_some() && self.units.get(pulled).consider_sort_avoidance() {
            if pos == 0 {
                self.current_sort_avoidance_cost = self.outermost_cost;
            } else {
                let (sa_rows, sa_single) = self.best_sort_avoidance_rows(pos - 1);
                let mut sa_cost = self.current_sort_avoidance_cost.cost;
                if let Some(pulled_best) =
                    self.units.get(pulled).best_sort_avoidance_path().cost
                {
                    sa_cost -= pulled_best.cost;
                }
                if sa_cost <= 0.0 {
                    sa_cost = self.resummed_prefix_sort_avoidance_cost(pos);
                }
                self.current_sort_avoidance_cost =
                    CostEstimate::new(sa_cost, sa_rows, sa_single);
            }
            self.best_ordering.remove_contribution(table);
            self.current_ordering = self.best_ordering.clone();
        }

        {
            let Self {
                units, predicates, ..
            } = self;
            units.get_mut(pulled).pull_predicates(predicates);
        }

        // Abandoning an order that diverged from the best plan leaves the
        // unit remembering the wrong path; restore the saved one.
        if self.found_best_plan && self.best_order[pos] != pulled {
            let ctx = self.context;
            self.units
                .get_mut(pulled)
                .update_best_plan(BestPlanAction::Load, ctx);
        }

        self.recompute_assigned();
        self.trace.record(|| PlanEvent::Pulled {
            position: pos,
            table_num: table,
        });
        Some(pulled)
    }

    fn best_path_rows(&self, pos: usize) -> (f64, f64) {
        match self.current_order[pos] {
            Some(u) => match self.units.get(u).best_path().cost {
                Some(c) => (c.row_count, c.single_scan_row_count),
                None => (
                    self.outermost_cost.row_count,
                    self.outermost_cost.single_scan_row_count,
                ),
            },
            None => (
                self.outermost_cost.row_count,
                self.outermost_cost.single_scan_row_count,
            ),
        }
    }

    fn best_sort_avoidance_rows(&self, pos: usize) -> (f64, f64) {
        match self.current_order[pos] {
            Some(u) => match self.units.get(u).best_sort_avoidance_path().cost {
                Some(c) => (c.row_count, c.single_scan_row_count),
                None => (
                    self.outermost_cost.row_count,
                    self.outermost_cost.single_scan_row_count,
                ),
            },
            None => (
                self.outermost_cost.row_count,
                self.outermost_cost.single_scan_row_count,
            ),
        }
    }

    /// The prefix cost below `pos`, rebuilt by summation.
    fn resummed_prefix_cost(&self, pos: usize) -> f64 {
        let mut total = self.outermost_cost.cost;
        for slot in &self.current_order[..pos] {
            if let Some(u) = slot {
                if let Some(c) = self.units.get(*u).best_path().cost {
                    total += c.cost;
                }
            }
        }
        total
    }

    fn resummed_prefix_sort_avoidance_cost(&self, pos: usize) -> f64 {
        let mut total = self.outermost_cost.cost;
        for slot in &self.current_order[..pos] {
            if let Some(u) = slot {
                if let Some(c) = self.units.get(*u).best_sort_avoidance_path().cost {
                    total += c.cost;
                }
            }
        }
        total
    }

    fn recompute_assigned(&mut self) {
        self.assigned.clear();
        for slot in &self.current_order {
            if let Some(u) = slot {
                self.assigned.union_with(self.units.get(*u).referenced_map());
            }
        }
    }

    /// Occupies `pos` with `unit_index` and readies the unit for costing:
    /// a fresh placement starts with no best cost, a reset path cursor,
    /// and every newly covered predicate pushed down.
    fn place_unit(&mut self, pos: usize, unit_index: usize) {
        self.current_order[pos] = Some(unit_index);
        self.units.get_mut(unit_index).best_path_mut().cost = None;
        self.recompute_assigned();
        {
            let Self {
                units,
                current_ordering,
                ..
            } = self;
            units.get_mut(unit_index).start_optimizing(current_ordering);
        }
        {
            let Self {
                units,
                predicates,
                non_correlated,
                assigned,
                ..
            } = self;
            push_eligible_predicates(units, predicates, non_correlated, assigned, unit_index);
        }
        let table = self.units.get(unit_index).table_num();
        tracing::trace!(
            target: "quarry.optimizer",
            position = pos,
            unit = %table,
            "considering join order position"
        );
        self.trace.record(|| PlanEvent::Placed {
            position: pos,
            table_num: table,
        });
    }

    /// Builds the jump target: units ranked by how few rows their current
    /// best paths return per scan, so the biggest producers land innermost.
    /// Returns true when a jump was initiated.
    fn prepare_jump(&mut self) -> bool {
        let n = self.units.len();
        let mut ranked: Vec<(f64, usize)> = Vec::with_capacity(n);
        for i in 0..n {
            let Some(cost) = self.units.get(i).best_path().cost else {
                // A unit was never costed in this order; try again after
                // the next complete order.
                return false;
            };
            ranked.push((cost.single_scan_row_count, i));
        }
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        if ranked.iter().enumerate().all(|(rank, &(_, i))| rank == i) {
            // Ranked order is the order just walked; jumping there wins
            // nothing, now or ever.
            self.jump_state = JumpState::NoJump;
            return false;
        }

        let target: Vec<TableNum> = ranked
            .iter()
            .map(|&(_, i)| self.units.get(i).table_num())
            .collect();
        tracing::debug!(
            target: "quarry.optimizer",
            target_order = ?target,
            "jumping to row-count-ranked join order"
        );
        self.trace.record(|| PlanEvent::Jumped { target });

        for (rank, &(_, i)) in ranked.iter().enumerate() {
            self.first_look[rank] = Some(i);
        }
        self.jump_state = JumpState::Jumping;
        self.join_position -= 1;
        self.rewind_join_order();
        true
    }

    /// Pulls every placement from the current position down to zero and
    /// zeroes the running costs. Leaves the position at zero.
    fn rewind_join_order(&mut self) {
        loop {
            let pos = self.join_position as usize;
            if let Some(u) = self.current_order[pos].take() {
                let Self {
                    units, predicates, ..
                } = self;
                units.get_mut(u).pull_predicates(predicates);
            }
            if self.join_position == 0 {
                break;
            }
            self.join_position -= 1;
        }
        self.current_cost = CostEstimate::ZERO;
        self.current_sort_avoidance_cost = CostEstimate::ZERO;
        self.assigned.clear();
    }

    /// Whether the proposed order has reached the jump target from below.
    /// Unfilled positions compare smallest, so a partial order counts only
    /// once a filled prefix already exceeds the target.
    fn order_reached_jump_target(&self) -> bool {
        self.current_order >= self.first_look
    }

    // -- access paths and costing -------------------------------------------

    /// Steps the innermost unit to its next access path. On exhaustion,
    /// folds the unit's winning path into the running totals, finishes the
    /// order if it is complete, and returns false.
    ///
    /// # Errors
    ///
    /// Propagates path-enumeration failures from the unit.
    pub fn next_access_path(&mut self) -> Result<bool> {
        if self.join_position < 0 {
            return Ok(false);
        }
        let pos = self.join_position as usize;
        let Some(unit_index) = self.current_order[pos] else {
            return Ok(false);
        };

        let stepped = {
            let Self {
                units,
                current_ordering,
                registry,
                ..
            } = self;
            units
                .get_mut(unit_index)
                .next_access_path(current_ordering, registry)?
        };
        if stepped {
            return Ok(true);
        }

        // Paths exhausted. If nothing was ever accepted at this placement
        // there is no contribution to fold and nothing to complete.
        let Some(best) = self.units.get(unit_index).best_path().cost else {
            return Ok(false);
        };
        self.current_cost = CostEstimate::new(
            self.current_cost.cost + best.cost,
            best.row_count,
            best.single_scan_row_count,
        );

        if self.required_ordering.is_some()
            && self.units.get(unit_index).consider_sort_avoidance()
        {
            if let Some(best_sa) = self.units.get(unit_index).best_sort_avoidance_path().cost {
                self.current_sort_avoidance_cost = CostEstimate::new(
                    self.current_sort_avoidance_cost.cost + best_sa.cost,
                    best_sa.row_count,
                    best_sa.single_scan_row_count,
                );
            }
        }

        if pos == self.units.len() - 1 {
            self.finish_complete_order(unit_index);
        }
        Ok(false)
    }

    /// A join order just completed: charge the sort a required ordering
    /// would need, compare against the best plan, and remember a win.
    fn finish_complete_order(&mut self, innermost: usize) {
        let has_required = self.required_ordering.is_some();
        let mut original_row_count = self.current_cost.row_count;
        let mut added_sort = None;

        if has_required {
            let mut harmonized = false;
            if self.sort_cost.is_some()
                && self.found_best_plan
                && self.best_kind == JoinPlanKind::Normal
            {
                // Competing orders can disagree wildly on row count, and
                // the sort charge scales with it. Re-level the best plan's
                // sort at both row counts so the comparison below is about
                // join cost, not row-estimate drift.
                if self.best_cost.row_count > self.current_cost.row_count {
                    let old_sort = self.estimated_sort_cost(self.best_cost.row_count);
                    let new_sort = self.estimated_sort_cost(self.current_cost.row_count);
                    self.best_cost = CostEstimate::new(
                        (self.best_cost.cost - old_sort.cost + new_sort.cost).max(0.0),
                        new_sort.row_count,
                        self.current_cost.single_scan_row_count,
                    );
                    self.sort_cost = Some(new_sort);
                    harmonized = true;
                } else if self.best_cost.row_count < self.current_cost.row_count {
                    self.current_cost = CostEstimate::new(
                        self.current_cost.cost,
                        self.best_cost.row_count,
                        self.current_cost.single_scan_row_count,
                    );
                }
            }
            if !harmonized {
                self.sort_cost = Some(self.estimated_sort_cost(self.current_cost.row_count));
            }
            original_row_count = self.current_cost.row_count;
            if let Some(sort) = self.sort_cost {
                self.current_cost = CostEstimate::new(
                    self.current_cost.cost + sort.cost,
                    sort.row_count,
                    self.current_cost.single_scan_row_count,
                );
                added_sort = Some(sort);
            }
        }

        let order = self.filled_order();
        let cost = self.current_cost;
        tracing::debug!(
            target: "quarry.optimizer",
            order = ?order,
            cost = %cost,
            "costed complete join order"
        );
        self.trace.record(|| PlanEvent::OrderCosted { order, cost });

        if !self.found_best_plan
            || self.current_cost.compare(&self.best_cost) == Ordering::Less
        {
            self.remember_best(JoinPlanKind::Normal, self.current_cost);
        }

        // The sort charge must not leak into the running total: the next
        // permutation subtracts per-unit costs from it.
        if let Some(sort) = added_sort {
            self.current_cost = CostEstimate::new(
                (self.current_cost.cost - sort.cost).max(0.0),
                original_row_count,
                self.current_cost.single_scan_row_count,
            );
        }

        if has_required && self.units.get(innermost).consider_sort_avoidance() {
            let satisfied = self
                .required_ordering
                .as_ref()
                .is_some_and(|req| {
                    req.sort_required(&self.best_ordering) == SortNeed::NothingRequired
                });
            // Ties go to sort avoidance: at equal cost, not sorting also
            // saves the sort's memory and pipelines the first row sooner.
            if satisfied
                && self
                    .current_sort_avoidance_cost
                    .compare(&self.best_cost)
                    != Ordering::Greater
            {
                self.remember_best(
                    JoinPlanKind::SortAvoidance,
                    self.current_sort_avoidance_cost,
                );
            }
        }
    }

    /// Sort estimate for `rows` rows, zero when the chosen paths already
    /// produce the required ordering.
    fn estimated_sort_cost(&self, rows: f64) -> CostEstimate {
        match &self.required_ordering {
            Some(req) if req.sort_required(&self.best_ordering) == SortNeed::NothingRequired => {
                CostEstimate::new(0.0, rows, rows)
            }
            _ => self.model.sort(rows),
        }
    }

    fn remember_best(&mut self, kind: JoinPlanKind, cost: CostEstimate) {
        self.found_best_plan = true;
        self.best_cost = cost;
        self.best_kind = kind;
        for (i, slot) in self.current_order.iter().enumerate() {
            if let Some(u) = slot {
                self.best_order[i] = *u;
            }
        }
        let ctx = self.context;
        for i in 0..self.units.len() {
            let unit = self.units.get_mut(self.best_order[i]);
            unit.remember_as_best(kind);
            unit.update_best_plan(BestPlanAction::Add, ctx);
        }

        let order = self.best_join_order();
        tracing::debug!(
            target: "quarry.optimizer",
            order = ?order,
            cost = %cost,
            kind = ?kind,
            "remembered new best join order"
        );
        self.trace
            .record(|| PlanEvent::BestPlanRemembered { kind, order, cost });
    }

    fn filled_order(&self) -> Vec<TableNum> {
        self.current_order
            .iter()
            .flatten()
            .map(|&u| self.units.get(u).table_num())
            .collect()
    }

    /// Prices the innermost unit's current access path beneath the outer
    /// prefix and lets the unit's best-path slots compete for it.
    ///
    /// # Errors
    ///
    /// Propagates costing failures from the unit.
    pub fn cost_current_path(&mut self) -> Result<()> {
        if self.join_position < 0 {
            return Ok(());
        }
        let pos = self.join_position as usize;
        let Some(unit_index) = self.current_order[pos] else {
            return Ok(());
        };

        let outer = if pos == 0 {
            self.outermost_cost
        } else {
            match self.current_order[pos - 1] {
                Some(prev) => match self.units.get(prev).best_path().cost {
                    Some(c) => c,
                    None => return Ok(()),
                },
                None => return Ok(()),
            }
        };

        {
            let unit = self.units.get(unit_index);
            let strategy = self.registry.get(unit.current_path().strategy);
            if !strategy.feasible(unit.referenced_map(), unit.hosted_predicates()) {
                tracing::trace!(
                    target: "quarry.optimizer",
                    unit = %unit.table_num(),
                    strategy = strategy.name(),
                    "skipping infeasible join strategy"
                );
                return Ok(());
            }
        }

        let estimate = {
            let Self {
                units,
                model,
                registry,
                ..
            } = self;
            units
                .get_mut(unit_index)
                .estimate_cost(&outer, model, registry)?
        };

        self.select_access_path(unit_index, estimate, &outer);
        Ok(())
    }

    /// Decides whether the just-costed path displaces the unit's best path
    /// or best sort-avoidance path for this placement.
    fn select_access_path(&mut self, unit_index: usize, estimate: CostEstimate, outer: &CostEstimate) {
        let pos = self.join_position as usize;

        if self.effective_rule_based(unit_index) {
            let update = {
                let unit = self.units.get(unit_index);
                rule_based_prefers(unit.current_path(), unit.best_path())
            };
            if update {
                self.units
                    .get_mut(unit_index)
                    .update_best_from_current(estimate);
            }
        } else {
            // Materializing strategies are skipped outright when their
            // working set would not fit the per-table memory budget.
            let (memory, table_num, strategy_name) = {
                let unit = self.units.get(unit_index);
                let strategy = self.registry.get(unit.current_path().strategy);
                let rows_per_scan = if outer.row_count > 0.0 {
                    estimate.row_count / outer.row_count
                } else {
                    estimate.row_count
                };
                (
                    strategy.memory_usage(unit.memory_per_row(), rows_per_scan),
                    unit.table_num(),
                    strategy.name().to_owned(),
                )
            };
            let budget = self.config.max_memory_per_table as f64;
            if memory > budget {
                tracing::debug!(
                    target: "quarry.optimizer",
                    unit = %table_num,
                    strategy = strategy_name.as_str(),
                    memory,
                    budget,
                    "skipping access path over the per-table memory budget"
                );
                self.trace.record(|| PlanEvent::MemorySkipped {
                    table_num,
                    strategy: strategy_name,
                    memory,
                    budget,
                });
                return;
            }

            let update = {
                let unit = self.units.get(unit_index);
                // Base tables keep the first of equal-cost paths; derived
                // units take the latest, whose estimate reflects the most
                // predicate knowledge.
                cost_prefers(&estimate, unit.best_path(), !unit.is_base_table())
            };
            if update {
                self.units
                    .get_mut(unit_index)
                    .update_best_from_current(estimate);
            }
        }

        // Sort-avoidance bookkeeping rides along under both selection
        // modes, but only while the chain from position zero is unbroken
        // and the candidate path keeps the required ordering satisfiable.
        if self.required_ordering.is_none() {
            return;
        }
        let chain_alive = pos == 0
            || match self.current_order[pos - 1] {
                Some(prev) => self.units.get(prev).consider_sort_avoidance(),
                None => false,
            };
        if !chain_alive {
            return;
        }
        let satisfiable = self
            .required_ordering
            .as_ref()
            .is_some_and(|req| {
                req.sort_required_within(&self.current_ordering, &self.assigned)
                    == SortNeed::NothingRequired
            });
        if !satisfiable {
            return;
        }
        let update = match self.units.get(unit_index).best_sort_avoidance_path().cost {
            None => true,
            Some(best) => estimate.compare(&best) == Ordering::Less,
        };
        if update {
            self.units
                .get_mut(unit_index)
                .update_best_sort_avoidance_from_current(estimate);
            self.best_ordering = self.current_ordering.clone();
        }
    }

    /// Whether this unit is selected by the rule-based peck order instead
    /// of numeric cost: by configuration, or because the numbers it would
    /// be costed with are not real statistics.
    fn effective_rule_based(&self, unit_index: usize) -> bool {
        self.config.rule_based
            || !self.model.use_statistics
            || !self.units.get(unit_index).uses_gathered_stats()
    }
}

// ---------------------------------------------------------------------------
// Predicate pushing
// ---------------------------------------------------------------------------

/// Offers `units[unit_index]` every predicate that has become fully
/// covered: all referenced tables are either placed (in `outer_tables`) or
/// correlated to an enclosing block. Scoped predicates are additionally
/// held back from units whose base tables they do not target. Accepted
/// predicates move from the master list into the unit.
fn push_eligible_predicates(
    units: &mut OptimizableList,
    predicates: &mut PredicateList,
    non_correlated: &TableSet,
    outer_tables: &TableSet,
    unit_index: usize,
) {
    let unit = units.get_mut(unit_index);
    let unit_base_tables = unit.base_table_set();

    // Walk backwards so removal never skips an entry.
    let mut i = predicates.len();
    while i > 0 {
        i -= 1;
        let pred = predicates.get(i);
        if !pred.pushable {
            continue;
        }
        let mut remaining = pred.referenced.clone();
        remaining.subtract(outer_tables);
        remaining.intersect_with(non_correlated);
        if !remaining.is_empty() {
            continue;
        }
        if let Some(scope) = &pred.scope {
            if !scope.target_tables.intersects(&unit_base_tables) {
                continue;
            }
        }
        let pred = predicates.remove(i);
        if let PushOutcome::Rejected(pred) = unit.push_predicate(pred) {
            predicates.insert(i, pred);
        }
    }
}

// ---------------------------------------------------------------------------
// Path selection rules
// ---------------------------------------------------------------------------

/// Rule-based peck order, best first: a path with useful predicates, then
/// a covering index, then the heap over an index that is neither. Within a
/// class the later candidate wins, except that a covering path with useful
/// predicates is never displaced by a non-covering one.
fn rule_based_prefers(current: &AccessPath, best: &AccessPath) -> bool {
    if best.cost.is_none() {
        return true;
    }
    if !current.non_matching_index_scan {
        return !best.covering_index_scan
            || best.non_matching_index_scan
            || current.covering_index_scan;
    }
    if current.covering_index_scan {
        return true;
    }
    current.storage == StoragePath::Heap
        && !best.covering_index_scan
        && best.non_matching_index_scan
}

/// Numeric cost comparison against the best path slot.
fn cost_prefers(estimate: &CostEstimate, best: &AccessPath, accept_ties: bool) -> bool {
    match best.cost {
        None => true,
        Some(b) => match estimate.compare(&b) {
            Ordering::Less => true,
            Ordering::Equal => accept_ties,
            Ordering::Greater => false,
        },
    }
}
