//! Invariant tests for the join-order search as a whole.
//!
//! Covers:
//! 1. Every costed complete join order names each unit exactly once, and
//!    below the jump threshold no complete order is costed twice.
//! 2. A predicate hosted on a unit never references a table outside the
//!    outer prefix that ends at that unit.
//! 3. Predicates survive the search: after a round they are all back on the
//!    statement list, and after commit they partition between hosts and the
//!    residual list with none lost or duplicated.
//! 4. The committed plan never costs more than any complete order the
//!    search explored.
//! 5. A chain of equijoins over tables of very different sizes joins the
//!    smallest tables outermost, and the total is the sum of the per-table
//!    scan costs under nested-loop multiplication.
//! 6. Abandoning the search on timeout reports a cost that was genuinely
//!    explored, never one below what a full search would find.
//! 7. An index that feeds the required ordering commits a sort-avoidance
//!    plan with no sort charge; without such an index the plan stays
//!    normal and pays the sort.
//! 8. With enough tables the search jumps to the join order ranked by
//!    single-scan row counts before walking the rest of the space.
//! 9. A unit never appears before the tables it depends on, under any
//!    dependency shape.

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;
    use std::collections::HashSet;

    use proptest::prelude::*;
    use quarry_types::{ColumnId, TableNum, TableSet};

    use crate::access_path::JoinPlanKind;
    use crate::clock::ManualClock;
    use crate::optimizable::{BaseTable, Optimizable, OptimizableList};
    use crate::optimizer::{Optimizer, OptimizerConfig, OptimizerEnv};
    use crate::ordering::RequiredOrdering;
    use crate::predicate::{PredId, Predicate, PredicateList};
    use crate::stats::{CostModel, EQUALITY_SELECTIVITY, IndexInfo, TableStats};
    use crate::strategy::{NestedLoopJoin, StrategyRegistry};
    use crate::trace::PlanEvent;

    // ────────────────────────────────────────────────────────────────────────
    // Helpers
    // ────────────────────────────────────────────────────────────────────────

    fn table(name: &str, num: usize, capacity: usize, rows: f64) -> BaseTable {
        BaseTable::new(
            name,
            TableNum(num),
            capacity,
            TableStats::gathered(rows, (rows / 100.0).max(1.0), 40.0),
        )
    }

    fn traced_env() -> OptimizerEnv {
        OptimizerEnv {
            config: OptimizerConfig {
                trace: true,
                ..OptimizerConfig::default()
            },
            ..OptimizerEnv::default()
        }
    }

    /// Equijoins on column zero linking the given table pairs.
    fn equijoin_chain(capacity: usize, links: &[(usize, usize)]) -> PredicateList {
        let mut preds = PredicateList::new();
        for (i, &(a, b)) in links.iter().enumerate() {
            preds.push(Predicate::equijoin(
                PredId(i),
                capacity,
                (TableNum(a), ColumnId(0)),
                (TableNum(b), ColumnId(0)),
            ));
        }
        preds
    }

    fn is_permutation(order: &[TableNum], n: usize) -> bool {
        let mut seen = vec![false; n];
        if order.len() != n {
            return false;
        }
        for t in order {
            if t.index() >= n || seen[t.index()] {
                return false;
            }
            seen[t.index()] = true;
        }
        true
    }

    // ────────────────────────────────────────────────────────────────────────
    // Complete-order exactness
    // ────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_costed_orders_name_each_unit_exactly_once() {
        let units: Vec<Box<dyn Optimizable>> = vec![
            Box::new(table("a", 0, 3, 300.0)),
            Box::new(table("b", 1, 3, 40.0)),
            Box::new(table("c", 2, 3, 7_000.0)),
        ];
        let mut opt = Optimizer::new(
            OptimizableList::new(units),
            equijoin_chain(3, &[(0, 1), (1, 2)]),
            traced_env(),
        )
        .unwrap();
        opt.optimize_round().unwrap();

        let mut costed = 0;
        let mut seen: HashSet<Vec<usize>> = HashSet::new();
        for event in opt.plan_trace().events() {
            if let PlanEvent::OrderCosted { order, .. } = event {
                costed += 1;
                assert!(
                    is_permutation(order, 3),
                    "costed order {order:?} is not a permutation"
                );
                assert!(
                    seen.insert(order.iter().map(|t| t.index()).collect()),
                    "order {order:?} was costed twice"
                );
            }
        }
        assert!(costed >= 1, "no complete order was ever costed");
    }

    // ────────────────────────────────────────────────────────────────────────
    // Predicate custody
    // ────────────────────────────────────────────────────────────────────────

    /// Drives the search by hand and checks, after every placement, that
    /// each hosted predicate references only tables in the prefix that ends
    /// at its host.
    #[test]
    fn test_hosted_predicates_stay_within_the_outer_prefix() {
        let capacity = 4;
        let units: Vec<Box<dyn Optimizable>> = vec![
            Box::new(table("a", 0, capacity, 500.0)),
            Box::new(table("b", 1, capacity, 60.0)),
            Box::new(table("c", 2, capacity, 2_000.0)),
            Box::new(table("d", 3, capacity, 90.0)),
        ];
        let mut preds = equijoin_chain(capacity, &[(0, 1), (1, 2), (2, 3)]);
        let mut wide = TableSet::new(capacity);
        wide.insert(TableNum(0));
        wide.insert(TableNum(1));
        wide.insert(TableNum(2));
        preds.push(Predicate::opaque(PredId(9), wide));

        let mut opt =
            Optimizer::new(OptimizableList::new(units), preds, OptimizerEnv::default()).unwrap();

        while opt.next_join_order().unwrap() {
            let mut prefix = TableSet::new(capacity);
            for slot in opt.proposed_join_order() {
                let Some(u) = *slot else { break };
                prefix.union_with(opt.units().get(u).referenced_map());
                for pred in opt.units().get(u).hosted_predicates().iter() {
                    assert!(
                        prefix.contains_all(&pred.referenced),
                        "predicate {:?} hosted on unit {u} references {} outside prefix {}",
                        pred.id,
                        pred.referenced,
                        prefix
                    );
                }
            }
            while opt.next_access_path().unwrap() {
                opt.cost_current_path().unwrap();
            }
        }
        assert!(opt.found_best_plan());
    }

    #[test]
    fn test_predicates_partition_between_hosts_and_residual_after_commit() {
        let capacity = 3;
        let units: Vec<Box<dyn Optimizable>> = vec![
            Box::new(table("a", 0, capacity, 400.0)),
            Box::new(table("b", 1, capacity, 25.0)),
            Box::new(table("c", 2, capacity, 900.0)),
        ];
        let mut preds = equijoin_chain(capacity, &[(0, 1), (1, 2)]);
        let mut all = TableSet::new(capacity);
        all.insert(TableNum(0));
        all.insert(TableNum(2));
        preds.push(Predicate::opaque(PredId(7), all).non_pushable());
        let initial: HashSet<usize> = preds.iter().map(|p| p.id.0).collect();

        let mut opt =
            Optimizer::new(OptimizableList::new(units), preds, OptimizerEnv::default()).unwrap();
        opt.optimize_round().unwrap();

        // Round over: every pushed predicate is back on the statement list.
        let after_round: HashSet<usize> =
            opt.residual_predicates().iter().map(|p| p.id.0).collect();
        assert_eq!(after_round, initial);
        for i in 0..opt.units().len() {
            assert!(opt.units().get(i).hosted_predicates().is_empty());
        }

        opt.commit_plan().unwrap();

        // Committed: hosts and the residual list partition the originals.
        let mut found: Vec<usize> = opt.residual_predicates().iter().map(|p| p.id.0).collect();
        for i in 0..opt.units().len() {
            found.extend(opt.units().get(i).hosted_predicates().iter().map(|p| p.id.0));
        }
        found.sort_unstable();
        let mut expected: Vec<usize> = initial.into_iter().collect();
        expected.sort_unstable();
        assert_eq!(found, expected, "a predicate was lost or duplicated");
        // The non-pushable one stayed residual.
        assert!(opt.residual_predicates().contains_id(PredId(7)));
    }

    // ────────────────────────────────────────────────────────────────────────
    // Whole-plan cost shape
    // ────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_smallest_tables_join_outermost_in_an_equijoin_chain() {
        let capacity = 3;
        let units: Vec<Box<dyn Optimizable>> = vec![
            Box::new(table("a", 0, capacity, 100.0)),
            Box::new(table("b", 1, capacity, 10.0)),
            Box::new(table("c", 2, capacity, 1.0)),
        ];
        let mut preds = PredicateList::new();
        preds.push(Predicate::equijoin(
            PredId(0),
            capacity,
            (TableNum(0), ColumnId(0)),
            (TableNum(1), ColumnId(0)),
        ));
        preds.push(Predicate::equijoin(
            PredId(1),
            capacity,
            (TableNum(1), ColumnId(1)),
            (TableNum(2), ColumnId(0)),
        ));

        let mut opt =
            Optimizer::new(OptimizableList::new(units), preds, traced_env()).unwrap();
        let plan = opt.optimize().unwrap();

        assert_eq!(plan.order, vec![TableNum(2), TableNum(1), TableNum(0)]);
        assert_eq!(plan.kind, JoinPlanKind::Normal);
        // One full scan each, outermost first: 1.01 + 1.1 + 2.0. Each outer
        // prefix feeds a single row into the next scan, so no nested-loop
        // multiplier ever exceeds one.
        let expected = 1.01 + 1.1 + 2.0;
        assert!(
            (plan.cost.cost - expected).abs() < 1e-9,
            "expected {expected}, costed {}",
            plan.cost.cost
        );
        // Plan cardinality is the innermost estimate: 100 rows kept at 0.1.
        assert!((plan.cost.row_count - 10.0).abs() < 1e-9);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        /// Random four-table blocks: every costed order is a permutation,
        /// none repeats, and the committed plan is at most as expensive as
        /// anything the search explored.
        #[test]
        fn prop_committed_plan_is_floor_of_explored_orders(
            rows in prop::collection::vec(1u32..=20_000, 4),
            link_mask in 0u8..8,
        ) {
            let capacity = 4;
            let units: Vec<Box<dyn Optimizable>> = rows
                .iter()
                .enumerate()
                .map(|(i, &r)| {
                    Box::new(table(&format!("t{i}"), i, capacity, f64::from(r)))
                        as Box<dyn Optimizable>
                })
                .collect();
            let links: Vec<(usize, usize)> = [(0, 1), (1, 2), (2, 3)]
                .iter()
                .enumerate()
                .filter(|(i, _)| link_mask & (1 << i) != 0)
                .map(|(_, &l)| l)
                .collect();
            let preds = equijoin_chain(capacity, &links);

            let mut opt =
                Optimizer::new(OptimizableList::new(units), preds, traced_env()).unwrap();
            let plan = opt.optimize().unwrap();

            prop_assert!(is_permutation(&plan.order, capacity));
            prop_assert_eq!(plan.choices.len(), capacity);

            let mut seen: HashSet<Vec<usize>> = HashSet::new();
            for event in opt.plan_trace().events() {
                if let PlanEvent::OrderCosted { order, cost } = event {
                    prop_assert!(is_permutation(order, capacity));
                    prop_assert!(
                        seen.insert(order.iter().map(|t| t.index()).collect()),
                        "order {:?} costed twice", order
                    );
                    prop_assert!(
                        plan.cost.compare(cost) != Ordering::Greater,
                        "committed {} but explored cheaper {}", plan.cost, cost
                    );
                }
            }
        }

        /// Random dependency shapes over four tables: no costed order ever
        /// places a unit before all of its providers.
        #[test]
        fn prop_dependent_units_follow_their_providers(dep_mask in 0u8..64) {
            let capacity = 4;
            let pairs = [(1, 0), (2, 0), (2, 1), (3, 0), (3, 1), (3, 2)];
            let mut deps: Vec<Vec<usize>> = vec![Vec::new(); capacity];
            for (bit, &(unit, provider)) in pairs.iter().enumerate() {
                if dep_mask & (1 << bit) != 0 {
                    deps[unit].push(provider);
                }
            }

            let units: Vec<Box<dyn Optimizable>> = (0..capacity)
                .map(|i| {
                    let mut dep_set = TableSet::new(capacity);
                    for &p in &deps[i] {
                        dep_set.insert(TableNum(p));
                    }
                    Box::new(
                        table(&format!("t{i}"), i, capacity, 100.0 * (i as f64 + 1.0))
                            .with_dependencies(dep_set),
                    ) as Box<dyn Optimizable>
                })
                .collect();

            let mut opt = Optimizer::new(
                OptimizableList::new(units),
                PredicateList::new(),
                traced_env(),
            )
            .unwrap();
            let plan = opt.optimize().unwrap();

            let respected = |order: &[TableNum]| {
                let mut placed: HashSet<usize> = HashSet::new();
                for t in order {
                    if !deps[t.index()].iter().all(|p| placed.contains(p)) {
                        return false;
                    }
                    placed.insert(t.index());
                }
                true
            };
            prop_assert!(respected(&plan.order), "committed {:?}", plan.order);
            for event in opt.plan_trace().events() {
                if let PlanEvent::OrderCosted { order, .. } = event {
                    prop_assert!(respected(order), "costed {:?}", order);
                }
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Timeout honesty
    // ────────────────────────────────────────────────────────────────────────

    fn wide_block(capacity: usize) -> (Vec<Box<dyn Optimizable>>, PredicateList) {
        let rows = [900.0, 50.0, 700.0, 30.0, 400.0, 80.0, 600.0];
        let units: Vec<Box<dyn Optimizable>> = rows
            .iter()
            .enumerate()
            .map(|(i, &r)| {
                Box::new(table(&format!("t{i}"), i, capacity, r)) as Box<dyn Optimizable>
            })
            .collect();
        let preds = equijoin_chain(capacity, &[(0, 1), (2, 3), (4, 5)]);
        (units, preds)
    }

    #[test]
    fn test_timed_out_cost_was_genuinely_explored() {
        let capacity = 7;
        let clock = ManualClock::new();
        let handle = clock.clone();
        let (units, preds) = wide_block(capacity);
        let env = OptimizerEnv {
            clock: Box::new(clock),
            config: OptimizerConfig {
                trace: true,
                ..OptimizerConfig::default()
            },
            ..OptimizerEnv::default()
        };
        let mut opt = Optimizer::new(OptimizableList::new(units), preds, env).unwrap();

        let mut cut = false;
        while opt.next_join_order().unwrap() {
            while opt.next_access_path().unwrap() {
                opt.cost_current_path().unwrap();
            }
            if !cut && opt.found_best_plan() {
                handle.set(u64::MAX);
                cut = true;
            }
        }
        assert!(opt.timed_out());
        let timed_best = opt.best_cost();
        let explored = opt.plan_trace().events().iter().any(|e| {
            matches!(e, PlanEvent::OrderCosted { cost, .. } if cost.cost == timed_best.cost)
        });
        assert!(explored, "reported cost {timed_best} matches no explored order");

        // A full search over the same block can only match or beat it.
        let (units, preds) = wide_block(capacity);
        let env = OptimizerEnv {
            config: OptimizerConfig {
                no_timeout: true,
                ..OptimizerConfig::default()
            },
            ..OptimizerEnv::default()
        };
        let mut full = Optimizer::new(OptimizableList::new(units), preds, env).unwrap();
        full.optimize_round().unwrap();
        assert!(
            full.best_cost().compare(&timed_best) != Ordering::Greater,
            "full search found {} worse than the timed-out {}",
            full.best_cost(),
            timed_best
        );
    }

    // ────────────────────────────────────────────────────────────────────────
    // Sort avoidance
    // ────────────────────────────────────────────────────────────────────────

    fn ordered_pair(
        capacity: usize,
        referenced: Vec<ColumnId>,
    ) -> (Vec<Box<dyn Optimizable>>, PredicateList) {
        let t0 = table("orders", 0, capacity, 10_000.0)
            .with_index(IndexInfo::new("ix_orders", vec![ColumnId(0)], false))
            .with_referenced_columns(referenced);
        let t1 = table("lines", 1, capacity, 500.0);
        let units: Vec<Box<dyn Optimizable>> =
            vec![Box::new(t0), Box::new(t1)];
        let preds = equijoin_chain(capacity, &[(0, 1)]);
        (units, preds)
    }

    #[test]
    fn test_index_feeding_required_order_commits_sort_avoidance() {
        let capacity = 2;
        let (units, preds) = ordered_pair(capacity, vec![ColumnId(0)]);
        let env = OptimizerEnv {
            registry: StrategyRegistry::new(vec![Box::new(NestedLoopJoin)]),
            required_ordering: Some(RequiredOrdering::ascending(vec![(
                TableNum(0),
                ColumnId(0),
            )])),
            ..OptimizerEnv::default()
        };
        let mut opt = Optimizer::new(OptimizableList::new(units), preds, env).unwrap();
        let plan = opt.optimize().unwrap();

        assert_eq!(plan.kind, JoinPlanKind::SortAvoidance);
        assert_eq!(plan.order, vec![TableNum(0), TableNum(1)]);
        assert_eq!(plan.choices[0].storage, "ix_orders");

        // Covering index scan of the outer, one inner scan per outer row,
        // and no sort term anywhere.
        let model = CostModel::default();
        let outer = model.index_scan(
            &TableStats::gathered(10_000.0, 100.0, 40.0),
            &IndexInfo::new("ix_orders", vec![ColumnId(0)], false),
            1.0,
            1.0,
            true,
        );
        let inner = model.full_scan(
            &TableStats::gathered(500.0, 5.0, 40.0),
            EQUALITY_SELECTIVITY,
        );
        let expected = outer.cost + inner.cost * outer.row_count;
        assert!(
            (plan.cost.cost - expected).abs() < 1e-6,
            "expected {expected}, committed {}",
            plan.cost.cost
        );
    }

    #[test]
    fn test_unindexed_required_order_pays_the_sort() {
        let capacity = 2;
        // Column 5 is read but not indexed, so no path feeds the ordering.
        let (units, preds) = ordered_pair(capacity, vec![ColumnId(0), ColumnId(5)]);
        let env = OptimizerEnv {
            registry: StrategyRegistry::new(vec![Box::new(NestedLoopJoin)]),
            required_ordering: Some(RequiredOrdering::ascending(vec![(
                TableNum(0),
                ColumnId(5),
            )])),
            ..OptimizerEnv::default()
        };
        let mut opt = Optimizer::new(OptimizableList::new(units), preds, env).unwrap();
        let plan = opt.optimize().unwrap();

        assert_eq!(plan.kind, JoinPlanKind::Normal);
        assert_eq!(plan.order, vec![TableNum(1), TableNum(0)]);

        let model = CostModel::default();
        let outer = model.full_scan(&TableStats::gathered(500.0, 5.0, 40.0), 1.0);
        let inner = model.full_scan(
            &TableStats::gathered(10_000.0, 100.0, 40.0),
            EQUALITY_SELECTIVITY,
        );
        let join_rows = inner.row_count * outer.row_count;
        let expected =
            outer.cost + inner.cost * outer.row_count + model.sort(join_rows).cost;
        assert!(
            (plan.cost.cost - expected).abs() < 1e-6,
            "expected {expected}, committed {}",
            plan.cost.cost
        );
        assert!((plan.cost.row_count - join_rows).abs() < 1e-6);
    }

    // ────────────────────────────────────────────────────────────────────────
    // Jumping
    // ────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_jump_targets_the_order_ranked_by_scan_rows() {
        let capacity = 7;
        // Row counts descend with the table number, so the ranked order is
        // the exact reverse of the list order.
        let units: Vec<Box<dyn Optimizable>> = (0..capacity)
            .map(|i| {
                Box::new(table(
                    &format!("t{i}"),
                    i,
                    capacity,
                    100.0 * (capacity - i) as f64,
                )) as Box<dyn Optimizable>
            })
            .collect();
        let mut opt = Optimizer::new(
            OptimizableList::new(units),
            PredicateList::new(),
            traced_env(),
        )
        .unwrap();
        let plan = opt.optimize().unwrap();
        assert!(is_permutation(&plan.order, capacity));

        let target: Vec<TableNum> = (0..capacity).rev().map(TableNum).collect();
        let jumped = opt
            .plan_trace()
            .events()
            .iter()
            .find_map(|e| match e {
                PlanEvent::Jumped { target } => Some(target.clone()),
                _ => None,
            })
            .expect("a seven-table block should jump");
        assert_eq!(jumped, target);

        // The jump rearranges the walk without losing any of the space:
        // all 5040 orders still get costed. Orders walked before the jump
        // may be seen again on the low walk back up to the target.
        let mut seen: HashSet<Vec<usize>> = HashSet::new();
        for event in opt.plan_trace().events() {
            if let PlanEvent::OrderCosted { order, .. } = event {
                assert!(is_permutation(order, capacity));
                seen.insert(order.iter().map(|t| t.index()).collect());
            }
        }
        assert_eq!(seen.len(), 5040, "some join order was never costed");
    }
}
