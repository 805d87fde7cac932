//! Machine-readable record of one optimization.
//!
//! Span-level logging answers "what is the search doing right now"; the
//! plan trace answers "why did it pick that plan" after the fact. When
//! enabled, the optimizer appends one event per decision, in order, and the
//! whole trace serializes to deterministic JSON for diffing across runs.

use quarry_types::{CostEstimate, TableNum};
use serde::Serialize;

use crate::access_path::JoinPlanKind;

/// One decision taken during the search.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlanEvent {
    /// A unit took a position in the join order under trial.
    Placed {
        /// Join position, zero-based from the outermost.
        position: usize,
        table_num: TableNum,
    },
    /// The unit at `position` was backed out.
    Pulled {
        position: usize,
        table_num: TableNum,
    },
    /// A join strategy was not costed because its working set exceeds the
    /// per-table memory budget.
    MemorySkipped {
        table_num: TableNum,
        strategy: String,
        memory: f64,
        budget: f64,
    },
    /// A complete join order was costed.
    OrderCosted {
        order: Vec<TableNum>,
        cost: CostEstimate,
    },
    /// A complete join order became the best plan so far.
    BestPlanRemembered {
        kind: JoinPlanKind,
        order: Vec<TableNum>,
        cost: CostEstimate,
    },
    /// The search restarted from a promising join order.
    Jumped { target: Vec<TableNum> },
    /// Further search was judged not worth its time.
    TimedOut { elapsed_ms: f64 },
    /// The winning plan was committed into the units.
    Committed {
        kind: JoinPlanKind,
        order: Vec<TableNum>,
        cost: CostEstimate,
    },
}

/// An append-only event log. Disabled traces drop events without building
/// them, so tracing costs nothing when off.
#[derive(Debug, Default)]
pub struct PlanTrace {
    enabled: bool,
    events: Vec<PlanEvent>,
}

impl PlanTrace {
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            events: Vec::new(),
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&mut self, event: impl FnOnce() -> PlanEvent) {
        if self.enabled {
            self.events.push(event());
        }
    }

    #[must_use]
    pub fn events(&self) -> &[PlanEvent] {
        &self.events
    }

    /// Serialize the event log to deterministic pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns `Err` when serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_trace_drops_events() {
        let mut trace = PlanTrace::disabled();
        trace.record(|| PlanEvent::Placed {
            position: 0,
            table_num: TableNum(1),
        });
        assert!(trace.events().is_empty());
        assert!(!trace.is_enabled());
    }

    #[test]
    fn test_events_keep_order_and_serialize() {
        let mut trace = PlanTrace::enabled();
        trace.record(|| PlanEvent::Placed {
            position: 0,
            table_num: TableNum(2),
        });
        trace.record(|| PlanEvent::OrderCosted {
            order: vec![TableNum(2)],
            cost: CostEstimate::new(10.0, 5.0, 5.0),
        });
        trace.record(|| PlanEvent::Pulled {
            position: 0,
            table_num: TableNum(2),
        });
        assert_eq!(trace.events().len(), 3);

        let json = trace.to_json().unwrap();
        assert!(json.contains("\"event\": \"placed\""));
        assert!(json.contains("\"event\": \"order_costed\""));
        assert!(json.contains("\"event\": \"pulled\""));
    }
}
