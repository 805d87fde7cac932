//! Quarry optimizer verification harness.
//!
//! This crate is intentionally not "just tests": it contains reusable
//! verification tooling (synthetic catalog builders, an exhaustive plan
//! oracle, a row-order replay simulator) that other crates can call into
//! from their own tests.
//!
//! The pieces compose:
//!
//! ```text
//! BlockSpec → Optimizer        → committed Plan ─┐
//!          → exhaustive_best   → OraclePlan     ─┼→ differential checks
//!          → replay_plan(Plan) → emitted rows   ─┘
//! ```
//!
//! A [`catalog::BlockSpec`] is the single source of truth for one query
//! block. It can build the real optimizer's inputs, feed the oracle's
//! brute-force enumeration, and synthesize deterministic rows for replay,
//! so one spec drives all three without re-describing the schema.

pub mod catalog;
pub mod oracle;
pub mod replay;
