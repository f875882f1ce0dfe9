//! # Execution Engine
//!
//! Pull-based, budgeted query execution:
//!
//! ```text
//! PlanNode tree ──build──► Operator tree ──pull──► rows
//!                               │
//!                        ExecutionContext
//!                 (budget, allocator, counters,
//!                  deadline, abort, violation)
//! ```
//!
//! Operators are a tagged enum dispatched through a central match — one
//! variant per kind, no virtual hierarchy. Every `next` consults the
//! hot-path `should_stop`; row boundaries run the full `check_budget`.
//! Budget violations are sticky, typed, and never crash the process.

mod context;
mod executor;
mod operators;
mod plan;

pub use context::{
    AbortHandle, BudgetError, BudgetViolation, ExecutionContext, ExecutionStats, QueryBudget,
};
pub use executor::{Executor, QueryOutput};
pub use operators::Operator;
pub use plan::{AggregateFunc, AggregateSpec, BinaryOp, Expr, PlanNode, SortKey};
