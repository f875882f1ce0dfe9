//! # RimDB - Embedded SQL Storage & Execution Core
//!
//! RimDB is the storage and execution core of an embedded SQL engine built
//! for edge deployment: deterministic query processing over a page-oriented,
//! write-ahead-logged storage layer, with every query running under explicit
//! resource budgets so no single statement can monopolize the process.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Engine (facade)              │
//! ├──────────────┬──────────────────────────┤
//! │  Transaction │   Shutdown Coordinator   │
//! │   Manager    │   (phased drain)         │
//! ├──────────────┴──────────────────────────┤
//! │  Executor (pull-based operator tree)    │
//! │  gated by ExecutionContext budgets      │
//! ├─────────────────────────────────────────┤
//! │  Catalog │ Record serialization         │
//! ├─────────────────────────────────────────┤
//! │  Buffer Pool (LRU, pinned page guards)  │
//! ├─────────────────────────────────────────┤
//! │  Slotted Pages │ Table Files │ Segments │
//! ├─────────────────────────────────────────┤
//! │  Write-Ahead Log + Recovery/Checkpoint  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! A single writer-preferring reader-writer lock serializes all mutations
//! against any number of concurrent read transactions. Page mutations and
//! WAL appends therefore need no further logical concurrency control; each
//! subsystem still holds an internal mutex to protect its own structures
//! against concurrent service calls.
//!
//! ## Durability Model
//!
//! Every mutation appends a CRC-protected WAL record before touching the
//! buffer pool. `Wal::append` writes to OS buffers only; durability comes
//! from `sync` at the commit boundary (configurable via the engine's
//! sync-on-commit setting). With sync-on-commit disabled, at most one
//! committed transaction can be lost on power failure.
//!
//! On startup, recovery replays the log from the last checkpoint forward,
//! idempotently by LSN: slot occupancy guards re-inserts, the page-header
//! LSN guards re-updates and re-deletes.
//!
//! ## Resource Budgets
//!
//! Each query executes under a `QueryBudget` (memory, instructions, wall
//! time, result rows). Operators consult `should_stop` on every `next` call
//! and `check_budget` at row boundaries; the first violation is sticky and
//! surfaces as a typed `BudgetError` without crashing the process.
//!
//! ## Quick Start
//!
//! ```ignore
//! use rimdb::{Engine, EngineConfig, PlanNode, QueryBudget};
//!
//! let engine = Engine::open(EngineConfig::new("./data"))?;
//!
//! let txn = engine.begin_write()?;
//! let plan = PlanNode::table_scan(table_id, "events");
//! let mut ctx = engine.new_context(QueryBudget::default());
//! let result = engine.execute(&txn, &plan, &mut ctx)?;
//! engine.commit(txn)?;
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: slotted pages, table files, segments, buffer pool, WAL,
//!   recovery and checkpointing
//! - [`catalog`]: table and column metadata with binary persistence
//! - [`record`]: typed column values and row serialization
//! - [`memory`]: per-query arena + allocator and the global memory tracker
//! - [`exec`]: plans, operators, execution context and budgets
//! - [`txn`]: writer-preferring RW-lock and transaction lifecycle
//! - [`shutdown`]: phased graceful-shutdown coordination
//! - [`engine`]: the `Engine` value that owns all of the above

pub mod catalog;
pub mod config;
pub mod engine;
pub mod exec;
pub mod memory;
pub mod record;
pub mod shutdown;
pub mod storage;
pub mod txn;

pub use catalog::{Catalog, ColumnInfo, ColumnType, TableInfo};
pub use config::EngineConfig;
pub use engine::Engine;
pub use exec::{
    BudgetError, BudgetViolation, ExecutionContext, ExecutionStats, Expr, PlanNode, QueryBudget,
    QueryOutput,
};
pub use record::{Record, Row, Value};
pub use storage::{CheckpointManager, RecoveryManager, RecoveryStats};
pub use txn::{Transaction, TransactionManager, TransactionState};
