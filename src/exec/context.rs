//! # Execution Context and Budgets
//!
//! Every query runs under a [`QueryBudget`]: caps on memory, executed
//! instructions, wall time, and result rows. The context enforces them at
//! two levels:
//!
//! - **Hot path** — [`ExecutionContext::should_stop`], a cheap boolean
//!   safe to consult in every `next()` iteration.
//! - **Explicit** — [`ExecutionContext::check_budget`], called at natural
//!   checkpoints (once per emitted row, once per materialized row in
//!   Sort). The first violation is recorded and every later check
//!   re-raises the same [`BudgetError`] without re-evaluating, so a
//!   failing query cannot flicker between violation kinds on its way out.
//!
//! Abort is cooperative: an [`AbortHandle`] (cloneable, cross-thread)
//! flips a flag that the next check surfaces as `Aborted`. There is no
//! in-flight interruption of OS I/O.
//!
//! Timeouts are monotonic-clock deadlines established at `start()`. The
//! executor always calls `finalize()` — success or failure — to freeze
//! `elapsed_time` and `memory_used` into the stats report.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::Result;

use crate::config::{
    DEFAULT_MAX_INSTRUCTIONS, DEFAULT_MAX_RESULT_ROWS, DEFAULT_MAX_TIME_MS,
    DEFAULT_QUERY_MEMORY_LIMIT,
};
use crate::memory::QueryAllocator;

/// Per-query resource caps.
#[derive(Debug, Clone)]
pub struct QueryBudget {
    pub max_memory_bytes: usize,
    pub max_instructions: u64,
    pub max_time: Duration,
    pub max_result_rows: u64,
}

impl Default for QueryBudget {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_QUERY_MEMORY_LIMIT,
            max_instructions: DEFAULT_MAX_INSTRUCTIONS,
            max_time: Duration::from_millis(DEFAULT_MAX_TIME_MS),
            max_result_rows: DEFAULT_MAX_RESULT_ROWS,
        }
    }
}

/// Counters accumulated over one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub instructions_executed: u64,
    pub rows_scanned: u64,
    pub rows_returned: u64,
    pub memory_used: usize,
    pub elapsed_time: Duration,
}

/// Which budget a query ran through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetViolation {
    MemoryExceeded,
    InstructionsExceeded,
    Timeout,
    RowsExceeded,
    Aborted,
}

/// Typed budget failure: the violation kind plus a message carrying the
/// exceeded figure and the limit. Downcastable from the eyre chain so
/// callers can discriminate without string matching.
#[derive(Debug, Clone)]
pub struct BudgetError {
    pub violation: BudgetViolation,
    message: String,
}

impl std::fmt::Display for BudgetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BudgetError {}

/// Cooperative cancel switch for one query.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Per-query execution state: budget, allocator, counters, deadline, and
/// the sticky violation.
pub struct ExecutionContext {
    budget: QueryBudget,
    allocator: QueryAllocator,
    stats: ExecutionStats,
    start_time: Option<Instant>,
    aborted: Arc<AtomicBool>,
    violation: Option<BudgetError>,
}

impl ExecutionContext {
    pub fn new(budget: QueryBudget, allocator: QueryAllocator) -> Self {
        Self {
            budget,
            allocator,
            stats: ExecutionStats::default(),
            start_time: None,
            aborted: Arc::new(AtomicBool::new(false)),
            violation: None,
        }
    }

    pub fn budget(&self) -> &QueryBudget {
        &self.budget
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    pub fn allocator(&self) -> &QueryAllocator {
        &self.allocator
    }

    pub fn violation(&self) -> Option<BudgetViolation> {
        self.violation.as_ref().map(|e| e.violation)
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            flag: Arc::clone(&self.aborted),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Starts the wall-clock deadline.
    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
    }

    fn elapsed(&self) -> Duration {
        self.start_time.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Hot-path check, safe for every `next()` iteration: true iff the
    /// query is aborted, already in violation, past its deadline, or out
    /// of instructions.
    pub fn should_stop(&self) -> bool {
        if self.is_aborted() || self.violation.is_some() {
            return true;
        }
        if self.start_time.is_some() && self.elapsed() > self.budget.max_time {
            return true;
        }
        self.stats.instructions_executed >= self.budget.max_instructions
    }

    pub fn record_instructions(&mut self, count: u64) {
        self.stats.instructions_executed += count;
    }

    pub fn record_row_scanned(&mut self) {
        self.stats.rows_scanned += 1;
    }

    pub fn record_row_returned(&mut self) {
        self.stats.rows_returned += 1;
    }

    fn fail(&mut self, violation: BudgetViolation, message: String) -> eyre::Report {
        let error = BudgetError { violation, message };
        self.violation = Some(error.clone());
        error.into()
    }

    /// Charges materialized bytes against the query's memory budget,
    /// converting an allocator refusal into the sticky MemoryExceeded
    /// violation.
    pub fn charge_memory(&mut self, bytes: usize) -> Result<()> {
        if self.allocator.charge(bytes).is_err() {
            let used = self.allocator.bytes_used();
            let limit = self.budget.max_memory_bytes;
            return Err(self.fail(
                BudgetViolation::MemoryExceeded,
                format!(
                    "memory budget exceeded: {} bytes used, limit is {}",
                    used, limit
                ),
            ));
        }
        Ok(())
    }

    pub fn release_memory(&mut self, bytes: usize) {
        self.allocator.release(bytes);
    }

    /// Full budget evaluation; the violation, once set, is re-raised
    /// verbatim by every later call.
    pub fn check_budget(&mut self) -> Result<()> {
        if let Some(error) = &self.violation {
            return Err(error.clone().into());
        }

        if self.is_aborted() {
            return Err(self.fail(BudgetViolation::Aborted, "query was aborted".to_string()));
        }

        if self.start_time.is_some() {
            let elapsed = self.elapsed();
            if elapsed > self.budget.max_time {
                return Err(self.fail(
                    BudgetViolation::Timeout,
                    format!(
                        "query timeout after {}ms, limit is {}ms",
                        elapsed.as_millis(),
                        self.budget.max_time.as_millis()
                    ),
                ));
            }
        }

        if self.stats.instructions_executed >= self.budget.max_instructions {
            return Err(self.fail(
                BudgetViolation::InstructionsExceeded,
                format!(
                    "instruction limit exceeded: {} executed, limit is {}",
                    self.stats.instructions_executed, self.budget.max_instructions
                ),
            ));
        }

        if self.stats.rows_returned > self.budget.max_result_rows {
            return Err(self.fail(
                BudgetViolation::RowsExceeded,
                format!(
                    "row limit exceeded: {} rows, limit is {}",
                    self.stats.rows_returned, self.budget.max_result_rows
                ),
            ));
        }

        if self.allocator.bytes_used() > self.budget.max_memory_bytes {
            let used = self.allocator.bytes_used();
            return Err(self.fail(
                BudgetViolation::MemoryExceeded,
                format!(
                    "memory budget exceeded: {} bytes used, limit is {}",
                    used, self.budget.max_memory_bytes
                ),
            ));
        }

        Ok(())
    }

    /// Requests cooperative abort; the next check surfaces it.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Freezes elapsed time and memory usage into the stats. Called by
    /// the executor on every exit path.
    pub fn finalize(&mut self) {
        self.stats.elapsed_time = self.elapsed();
        self.stats.memory_used = self.allocator.bytes_used();
    }
}
