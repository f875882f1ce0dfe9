//! # Engine
//!
//! The `Engine` value owns every subsystem — memory tracker, catalog,
//! buffer pool, WAL, transaction manager, shutdown coordinator — and is
//! passed by reference to whatever needs it. One process can host
//! several independent engines; nothing here is a global.
//!
//! ## Startup
//!
//! `Engine::open` creates the data directory if absent, loads the
//! persisted catalog, opens the WAL (validating its header and
//! re-establishing the LSN counter), and replays the log from the last
//! checkpoint. The recovery stats stay available on the engine for
//! introspection.
//!
//! ## Statement Flow
//!
//! ```text
//! begin_read / begin_write        (RW-lock acquisition)
//!         │
//! new_context(budget)             (arena + allocator + counters)
//!         │
//! execute(&txn, &plan, &mut ctx)  (operator tree under budgets)
//!         │
//! commit(txn) / abort(txn)        (COMMIT/ROLLBACK record, WAL sync)
//! ```
//!
//! `commit` appends a COMMIT record and — with sync-on-commit enabled,
//! the default — syncs the WAL, making the transaction durable. With it
//! disabled, at most one committed transaction can be lost to a crash.
//!
//! ## Shutdown
//!
//! `shutdown(timeout)` drives the phased sequence; the engine wires
//! FLUSH_WAL to a WAL sync and CLOSE_FILES to a full page flush + file
//! sync. Statements started after shutdown is requested are refused via
//! the active-operation guard. Dropping the engine without a shutdown
//! syncs the WAL but deliberately leaves pages unflushed — recovery owns
//! that path, and commit already made the log durable.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use eyre::{ensure, Result, WrapErr};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::config::{EngineConfig, CATALOG_FILE_NAME, DEFAULT_CHECKPOINT_THRESHOLD, WAL_FILE_NAME};
use crate::exec::{ExecutionContext, Executor, PlanNode, QueryBudget, QueryOutput};
use crate::memory::{MemoryTracker, QueryAllocator};
use crate::shutdown::{ShutdownCoordinator, ShutdownPhase};
use crate::storage::{
    BufferPool, CheckpointManager, RecoveryManager, RecoveryStats, Wal, WalEntry, WalRecordType,
};
use crate::txn::{Transaction, TransactionManager};


/// The embedded engine: storage, execution, and lifecycle in one value.
pub struct Engine {
    config: EngineConfig,
    tracker: Arc<MemoryTracker>,
    catalog: Arc<Catalog>,
    pool: Arc<BufferPool>,
    wal: Arc<Wal>,
    txn_manager: TransactionManager,
    shutdown: Arc<ShutdownCoordinator>,
    recovery: RecoveryStats,
}

impl Engine {
    /// Opens (or creates) the database in `config.data_dir`, running
    /// crash recovery before returning.
    pub fn open(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .wrap_err_with(|| format!("failed to create data directory {:?}", config.data_dir))?;

        let tracker = Arc::new(match config.global_memory_limit {
            Some(limit) => MemoryTracker::with_limit(limit),
            None => MemoryTracker::auto_detect(),
        });

        let catalog = Arc::new(Catalog::new());
        let catalog_path = config.data_dir.join(CATALOG_FILE_NAME);
        if catalog_path.exists() {
            catalog.load(&catalog_path)?;
            info!(tables = catalog.table_count(), "catalog loaded");
        }

        let pool = Arc::new(BufferPool::new(&config.data_dir, config.max_pool_pages)?);
        let wal = Arc::new(Wal::open(&config.data_dir.join(WAL_FILE_NAME))?);

        let recovery = RecoveryManager::new(&wal, &pool).recover()?;
        if recovery.errors > 0 {
            warn!(errors = recovery.errors, "recovery completed with errors");
        }

        let shutdown = Arc::new(ShutdownCoordinator::new());
        {
            let wal = Arc::clone(&wal);
            shutdown.register_callback(ShutdownPhase::FlushWal, move || wal.sync());
        }
        {
            let pool = Arc::clone(&pool);
            shutdown.register_callback(ShutdownPhase::CloseFiles, move || {
                pool.flush_all()?;
                pool.sync()?;
                pool.files().close_all();
                Ok(())
            });
        }

        Ok(Self {
            config,
            tracker,
            catalog,
            pool,
            wal,
            txn_manager: TransactionManager::new(),
            shutdown,
            recovery,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    pub fn memory_tracker(&self) -> &Arc<MemoryTracker> {
        &self.tracker
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.txn_manager
    }

    /// Stats from the recovery pass that ran at open.
    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery
    }

    /// The per-query budget derived from engine configuration.
    pub fn default_budget(&self) -> QueryBudget {
        QueryBudget {
            max_memory_bytes: self.config.query_memory_limit,
            max_instructions: self.config.max_instructions,
            max_time: self.config.max_time,
            max_result_rows: self.config.max_result_rows,
        }
    }

    /// Builds an execution context whose allocator reserves against the
    /// engine's global memory tracker.
    pub fn new_context(&self, budget: QueryBudget) -> ExecutionContext {
        let allocator =
            QueryAllocator::with_tracker(budget.max_memory_bytes, Arc::clone(&self.tracker));
        ExecutionContext::new(budget, allocator)
    }

    fn ensure_accepting(&self) -> Result<()> {
        ensure!(
            !self.shutdown.is_requested(),
            "engine is shutting down; no new transactions"
        );
        Ok(())
    }

    /// Begins a read transaction (blocks while a writer holds or waits).
    pub fn begin_read(&self) -> Result<Transaction<'_>> {
        self.ensure_accepting()?;
        Ok(self.txn_manager.begin_read())
    }

    /// Begins the write transaction (blocks until exclusive).
    pub fn begin_write(&self) -> Result<Transaction<'_>> {
        self.ensure_accepting()?;
        Ok(self.txn_manager.begin_write())
    }

    pub fn try_begin_write(&self) -> Option<Transaction<'_>> {
        if self.shutdown.is_requested() {
            return None;
        }
        self.txn_manager.try_begin_write()
    }

    /// Executes a plan under `txn`. Refused once shutdown has started.
    pub fn execute(
        &self,
        txn: &Transaction<'_>,
        plan: &PlanNode,
        ctx: &mut ExecutionContext,
    ) -> Result<QueryOutput> {
        let guard = self.shutdown.begin_operation();
        ensure!(guard.valid(), "engine is shutting down; statement refused");

        Executor::new(&self.pool, &self.wal, &self.catalog, &self.config.data_dir)
            .execute(txn, plan, ctx)
    }

    /// Commits: appends COMMIT, syncs the WAL when configured, releases
    /// the lock.
    pub fn commit(&self, txn: Transaction<'_>) -> Result<()> {
        if !txn.is_read_only() {
            self.wal
                .append(WalEntry::new(WalRecordType::Commit, 0, 0, 0))?;
            if self.config.sync_on_commit {
                self.wal.sync()?;
            }
        }
        txn.commit();
        Ok(())
    }

    /// Aborts: appends ROLLBACK for writers, releases the lock. No page
    /// undo is performed in the single-writer design.
    pub fn abort(&self, txn: Transaction<'_>) -> Result<()> {
        if !txn.is_read_only() {
            self.wal
                .append(WalEntry::new(WalRecordType::Rollback, 0, 0, 0))?;
        }
        txn.abort();
        Ok(())
    }

    /// Runs a full checkpoint under the writer lock (so no reader is
    /// mid-borrow on a page being flushed) and returns its LSN.
    pub fn checkpoint(&self) -> Result<u64> {
        let txn = self.txn_manager.begin_write();
        let lsn = CheckpointManager::new(&self.wal, &self.pool).checkpoint()?;
        txn.commit();
        Ok(lsn)
    }

    /// Checkpoints only when the WAL has outgrown the default threshold.
    pub fn checkpoint_if_needed(&self) -> Result<Option<u64>> {
        let manager = CheckpointManager::new(&self.wal, &self.pool);
        if manager.should_checkpoint(DEFAULT_CHECKPOINT_THRESHOLD) {
            return self.checkpoint().map(Some);
        }
        Ok(None)
    }

    /// Drives the phased shutdown. Returns whether the drain completed
    /// inside the deadline; later phases run regardless.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.initiate(timeout)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Pages stay unflushed on purpose: commit already made the WAL
        // durable and recovery rebuilds pages from it. Only make sure
        // buffered log bytes reach the file.
        if let Err(e) = self.wal.sync() {
            warn!(error = %e, "failed to sync WAL while dropping engine");
        }
    }
}
