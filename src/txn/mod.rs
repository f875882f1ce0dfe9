//! # Transactions
//!
//! Thin wrappers over the writer-preferring [`RwLock`]: a transaction is
//! a lock ticket plus an identity. `begin_read`/`begin_write` acquire the
//! corresponding side of the lock; commit and abort both release it
//! exactly once. Dropping an active transaction aborts it, so an early
//! return or panic can never leak the lock.
//!
//! At most one writer executes at any instant; page mutations and WAL
//! appends performed under a write transaction therefore need no further
//! logical concurrency control. Readers see the state visible when their
//! read lock was granted, and that state cannot change underneath them.

mod rwlock;

pub use rwlock::RwLock;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// One transaction: identity plus a held lock ticket. The ticket is
/// released exactly once, by commit, abort, or drop.
pub struct Transaction<'a> {
    manager: &'a TransactionManager,
    id: u64,
    read_only: bool,
    state: TransactionState,
    start_time: Instant,
}

impl Transaction<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn commit(mut self) {
        self.finish(TransactionState::Committed);
    }

    pub fn abort(mut self) {
        self.finish(TransactionState::Aborted);
    }

    fn finish(&mut self, state: TransactionState) {
        if self.state != TransactionState::Active {
            return;
        }
        self.state = state;
        self.manager.release(self.read_only);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        // An active transaction going out of scope is an abort.
        self.finish(TransactionState::Aborted);
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("read_only", &self.read_only)
            .field("state", &self.state)
            .finish()
    }
}

/// Hands out transactions over the single global lock.
#[derive(Debug, Default)]
pub struct TransactionManager {
    lock: RwLock,
    next_id: AtomicU64,
    active_count: AtomicU64,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(),
            next_id: AtomicU64::new(1),
            active_count: AtomicU64::new(0),
        }
    }

    fn admit(&self, read_only: bool) -> Transaction<'_> {
        self.active_count.fetch_add(1, Ordering::AcqRel);
        Transaction {
            manager: self,
            id: self.next_id.fetch_add(1, Ordering::AcqRel),
            read_only,
            state: TransactionState::Active,
            start_time: Instant::now(),
        }
    }

    fn release(&self, read_only: bool) {
        if read_only {
            self.lock.unlock_read();
        } else {
            self.lock.unlock_write();
        }
        self.active_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Begins a read transaction, blocking while a writer holds or waits.
    pub fn begin_read(&self) -> Transaction<'_> {
        self.lock.lock_read();
        self.admit(true)
    }

    /// Begins the write transaction, blocking until exclusive.
    pub fn begin_write(&self) -> Transaction<'_> {
        self.lock.lock_write();
        self.admit(false)
    }

    /// Non-blocking write begin; does not queue behind readers.
    pub fn try_begin_write(&self) -> Option<Transaction<'_>> {
        self.lock.try_lock_write().then(|| self.admit(false))
    }

    /// Non-blocking read begin.
    pub fn try_begin_read(&self) -> Option<Transaction<'_>> {
        self.lock.try_lock_read().then(|| self.admit(true))
    }

    pub fn active_transactions(&self) -> u64 {
        self.active_count.load(Ordering::Acquire)
    }

    /// Next id to be assigned; ids are monotone and never reused.
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }
}
