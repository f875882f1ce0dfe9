//! # Global Memory Tracker
//!
//! Process-wide ceiling over all per-query reservations. Counters are
//! lock-free atomics updated with compare-exchange so reservation is a
//! single contended CAS on the hot path.
//!
//! Per-query allocators reserve against this tracker *in addition to*
//! their own byte caps: both must admit an allocation for it to proceed,
//! and both release on query teardown.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use sysinfo::System;

use crate::config::{
    DEFAULT_GLOBAL_MEMORY_LIMIT, GLOBAL_MEMORY_BUDGET_PERCENT, MIN_GLOBAL_MEMORY_LIMIT,
};

static SYSTEM_TOTAL_MEMORY: OnceLock<usize> = OnceLock::new();

#[derive(Debug)]
pub struct MemoryTracker {
    limit: AtomicUsize,
    used: AtomicUsize,
    peak: AtomicUsize,
    allocation_count: AtomicU64,
    failed_count: AtomicU64,
}

impl MemoryTracker {
    /// Ceiling at a fraction of system RAM, floored so constrained
    /// environments still get a workable budget.
    pub fn auto_detect() -> Self {
        let total_memory = *SYSTEM_TOTAL_MEMORY.get_or_init(|| {
            let mut sys = System::new();
            sys.refresh_memory();
            sys.total_memory() as usize
        });

        let limit = if total_memory == 0 {
            DEFAULT_GLOBAL_MEMORY_LIMIT
        } else {
            (total_memory * GLOBAL_MEMORY_BUDGET_PERCENT) / 100
        };
        Self::with_limit(limit)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(limit.max(MIN_GLOBAL_MEMORY_LIMIT)),
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            allocation_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
        }
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit
            .store(limit.max(MIN_GLOBAL_MEMORY_LIMIT), Ordering::Release);
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.limit().saturating_sub(self.used())
    }

    pub fn would_exceed(&self, size: usize) -> bool {
        self.used().saturating_add(size) > self.limit()
    }

    /// Attempts to reserve `size` bytes against the ceiling.
    pub fn try_reserve(&self, size: usize) -> bool {
        if size == 0 {
            return true;
        }

        let limit = self.limit();
        loop {
            let current = self.used.load(Ordering::Acquire);
            let Some(next) = current.checked_add(size) else {
                self.failed_count.fetch_add(1, Ordering::AcqRel);
                return false;
            };
            if next > limit {
                self.failed_count.fetch_add(1, Ordering::AcqRel);
                return false;
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::AcqRel);
                    self.allocation_count.fetch_add(1, Ordering::AcqRel);
                    return true;
                }
                Err(_) => continue,
            }
        }
    }

    /// Returns reserved bytes. Saturates at zero so double releases can
    /// never underflow the counter.
    pub fn release(&self, size: usize) {
        if size == 0 {
            return;
        }
        loop {
            let current = self.used.load(Ordering::Acquire);
            let next = current.saturating_sub(size);
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(_) => continue,
            }
        }
    }

    pub fn allocation_count(&self) -> u64 {
        self.allocation_count.load(Ordering::Acquire)
    }

    pub fn failed_allocation_count(&self) -> u64 {
        self.failed_count.load(Ordering::Acquire)
    }

    pub fn reset_stats(&self) {
        self.peak.store(self.used(), Ordering::Release);
        self.allocation_count.store(0, Ordering::Release);
        self.failed_count.store(0, Ordering::Release);
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::auto_detect()
    }
}

/// RAII reservation against a tracker; releases on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    tracker: Arc<MemoryTracker>,
    size: usize,
}

impl MemoryReservation {
    /// Reserves or fails with the figures a caller needs to report.
    pub fn new(tracker: Arc<MemoryTracker>, size: usize) -> eyre::Result<Self> {
        if !tracker.try_reserve(size) {
            eyre::bail!(
                "global memory limit exceeded: {} bytes requested, {} of {} in use",
                size,
                tracker.used(),
                tracker.limit()
            );
        }
        Ok(Self { tracker, size })
    }

    pub fn try_new(tracker: Arc<MemoryTracker>, size: usize) -> Option<Self> {
        tracker
            .try_reserve(size)
            .then_some(Self { tracker, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Releases early; drop becomes a no-op.
    pub fn release(mut self) {
        self.tracker.release(self.size);
        self.size = 0;
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.tracker.release(self.size);
    }
}
