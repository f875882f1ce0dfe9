//! # Query Allocator
//!
//! Wraps one query's arena with budget enforcement. Every byte is counted
//! twice before it exists: against the query's own cap and against the
//! process-wide tracker. Either refusal fails the allocation with a typed
//! [`MemoryBudgetExceeded`] carrying the figures the error message needs.
//!
//! Operators that materialize into ordinary containers (Sort buffers,
//! aggregate tables) account through `charge`/`release` without routing
//! their storage through the arena; the arena serves byte-level scratch.

use std::cell::Cell;
use std::sync::Arc;

use eyre::Result;

use super::arena::QueryArena;
use super::tracker::MemoryTracker;

/// Typed budget failure, downcastable from the eyre chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudgetExceeded {
    pub requested: usize,
    pub used: usize,
    pub limit: usize,
}

impl std::fmt::Display for MemoryBudgetExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "memory budget exceeded: {} bytes requested with {} of {} in use",
            self.requested, self.used, self.limit
        )
    }
}

impl std::error::Error for MemoryBudgetExceeded {}

/// Per-query allocator: an arena plus a byte cap plus a share of the
/// global ceiling.
pub struct QueryAllocator {
    arena: QueryArena,
    limit: usize,
    bytes_used: Cell<usize>,
    tracker: Option<Arc<MemoryTracker>>,
    reserved_global: Cell<usize>,
}

impl QueryAllocator {
    pub fn new(limit: usize) -> Self {
        Self {
            arena: QueryArena::new(),
            limit,
            bytes_used: Cell::new(0),
            tracker: None,
            reserved_global: Cell::new(0),
        }
    }

    /// Couples the allocator to the process-wide tracker; both ceilings
    /// must admit every charge.
    pub fn with_tracker(limit: usize, tracker: Arc<MemoryTracker>) -> Self {
        Self {
            arena: QueryArena::new(),
            limit,
            bytes_used: Cell::new(0),
            tracker: Some(tracker),
            reserved_global: Cell::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used.get()
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.bytes_used.get())
    }

    pub fn would_exceed(&self, size: usize) -> bool {
        self.bytes_used.get().saturating_add(size) > self.limit
    }

    /// Accounts `bytes` against both ceilings without arena involvement.
    pub fn charge(&self, bytes: usize) -> Result<()> {
        let used = self.bytes_used.get();
        if used.saturating_add(bytes) > self.limit {
            return Err(MemoryBudgetExceeded {
                requested: bytes,
                used,
                limit: self.limit,
            }
            .into());
        }

        if let Some(tracker) = &self.tracker {
            if !tracker.try_reserve(bytes) {
                return Err(MemoryBudgetExceeded {
                    requested: bytes,
                    used: tracker.used(),
                    limit: tracker.limit(),
                }
                .into());
            }
            self.reserved_global.set(self.reserved_global.get() + bytes);
        }

        self.bytes_used.set(used + bytes);
        Ok(())
    }

    /// Returns previously charged bytes.
    pub fn release(&self, bytes: usize) {
        let released = bytes.min(self.bytes_used.get());
        self.bytes_used.set(self.bytes_used.get() - released);

        if let Some(tracker) = &self.tracker {
            let global = released.min(self.reserved_global.get());
            self.reserved_global.set(self.reserved_global.get() - global);
            tracker.release(global);
        }
    }

    /// Arena allocation with budget enforcement.
    pub fn alloc_bytes(&self, len: usize) -> Result<&mut [u8]> {
        self.charge(len)?;
        self.arena.alloc_bytes(len)
    }

    pub fn alloc_aligned(&self, len: usize, align: usize) -> Result<&mut [u8]> {
        self.charge(len)?;
        self.arena.alloc_aligned(len, align)
    }

    pub fn alloc_copy(&self, src: &[u8]) -> Result<&[u8]> {
        self.charge(src.len())?;
        Ok(self.arena.alloc_copy(src))
    }

    pub fn alloc_str(&self, src: &str) -> Result<&str> {
        self.charge(src.len())?;
        Ok(self.arena.alloc_str(src))
    }

    /// Rewinds the arena and zeroes all accounting, releasing the global
    /// reservation.
    pub fn reset(&mut self) {
        self.arena.reset();
        self.bytes_used.set(0);
        if let Some(tracker) = &self.tracker {
            tracker.release(self.reserved_global.get());
        }
        self.reserved_global.set(0);
    }
}

impl Drop for QueryAllocator {
    fn drop(&mut self) {
        if let Some(tracker) = &self.tracker {
            tracker.release(self.reserved_global.get());
        }
    }
}
