//! # Per-Query Arena
//!
//! A linear bump allocator backing one query's scratch allocations:
//! serialized records on the insert path, copied strings during decode,
//! sort scratch. Backed by `bumpalo::Bump` with a fixed first-chunk size;
//! oversize requests get their own dedicated chunk, exactly the behavior
//! a query-lifetime arena wants.
//!
//! There is no per-object free. `reset` rewinds the whole arena — every
//! previously handed-out reference is invalidated, which the borrow
//! checker enforces by requiring `&mut self`.
//!
//! Byte accounting is tracked by the arena itself (bytes handed out, not
//! chunk capacity) so the query allocator can charge exact figures
//! against its budget.

use std::alloc::Layout;
use std::cell::Cell;

use bumpalo::Bump;
use eyre::{ensure, Result};

use crate::config::ARENA_BLOCK_SIZE;

pub struct QueryArena {
    bump: Bump,
    bytes_allocated: Cell<usize>,
}

impl QueryArena {
    pub fn new() -> Self {
        Self::with_block_size(ARENA_BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            bump: Bump::with_capacity(block_size),
            bytes_allocated: Cell::new(0),
        }
    }

    /// Bytes handed out since creation or the last `reset`.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.get()
    }

    /// Backing capacity currently owned by the arena's chunks.
    pub fn capacity(&self) -> usize {
        self.bump.allocated_bytes()
    }

    fn bump_bytes(&self, len: usize) {
        self.bytes_allocated.set(self.bytes_allocated.get() + len);
    }

    /// Allocates `len` zeroed bytes with the given alignment.
    pub fn alloc_aligned(&self, len: usize, align: usize) -> Result<&mut [u8]> {
        ensure!(align.is_power_of_two(), "alignment {} is not a power of two", align);
        let layout = Layout::from_size_align(len.max(1), align)
            .map_err(|e| eyre::eyre!("invalid arena layout ({} bytes, align {}): {}", len, align, e))?;

        let ptr = self.bump.alloc_layout(layout);
        self.bump_bytes(len);
        // SAFETY: alloc_layout returns a valid allocation of `layout.size()`
        // bytes, exclusively ours until reset; we only expose `len` of them.
        let slice = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) };
        slice.fill(0);
        Ok(slice)
    }

    /// Allocates `len` zeroed bytes at the default 8-byte alignment.
    pub fn alloc_bytes(&self, len: usize) -> Result<&mut [u8]> {
        self.alloc_aligned(len, 8)
    }

    /// Copies a byte slice into the arena.
    pub fn alloc_copy(&self, src: &[u8]) -> &[u8] {
        self.bump_bytes(src.len());
        self.bump.alloc_slice_copy(src)
    }

    /// Copies a string into the arena.
    pub fn alloc_str(&self, src: &str) -> &str {
        self.bump_bytes(src.len());
        self.bump.alloc_str(src)
    }

    /// Rewinds the arena. All previously returned references are gone;
    /// `&mut self` makes that a compile-time fact. The largest chunk is
    /// retained for reuse.
    pub fn reset(&mut self) {
        self.bump.reset();
        self.bytes_allocated.set(0);
    }
}

impl Default for QueryArena {
    fn default() -> Self {
        Self::new()
    }
}
