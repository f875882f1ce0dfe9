//! # RimDB Configuration Constants
//!
//! This module centralizes the layout and limit constants, grouping
//! interdependent values together. Constants that depend on each other are
//! co-located so a change in one is visible next to the values it affects.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (8192 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (24 bytes, fixed by the on-disk layout)
//!       │
//!       ├─> SLOT_ENTRY_SIZE (4 bytes per slot directory entry)
//!       │
//!       ├─> PAGE_CAPACITY (derived: PAGE_SIZE - PAGE_HEADER_SIZE)
//!       │     Upper bound on a single record plus its slot entry.
//!       │
//!       └─> table file offset of page P = P * PAGE_SIZE
//!
//! WAL_RECORD_HEADER_SIZE (32 bytes)
//!       │
//!       └─> WAL_MAX_RECORD_SIZE
//!             Records larger than this are treated as corruption by the
//!             reader, which is what terminates replay at a torn tail.
//!
//! SEGMENT_MAX_PAGES (1024)
//!       │
//!       └─> segment rotation point; a full segment is 8 MiB of pages
//!           plus the segment header page
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions below:
//!
//! 1. `PAGE_HEADER_SIZE + SLOT_ENTRY_SIZE <= PAGE_SIZE` (a page can hold at
//!    least one slot)
//! 2. `WAL_MAX_RECORD_SIZE > WAL_RECORD_HEADER_SIZE` (payloads can exist)
//! 3. Header struct sizes match their declared constants (asserted next to
//!    each struct definition in `storage`)

// ============================================================================
// PAGE LAYOUT
// ============================================================================

/// Size of each database page in bytes (8 KiB). The fundamental unit of
/// I/O, caching, and WAL-referenced addressing.
pub const PAGE_SIZE: usize = 8192;

/// Size of the page header at offset 0 of every page.
pub const PAGE_HEADER_SIZE: usize = 24;

/// Size of one slot directory entry (offset + length).
pub const SLOT_ENTRY_SIZE: usize = 4;

/// Maximum bytes available to slots plus records in a fresh page.
pub const PAGE_CAPACITY: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Magic number stamped into every page header ("EDBG").
pub const PAGE_MAGIC: u32 = 0x4544_4247;

const _: () = assert!(PAGE_HEADER_SIZE + SLOT_ENTRY_SIZE <= PAGE_SIZE);

// ============================================================================
// WAL LAYOUT
// ============================================================================

/// Magic number of the WAL file header ("WALE").
pub const WAL_MAGIC: u32 = 0x5741_4C45;

/// Current WAL file format version.
pub const WAL_VERSION: u32 = 1;

/// Size of the WAL file header.
pub const WAL_FILE_HEADER_SIZE: usize = 24;

/// Size of each WAL record header.
pub const WAL_RECORD_HEADER_SIZE: usize = 32;

/// Upper bound on a serialized WAL record. A header claiming more than this
/// is treated as a torn tail and terminates replay cleanly.
pub const WAL_MAX_RECORD_SIZE: usize = WAL_RECORD_HEADER_SIZE + 16 * PAGE_SIZE;

/// WAL size at which the checkpoint manager recommends a checkpoint.
pub const DEFAULT_CHECKPOINT_THRESHOLD: u64 = 64 * 1024 * 1024;

const _: () = assert!(WAL_MAX_RECORD_SIZE > WAL_RECORD_HEADER_SIZE);

// ============================================================================
// SEGMENT LAYOUT
// ============================================================================

/// Magic number of the segment file header ("SEGE").
pub const SEGMENT_MAGIC: u32 = 0x5345_4745;

/// Size of the segment file header region. The first page-sized slot of a
/// segment file is reserved for it; pages follow at slot 1 onward.
pub const SEGMENT_HEADER_SIZE: usize = 32;

/// Pages per segment before rotation to a new active segment.
pub const SEGMENT_MAX_PAGES: u32 = 1024;

const _: () = assert!(SEGMENT_HEADER_SIZE <= PAGE_SIZE);

// ============================================================================
// BUFFER POOL
// ============================================================================

/// Default buffer-pool capacity in pages (8 MiB of frames).
pub const DEFAULT_POOL_PAGES: usize = 1024;

// ============================================================================
// MEMORY BUDGETS
// ============================================================================

/// Default process-wide memory ceiling (512 MiB).
pub const DEFAULT_GLOBAL_MEMORY_LIMIT: usize = 512 * 1024 * 1024;

/// Floor for the global ceiling; auto-detection never goes below this.
pub const MIN_GLOBAL_MEMORY_LIMIT: usize = 16 * 1024 * 1024;

/// Fraction of system RAM used when auto-detecting the global ceiling.
pub const GLOBAL_MEMORY_BUDGET_PERCENT: usize = 25;

/// Default per-query memory budget (64 MiB).
pub const DEFAULT_QUERY_MEMORY_LIMIT: usize = 64 * 1024 * 1024;

/// Default arena block size for per-query allocations (64 KiB).
pub const ARENA_BLOCK_SIZE: usize = 64 * 1024;

// ============================================================================
// QUERY BUDGET DEFAULTS
// ============================================================================

/// Default instruction budget per query.
pub const DEFAULT_MAX_INSTRUCTIONS: u64 = 10_000_000;

/// Default wall-clock budget per query in milliseconds.
pub const DEFAULT_MAX_TIME_MS: u64 = 30_000;

/// Default result-row budget per query.
pub const DEFAULT_MAX_RESULT_ROWS: u64 = 100_000;

/// Instructions charged when a scan advances to a new page.
pub const SCAN_PAGE_COST: u64 = 10;

/// Instructions charged per row passing through an operator boundary.
pub const ROW_STEP_COST: u64 = 1;

/// Estimated bookkeeping bytes charged per materialized row on top of the
/// row's own value bytes (vector headers, sort scratch). Deliberately
/// over-counts rather than under-counts.
pub const ROW_OVERHEAD_BYTES: usize = 48;

/// Estimated bytes charged per hash-aggregate group entry (key bytes,
/// accumulator states, table overhead). Over-counts for narrow groups.
pub const GROUP_ENTRY_OVERHEAD_BYTES: usize = 256;

// ============================================================================
// FILE NAMES
// ============================================================================

/// WAL file name inside the data directory.
pub const WAL_FILE_NAME: &str = "rimdb.wal";

/// Catalog file name inside the data directory.
pub const CATALOG_FILE_NAME: &str = "rimdb.catalog";

/// Extension of per-table data files (`t<table_id>.rdb`).
pub const TABLE_FILE_EXTENSION: &str = "rdb";
