//! # Storage Layer
//!
//! Everything between raw files and the executor: slotted page frames,
//! the per-table page files the buffer pool binds to, the append-oriented
//! segment container, the LRU buffer pool itself, the write-ahead log,
//! and crash recovery.
//!
//! ## Layering
//!
//! ```text
//! RecoveryManager / CheckpointManager
//!         │ replays into / flushes
//!         ▼
//! BufferPool ──────────────► Wal
//!         │ loads/evicts        append + sync
//!         ▼
//! TableFileSet (page P at offset P·8192)     SegmentManager (rotating)
//!         │                                          │
//!         ▼                                          ▼
//! Page (slotted frame, 24-byte header, LSN stamped)
//! ```
//!
//! The per-table file layout is authoritative: recovery addresses pages as
//! (table_id, page_id) and the pool computes byte offsets from page ids.
//! Segments exist as the rotation-friendly archival container and share
//! the same page frames and validation rules.
//!
//! ## Write Path
//!
//! A mutation under the writer lock appends its WAL record, then mutates
//! the cached page and stamps the record's LSN into the page header. The
//! page reaches its file on eviction, flush, or checkpoint; the WAL
//! reaches storage on `sync` at the commit boundary.

mod page;
mod pool;
mod recovery;
mod segment;
mod table_file;
mod wal;

pub use page::{
    Page, PageHeader, SlotEntry, FLAG_DIRTY, FLAG_INTERNAL, FLAG_LEAF, FLAG_NONE, FLAG_OVERFLOW,
    SLOT_TOMBSTONE,
};
pub use pool::{BufferPool, PageGuard, PageKey};
pub use recovery::{CheckpointManager, RecoveryManager, RecoveryStats};
pub use segment::{Segment, SegmentHeader, SegmentManager};
pub use table_file::{TableFile, TableFileSet};
pub use wal::{payload_crc, Wal, WalEntry, WalFileHeader, WalRecord, WalRecordHeader, WalRecordType};
