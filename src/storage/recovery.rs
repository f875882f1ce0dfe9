//! # Crash Recovery and Checkpointing
//!
//! Recovery replays the WAL from the last checkpoint forward, in LSN
//! order, reconstructing every page mutation that never reached its table
//! file. Replay is idempotent, so recovering twice (or crashing during
//! recovery and starting over) converges on the same state:
//!
//! - **INSERT** is guarded by slot occupancy — a freshly reconstructed
//!   page has LSN 0, so the page-LSN test alone cannot be used, but an
//!   occupied slot proves the insert already landed. The page-LSN test is
//!   applied as well so an insert whose slot was later tombstoned is not
//!   re-inserted at a new slot.
//! - **UPDATE / DELETE** are guarded by the page-header LSN: a page whose
//!   LSN is at or past the record's has already absorbed it.
//! - **COMMIT / ROLLBACK** are record-keeping only in the single-writer
//!   design (no undo log is kept).
//! - **CREATE_TABLE / DROP_TABLE** are audit markers; the catalog file is
//!   authoritative and persists independently.
//!
//! ## Checkpoint Ordering
//!
//! A checkpoint runs strictly: flush all dirty pages → sync table files →
//! sync the WAL → append CHECKPOINT → sync the WAL again → persist the
//! checkpoint LSN in the WAL header. A crash between the flush and the
//! CHECKPOINT record is safe: recovery redoes from the previous
//! checkpoint, and every redo is idempotent.

use eyre::Result;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_CHECKPOINT_THRESHOLD;

use super::pool::BufferPool;
use super::wal::{Wal, WalRecord, WalRecordType};

/// Counters describing one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub records_processed: u64,
    pub records_applied: u64,
    pub records_skipped: u64,
    pub errors: u64,
    pub start_lsn: u64,
    pub end_lsn: u64,
}

/// Replays WAL records into the buffer pool on startup.
pub struct RecoveryManager<'a> {
    wal: &'a Wal,
    pool: &'a BufferPool,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(wal: &'a Wal, pool: &'a BufferPool) -> Self {
        Self { wal, pool }
    }

    /// LSN of the latest CHECKPOINT record in the log, or 0 if none.
    pub fn find_last_checkpoint(&self) -> Result<u64> {
        let records = self.wal.read_all()?;
        Ok(records
            .iter()
            .filter(|r| r.record_type == WalRecordType::Checkpoint)
            .map(|r| r.lsn)
            .max()
            .unwrap_or(0))
    }

    /// True when the log holds mutations past the last checkpoint.
    pub fn needs_recovery(&self) -> Result<bool> {
        let checkpoint_lsn = self.find_last_checkpoint()?;
        let records = self.wal.read_from(checkpoint_lsn.max(1))?;
        Ok(records
            .iter()
            .any(|r| r.record_type != WalRecordType::Checkpoint))
    }

    /// Replays the log from the last checkpoint. Individual record
    /// failures are counted and logged, not fatal — a partially damaged
    /// tail should never prevent the engine from starting.
    pub fn recover(&self) -> Result<RecoveryStats> {
        let checkpoint_lsn = self.find_last_checkpoint()?;
        let start_lsn = checkpoint_lsn.max(1);
        let mut stats = RecoveryStats {
            start_lsn,
            ..Default::default()
        };

        let records = self.wal.read_from(start_lsn)?;
        debug!(start_lsn, count = records.len(), "replaying WAL records");

        for record in &records {
            stats.records_processed += 1;
            stats.end_lsn = record.lsn;

            let outcome = match record.record_type {
                WalRecordType::Insert => self.apply_insert(record),
                WalRecordType::Update => self.apply_update(record),
                WalRecordType::Delete => self.apply_delete(record),
                WalRecordType::Checkpoint => Ok(Applied::Skipped),
                WalRecordType::Commit
                | WalRecordType::Rollback
                | WalRecordType::CreateTable
                | WalRecordType::DropTable => Ok(Applied::Yes),
                WalRecordType::Invalid => {
                    warn!(lsn = record.lsn, "unknown WAL record type during replay");
                    stats.errors += 1;
                    continue;
                }
            };

            match outcome {
                Ok(Applied::Yes) => stats.records_applied += 1,
                Ok(Applied::Skipped) => stats.records_skipped += 1,
                Err(e) => {
                    warn!(lsn = record.lsn, error = %e, "failed to replay WAL record");
                    stats.errors += 1;
                }
            }
        }

        info!(
            processed = stats.records_processed,
            applied = stats.records_applied,
            skipped = stats.records_skipped,
            errors = stats.errors,
            "recovery complete"
        );

        Ok(stats)
    }

    fn apply_insert(&self, record: &WalRecord) -> Result<Applied> {
        let mut guard = self
            .pool
            .get_or_create_page(record.table_id, record.page_id)?;

        // Occupancy is the primary guard (a reconstructed page has LSN 0);
        // the page-LSN test additionally protects slots whose record was
        // inserted and later deleted, which occupancy alone would re-insert.
        if guard.page().lsn() >= record.lsn || guard.page().slot_occupied(record.slot_id) {
            return Ok(Applied::Skipped);
        }

        let page = guard.page_mut();
        let slot = page.insert_record(&record.payload)?;
        if slot != record.slot_id {
            // Replay in LSN order should reproduce slot order; divergence
            // means the page was modified outside the log.
            warn!(
                lsn = record.lsn,
                expected = record.slot_id,
                actual = slot,
                "replayed insert landed in unexpected slot"
            );
        }
        page.set_lsn(record.lsn);
        Ok(Applied::Yes)
    }

    fn apply_update(&self, record: &WalRecord) -> Result<Applied> {
        let mut guard = self
            .pool
            .get_or_create_page(record.table_id, record.page_id)?;

        if guard.page().lsn() >= record.lsn {
            return Ok(Applied::Skipped);
        }

        let page = guard.page_mut();
        page.update_record(record.slot_id, &record.payload)?;
        page.set_lsn(record.lsn);
        Ok(Applied::Yes)
    }

    fn apply_delete(&self, record: &WalRecord) -> Result<Applied> {
        let mut guard = self
            .pool
            .get_or_create_page(record.table_id, record.page_id)?;

        if guard.page().lsn() >= record.lsn {
            return Ok(Applied::Skipped);
        }

        let page = guard.page_mut();
        page.delete_record(record.slot_id)?;
        page.set_lsn(record.lsn);
        Ok(Applied::Yes)
    }
}

enum Applied {
    Yes,
    Skipped,
}

/// Runs checkpoints: flush everything, then fence the log.
pub struct CheckpointManager<'a> {
    wal: &'a Wal,
    pool: &'a BufferPool,
}

impl<'a> CheckpointManager<'a> {
    pub fn new(wal: &'a Wal, pool: &'a BufferPool) -> Self {
        Self { wal, pool }
    }

    /// Performs a full checkpoint and returns the CHECKPOINT record's LSN.
    pub fn checkpoint(&self) -> Result<u64> {
        let flushed = self.pool.flush_all()?;
        self.pool.sync()?;
        self.wal.sync()?;

        let lsn = self.wal.checkpoint()?;
        self.wal.set_last_checkpoint(lsn)?;
        self.wal.sync()?;

        info!(lsn, pages_flushed = flushed, "checkpoint complete");
        Ok(lsn)
    }

    /// Recommends a checkpoint once the WAL exceeds `threshold` bytes.
    pub fn should_checkpoint(&self, threshold: u64) -> bool {
        self.wal
            .file_size()
            .map(|size| size >= threshold)
            .unwrap_or(false)
    }

    pub fn should_checkpoint_default(&self) -> bool {
        self.should_checkpoint(DEFAULT_CHECKPOINT_THRESHOLD)
    }

    pub fn last_checkpoint_lsn(&self) -> u64 {
        self.wal.last_checkpoint_lsn()
    }
}
