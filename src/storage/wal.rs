//! # Write-Ahead Log
//!
//! Append-only durable log of logical mutations. Every record carries the
//! (table, page, slot) address it mutates plus a payload (the serialized
//! record for INSERT/UPDATE, empty for the rest), protected by a CRC32
//! over the payload.
//!
//! ## File Layout
//!
//! ```text
//! +--------------------------+
//! | WalFileHeader (24 bytes) |  magic, version, first_lsn,
//! +--------------------------+  last_checkpoint_lsn
//! | WalRecordHeader (32 B)   |
//! | payload ...              |
//! +--------------------------+
//! | WalRecordHeader (32 B)   |
//! | payload ...              |
//! +--------------------------+
//! | (possibly torn tail)     |  <- readers stop here cleanly
//! +--------------------------+
//! ```
//!
//! ## Record Header (32 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ---------------------------------------
//! 0       8     lsn        monotonic from 1, never reused
//! 8       4     length     total bytes including header
//! 12      4     crc32      CRC32 of the payload only
//! 16      1     type       INSERT..ROLLBACK
//! 17      3     reserved
//! 20      4     table_id
//! 24      4     page_id
//! 28      2     slot_id
//! 30      2     padding
//! ```
//!
//! CRC32 uses the reflected 0xEDB88320 polynomial with 0xFFFFFFFF initial
//! value and final XOR — the `CRC_32_ISO_HDLC` parameter set.
//!
//! ## Durability
//!
//! `append` stamps the LSN and writes to OS buffers under the WAL mutex;
//! it does NOT fsync. Callers needing durability call `sync` — the commit
//! boundary is the expected sync point. A crash can therefore tear the
//! final record; on open the torn tail is detected during the LSN scan
//! and truncated away, and `read_from` always stops at the first
//! malformed record, so a torn tail is never an error.

use crc::{Crc, CRC_32_ISO_HDLC};
use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{
    WAL_FILE_HEADER_SIZE, WAL_MAGIC, WAL_MAX_RECORD_SIZE, WAL_RECORD_HEADER_SIZE, WAL_VERSION,
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Computes the payload checksum exactly as stored in record headers.
pub fn payload_crc(payload: &[u8]) -> u32 {
    CRC32.checksum(payload)
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalRecordType {
    Invalid = 0,
    Insert = 1,
    Update = 2,
    Delete = 3,
    CreateTable = 4,
    DropTable = 5,
    Checkpoint = 6,
    Commit = 7,
    Rollback = 8,
}

impl WalRecordType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => WalRecordType::Insert,
            2 => WalRecordType::Update,
            3 => WalRecordType::Delete,
            4 => WalRecordType::CreateTable,
            5 => WalRecordType::DropTable,
            6 => WalRecordType::Checkpoint,
            7 => WalRecordType::Commit,
            8 => WalRecordType::Rollback,
            _ => WalRecordType::Invalid,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct WalFileHeader {
    magic: U32,
    version: U32,
    first_lsn: U64,
    last_checkpoint_lsn: U64,
}

const _: () = assert!(size_of::<WalFileHeader>() == WAL_FILE_HEADER_SIZE);

impl WalFileHeader {
    fn new() -> Self {
        Self {
            magic: U32::new(WAL_MAGIC),
            version: U32::new(WAL_VERSION),
            first_lsn: U64::new(1),
            last_checkpoint_lsn: U64::new(0),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic.get() == WAL_MAGIC && self.version.get() == WAL_VERSION
    }

    pub fn last_checkpoint_lsn(&self) -> u64 {
        self.last_checkpoint_lsn.get()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct WalRecordHeader {
    lsn: U64,
    length: U32,
    crc32: U32,
    record_type: u8,
    reserved: [u8; 3],
    table_id: U32,
    page_id: U32,
    slot_id: U16,
    padding: U16,
}

const _: () = assert!(size_of::<WalRecordHeader>() == WAL_RECORD_HEADER_SIZE);

impl WalRecordHeader {
    fn payload_len(&self) -> Option<usize> {
        let length = self.length.get() as usize;
        if length < WAL_RECORD_HEADER_SIZE || length > WAL_MAX_RECORD_SIZE {
            return None;
        }
        Some(length - WAL_RECORD_HEADER_SIZE)
    }
}

/// One decoded WAL record.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub lsn: u64,
    pub record_type: WalRecordType,
    pub table_id: u32,
    pub page_id: u32,
    pub slot_id: u16,
    pub payload: Vec<u8>,
}

impl WalRecord {
    pub fn serialized_size(&self) -> usize {
        WAL_RECORD_HEADER_SIZE + self.payload.len()
    }
}

/// What a caller hands to `append`: everything but the LSN, which the WAL
/// stamps itself.
#[derive(Debug, Clone)]
pub struct WalEntry<'a> {
    pub record_type: WalRecordType,
    pub table_id: u32,
    pub page_id: u32,
    pub slot_id: u16,
    pub payload: &'a [u8],
}

impl<'a> WalEntry<'a> {
    pub fn new(record_type: WalRecordType, table_id: u32, page_id: u32, slot_id: u16) -> Self {
        Self {
            record_type,
            table_id,
            page_id,
            slot_id,
            payload: &[],
        }
    }

    pub fn with_payload(mut self, payload: &'a [u8]) -> Self {
        self.payload = payload;
        self
    }
}

struct WalInner {
    file: File,
    current_lsn: u64,
    last_checkpoint_lsn: u64,
    /// Byte offset of the end of the last valid record; appends land here.
    write_pos: u64,
    write_buf: Vec<u8>,
}

/// The write-ahead log. Owns its file handle and the monotonic LSN
/// counter; a single mutex serializes appends, syncs, and reads.
pub struct Wal {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Opens an existing WAL (validating the header and scanning to the
    /// end to re-establish the LSN counter) or creates a fresh one.
    pub fn open(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::open_existing(path)
        } else {
            Self::create(path)
        }
    }

    fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create WAL at {:?}", path))?;

        let header = WalFileHeader::new();
        file.write_all(header.as_bytes())
            .wrap_err("failed to write WAL file header")?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(WalInner {
                file,
                current_lsn: 1,
                last_checkpoint_lsn: 0,
                write_pos: WAL_FILE_HEADER_SIZE as u64,
                write_buf: Vec::with_capacity(64 * 1024),
            }),
        })
    }

    fn open_existing(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open WAL at {:?}", path))?;

        let mut header_bytes = [0u8; WAL_FILE_HEADER_SIZE];
        file.read_exact(&mut header_bytes)
            .wrap_err("short read of WAL file header")?;
        let header = WalFileHeader::read_from_bytes(&header_bytes)
            .map_err(|e| eyre::eyre!("failed to parse WAL file header: {:?}", e))?;
        ensure!(
            header.is_valid(),
            "invalid WAL header in {:?}: magic {:#010x} version {}",
            path,
            { header.magic.get() },
            { header.version.get() }
        );

        // Scan record headers, skipping payloads, to find the last LSN and
        // the end of valid data. Anything past a malformed header is a
        // torn tail from an interrupted append.
        let file_len = file.metadata().wrap_err("failed to stat WAL")?.len();
        let mut pos = WAL_FILE_HEADER_SIZE as u64;
        let mut current_lsn = 1u64;

        loop {
            let mut rec_header = [0u8; WAL_RECORD_HEADER_SIZE];
            file.seek(SeekFrom::Start(pos))?;
            match file.read_exact(&mut rec_header) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e).wrap_err("failed to read WAL record header"),
            }
            let rec = WalRecordHeader::read_from_bytes(&rec_header)
                .map_err(|e| eyre::eyre!("failed to parse WAL record header: {:?}", e))?;

            let Some(payload_len) = rec.payload_len() else {
                break;
            };
            let record_end = pos + (WAL_RECORD_HEADER_SIZE + payload_len) as u64;
            if record_end > file_len {
                break;
            }

            current_lsn = rec.lsn.get() + 1;
            pos = record_end;
        }

        if pos < file_len {
            warn!(
                wal = ?path,
                discarded = file_len - pos,
                "discarding torn WAL tail"
            );
            file.set_len(pos).wrap_err("failed to truncate torn WAL tail")?;
        }

        debug!(wal = ?path, next_lsn = current_lsn, "opened WAL");

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(WalInner {
                file,
                current_lsn,
                last_checkpoint_lsn: header.last_checkpoint_lsn(),
                write_pos: pos,
                write_buf: Vec::with_capacity(64 * 1024),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next LSN that will be assigned.
    pub fn current_lsn(&self) -> u64 {
        self.inner.lock().current_lsn
    }

    pub fn last_checkpoint_lsn(&self) -> u64 {
        self.inner.lock().last_checkpoint_lsn
    }

    pub fn file_size(&self) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner.file.metadata().wrap_err("failed to stat WAL")?.len())
    }

    /// Appends one record, returning its LSN. Writes to OS buffers only;
    /// durability requires a subsequent `sync`.
    pub fn append(&self, entry: WalEntry<'_>) -> Result<u64> {
        ensure!(
            entry.payload.len() + WAL_RECORD_HEADER_SIZE <= WAL_MAX_RECORD_SIZE,
            "WAL payload too large: {} bytes",
            entry.payload.len()
        );

        let mut inner = self.inner.lock();
        let lsn = inner.current_lsn;

        let header = WalRecordHeader {
            lsn: U64::new(lsn),
            length: U32::new((WAL_RECORD_HEADER_SIZE + entry.payload.len()) as u32),
            crc32: U32::new(payload_crc(entry.payload)),
            record_type: entry.record_type as u8,
            reserved: [0; 3],
            table_id: U32::new(entry.table_id),
            page_id: U32::new(entry.page_id),
            slot_id: U16::new(entry.slot_id),
            padding: U16::new(0),
        };

        // Serialize into the reusable buffer and write contiguously so a
        // crash can only tear the final record, never interleave two.
        inner.write_buf.clear();
        inner.write_buf.extend_from_slice(header.as_bytes());
        inner.write_buf.extend_from_slice(entry.payload);

        let write_pos = inner.write_pos;
        let inner = &mut *inner;
        inner
            .file
            .seek(SeekFrom::Start(write_pos))
            .wrap_err("failed to seek to WAL append position")?;
        inner
            .file
            .write_all(&inner.write_buf)
            .wrap_err("failed to append WAL record")?;

        inner.write_pos += inner.write_buf.len() as u64;
        inner.current_lsn += 1;

        Ok(lsn)
    }

    /// Flushes OS buffers to storage.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_all().wrap_err("failed to sync WAL")
    }

    /// Appends a CHECKPOINT record (no payload) and returns its LSN. Page
    /// flushing and ordering around it belong to the checkpoint manager.
    pub fn checkpoint(&self) -> Result<u64> {
        self.append(WalEntry::new(WalRecordType::Checkpoint, 0, 0, 0))
    }

    /// Persists `lsn` as the last checkpoint in the file header.
    pub fn set_last_checkpoint(&self, lsn: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.last_checkpoint_lsn = lsn;

        let mut header = WalFileHeader::new();
        header.last_checkpoint_lsn = U64::new(lsn);
        inner
            .file
            .seek(SeekFrom::Start(0))
            .wrap_err("failed to seek to WAL header")?;
        inner
            .file
            .write_all(header.as_bytes())
            .wrap_err("failed to rewrite WAL header")?;
        Ok(())
    }

    /// Reads every record with `lsn >= start_lsn`, in LSN order, stopping
    /// cleanly at EOF or the first corrupt/truncated record.
    pub fn read_from(&self, start_lsn: u64) -> Result<Vec<WalRecord>> {
        let mut inner = self.inner.lock();
        let mut records = Vec::new();
        let mut pos = WAL_FILE_HEADER_SIZE as u64;

        loop {
            let mut header_bytes = [0u8; WAL_RECORD_HEADER_SIZE];
            inner.file.seek(SeekFrom::Start(pos))?;
            match inner.file.read_exact(&mut header_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e).wrap_err("failed to read WAL record header"),
            }
            let header = WalRecordHeader::read_from_bytes(&header_bytes)
                .map_err(|e| eyre::eyre!("failed to parse WAL record header: {:?}", e))?;

            let Some(payload_len) = header.payload_len() else {
                break;
            };

            let mut payload = vec![0u8; payload_len];
            match inner.file.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e).wrap_err("failed to read WAL record payload"),
            }

            if payload_crc(&payload) != header.crc32.get() {
                break;
            }

            let record_type = WalRecordType::from_byte(header.record_type);
            if record_type == WalRecordType::Invalid {
                break;
            }

            if header.lsn.get() >= start_lsn {
                records.push(WalRecord {
                    lsn: header.lsn.get(),
                    record_type,
                    table_id: header.table_id.get(),
                    page_id: header.page_id.get(),
                    slot_id: header.slot_id.get(),
                    payload,
                });
            }

            pos += (WAL_RECORD_HEADER_SIZE + payload_len) as u64;
        }

        Ok(records)
    }

    pub fn read_all(&self) -> Result<Vec<WalRecord>> {
        self.read_from(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn wal_in(dir: &Path) -> Wal {
        Wal::open(&dir.join("test.wal")).unwrap()
    }

    #[test]
    fn fresh_wal_starts_at_lsn_one() {
        let dir = tempdir().unwrap();
        let wal = wal_in(dir.path());
        assert_eq!(wal.current_lsn(), 1);
        assert_eq!(wal.last_checkpoint_lsn(), 0);
        assert_eq!(wal.file_size().unwrap(), WAL_FILE_HEADER_SIZE as u64);
    }

    #[test]
    fn append_read_round_trip() {
        let dir = tempdir().unwrap();
        let wal = wal_in(dir.path());

        let payloads: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; i as usize * 7]).collect();
        for (i, payload) in payloads.iter().enumerate() {
            let lsn = wal
                .append(
                    WalEntry::new(WalRecordType::Insert, 1, i as u32, i as u16)
                        .with_payload(payload),
                )
                .unwrap();
            assert_eq!(lsn, i as u64 + 1);
        }

        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), payloads.len());
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.lsn, i as u64 + 1);
            assert_eq!(record.record_type, WalRecordType::Insert);
            assert_eq!(record.payload, payloads[i]);
            assert_eq!(record.page_id, i as u32);
        }
    }

    #[test]
    fn read_from_filters_by_lsn() {
        let dir = tempdir().unwrap();
        let wal = wal_in(dir.path());
        for _ in 0..5 {
            wal.append(WalEntry::new(WalRecordType::Commit, 0, 0, 0))
                .unwrap();
        }

        let records = wal.read_from(3).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].lsn, 3);
    }

    #[test]
    fn reopen_continues_lsn_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let wal = Wal::open(&path).unwrap();
            wal.append(WalEntry::new(WalRecordType::Insert, 1, 0, 0).with_payload(b"a"))
                .unwrap();
            wal.append(WalEntry::new(WalRecordType::Insert, 1, 0, 1).with_payload(b"b"))
                .unwrap();
            wal.sync().unwrap();
        }

        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.current_lsn(), 3);
        let lsn = wal
            .append(WalEntry::new(WalRecordType::Insert, 1, 0, 2).with_payload(b"c"))
            .unwrap();
        assert_eq!(lsn, 3);
        assert_eq!(wal.read_all().unwrap().len(), 3);
    }

    #[test]
    fn torn_tail_yields_longest_valid_prefix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let full_len;
        {
            let wal = Wal::open(&path).unwrap();
            for i in 0..4u32 {
                wal.append(
                    WalEntry::new(WalRecordType::Insert, 1, i, 0).with_payload(&[0xAA; 100]),
                )
                .unwrap();
            }
            wal.sync().unwrap();
            full_len = wal.file_size().unwrap();
        }

        // Truncate to every possible byte length; read_all must return the
        // longest prefix of intact records without erroring.
        let record_len = (WAL_RECORD_HEADER_SIZE + 100) as u64;
        for cut in (WAL_FILE_HEADER_SIZE as u64..=full_len).rev() {
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            file.set_len(cut).unwrap();
            drop(file);

            let wal = Wal::open(&path).unwrap();
            let records = wal.read_all().unwrap();
            let expected = ((cut - WAL_FILE_HEADER_SIZE as u64) / record_len) as usize;
            assert_eq!(records.len(), expected, "cut at {} bytes", cut);
        }
    }

    #[test]
    fn corrupt_payload_stops_read_cleanly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let wal = Wal::open(&path).unwrap();
        wal.append(WalEntry::new(WalRecordType::Insert, 1, 0, 0).with_payload(b"good"))
            .unwrap();
        wal.append(WalEntry::new(WalRecordType::Insert, 1, 0, 1).with_payload(b"evil"))
            .unwrap();
        wal.sync().unwrap();
        drop(wal);

        // Flip a byte in the second record's payload.
        let mut bytes = std::fs::read(&path).unwrap();
        let second_payload_at =
            WAL_FILE_HEADER_SIZE + 2 * WAL_RECORD_HEADER_SIZE + b"good".len();
        bytes[second_payload_at] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let wal = Wal::open(&path).unwrap();
        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"good");
    }

    #[test]
    fn append_after_torn_tail_overwrites_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let wal = Wal::open(&path).unwrap();
            wal.append(WalEntry::new(WalRecordType::Insert, 1, 0, 0).with_payload(b"keep"))
                .unwrap();
            wal.append(WalEntry::new(WalRecordType::Insert, 1, 0, 1).with_payload(b"torn"))
                .unwrap();
            wal.sync().unwrap();
        }

        // Tear the second record mid-payload.
        let cut = (WAL_FILE_HEADER_SIZE + 2 * WAL_RECORD_HEADER_SIZE + b"keep".len() + 2) as u64;
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(cut).unwrap();
        drop(file);

        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.current_lsn(), 2);
        wal.append(WalEntry::new(WalRecordType::Insert, 1, 0, 1).with_payload(b"fresh"))
            .unwrap();

        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].payload, b"fresh");
        assert_eq!(records[1].lsn, 2);
    }

    #[test]
    fn checkpoint_appends_typed_record() {
        let dir = tempdir().unwrap();
        let wal = wal_in(dir.path());
        wal.append(WalEntry::new(WalRecordType::Insert, 1, 0, 0).with_payload(b"x"))
            .unwrap();
        let ckpt_lsn = wal.checkpoint().unwrap();

        let records = wal.read_all().unwrap();
        assert_eq!(records[1].record_type, WalRecordType::Checkpoint);
        assert_eq!(records[1].lsn, ckpt_lsn);
        assert!(records[1].payload.is_empty());
    }

    #[test]
    fn last_checkpoint_lsn_persists_in_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let wal = Wal::open(&path).unwrap();
            let lsn = wal.checkpoint().unwrap();
            wal.set_last_checkpoint(lsn).unwrap();
            wal.sync().unwrap();
        }

        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.last_checkpoint_lsn(), 1);
    }

    #[test]
    fn open_rejects_bad_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bogus.wal");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        assert!(Wal::open(&path).is_err());
    }
}
