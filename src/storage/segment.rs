//! # Segment Files
//!
//! The segmented layout is the append-oriented container format: one table
//! owns a series of segment files, each holding a header followed by
//! contiguous page-sized slots. Writes go to the *active* segment; when it
//! reaches its configured page count it is sealed and a new segment
//! becomes active. Reads address pages by (segment_id, page_offset).
//!
//! ## File Layout
//!
//! ```text
//! +--------------------------+
//! | SegmentHeader (32 bytes) |  <- first page-sized slot, zero padded
//! +--------------------------+
//! | Page 0                   |  <- offset PAGE_SIZE
//! | Page 1                   |
//! | ...                      |
//! +--------------------------+
//! ```
//!
//! The header slot is padded to a full page so page slots stay
//! page-aligned. `created_lsn` is the WAL position when the segment was
//! created; `max_lsn` tracks the newest LSN among pages written into it.
//!
//! The buffer pool binds to the simpler per-table file layout
//! (`table_file`); segments stand alone as the rotation-friendly container
//! and share the same page frames and validation rules.

use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{PAGE_SIZE, SEGMENT_HEADER_SIZE, SEGMENT_MAGIC, SEGMENT_MAX_PAGES};

use super::page::Page;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct SegmentHeader {
    magic: U32,
    segment_id: U32,
    table_id: U32,
    page_count: U32,
    created_lsn: U64,
    max_lsn: U64,
}

const _: () = assert!(size_of::<SegmentHeader>() == SEGMENT_HEADER_SIZE);

impl SegmentHeader {
    fn new(segment_id: u32, table_id: u32, created_lsn: u64) -> Self {
        Self {
            magic: U32::new(SEGMENT_MAGIC),
            segment_id: U32::new(segment_id),
            table_id: U32::new(table_id),
            page_count: U32::new(0),
            created_lsn: U64::new(created_lsn),
            max_lsn: U64::new(0),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic.get() == SEGMENT_MAGIC
    }

    pub fn segment_id(&self) -> u32 {
        self.segment_id.get()
    }

    pub fn table_id(&self) -> u32 {
        self.table_id.get()
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.get()
    }

    pub fn created_lsn(&self) -> u64 {
        self.created_lsn.get()
    }

    pub fn max_lsn(&self) -> u64 {
        self.max_lsn.get()
    }
}

struct SegmentInner {
    file: File,
    header: SegmentHeader,
}

impl SegmentInner {
    fn persist_header(&mut self, path: &Path) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(0))
            .wrap_err_with(|| format!("failed to seek to segment header in {:?}", path))?;
        self.file
            .write_all(self.header.as_bytes())
            .wrap_err_with(|| format!("failed to write segment header to {:?}", path))?;
        Ok(())
    }
}

/// One segment file.
pub struct Segment {
    path: PathBuf,
    max_pages: u32,
    inner: Mutex<SegmentInner>,
}

impl Segment {
    pub fn create(
        path: &Path,
        table_id: u32,
        segment_id: u32,
        created_lsn: u64,
        max_pages: u32,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create segment file at {:?}", path))?;

        let header = SegmentHeader::new(segment_id, table_id, created_lsn);
        // Pad the header slot to a full page so page offsets stay aligned.
        let mut slot = vec![0u8; PAGE_SIZE];
        slot[..SEGMENT_HEADER_SIZE].copy_from_slice(header.as_bytes());
        file.write_all(&slot)
            .wrap_err_with(|| format!("failed to write segment header to {:?}", path))?;

        Ok(Self {
            path: path.to_path_buf(),
            max_pages,
            inner: Mutex::new(SegmentInner { file, header }),
        })
    }

    pub fn open(path: &Path, max_pages: u32) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open segment file at {:?}", path))?;

        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        file.read_exact(&mut buf)
            .wrap_err_with(|| format!("short read of segment header in {:?}", path))?;
        let header = SegmentHeader::read_from_bytes(&buf)
            .map_err(|e| eyre::eyre!("failed to parse segment header: {:?}", e))?;
        ensure!(
            header.is_valid(),
            "invalid segment magic in {:?}: {:#010x}",
            path,
            { header.magic.get() }
        );

        Ok(Self {
            path: path.to_path_buf(),
            max_pages,
            inner: Mutex::new(SegmentInner { file, header }),
        })
    }

    pub fn header(&self) -> SegmentHeader {
        self.inner.lock().header
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        inner.header.page_count() >= self.max_pages
    }

    fn page_offset(page_offset: u32) -> u64 {
        (page_offset as u64 + 1) * PAGE_SIZE as u64
    }

    pub fn read_page(&self, page_offset: u32, page: &mut Page) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure!(
            page_offset < inner.header.page_count(),
            "page offset {} out of range for segment {} ({} pages)",
            page_offset,
            inner.header.segment_id(),
            inner.header.page_count()
        );
        inner
            .file
            .seek(SeekFrom::Start(Self::page_offset(page_offset)))
            .wrap_err_with(|| format!("failed to seek in segment {:?}", self.path))?;
        inner
            .file
            .read_exact(page.data_mut().as_mut_slice())
            .wrap_err_with(|| {
                format!("short read of page {} in segment {:?}", page_offset, self.path)
            })?;
        Ok(())
    }

    /// Rewrites an existing page slot in place.
    pub fn write_page(&self, page_offset: u32, page: &Page) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure!(
            page_offset < inner.header.page_count(),
            "page offset {} out of range for segment {} ({} pages)",
            page_offset,
            inner.header.segment_id(),
            inner.header.page_count()
        );
        inner
            .file
            .seek(SeekFrom::Start(Self::page_offset(page_offset)))
            .wrap_err_with(|| format!("failed to seek in segment {:?}", self.path))?;
        inner
            .file
            .write_all(page.data().as_slice())
            .wrap_err_with(|| {
                format!("failed to write page {} in segment {:?}", page_offset, self.path)
            })?;

        if page.lsn() > inner.header.max_lsn() {
            inner.header.max_lsn = U64::new(page.lsn());
            inner.persist_header(&self.path)?;
        }
        Ok(())
    }

    /// Appends a page to the segment, returning its page offset.
    pub fn append_page(&self, page: &Page) -> Result<u32> {
        let mut inner = self.inner.lock();
        let offset = inner.header.page_count();
        if offset >= self.max_pages {
            bail!(
                "segment {} is full ({} pages)",
                inner.header.segment_id(),
                self.max_pages
            );
        }

        inner
            .file
            .seek(SeekFrom::Start(Self::page_offset(offset)))
            .wrap_err_with(|| format!("failed to seek in segment {:?}", self.path))?;
        inner
            .file
            .write_all(page.data().as_slice())
            .wrap_err_with(|| format!("failed to append page to segment {:?}", self.path))?;

        inner.header.page_count = U32::new(offset + 1);
        if page.lsn() > inner.header.max_lsn() {
            inner.header.max_lsn = U64::new(page.lsn());
        }
        inner.persist_header(&self.path)?;

        Ok(offset)
    }

    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner
            .file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync segment {:?}", self.path))
    }
}

/// Manages one table's segment series: opens existing segments, appends to
/// the active one, and rotates when it fills.
pub struct SegmentManager {
    dir: PathBuf,
    table_id: u32,
    max_pages: u32,
    segments: Mutex<Vec<Segment>>,
}

impl SegmentManager {
    pub fn open(dir: &Path, table_id: u32) -> Result<Self> {
        Self::with_max_pages(dir, table_id, SEGMENT_MAX_PAGES)
    }

    pub fn with_max_pages(dir: &Path, table_id: u32, max_pages: u32) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create segment directory at {:?}", dir))?;

        let mut segments = Vec::new();
        for segment_id in 1.. {
            let path = Self::segment_path(dir, table_id, segment_id);
            if !path.exists() {
                break;
            }
            segments.push(Segment::open(&path, max_pages)?);
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            table_id,
            max_pages,
            segments: Mutex::new(segments),
        })
    }

    fn segment_path(dir: &Path, table_id: u32, segment_id: u32) -> PathBuf {
        dir.join(format!("t{}.s{:06}.seg", table_id, segment_id))
    }

    /// Appends a page, rotating to a fresh segment when the active one is
    /// full. Returns (segment_id, page_offset).
    pub fn append_page(&self, page: &Page, current_lsn: u64) -> Result<(u32, u32)> {
        let mut segments = self.segments.lock();

        let needs_new = match segments.last() {
            Some(active) => active.is_full(),
            None => true,
        };
        if needs_new {
            let segment_id = segments.len() as u32 + 1;
            let path = Self::segment_path(&self.dir, self.table_id, segment_id);
            segments.push(Segment::create(
                &path,
                self.table_id,
                segment_id,
                current_lsn,
                self.max_pages,
            )?);
        }

        let active = segments.last().expect("active segment exists");
        let offset = active.append_page(page)?;
        Ok((active.header().segment_id(), offset))
    }

    pub fn read_page(&self, segment_id: u32, page_offset: u32, page: &mut Page) -> Result<()> {
        let segments = self.segments.lock();
        let index = segment_id
            .checked_sub(1)
            .map(|i| i as usize)
            .filter(|&i| i < segments.len())
            .ok_or_else(|| {
                eyre::eyre!(
                    "segment {} does not exist for table {}",
                    segment_id,
                    self.table_id
                )
            })?;
        segments[index].read_page(page_offset, page)
    }

    pub fn active_segment_id(&self) -> u32 {
        self.segments.lock().len() as u32
    }

    pub fn segment_count(&self) -> usize {
        self.segments.lock().len()
    }

    pub fn sync_all(&self) -> Result<()> {
        let segments = self.segments.lock();
        for segment in segments.iter() {
            segment.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::FLAG_LEAF;
    use tempfile::tempdir;

    fn page_with(payload: &[u8], page_id: u32, lsn: u64) -> Page {
        let mut page = Page::new();
        page.init(page_id, FLAG_LEAF);
        page.insert_record(payload).unwrap();
        page.set_lsn(lsn);
        page
    }

    #[test]
    fn create_append_read_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t1.s000001.seg");
        let segment = Segment::create(&path, 1, 1, 10, 8).unwrap();

        let page = page_with(b"in segment", 0, 11);
        let offset = segment.append_page(&page).unwrap();
        assert_eq!(offset, 0);

        let mut loaded = Page::new();
        segment.read_page(0, &mut loaded).unwrap();
        assert_eq!(loaded.record(0).unwrap(), b"in segment");

        let header = segment.header();
        assert_eq!(header.page_count(), 1);
        assert_eq!(header.created_lsn(), 10);
        assert_eq!(header.max_lsn(), 11);
    }

    #[test]
    fn reopen_preserves_header_and_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t2.s000001.seg");
        {
            let segment = Segment::create(&path, 2, 1, 0, 8).unwrap();
            segment.append_page(&page_with(b"first", 0, 5)).unwrap();
            segment.append_page(&page_with(b"second", 1, 6)).unwrap();
            segment.sync().unwrap();
        }

        let segment = Segment::open(&path, 8).unwrap();
        assert_eq!(segment.header().page_count(), 2);
        assert_eq!(segment.header().max_lsn(), 6);

        let mut page = Page::new();
        segment.read_page(1, &mut page).unwrap();
        assert_eq!(page.record(0).unwrap(), b"second");
    }

    #[test]
    fn append_fails_when_full() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t3.s000001.seg");
        let segment = Segment::create(&path, 3, 1, 0, 2).unwrap();

        segment.append_page(&page_with(b"a", 0, 1)).unwrap();
        segment.append_page(&page_with(b"b", 1, 2)).unwrap();
        assert!(segment.is_full());
        assert!(segment.append_page(&page_with(b"c", 2, 3)).is_err());
    }

    #[test]
    fn read_out_of_range_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t4.s000001.seg");
        let segment = Segment::create(&path, 4, 1, 0, 8).unwrap();

        let mut page = Page::new();
        assert!(segment.read_page(0, &mut page).is_err());
    }

    #[test]
    fn manager_rotates_at_capacity() {
        let dir = tempdir().unwrap();
        let manager = SegmentManager::with_max_pages(dir.path(), 7, 2).unwrap();

        let mut addresses = Vec::new();
        for i in 0..5u32 {
            let page = page_with(format!("page-{}", i).as_bytes(), i, i as u64 + 1);
            addresses.push(manager.append_page(&page, i as u64 + 1).unwrap());
        }

        // 2 pages per segment: segments 1 and 2 full, 3 active.
        assert_eq!(manager.segment_count(), 3);
        assert_eq!(addresses[0], (1, 0));
        assert_eq!(addresses[2], (2, 0));
        assert_eq!(addresses[4], (3, 0));

        for (i, (segment_id, offset)) in addresses.iter().enumerate() {
            let mut page = Page::new();
            manager.read_page(*segment_id, *offset, &mut page).unwrap();
            assert_eq!(
                page.record(0).unwrap(),
                format!("page-{}", i).as_bytes()
            );
        }
    }

    #[test]
    fn manager_reopens_existing_series() {
        let dir = tempdir().unwrap();
        {
            let manager = SegmentManager::with_max_pages(dir.path(), 8, 2).unwrap();
            for i in 0..3u32 {
                manager
                    .append_page(&page_with(b"persist", i, i as u64), i as u64)
                    .unwrap();
            }
            manager.sync_all().unwrap();
        }

        let manager = SegmentManager::with_max_pages(dir.path(), 8, 2).unwrap();
        assert_eq!(manager.segment_count(), 2);

        let mut page = Page::new();
        manager.read_page(2, 0, &mut page).unwrap();
        assert_eq!(page.record(0).unwrap(), b"persist");

        // New appends continue in the active segment.
        let (segment_id, offset) = manager
            .append_page(&page_with(b"more", 3, 4), 4)
            .unwrap();
        assert_eq!((segment_id, offset), (2, 1));
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bogus.seg");
        std::fs::write(&path, vec![0u8; PAGE_SIZE]).unwrap();
        assert!(Segment::open(&path, 8).is_err());
    }
}
