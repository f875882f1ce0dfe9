//! # Buffer Pool
//!
//! Fixed-capacity cache of page frames keyed by (table_id, page_id), with
//! access-stamp LRU eviction and write-back of dirty frames. One mutex
//! protects the pool map; pin counts keep individual frames alive while a
//! caller holds a [`PageGuard`].
//!
//! ## Pin/Guard Protocol
//!
//! `get_page` and `allocate_page` pin the frame before returning; the
//! guard unpins on drop. Eviction only considers frames with a zero pin
//! count, so a guard's page can never be evicted out from under it —
//! the page-aliasing hazard of pointer-returning pools is closed
//! structurally rather than by caller discipline.
//!
//! ## LRU
//!
//! Each access stamps the frame with a monotonically increasing clock
//! value; eviction removes the unpinned frame with the smallest stamp,
//! writing it back first when dirty. Touch is O(1), eviction is O(n) over
//! cached frames, which is the right trade for a pool that evicts rarely
//! and is bounded at a few thousand frames.
//!
//! ## Dirty Tracking
//!
//! The frame-level dirty flag mirrors the page-header DIRTY bit: page
//! mutations set the header bit, `mark_dirty` and `page_mut` set the frame
//! flag, and flushing clears both after the frame reaches its file offset.
//!
//! ## Concurrency
//!
//! Frames live behind `UnsafeCell` so guards can hand out page references
//! without re-entering the pool mutex. Mutable access goes through
//! `PageGuard::page_mut(&mut self)`; exclusivity across threads comes from
//! the engine's single-writer transaction discipline, the same contract
//! the rest of the storage layer assumes.

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use super::page::{Page, FLAG_LEAF};
use super::table_file::TableFileSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub table_id: u32,
    pub page_id: u32,
}

impl PageKey {
    pub fn new(table_id: u32, page_id: u32) -> Self {
        Self { table_id, page_id }
    }
}

struct Frame {
    key: PageKey,
    page: UnsafeCell<Page>,
    dirty: AtomicBool,
    pin_count: AtomicU32,
    last_used: AtomicU64,
}

impl Frame {
    fn new(key: PageKey, page: Page, stamp: u64) -> Box<Self> {
        Box::new(Self {
            key,
            page: UnsafeCell::new(page),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            last_used: AtomicU64::new(stamp),
        })
    }

    fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin called on unpinned frame");
    }

    fn touch(&self, stamp: u64) {
        self.last_used.store(stamp, Ordering::Release);
    }

    /// Shared page access. Sound while the frame is pinned or the pool
    /// mutex is held, which are the only two call sites.
    unsafe fn page_ref(&self) -> &Page {
        &*self.page.get()
    }

    /// Exclusive page access; see the module docs for the exclusivity
    /// contract.
    #[allow(clippy::mut_from_ref)]
    unsafe fn page_mut(&self) -> &mut Page {
        &mut *self.page.get()
    }
}

struct PoolState {
    frames: HashMap<PageKey, Box<Frame>>,
    next_page_id: HashMap<u32, u32>,
    clock: u64,
}

impl PoolState {
    fn stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Fixed-capacity page cache in front of the per-table files.
pub struct BufferPool {
    files: TableFileSet,
    max_pages: usize,
    state: Mutex<PoolState>,
}

// SAFETY: all access to the UnsafeCell'd frames is mediated either by the
// pool mutex (load, eviction, flush) or by a pinned PageGuard whose mutable
// access requires &mut and whose cross-thread exclusivity is provided by
// the single-writer transaction lock above this layer.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    pub fn new(data_dir: &Path, max_pages: usize) -> Result<Self> {
        let files = TableFileSet::new(data_dir)?;
        Ok(Self {
            files,
            max_pages: max_pages.max(1),
            state: Mutex::new(PoolState {
                frames: HashMap::new(),
                next_page_id: HashMap::new(),
                clock: 0,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.max_pages
    }

    pub fn files(&self) -> &TableFileSet {
        &self.files
    }

    pub fn cached_pages(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn dirty_pages(&self) -> usize {
        let state = self.state.lock();
        state
            .frames
            .values()
            .filter(|f| f.dirty.load(Ordering::Acquire))
            .count()
    }

    /// Pages allocated to a table so far (cached or on disk). Also the id
    /// the next `allocate_page` will hand out.
    pub fn table_page_count(&self, table_id: u32) -> Result<u32> {
        let mut state = self.state.lock();
        self.seeded_next_page_id(&mut state, table_id)
    }

    fn seeded_next_page_id(&self, state: &mut PoolState, table_id: u32) -> Result<u32> {
        if let Some(&next) = state.next_page_id.get(&table_id) {
            return Ok(next);
        }
        let next = self.files.page_count(table_id)?;
        state.next_page_id.insert(table_id, next);
        Ok(next)
    }

    fn make_guard(&self, frame: &Frame) -> PageGuard<'_> {
        frame.pin();
        PageGuard {
            key: frame.key,
            frame: NonNull::from(frame),
            _pool: std::marker::PhantomData,
        }
    }

    /// Fetches a page, reading it from storage on a miss. Fails on a magic
    /// mismatch, a corrupt header, or a short read (page never written).
    pub fn get_page(&self, table_id: u32, page_id: u32) -> Result<PageGuard<'_>> {
        self.fetch(PageKey::new(table_id, page_id), false)
    }

    /// Like `get_page`, but a page missing from storage is initialized
    /// fresh instead of failing. Recovery uses this to reconstruct pages
    /// whose WAL records outlived the file contents.
    pub fn get_or_create_page(&self, table_id: u32, page_id: u32) -> Result<PageGuard<'_>> {
        self.fetch(PageKey::new(table_id, page_id), true)
    }

    fn fetch(&self, key: PageKey, create_missing: bool) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock();

        if state.frames.contains_key(&key) {
            let stamp = state.stamp();
            let frame = state.frames.get(&key).expect("frame present");
            frame.touch(stamp);
            return Ok(self.make_guard(frame));
        }

        self.evict_until_room(&mut state)?;

        let on_disk = self.files.page_count(key.table_id)?;
        let mut page = Page::new();
        let mut newly_created = false;

        if key.page_id < on_disk {
            let file = self.files.table_file(key.table_id)?;
            file.read_page(key.page_id, &mut page)?;
            page.validate()?;
        } else if create_missing {
            page.init(key.page_id, FLAG_LEAF);
            newly_created = true;
        } else {
            bail!(
                "page {} of table {} does not exist (file has {} pages)",
                key.page_id,
                key.table_id,
                on_disk
            );
        }

        if create_missing {
            // Keep the allocation cursor ahead of recovered pages.
            let next = self.seeded_next_page_id(&mut state, key.table_id)?;
            if key.page_id >= next {
                state.next_page_id.insert(key.table_id, key.page_id + 1);
            }
        }

        let stamp = state.stamp();
        let frame = Frame::new(key, page, stamp);
        if newly_created {
            frame.dirty.store(true, Ordering::Release);
        }
        let guard = self.make_guard(&frame);
        state.frames.insert(key, frame);

        Ok(guard)
    }

    /// Reserves the next page_id for a table and constructs an initialized
    /// leaf frame in cache, dirty and pinned. The page reaches disk on
    /// eviction or flush.
    pub fn allocate_page(&self, table_id: u32) -> Result<(u32, PageGuard<'_>)> {
        let mut state = self.state.lock();

        let page_id = self.seeded_next_page_id(&mut state, table_id)?;
        state.next_page_id.insert(table_id, page_id + 1);

        self.evict_until_room(&mut state)?;

        let mut page = Page::new();
        page.init(page_id, FLAG_LEAF);

        let key = PageKey::new(table_id, page_id);
        let stamp = state.stamp();
        let frame = Frame::new(key, page, stamp);
        frame.dirty.store(true, Ordering::Release);
        let guard = self.make_guard(&frame);
        state.frames.insert(key, frame);

        Ok((page_id, guard))
    }

    fn evict_until_room(&self, state: &mut PoolState) -> Result<()> {
        while state.frames.len() >= self.max_pages {
            if !self.evict_one_locked(state)? {
                bail!(
                    "buffer pool full and every frame is pinned (capacity {})",
                    self.max_pages
                );
            }
        }
        Ok(())
    }

    /// Evicts the least-recently-used unpinned frame, writing it back
    /// first when dirty. Returns false when nothing is evictable.
    fn evict_one_locked(&self, state: &mut PoolState) -> Result<bool> {
        let victim = state
            .frames
            .values()
            .filter(|f| !f.is_pinned())
            .min_by_key(|f| f.last_used.load(Ordering::Acquire))
            .map(|f| f.key);

        let Some(key) = victim else {
            return Ok(false);
        };

        let frame = state.frames.get(&key).expect("victim frame present");
        if frame.dirty.load(Ordering::Acquire) {
            // SAFETY: pool mutex held and the frame is unpinned, so no
            // guard references this page.
            let page = unsafe { frame.page_mut() };
            page.set_dirty(false);
            let file = self.files.table_file(key.table_id)?;
            file.write_page(key.page_id, page)?;
        }
        state.frames.remove(&key);
        Ok(true)
    }

    /// Evicts one LRU frame if any is evictable. Public face of the
    /// eviction step; a cache with no unpinned frames is a no-op.
    pub fn evict_page(&self) -> Result<bool> {
        let mut state = self.state.lock();
        self.evict_one_locked(&mut state)
    }

    pub fn mark_dirty(&self, table_id: u32, page_id: u32) {
        let state = self.state.lock();
        if let Some(frame) = state.frames.get(&PageKey::new(table_id, page_id)) {
            frame.dirty.store(true, Ordering::Release);
        }
    }

    /// Writes a single page back if dirty. Returns whether a write
    /// happened.
    pub fn flush_page(&self, table_id: u32, page_id: u32) -> Result<bool> {
        let state = self.state.lock();
        let key = PageKey::new(table_id, page_id);
        let Some(frame) = state.frames.get(&key) else {
            return Ok(false);
        };
        self.flush_frame_locked(frame)
    }

    fn flush_frame_locked(&self, frame: &Frame) -> Result<bool> {
        if !frame.dirty.load(Ordering::Acquire) {
            return Ok(false);
        }
        // SAFETY: pool mutex held; flushing runs under the engine's writer
        // role so no reader is mid-borrow on this frame.
        let page = unsafe { frame.page_mut() };
        page.set_dirty(false);
        let file = self.files.table_file(frame.key.table_id)?;
        file.write_page(frame.key.page_id, page)?;
        frame.dirty.store(false, Ordering::Release);
        Ok(true)
    }

    /// Writes every dirty frame back. Returns the number actually written.
    pub fn flush_all(&self) -> Result<usize> {
        let state = self.state.lock();
        let mut flushed = 0;
        for frame in state.frames.values() {
            if self.flush_frame_locked(frame)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Syncs all table files to storage.
    pub fn sync(&self) -> Result<()> {
        self.files.sync_all()
    }

    /// Discards a table: drops its cached frames and removes its file.
    pub fn drop_table(&self, table_id: u32) -> Result<()> {
        let mut state = self.state.lock();
        let pinned = state
            .frames
            .values()
            .any(|f| f.key.table_id == table_id && f.is_pinned());
        if pinned {
            bail!("cannot drop table {}: pages still borrowed", table_id);
        }
        state.frames.retain(|k, _| k.table_id != table_id);
        state.next_page_id.remove(&table_id);
        self.files.remove_table(table_id)
    }
}

/// A pinned borrow of one cached page. The frame cannot be evicted while
/// the guard lives; drop unpins.
#[derive(Debug)]
pub struct PageGuard<'a> {
    key: PageKey,
    frame: NonNull<Frame>,
    _pool: std::marker::PhantomData<&'a BufferPool>,
}

impl PageGuard<'_> {
    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn page(&self) -> &Page {
        // SAFETY: the frame is pinned for the guard's lifetime, so it is
        // neither evicted nor dropped; shared access is the default state.
        unsafe { self.frame.as_ref().page_ref() }
    }

    /// Mutable page access. `&mut self` gives per-guard exclusivity;
    /// cross-guard exclusivity comes from the single-writer lock.
    pub fn page_mut(&mut self) -> &mut Page {
        // SAFETY: see above; the frame outlives the guard and the writer
        // lock serializes mutators.
        let frame = unsafe { self.frame.as_ref() };
        frame.dirty.store(true, Ordering::Release);
        unsafe { frame.page_mut() }
    }

    pub fn mark_dirty(&self) {
        // SAFETY: pinned frame, shared access only.
        unsafe { self.frame.as_ref().dirty.store(true, Ordering::Release) }
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the frame stays in the map until pin_count reaches zero,
        // which cannot happen before this unpin.
        unsafe { self.frame.as_ref().unpin() }
    }
}
