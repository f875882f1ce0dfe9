//! # Per-Table Page Files
//!
//! The authoritative on-disk layout binds one file to each table: the
//! 8192-byte page with page_id P lives at byte offset P * 8192. A fresh
//! database has zero table files; files are created on first allocation
//! and removed on DROP TABLE.
//!
//! ## Durability Contract
//!
//! `write_page` persists the exact page frame at the computed offset and
//! `sync` flushes OS buffers to storage. A per-file mutex serializes reads
//! against writes so a reader concurrent with an eviction sees either the
//! pre- or post-write image, never a torn page. (Torn writes across power
//! loss remain an open risk of the format; see the design notes.)

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{PAGE_SIZE, TABLE_FILE_EXTENSION};

use super::page::Page;

/// One table's page file. Page P lives at byte offset P * PAGE_SIZE.
pub struct TableFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl TableFile {
    pub fn open_or_create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open table file at {:?}", path))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of full pages currently persisted.
    pub fn page_count(&self) -> Result<u32> {
        let file = self.file.lock();
        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat table file {:?}", self.path))?
            .len();
        Ok((len / PAGE_SIZE as u64) as u32)
    }

    /// Reads page `page_id` into `page`'s frame. A short read (the page
    /// was never written) fails the lookup.
    pub fn read_page(&self, page_id: u32, page: &mut Page) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))
            .wrap_err_with(|| format!("failed to seek to page {} in {:?}", page_id, self.path))?;
        file.read_exact(page.data_mut().as_mut_slice())
            .wrap_err_with(|| format!("short read of page {} in {:?}", page_id, self.path))?;
        Ok(())
    }

    /// Persists the exact frame at the page's computed offset.
    pub fn write_page(&self, page_id: u32, page: &Page) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))
            .wrap_err_with(|| format!("failed to seek to page {} in {:?}", page_id, self.path))?;
        file.write_all(page.data().as_slice())
            .wrap_err_with(|| format!("failed to write page {} to {:?}", page_id, self.path))?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_all()
            .wrap_err_with(|| format!("failed to sync table file {:?}", self.path))
    }
}

/// Directory of table files, keyed by table id. Creates the data
/// directory on construction and lazily opens files on first touch.
pub struct TableFileSet {
    dir: PathBuf,
    files: Mutex<HashMap<u32, Arc<TableFile>>>,
}

impl TableFileSet {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create data directory at {:?}", dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            files: Mutex::new(HashMap::new()),
        })
    }

    fn table_path(&self, table_id: u32) -> PathBuf {
        self.dir
            .join(format!("t{}.{}", table_id, TABLE_FILE_EXTENSION))
    }

    pub fn table_file(&self, table_id: u32) -> Result<Arc<TableFile>> {
        let mut files = self.files.lock();
        if let Some(file) = files.get(&table_id) {
            return Ok(Arc::clone(file));
        }
        let file = Arc::new(TableFile::open_or_create(&self.table_path(table_id))?);
        files.insert(table_id, Arc::clone(&file));
        Ok(file)
    }

    /// Pages persisted for a table; zero when the file does not exist yet.
    pub fn page_count(&self, table_id: u32) -> Result<u32> {
        let path = self.table_path(table_id);
        if !path.exists() {
            return Ok(0);
        }
        self.table_file(table_id)?.page_count()
    }

    /// Closes and removes a table's file. Missing files are fine — the
    /// table may never have been written.
    pub fn remove_table(&self, table_id: u32) -> Result<()> {
        let mut files = self.files.lock();
        files.remove(&table_id);
        let path = self.table_path(table_id);
        if path.exists() {
            std::fs::remove_file(&path)
                .wrap_err_with(|| format!("failed to remove table file {:?}", path))?;
        }
        Ok(())
    }

    pub fn sync_all(&self) -> Result<()> {
        let files = self.files.lock();
        for file in files.values() {
            file.sync()?;
        }
        Ok(())
    }

    /// Drops all open handles. Subsequent access reopens from disk.
    pub fn close_all(&self) {
        self.files.lock().clear();
    }

    pub fn open_file_count(&self) -> usize {
        self.files.lock().len()
    }

    pub fn data_dir(&self) -> &Path {
        &self.dir
    }
}
