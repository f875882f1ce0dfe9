//! # Configuration
//!
//! Central home for layout constants and the engine configuration value.
//! Import constants from here rather than re-declaring them locally; the
//! compile-time assertions in [`constants`] keep interdependent values
//! honest.

mod constants;

pub use constants::*;

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine-wide configuration, passed to `Engine::open`.
///
/// Defaults mirror an edge-class deployment: a 512 MiB global memory
/// ceiling, 64 MiB default query budget, a 1024-page buffer pool, and WAL
/// sync at every commit.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding all table files, the WAL, and the catalog.
    /// Created on startup if absent.
    pub data_dir: PathBuf,
    /// Buffer-pool capacity in pages.
    pub max_pool_pages: usize,
    /// Whether `Engine::commit` syncs the WAL. Disabling trades the
    /// at-most-one-commit-lost failure mode for commit latency.
    pub sync_on_commit: bool,
    /// Process-wide memory ceiling. `None` auto-detects from system RAM.
    pub global_memory_limit: Option<usize>,
    /// Default per-query memory budget.
    pub query_memory_limit: usize,
    /// Default per-query instruction budget.
    pub max_instructions: u64,
    /// Default per-query wall-clock budget.
    pub max_time: Duration,
    /// Default per-query result-row budget.
    pub max_result_rows: u64,
}

impl EngineConfig {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn max_pool_pages(mut self, pages: usize) -> Self {
        self.max_pool_pages = pages;
        self
    }

    pub fn sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    pub fn global_memory_limit(mut self, bytes: usize) -> Self {
        self.global_memory_limit = Some(bytes);
        self
    }

    pub fn query_memory_limit(mut self, bytes: usize) -> Self {
        self.query_memory_limit = bytes;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_pool_pages: DEFAULT_POOL_PAGES,
            sync_on_commit: true,
            global_memory_limit: None,
            query_memory_limit: DEFAULT_QUERY_MEMORY_LIMIT,
            max_instructions: DEFAULT_MAX_INSTRUCTIONS,
            max_time: Duration::from_millis(DEFAULT_MAX_TIME_MS),
            max_result_rows: DEFAULT_MAX_RESULT_ROWS,
        }
    }
}
