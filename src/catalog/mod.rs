//! # Schema Catalog
//!
//! Table and column metadata for planning and record decoding. The
//! catalog is a read-mostly map behind a mutex, owned by the engine (not
//! a process singleton) and persisted as a compact little-endian record
//! in the data directory — see [`persistence`] for the byte layout.
//!
//! Row counts are planner estimates only; they are updated by DML and
//! carry no correctness weight.

mod persistence;

pub use crate::record::ColumnType;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::path::Path;

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: ColumnType,
    pub not_null: bool,
    pub primary_key: bool,
    /// Zero-based position in the table.
    pub index: u32,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            not_null: false,
            primary_key: false,
            index: 0,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.not_null = true;
        self
    }
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub id: u32,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    /// Estimate for planning, not authoritative.
    pub row_count: u64,
}

impl TableInfo {
    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, index: u32) -> Option<&ColumnInfo> {
        self.columns.get(index as usize)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

struct CatalogInner {
    tables: HashMap<u32, TableInfo>,
    by_name: HashMap<String, u32>,
    next_table_id: u32,
}

/// Thread-safe table metadata store.
pub struct Catalog {
    inner: Mutex<CatalogInner>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CatalogInner {
                tables: HashMap::new(),
                by_name: HashMap::new(),
                next_table_id: 1,
            }),
        }
    }

    /// Registers a table, assigning its id. Fails on a duplicate name,
    /// an empty column list, or duplicate column names.
    pub fn create_table(&self, name: &str, mut columns: Vec<ColumnInfo>) -> Result<u32> {
        ensure!(!name.is_empty(), "table name cannot be empty");
        ensure!(
            !columns.is_empty(),
            "table '{}' must have at least one column",
            name
        );
        for (i, col) in columns.iter().enumerate() {
            for other in &columns[..i] {
                if other.name.eq_ignore_ascii_case(&col.name) {
                    bail!("duplicate column '{}' in table '{}'", col.name, name);
                }
            }
        }

        let key = name.to_ascii_lowercase();
        let mut inner = self.inner.lock();
        if inner.by_name.contains_key(&key) {
            bail!("table '{}' already exists", name);
        }

        for (i, col) in columns.iter_mut().enumerate() {
            col.index = i as u32;
        }

        let id = inner.next_table_id;
        inner.next_table_id += 1;
        inner.by_name.insert(key, id);
        inner.tables.insert(
            id,
            TableInfo {
                id,
                name: name.to_string(),
                columns,
                row_count: 0,
            },
        );

        Ok(id)
    }

    /// Removes a table, returning its id.
    pub fn drop_table(&self, name: &str) -> Result<u32> {
        let key = name.to_ascii_lowercase();
        let mut inner = self.inner.lock();
        let Some(id) = inner.by_name.remove(&key) else {
            bail!("unknown table '{}'", name);
        };
        inner.tables.remove(&id);
        Ok(id)
    }

    pub fn table(&self, name: &str) -> Option<TableInfo> {
        let key = name.to_ascii_lowercase();
        let inner = self.inner.lock();
        inner
            .by_name
            .get(&key)
            .and_then(|id| inner.tables.get(id))
            .cloned()
    }

    pub fn table_by_id(&self, id: u32) -> Option<TableInfo> {
        self.inner.lock().tables.get(&id).cloned()
    }

    /// Resolves a name, failing with a planner-grade error when unknown.
    pub fn require_table(&self, name: &str) -> Result<TableInfo> {
        self.table(name)
            .ok_or_else(|| eyre::eyre!("unknown table '{}'", name))
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.inner
            .lock()
            .by_name
            .contains_key(&name.to_ascii_lowercase())
    }

    pub fn list_tables(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut names: Vec<String> = inner.tables.values().map(|t| t.name.clone()).collect();
        names.sort();
        names
    }

    pub fn table_count(&self) -> usize {
        self.inner.lock().tables.len()
    }

    pub fn update_row_count(&self, table_id: u32, row_count: u64) {
        let mut inner = self.inner.lock();
        if let Some(table) = inner.tables.get_mut(&table_id) {
            table.row_count = row_count;
        }
    }

    pub fn bump_row_count(&self, table_id: u32, delta: i64) {
        let mut inner = self.inner.lock();
        if let Some(table) = inner.tables.get_mut(&table_id) {
            table.row_count = table.row_count.saturating_add_signed(delta);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.tables.clear();
        inner.by_name.clear();
        inner.next_table_id = 1;
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = {
            let inner = self.inner.lock();
            persistence::serialize(&inner.tables, inner.next_table_id)
        };
        persistence::write_atomically(path, &bytes)
    }

    pub fn load(&self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)
            .map_err(|e| eyre::eyre!("failed to read catalog at {:?}: {}", path, e))?;
        let (tables, next_table_id) = persistence::deserialize(&bytes)?;

        let mut inner = self.inner.lock();
        inner.by_name = tables
            .values()
            .map(|t| (t.name.to_ascii_lowercase(), t.id))
            .collect();
        inner.tables = tables;
        inner.next_table_id = next_table_id;
        Ok(())
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
