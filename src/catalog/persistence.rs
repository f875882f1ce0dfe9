//! # Catalog Persistence
//!
//! The catalog file is a compact little-endian record:
//!
//! ```text
//! table_count   u32
//! next_table_id u32
//! per table:
//!     id           u32
//!     name_len     u32, then name bytes (UTF-8)
//!     column_count u32
//!     row_count    u64
//!     per column:
//!         name_len u32, then name bytes
//!         type     u8     (ColumnType code)
//!         flags    u8     (bit0 = not_null, bit1 = primary_key)
//!         index    u32
//! ```
//!
//! Tables are written in ascending id order so the file is deterministic
//! for a given catalog state. Writes go through a temp file + rename so a
//! crash mid-save leaves the previous catalog intact.

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use std::path::Path;

use crate::record::ColumnType;

use super::{ColumnInfo, TableInfo};

const FLAG_NOT_NULL: u8 = 0x01;
const FLAG_PRIMARY_KEY: u8 = 0x02;

pub(super) fn serialize(tables: &HashMap<u32, TableInfo>, next_table_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&(tables.len() as u32).to_le_bytes());
    out.extend_from_slice(&next_table_id.to_le_bytes());

    let mut ordered: Vec<&TableInfo> = tables.values().collect();
    ordered.sort_by_key(|t| t.id);

    for table in ordered {
        out.extend_from_slice(&table.id.to_le_bytes());
        out.extend_from_slice(&(table.name.len() as u32).to_le_bytes());
        out.extend_from_slice(table.name.as_bytes());
        out.extend_from_slice(&(table.columns.len() as u32).to_le_bytes());
        out.extend_from_slice(&table.row_count.to_le_bytes());

        for col in &table.columns {
            out.extend_from_slice(&(col.name.len() as u32).to_le_bytes());
            out.extend_from_slice(col.name.as_bytes());
            out.push(col.column_type as u8);
            let mut flags = 0u8;
            if col.not_null {
                flags |= FLAG_NOT_NULL;
            }
            if col.primary_key {
                flags |= FLAG_PRIMARY_KEY;
            }
            out.push(flags);
            out.extend_from_slice(&col.index.to_le_bytes());
        }
    }

    out
}

pub(super) fn deserialize(bytes: &[u8]) -> Result<(HashMap<u32, TableInfo>, u32)> {
    let mut reader = Reader { bytes, at: 0 };

    let table_count = reader.u32()?;
    let next_table_id = reader.u32()?;
    let mut tables = HashMap::with_capacity(table_count as usize);

    for _ in 0..table_count {
        let id = reader.u32()?;
        let name = reader.string()?;
        let column_count = reader.u32()?;
        let row_count = reader.u64()?;

        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let col_name = reader.string()?;
            let type_byte = reader.u8()?;
            let column_type = ColumnType::from_byte(type_byte)
                .ok_or_else(|| eyre::eyre!("unknown column type {:#04x} in catalog", type_byte))?;
            let flags = reader.u8()?;
            let index = reader.u32()?;
            columns.push(ColumnInfo {
                name: col_name,
                column_type,
                not_null: flags & FLAG_NOT_NULL != 0,
                primary_key: flags & FLAG_PRIMARY_KEY != 0,
                index,
            });
        }

        ensure!(id < next_table_id, "catalog table id {} >= next id", id);
        if tables
            .insert(
                id,
                TableInfo {
                    id,
                    name,
                    columns,
                    row_count,
                },
            )
            .is_some()
        {
            bail!("duplicate table id {} in catalog", id);
        }
    }

    Ok((tables, next_table_id))
}

pub(super) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)
        .wrap_err_with(|| format!("failed to write catalog temp file {:?}", tmp))?;
    std::fs::rename(&tmp, path)
        .wrap_err_with(|| format!("failed to move catalog into place at {:?}", path))?;
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        ensure!(
            self.at + n <= self.bytes.len(),
            "catalog file truncated at offset {}",
            self.at
        );
        let out = &self.bytes[self.at..self.at + n];
        self.at += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        ensure!(len <= 1 << 20, "catalog string length {} is absurd", len);
        let bytes = self.take(len)?;
        Ok(std::str::from_utf8(bytes)
            .wrap_err("catalog string is not valid UTF-8")?
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::super::Catalog;
    use super::*;
    use tempfile::tempdir;

    fn populated() -> Catalog {
        let catalog = Catalog::new();
        catalog
            .create_table(
                "users",
                vec![
                    ColumnInfo::new("id", ColumnType::Integer).primary_key(),
                    ColumnInfo::new("name", ColumnType::Text).not_null(),
                    ColumnInfo::new("score", ColumnType::Float),
                ],
            )
            .unwrap();
        catalog
            .create_table(
                "blobs",
                vec![
                    ColumnInfo::new("key", ColumnType::Text),
                    ColumnInfo::new("data", ColumnType::Blob),
                    ColumnInfo::new("live", ColumnType::Boolean),
                ],
            )
            .unwrap();
        catalog.update_row_count(1, 123);
        catalog
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.bin");

        let original = populated();
        original.save(&path).unwrap();

        let loaded = Catalog::new();
        loaded.load(&path).unwrap();

        assert_eq!(loaded.table_count(), 2);
        assert_eq!(loaded.table("users"), original.table("users"));
        assert_eq!(loaded.table("blobs"), original.table("blobs"));
        assert_eq!(loaded.table("users").unwrap().row_count, 123);

        // The id sequence continues after the persisted tables.
        let next = loaded.create_table("more", vec![ColumnInfo::new("x", ColumnType::Integer)]);
        assert_eq!(next.unwrap(), 3);
    }

    #[test]
    fn save_is_deterministic() {
        let a = populated();
        let b = populated();
        let dir = tempdir().unwrap();
        let (pa, pb) = (dir.path().join("a"), dir.path().join("b"));
        a.save(&pa).unwrap();
        b.save(&pb).unwrap();
        assert_eq!(std::fs::read(pa).unwrap(), std::fs::read(pb).unwrap());
    }

    #[test]
    fn truncated_catalog_is_rejected() {
        let catalog = populated();
        let bytes = {
            let inner = catalog.inner.lock();
            serialize(&inner.tables, inner.next_table_id)
        };

        for cut in [2, 8, 20, bytes.len() - 1] {
            assert!(deserialize(&bytes[..cut]).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        let catalog = populated();
        let mut bytes = {
            let inner = catalog.inner.lock();
            serialize(&inner.tables, inner.next_table_id)
        };

        // First column type byte: after header(8) + id(4) + name(4+5) +
        // col_count(4) + row_count(8) + col name(4+2).
        let at = 8 + 4 + 9 + 4 + 8 + 6;
        assert_eq!(bytes[at], ColumnType::Integer as u8);
        bytes[at] = 0x77;
        assert!(deserialize(&bytes).is_err());
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new();
        assert!(catalog.load(&dir.path().join("absent")).is_err());
    }
}
