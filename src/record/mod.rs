//! # Record Serialization
//!
//! A record is one table row serialized into a page slot. The wire format
//! is a fixed 8-byte header followed by one tagged column payload per
//! column, all integers little-endian:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ----------------------------------------------
//! 0       4     size          total bytes including this header
//! 4       2     column_count
//! 6       2     flags         bit0 = DELETED, bit1 = OVERFLOW
//! 8       ...   columns       type byte + type-specific payload
//! ```
//!
//! Column payloads: INTEGER is 8 bytes (i64), FLOAT is 8 bytes (f64 bits),
//! BOOLEAN is 1 byte, TEXT and BLOB are a 4-byte length prefix plus bytes,
//! NULL has no payload.
//!
//! The header struct uses `zerocopy` little-endian fields so it can be read
//! directly off a page slice without copying.

mod value;

pub use value::{ColumnType, Value};

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const RECORD_HEADER_SIZE: usize = 8;

pub const RECORD_FLAG_DELETED: u16 = 0x0001;
pub const RECORD_FLAG_OVERFLOW: u16 = 0x0002;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RecordHeader {
    size: U32,
    column_count: U16,
    flags: U16,
}

const _: () = assert!(size_of::<RecordHeader>() == RECORD_HEADER_SIZE);

impl RecordHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= RECORD_HEADER_SIZE,
            "buffer too small for RecordHeader: {} < {}",
            bytes.len(),
            RECORD_HEADER_SIZE
        );
        Self::ref_from_bytes(&bytes[..RECORD_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse RecordHeader: {:?}", e))
    }

    pub fn size(&self) -> u32 {
        self.size.get()
    }

    pub fn column_count(&self) -> u16 {
        self.column_count.get()
    }

    pub fn flags(&self) -> u16 {
        self.flags.get()
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.get() & RECORD_FLAG_DELETED != 0
    }

    pub fn is_overflow(&self) -> bool {
        self.flags.get() & RECORD_FLAG_OVERFLOW != 0
    }
}

/// One result row flowing through the operator tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Memory-accounting estimate for one materialized row.
    pub fn footprint(&self) -> usize {
        crate::config::ROW_OVERHEAD_BYTES + self.values.iter().map(Value::footprint).sum::<usize>()
    }
}

/// A row plus its record-level flags, as stored in a page slot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub values: Vec<Value>,
    pub flags: u16,
}

impl Record {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values, flags: 0 }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & RECORD_FLAG_DELETED != 0
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = RECORD_HEADER_SIZE;
        for v in &self.values {
            size += 1; // type byte
            size += match v {
                Value::Null => 0,
                Value::Integer(_) | Value::Float(_) => 8,
                Value::Boolean(_) => 1,
                Value::Text(s) => 4 + s.len(),
                Value::Blob(b) => 4 + b.len(),
            };
        }
        size
    }

    /// Serializes into `buf`, which must be at least `serialized_size()`
    /// bytes. Returns the number of bytes written.
    pub fn serialize_into(&self, buf: &mut [u8]) -> Result<usize> {
        let total = self.serialized_size();
        ensure!(
            buf.len() >= total,
            "record buffer too small: {} < {}",
            buf.len(),
            total
        );
        ensure!(total <= u32::MAX as usize, "record too large: {}", total);
        ensure!(
            self.values.len() <= u16::MAX as usize,
            "too many columns: {}",
            self.values.len()
        );

        let header = RecordHeader {
            size: U32::new(total as u32),
            column_count: U16::new(self.values.len() as u16),
            flags: U16::new(self.flags),
        };
        buf[..RECORD_HEADER_SIZE].copy_from_slice(header.as_bytes());

        let mut at = RECORD_HEADER_SIZE;
        for v in &self.values {
            buf[at] = v.column_type() as u8;
            at += 1;
            match v {
                Value::Null => {}
                Value::Integer(i) => {
                    buf[at..at + 8].copy_from_slice(&i.to_le_bytes());
                    at += 8;
                }
                Value::Float(f) => {
                    buf[at..at + 8].copy_from_slice(&f.to_le_bytes());
                    at += 8;
                }
                Value::Boolean(b) => {
                    buf[at] = *b as u8;
                    at += 1;
                }
                Value::Text(s) => {
                    buf[at..at + 4].copy_from_slice(&(s.len() as u32).to_le_bytes());
                    at += 4;
                    buf[at..at + s.len()].copy_from_slice(s.as_bytes());
                    at += s.len();
                }
                Value::Blob(b) => {
                    buf[at..at + 4].copy_from_slice(&(b.len() as u32).to_le_bytes());
                    at += 4;
                    buf[at..at + b.len()].copy_from_slice(b);
                    at += b.len();
                }
            }
        }

        debug_assert_eq!(at, total);
        Ok(total)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.serialized_size()];
        self.serialize_into(&mut buf)?;
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let header = RecordHeader::from_bytes(data)?;
        let total = header.size() as usize;
        ensure!(
            data.len() >= total,
            "record truncated: {} < declared size {}",
            data.len(),
            total
        );

        let column_count = header.column_count() as usize;
        let flags = header.flags();
        let mut values = Vec::with_capacity(column_count);
        let mut at = RECORD_HEADER_SIZE;

        for _ in 0..column_count {
            ensure!(at < total, "record column data runs past declared size");
            let ty = ColumnType::from_byte(data[at])
                .ok_or_else(|| eyre::eyre!("unknown column type byte {:#04x}", data[at]))?;
            at += 1;
            let value = match ty {
                ColumnType::Null => Value::Null,
                ColumnType::Integer => {
                    let v = i64::from_le_bytes(Self::take::<8>(data, &mut at, total)?);
                    Value::Integer(v)
                }
                ColumnType::Float => {
                    let v = f64::from_le_bytes(Self::take::<8>(data, &mut at, total)?);
                    Value::Float(v)
                }
                ColumnType::Boolean => {
                    let [b] = Self::take::<1>(data, &mut at, total)?;
                    Value::Boolean(b != 0)
                }
                ColumnType::Text => {
                    let len = u32::from_le_bytes(Self::take::<4>(data, &mut at, total)?) as usize;
                    let bytes = Self::take_slice(data, &mut at, total, len)?;
                    Value::Text(std::str::from_utf8(bytes)?.to_string())
                }
                ColumnType::Blob => {
                    let len = u32::from_le_bytes(Self::take::<4>(data, &mut at, total)?) as usize;
                    let bytes = Self::take_slice(data, &mut at, total, len)?;
                    Value::Blob(bytes.to_vec())
                }
            };
            values.push(value);
        }

        Ok(Self { values, flags })
    }

    fn take<const N: usize>(data: &[u8], at: &mut usize, total: usize) -> Result<[u8; N]> {
        if *at + N > total {
            bail!("record column payload truncated at offset {}", at);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&data[*at..*at + N]);
        *at += N;
        Ok(out)
    }

    fn take_slice<'a>(data: &'a [u8], at: &mut usize, total: usize, len: usize) -> Result<&'a [u8]> {
        if *at + len > total {
            bail!("record column payload truncated at offset {}", at);
        }
        let out = &data[*at..*at + len];
        *at += len;
        Ok(out)
    }
}

/// Encodes values into a byte key for hashing (group-by and DISTINCT).
/// The encoding is injective per value list, not ordered.
pub fn encode_group_key(values: &[Value], out: &mut Vec<u8>) {
    out.clear();
    for v in values {
        out.push(v.column_type() as u8);
        match v {
            Value::Null => {}
            Value::Integer(i) => out.extend_from_slice(&i.to_le_bytes()),
            Value::Float(f) => out.extend_from_slice(&f.to_le_bytes()),
            Value::Boolean(b) => out.push(*b as u8),
            Value::Text(s) => {
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Blob(b) => {
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
        }
    }
}
