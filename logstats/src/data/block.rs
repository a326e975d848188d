//! Columnar block storage
//!
//! A [`Block`] is the unit of streaming between pipe stages: a batch of
//! rows with named columns. Columns carry typed encodings so the hot
//! aggregation paths can walk native values instead of strings; the string
//! form is the canonical value a row "has" for grouping and output.

use std::borrow::Cow;

use super::bitmap::Bitmap;
use super::values::{format_f64, format_i64, format_ipv4, format_timestamp, format_u64};

/// Value type tag for a column encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Const,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int64,
    Float64,
    Ipv4,
    Timestamp,
    Dict,
}

/// Typed column payload. `Const` means every row of the block shares the
/// single value.
#[derive(Debug, Clone)]
pub enum ColumnData {
    Const(String),
    Str(Vec<String>),
    Dict { dict: Vec<String>, idxs: Vec<u8> },
    Uint8(Vec<u8>),
    Uint16(Vec<u16>),
    Uint32(Vec<u32>),
    Uint64(Vec<u64>),
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Ipv4(Vec<u32>),
    /// Unix timestamps in nanoseconds; string form is RFC 3339.
    Timestamp(Vec<i64>),
}

/// A named column inside a block.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn new_const(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Const(value.into()),
        }
    }

    pub fn new_str(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Str(values),
        }
    }

    pub fn new_dict(name: impl Into<String>, dict: Vec<String>, idxs: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Dict { dict, idxs },
        }
    }

    pub fn new_u64(name: impl Into<String>, values: Vec<u64>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Uint64(values),
        }
    }

    pub fn new_i64(name: impl Into<String>, values: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Int64(values),
        }
    }

    pub fn new_f64(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Float64(values),
        }
    }

    pub fn new_timestamp(name: impl Into<String>, nsecs: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Timestamp(nsecs),
        }
    }

    pub fn new_ipv4(name: impl Into<String>, values: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Ipv4(values),
        }
    }

    pub fn value_type(&self) -> ValueType {
        match &self.data {
            ColumnData::Const(_) => ValueType::Const,
            ColumnData::Str(_) => ValueType::String,
            ColumnData::Dict { .. } => ValueType::Dict,
            ColumnData::Uint8(_) => ValueType::Uint8,
            ColumnData::Uint16(_) => ValueType::Uint16,
            ColumnData::Uint32(_) => ValueType::Uint32,
            ColumnData::Uint64(_) => ValueType::Uint64,
            ColumnData::Int64(_) => ValueType::Int64,
            ColumnData::Float64(_) => ValueType::Float64,
            ColumnData::Ipv4(_) => ValueType::Ipv4,
            ColumnData::Timestamp(_) => ValueType::Timestamp,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self.data, ColumnData::Const(_))
    }

    /// The shared value of a const column.
    pub fn const_value(&self) -> &str {
        match &self.data {
            ColumnData::Const(v) => v,
            _ => panic!("BUG: const_value() called on non-const column {:?}", self.name),
        }
    }

    /// Number of rows the payload encodes, or `None` for const columns
    /// (which stretch to the block's row count).
    pub fn encoded_len(&self) -> Option<usize> {
        match &self.data {
            ColumnData::Const(_) => None,
            ColumnData::Str(v) => Some(v.len()),
            ColumnData::Dict { idxs, .. } => Some(idxs.len()),
            ColumnData::Uint8(v) => Some(v.len()),
            ColumnData::Uint16(v) => Some(v.len()),
            ColumnData::Uint32(v) => Some(v.len()),
            ColumnData::Uint64(v) => Some(v.len()),
            ColumnData::Int64(v) => Some(v.len()),
            ColumnData::Float64(v) => Some(v.len()),
            ColumnData::Ipv4(v) => Some(v.len()),
            ColumnData::Timestamp(v) => Some(v.len()),
        }
    }

    /// String form of the value at `row`. Numeric encodings render into
    /// `buf`; string encodings are returned as-is.
    pub fn value_into<'a>(&'a self, row: usize, buf: &'a mut String) -> &'a str {
        buf.clear();
        match &self.data {
            ColumnData::Const(v) => v,
            ColumnData::Str(v) => &v[row],
            ColumnData::Dict { dict, idxs } => &dict[idxs[row] as usize],
            ColumnData::Uint8(v) => {
                *buf = format_u64(u64::from(v[row]));
                buf
            }
            ColumnData::Uint16(v) => {
                *buf = format_u64(u64::from(v[row]));
                buf
            }
            ColumnData::Uint32(v) => {
                *buf = format_u64(u64::from(v[row]));
                buf
            }
            ColumnData::Uint64(v) => {
                *buf = format_u64(v[row]);
                buf
            }
            ColumnData::Int64(v) => {
                *buf = format_i64(v[row]);
                buf
            }
            ColumnData::Float64(v) => {
                *buf = format_f64(v[row]);
                buf
            }
            ColumnData::Ipv4(v) => {
                *buf = format_ipv4(v[row]);
                buf
            }
            ColumnData::Timestamp(v) => {
                *buf = format_timestamp(v[row]);
                buf
            }
        }
    }

    /// True when the row's value is the empty string. Typed numeric
    /// encodings always render non-empty.
    #[inline]
    pub fn is_empty_value(&self, row: usize) -> bool {
        match &self.data {
            ColumnData::Const(v) => v.is_empty(),
            ColumnData::Str(v) => v[row].is_empty(),
            ColumnData::Dict { dict, idxs } => dict[idxs[row] as usize].is_empty(),
            _ => false,
        }
    }

    /// Owned string form of the value at `row`.
    pub fn value(&self, row: usize) -> String {
        let mut buf = String::new();
        self.value_into(row, &mut buf).to_string()
    }

    /// Materialize all `rows` values as strings. Dict values are rendered
    /// once per dictionary entry, numeric runs once per distinct value.
    pub fn values(&self, rows: usize) -> Vec<String> {
        match &self.data {
            ColumnData::Const(v) => vec![v.clone(); rows],
            ColumnData::Str(v) => v.clone(),
            ColumnData::Dict { dict, idxs } => {
                idxs.iter().map(|&i| dict[i as usize].clone()).collect()
            }
            _ => {
                let mut out = Vec::with_capacity(rows);
                let mut buf = String::new();
                for row in 0..rows {
                    out.push(self.value_into(row, &mut buf).to_string());
                }
                out
            }
        }
    }
}

/// A columnar batch of rows flowing through the pipeline.
#[derive(Debug, Clone, Default)]
pub struct Block {
    rows: usize,
    columns: Vec<Column>,
}

impl Block {
    pub fn new(rows: usize, columns: Vec<Column>) -> Self {
        for c in &columns {
            if let Some(n) = c.encoded_len() {
                assert_eq!(n, rows, "BUG: column {:?} has {n} rows, block has {rows}", c.name);
            }
        }
        Self { rows, columns }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column lookup that treats a missing column as an all-empty const
    /// column, so callers see uniform "row has empty value" semantics.
    pub fn get_column<'a>(&'a self, name: &str) -> Cow<'a, Column> {
        match self.column_by_name(name) {
            Some(c) => Cow::Borrowed(c),
            None => Cow::Owned(Column::new_const(name, "")),
        }
    }

    /// Materialize the rows selected by `bm` into `dst`, keeping the
    /// column set. Const columns stay const; everything else is projected
    /// to plain strings.
    pub fn project_into(&self, bm: &Bitmap, dst: &mut Block) {
        let selected = bm.count_ones();
        dst.rows = selected;
        dst.columns.clear();
        for c in &self.columns {
            if c.is_const() {
                dst.columns.push(c.clone());
                continue;
            }
            let mut out = Vec::with_capacity(selected);
            let mut buf = String::new();
            for row in 0..self.rows {
                if bm.get(row) {
                    out.push(c.value_into(row, &mut buf).to_string());
                }
            }
            dst.columns.push(Column::new_str(c.name.clone(), out));
        }
    }
}
