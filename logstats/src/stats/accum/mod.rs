//! Statistics accumulators
//!
//! One accumulator holds the state of one stats function for one group.
//! The contract mirrors the pipe's streaming shape:
//!
//! - `update_all` / `update_row` advance the state and return the change
//!   in owned-state bytes, which the shard charges against its budget;
//! - `merge` folds a same-kind accumulator in (used by the flush-time
//!   fan-in; must be commutative for everything except `row_any`);
//! - `finalize` appends the string form to a caller buffer, polling the
//!   cancel token on long renderings.
//!
//! Dispatch is a tagged enum resolved once per block or row, so the inner
//! loops run on concrete types.

mod count;
mod minmax;
mod quantile;
mod row;
mod sum;
mod uniq;
mod values;

pub use count::{CountAccum, CountEmptyAccum};
pub use minmax::{MaxAccum, MinAccum};
pub use quantile::QuantileAccum;
pub use row::{RowAccum, RowChoice};
pub use sum::{AvgAccum, RateAccum, RateSumAccum, SumAccum, SumLenAccum};
pub use uniq::{CountUniqAccum, CountUniqHashAccum, UniqValuesAccum};
pub use values::ValuesAccum;

use std::borrow::Cow;

use crate::data::values::{marshal_bytes, try_parse_f64};
use crate::data::{Block, Column, ColumnData};
use crate::pipe::CancelToken;
use crate::stats::StatsFunc;

/// Rough per-entry bookkeeping cost of a hash-set slot, charged on top of
/// the payload bytes when estimating state size.
pub(crate) const SET_ENTRY_OVERHEAD: usize = 40;

/// The state of one stats function for one group.
#[derive(Debug)]
pub enum StatsAccum {
    Count(CountAccum),
    CountEmpty(CountEmptyAccum),
    CountUniq(CountUniqAccum),
    CountUniqHash(CountUniqHashAccum),
    Sum(SumAccum),
    SumLen(SumLenAccum),
    Avg(AvgAccum),
    Min(MinAccum),
    Max(MaxAccum),
    Quantile(QuantileAccum),
    UniqValues(UniqValuesAccum),
    Values(ValuesAccum),
    Rate(RateAccum),
    RateSum(RateSumAccum),
    Row(RowAccum),
}

impl StatsAccum {
    /// Create the zero state for `func`, returning it together with its
    /// initial size in bytes.
    pub fn new(func: &StatsFunc) -> (Self, usize) {
        let a = match func {
            StatsFunc::Count { .. } => StatsAccum::Count(CountAccum::default()),
            StatsFunc::CountEmpty { .. } => StatsAccum::CountEmpty(CountEmptyAccum::default()),
            StatsFunc::CountUniq { .. } => StatsAccum::CountUniq(CountUniqAccum::default()),
            StatsFunc::CountUniqHash { .. } => {
                StatsAccum::CountUniqHash(CountUniqHashAccum::default())
            }
            StatsFunc::Sum { .. } => StatsAccum::Sum(SumAccum::default()),
            StatsFunc::SumLen { .. } => StatsAccum::SumLen(SumLenAccum::default()),
            StatsFunc::Avg { .. } => StatsAccum::Avg(AvgAccum::default()),
            StatsFunc::Min { .. } => StatsAccum::Min(MinAccum::default()),
            StatsFunc::Max { .. } => StatsAccum::Max(MaxAccum::default()),
            StatsFunc::Median { .. } | StatsFunc::Quantile { .. } => {
                StatsAccum::Quantile(QuantileAccum::default())
            }
            StatsFunc::UniqValues { .. } => StatsAccum::UniqValues(UniqValuesAccum::default()),
            StatsFunc::Values { .. } => StatsAccum::Values(ValuesAccum::default()),
            StatsFunc::Rate => StatsAccum::Rate(RateAccum::default()),
            StatsFunc::RateSum { .. } => StatsAccum::RateSum(RateSumAccum::default()),
            StatsFunc::RowAny => StatsAccum::Row(RowAccum::new(RowChoice::Any)),
            StatsFunc::RowMin { .. } => StatsAccum::Row(RowAccum::new(RowChoice::Min)),
            StatsFunc::RowMax { .. } => StatsAccum::Row(RowAccum::new(RowChoice::Max)),
        };
        (a, std::mem::size_of::<StatsAccum>())
    }

    /// Advance the state for every row of `br`.
    pub fn update_all(&mut self, func: &StatsFunc, br: &Block) -> i64 {
        match (self, func) {
            (StatsAccum::Count(a), StatsFunc::Count { fields }) => a.update_all(fields, br),
            (StatsAccum::CountEmpty(a), StatsFunc::CountEmpty { fields }) => {
                a.update_all(fields, br)
            }
            (StatsAccum::CountUniq(a), StatsFunc::CountUniq { fields }) => a.update_all(fields, br),
            (StatsAccum::CountUniqHash(a), StatsFunc::CountUniqHash { fields }) => {
                a.update_all(fields, br)
            }
            (StatsAccum::Sum(a), StatsFunc::Sum { fields }) => a.update_all(fields, br),
            (StatsAccum::SumLen(a), StatsFunc::SumLen { fields }) => a.update_all(fields, br),
            (StatsAccum::Avg(a), StatsFunc::Avg { fields }) => a.update_all(fields, br),
            (StatsAccum::Min(a), StatsFunc::Min { fields }) => a.update_all(fields, br),
            (StatsAccum::Max(a), StatsFunc::Max { fields }) => a.update_all(fields, br),
            (StatsAccum::Quantile(a), StatsFunc::Median { fields })
            | (StatsAccum::Quantile(a), StatsFunc::Quantile { fields, .. }) => {
                a.update_all(fields, br)
            }
            (StatsAccum::UniqValues(a), StatsFunc::UniqValues { fields }) => {
                a.update_all(fields, br)
            }
            (StatsAccum::Values(a), StatsFunc::Values { fields }) => a.update_all(fields, br),
            (StatsAccum::Rate(a), StatsFunc::Rate) => a.update_all(br),
            (StatsAccum::RateSum(a), StatsFunc::RateSum { fields }) => a.update_all(fields, br),
            (StatsAccum::Row(a), StatsFunc::RowAny) => a.update_all(None, br),
            (StatsAccum::Row(a), StatsFunc::RowMin { field })
            | (StatsAccum::Row(a), StatsFunc::RowMax { field }) => {
                a.update_all(Some(field.as_str()), br)
            }
            _ => panic!("BUG: accumulator does not match stats function {func:?}"),
        }
    }

    /// Advance the state for the single row `row` of `br`.
    pub fn update_row(&mut self, func: &StatsFunc, br: &Block, row: usize) -> i64 {
        match (self, func) {
            (StatsAccum::Count(a), StatsFunc::Count { fields }) => a.update_row(fields, br, row),
            (StatsAccum::CountEmpty(a), StatsFunc::CountEmpty { fields }) => {
                a.update_row(fields, br, row)
            }
            (StatsAccum::CountUniq(a), StatsFunc::CountUniq { fields }) => {
                a.update_row(fields, br, row)
            }
            (StatsAccum::CountUniqHash(a), StatsFunc::CountUniqHash { fields }) => {
                a.update_row(fields, br, row)
            }
            (StatsAccum::Sum(a), StatsFunc::Sum { fields }) => a.update_row(fields, br, row),
            (StatsAccum::SumLen(a), StatsFunc::SumLen { fields }) => a.update_row(fields, br, row),
            (StatsAccum::Avg(a), StatsFunc::Avg { fields }) => a.update_row(fields, br, row),
            (StatsAccum::Min(a), StatsFunc::Min { fields }) => a.update_row(fields, br, row),
            (StatsAccum::Max(a), StatsFunc::Max { fields }) => a.update_row(fields, br, row),
            (StatsAccum::Quantile(a), StatsFunc::Median { fields })
            | (StatsAccum::Quantile(a), StatsFunc::Quantile { fields, .. }) => {
                a.update_row(fields, br, row)
            }
            (StatsAccum::UniqValues(a), StatsFunc::UniqValues { fields }) => {
                a.update_row(fields, br, row)
            }
            (StatsAccum::Values(a), StatsFunc::Values { fields }) => a.update_row(fields, br, row),
            (StatsAccum::Rate(a), StatsFunc::Rate) => a.update_row(br, row),
            (StatsAccum::RateSum(a), StatsFunc::RateSum { fields }) => {
                a.update_row(fields, br, row)
            }
            (StatsAccum::Row(a), StatsFunc::RowAny) => a.update_row(None, br, row),
            (StatsAccum::Row(a), StatsFunc::RowMin { field })
            | (StatsAccum::Row(a), StatsFunc::RowMax { field }) => {
                a.update_row(Some(field.as_str()), br, row)
            }
            _ => panic!("BUG: accumulator does not match stats function {func:?}"),
        }
    }

    /// Fold `other` into `self`; both must be the same concrete kind.
    pub fn merge(&mut self, other: StatsAccum) {
        match (self, other) {
            (StatsAccum::Count(a), StatsAccum::Count(b)) => a.merge(b),
            (StatsAccum::CountEmpty(a), StatsAccum::CountEmpty(b)) => a.merge(b),
            (StatsAccum::CountUniq(a), StatsAccum::CountUniq(b)) => a.merge(b),
            (StatsAccum::CountUniqHash(a), StatsAccum::CountUniqHash(b)) => a.merge(b),
            (StatsAccum::Sum(a), StatsAccum::Sum(b)) => a.merge(b),
            (StatsAccum::SumLen(a), StatsAccum::SumLen(b)) => a.merge(b),
            (StatsAccum::Avg(a), StatsAccum::Avg(b)) => a.merge(b),
            (StatsAccum::Min(a), StatsAccum::Min(b)) => a.merge(b),
            (StatsAccum::Max(a), StatsAccum::Max(b)) => a.merge(b),
            (StatsAccum::Quantile(a), StatsAccum::Quantile(b)) => a.merge(b),
            (StatsAccum::UniqValues(a), StatsAccum::UniqValues(b)) => a.merge(b),
            (StatsAccum::Values(a), StatsAccum::Values(b)) => a.merge(b),
            (StatsAccum::Rate(a), StatsAccum::Rate(b)) => a.merge(b),
            (StatsAccum::RateSum(a), StatsAccum::RateSum(b)) => a.merge(b),
            (StatsAccum::Row(a), StatsAccum::Row(b)) => a.merge(b),
            _ => panic!("BUG: cannot merge accumulators of different kinds"),
        }
    }

    /// Append the final value to `dst` and return a view of the appended
    /// bytes. Returns the empty view when cancelled mid-render.
    pub fn finalize<'a>(
        &mut self,
        func: &StatsFunc,
        step_seconds: f64,
        dst: &'a mut Vec<u8>,
        cancel: &CancelToken,
    ) -> &'a str {
        let start = dst.len();
        match (self, func) {
            (StatsAccum::Count(a), _) => a.finalize(dst),
            (StatsAccum::CountEmpty(a), _) => a.finalize(dst),
            (StatsAccum::CountUniq(a), _) => a.finalize(dst),
            (StatsAccum::CountUniqHash(a), _) => a.finalize(dst),
            (StatsAccum::Sum(a), _) => a.finalize(dst),
            (StatsAccum::SumLen(a), _) => a.finalize(dst),
            (StatsAccum::Avg(a), _) => a.finalize(dst),
            (StatsAccum::Min(a), _) => a.finalize(dst),
            (StatsAccum::Max(a), _) => a.finalize(dst),
            (StatsAccum::Quantile(a), StatsFunc::Quantile { phi, .. }) => a.finalize(*phi, dst),
            (StatsAccum::Quantile(a), _) => a.finalize(0.5, dst),
            (StatsAccum::UniqValues(a), _) => a.finalize(dst, cancel),
            (StatsAccum::Values(a), _) => a.finalize(dst, cancel),
            (StatsAccum::Rate(a), _) => a.finalize(step_seconds, dst),
            (StatsAccum::RateSum(a), _) => a.finalize(step_seconds, dst),
            (StatsAccum::Row(a), _) => a.finalize(dst),
        }
        std::str::from_utf8(&dst[start..]).unwrap_or("")
    }
}

/// True when the fields list addresses every column (`*` or empty).
#[inline]
pub(crate) fn is_star(fields: &[String]) -> bool {
    fields.is_empty() || fields.iter().any(|f| f == "*")
}

/// Resolve the input columns for a fields list against a block. `*`
/// selects every column the block carries; named fields missing from the
/// block resolve to all-empty const columns.
pub(crate) fn target_columns<'a>(br: &'a Block, fields: &'a [String]) -> Vec<Cow<'a, Column>> {
    if is_star(fields) {
        br.columns().iter().map(Cow::Borrowed).collect()
    } else {
        fields.iter().map(|f| br.get_column(f)).collect()
    }
}

/// Visit the input columns one at a time without materializing a column
/// vector; the allocation-free variant of [`target_columns`] for the
/// per-row update paths.
pub(crate) fn for_each_field_col(br: &Block, fields: &[String], mut f: impl FnMut(&Column)) {
    if is_star(fields) {
        for c in br.columns() {
            f(c);
        }
    } else {
        for name in fields {
            f(&br.get_column(name));
        }
    }
}

/// Parse the row's value as a finite f64, with native fast paths for the
/// numeric encodings.
#[inline]
pub(crate) fn f64_at(c: &Column, row: usize) -> Option<f64> {
    match &c.data {
        ColumnData::Uint8(v) => Some(f64::from(v[row])),
        ColumnData::Uint16(v) => Some(f64::from(v[row])),
        ColumnData::Uint32(v) => Some(f64::from(v[row])),
        ColumnData::Uint64(v) => Some(v[row] as f64),
        ColumnData::Int64(v) => Some(v[row] as f64),
        ColumnData::Float64(v) => Some(v[row]).filter(|f| f.is_finite()),
        ColumnData::Ipv4(_) | ColumnData::Timestamp(_) => None,
        ColumnData::Const(v) => try_parse_f64(v),
        ColumnData::Str(v) => try_parse_f64(&v[row]),
        ColumnData::Dict { dict, idxs } => try_parse_f64(&dict[idxs[row] as usize]),
    }
}

/// Run `f` over every finite numeric value of the column, using typed
/// loops where the encoding allows it.
pub(crate) fn for_each_f64(c: &Column, rows: usize, mut f: impl FnMut(f64)) {
    match &c.data {
        ColumnData::Uint8(v) => v.iter().for_each(|&x| f(f64::from(x))),
        ColumnData::Uint16(v) => v.iter().for_each(|&x| f(f64::from(x))),
        ColumnData::Uint32(v) => v.iter().for_each(|&x| f(f64::from(x))),
        ColumnData::Uint64(v) => v.iter().for_each(|&x| f(x as f64)),
        ColumnData::Int64(v) => v.iter().for_each(|&x| f(x as f64)),
        ColumnData::Float64(v) => v.iter().filter(|x| x.is_finite()).for_each(|&x| f(x)),
        ColumnData::Ipv4(_) | ColumnData::Timestamp(_) => {}
        ColumnData::Const(v) => {
            if let Some(x) = try_parse_f64(v) {
                for _ in 0..rows {
                    f(x);
                }
            }
        }
        ColumnData::Str(v) => v.iter().filter_map(|s| try_parse_f64(s)).for_each(f),
        ColumnData::Dict { dict, idxs } => {
            let parsed: Vec<Option<f64>> = dict.iter().map(|s| try_parse_f64(s)).collect();
            for &i in idxs {
                if let Some(x) = parsed[i as usize] {
                    f(x);
                }
            }
        }
    }
}

/// Encode the values of `cols` at `row` into `buf` as a length-prefixed
/// tuple. Returns false (and leaves `buf` empty) when every value is
/// empty, which uniqueness counters skip.
pub(crate) fn encode_row_tuple(
    cols: &[Cow<'_, Column>],
    row: usize,
    buf: &mut Vec<u8>,
    scratch: &mut String,
) -> bool {
    buf.clear();
    let mut any_non_empty = false;
    for c in cols {
        let v = c.value_into(row, scratch);
        if !v.is_empty() {
            any_non_empty = true;
        }
        marshal_bytes(buf, v.as_bytes());
    }
    any_non_empty
}
