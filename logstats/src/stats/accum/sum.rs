//! `sum`, `sum_len`, `avg`, `rate` and `rate_sum`

use crate::data::values::{format_f64, format_u64};
use crate::data::{Block, ColumnData};

use super::{f64_at, for_each_f64, for_each_field_col};

/// Running sum over the numerically parseable values of the named fields.
#[derive(Debug, Default)]
pub struct SumAccum {
    sum: f64,
}

impl SumAccum {
    pub fn update_all(&mut self, fields: &[String], br: &Block) -> i64 {
        let rows = br.row_count();
        let sum = &mut self.sum;
        for_each_field_col(br, fields, |c| for_each_f64(c, rows, |v| *sum += v));
        0
    }

    pub fn update_row(&mut self, fields: &[String], br: &Block, row: usize) -> i64 {
        let sum = &mut self.sum;
        for_each_field_col(br, fields, |c| {
            if let Some(v) = f64_at(c, row) {
                *sum += v;
            }
        });
        0
    }

    pub fn merge(&mut self, other: SumAccum) {
        self.sum += other.sum;
    }

    pub fn finalize(&mut self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(format_f64(self.sum).as_bytes());
    }
}

/// Sum of the byte lengths of the string form of the named fields.
#[derive(Debug, Default)]
pub struct SumLenAccum {
    n: u64,
}

impl SumLenAccum {
    pub fn update_all(&mut self, fields: &[String], br: &Block) -> i64 {
        let rows = br.row_count();
        let n = &mut self.n;
        for_each_field_col(br, fields, |c| {
            match &c.data {
                ColumnData::Const(v) => *n += (v.len() * rows) as u64,
                ColumnData::Str(vs) => *n += vs.iter().map(|s| s.len() as u64).sum::<u64>(),
                ColumnData::Dict { dict, idxs } => {
                    let lens: Vec<u64> = dict.iter().map(|s| s.len() as u64).collect();
                    *n += idxs.iter().map(|&i| lens[i as usize]).sum::<u64>();
                }
                _ => {
                    let mut buf = String::new();
                    for row in 0..rows {
                        *n += c.value_into(row, &mut buf).len() as u64;
                    }
                }
            }
        });
        0
    }

    pub fn update_row(&mut self, fields: &[String], br: &Block, row: usize) -> i64 {
        let mut buf = String::new();
        let n = &mut self.n;
        for_each_field_col(br, fields, |c| {
            *n += c.value_into(row, &mut buf).len() as u64;
        });
        0
    }

    pub fn merge(&mut self, other: SumLenAccum) {
        self.n += other.n;
    }

    pub fn finalize(&mut self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(format_u64(self.n).as_bytes());
    }
}

/// Arithmetic mean; renders the empty string when no value was seen.
#[derive(Debug, Default)]
pub struct AvgAccum {
    sum: f64,
    count: u64,
}

impl AvgAccum {
    pub fn update_all(&mut self, fields: &[String], br: &Block) -> i64 {
        let rows = br.row_count();
        let (sum, count) = (&mut self.sum, &mut self.count);
        for_each_field_col(br, fields, |c| {
            for_each_f64(c, rows, |v| {
                *sum += v;
                *count += 1;
            });
        });
        0
    }

    pub fn update_row(&mut self, fields: &[String], br: &Block, row: usize) -> i64 {
        let (sum, count) = (&mut self.sum, &mut self.count);
        for_each_field_col(br, fields, |c| {
            if let Some(v) = f64_at(c, row) {
                *sum += v;
                *count += 1;
            }
        });
        0
    }

    pub fn merge(&mut self, other: AvgAccum) {
        self.sum += other.sum;
        self.count += other.count;
    }

    pub fn finalize(&mut self, dst: &mut Vec<u8>) {
        if self.count == 0 {
            return;
        }
        dst.extend_from_slice(format_f64(self.sum / self.count as f64).as_bytes());
    }
}

/// Row count divided by the externally injected step, in rows per second.
#[derive(Debug, Default)]
pub struct RateAccum {
    n: u64,
}

impl RateAccum {
    pub fn update_all(&mut self, br: &Block) -> i64 {
        self.n += br.row_count() as u64;
        0
    }

    pub fn update_row(&mut self, _br: &Block, _row: usize) -> i64 {
        self.n += 1;
        0
    }

    pub fn merge(&mut self, other: RateAccum) {
        self.n += other.n;
    }

    pub fn finalize(&mut self, step_seconds: f64, dst: &mut Vec<u8>) {
        let step = if step_seconds > 0.0 { step_seconds } else { 1.0 };
        dst.extend_from_slice(format_f64(self.n as f64 / step).as_bytes());
    }
}

/// Like `sum`, divided by the externally injected step.
#[derive(Debug, Default)]
pub struct RateSumAccum {
    sum: f64,
}

impl RateSumAccum {
    pub fn update_all(&mut self, fields: &[String], br: &Block) -> i64 {
        let rows = br.row_count();
        let sum = &mut self.sum;
        for_each_field_col(br, fields, |c| for_each_f64(c, rows, |v| *sum += v));
        0
    }

    pub fn update_row(&mut self, fields: &[String], br: &Block, row: usize) -> i64 {
        let sum = &mut self.sum;
        for_each_field_col(br, fields, |c| {
            if let Some(v) = f64_at(c, row) {
                *sum += v;
            }
        });
        0
    }

    pub fn merge(&mut self, other: RateSumAccum) {
        self.sum += other.sum;
    }

    pub fn finalize(&mut self, step_seconds: f64, dst: &mut Vec<u8>) {
        let step = if step_seconds > 0.0 { step_seconds } else { 1.0 };
        dst.extend_from_slice(format_f64(self.sum / step).as_bytes());
    }
}
