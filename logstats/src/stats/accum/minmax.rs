//! `min` and `max`

use crate::data::values::format_f64;
use crate::data::Block;

use super::{f64_at, for_each_f64, for_each_field_col};

/// Numeric minimum; NaN and unparseable values are treated as absent.
#[derive(Debug, Default)]
pub struct MinAccum {
    v: f64,
    seen: bool,
}

impl MinAccum {
    pub fn update_all(&mut self, fields: &[String], br: &Block) -> i64 {
        let rows = br.row_count();
        for_each_field_col(br, fields, |c| for_each_f64(c, rows, |x| self.observe(x)));
        0
    }

    pub fn update_row(&mut self, fields: &[String], br: &Block, row: usize) -> i64 {
        for_each_field_col(br, fields, |c| {
            if let Some(x) = f64_at(c, row) {
                self.observe(x);
            }
        });
        0
    }

    #[inline]
    fn observe(&mut self, x: f64) {
        if !self.seen || x < self.v {
            self.v = x;
            self.seen = true;
        }
    }

    pub fn merge(&mut self, other: MinAccum) {
        if other.seen {
            self.observe(other.v);
        }
    }

    pub fn finalize(&mut self, dst: &mut Vec<u8>) {
        if self.seen {
            dst.extend_from_slice(format_f64(self.v).as_bytes());
        }
    }
}

/// Numeric maximum; NaN and unparseable values are treated as absent.
#[derive(Debug, Default)]
pub struct MaxAccum {
    v: f64,
    seen: bool,
}

impl MaxAccum {
    pub fn update_all(&mut self, fields: &[String], br: &Block) -> i64 {
        let rows = br.row_count();
        for_each_field_col(br, fields, |c| for_each_f64(c, rows, |x| self.observe(x)));
        0
    }

    pub fn update_row(&mut self, fields: &[String], br: &Block, row: usize) -> i64 {
        for_each_field_col(br, fields, |c| {
            if let Some(x) = f64_at(c, row) {
                self.observe(x);
            }
        });
        0
    }

    #[inline]
    fn observe(&mut self, x: f64) {
        if !self.seen || x > self.v {
            self.v = x;
            self.seen = true;
        }
    }

    pub fn merge(&mut self, other: MaxAccum) {
        if other.seen {
            self.observe(other.v);
        }
    }

    pub fn finalize(&mut self, dst: &mut Vec<u8>) {
        if self.seen {
            dst.extend_from_slice(format_f64(self.v).as_bytes());
        }
    }
}
