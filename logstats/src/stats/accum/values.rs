//! `values` — every observed value, in input order

use crate::data::Block;
use crate::pipe::CancelToken;

use super::for_each_field_col;

const CANCEL_POLL_EVERY: usize = 1024;

/// Ordered multiset of all values of the named fields, rendered as a JSON
/// array. Empty values are kept; the memory budget bounds growth.
#[derive(Debug, Default)]
pub struct ValuesAccum {
    values: Vec<String>,
}

impl ValuesAccum {
    pub fn update_all(&mut self, fields: &[String], br: &Block) -> i64 {
        let rows = br.row_count();
        let mut delta = 0i64;
        let mut buf = String::new();
        let values = &mut self.values;
        for_each_field_col(br, fields, |c| {
            for row in 0..rows {
                let v = c.value_into(row, &mut buf);
                delta += (v.len() + std::mem::size_of::<String>()) as i64;
                values.push(v.to_string());
            }
        });
        delta
    }

    pub fn update_row(&mut self, fields: &[String], br: &Block, row: usize) -> i64 {
        let mut delta = 0i64;
        let mut buf = String::new();
        let values = &mut self.values;
        for_each_field_col(br, fields, |c| {
            let v = c.value_into(row, &mut buf);
            delta += (v.len() + std::mem::size_of::<String>()) as i64;
            values.push(v.to_string());
        });
        delta
    }

    pub fn merge(&mut self, other: ValuesAccum) {
        self.values.extend(other.values);
    }

    pub fn finalize(&mut self, dst: &mut Vec<u8>, cancel: &CancelToken) {
        let start = dst.len();
        dst.push(b'[');
        for (i, v) in self.values.iter().enumerate() {
            if i % CANCEL_POLL_EVERY == 0 && cancel.is_cancelled() {
                dst.truncate(start);
                return;
            }
            if i > 0 {
                dst.push(b',');
            }
            if serde_json::to_writer(&mut *dst, v).is_err() {
                dst.truncate(start);
                return;
            }
        }
        dst.push(b']');
    }
}
