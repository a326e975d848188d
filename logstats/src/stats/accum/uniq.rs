//! `count_uniq`, `count_uniq_hash` and `uniq_values`

use ahash::AHashSet;
use xxhash_rust::xxh64::xxh64;

use crate::data::values::format_u64;
use crate::data::Block;
use crate::pipe::CancelToken;

use super::{encode_row_tuple, for_each_field_col, target_columns, SET_ENTRY_OVERHEAD};

/// How many items to render between cancel polls in `finalize`.
const CANCEL_POLL_EVERY: usize = 256;

/// Exact distinct count over value tuples of the named fields. Tuples
/// where every field is empty are not counted.
#[derive(Debug, Default)]
pub struct CountUniqAccum {
    set: AHashSet<Vec<u8>>,
}

impl CountUniqAccum {
    pub fn update_all(&mut self, fields: &[String], br: &Block) -> i64 {
        let rows = br.row_count();
        let cols = target_columns(br, fields);
        let mut delta = 0i64;
        let mut buf = Vec::new();
        let mut scratch = String::new();
        for row in 0..rows {
            // Consecutive equal tuples hash once.
            if row > 0 && cols.iter().all(|c| c.is_const()) {
                break;
            }
            if !encode_row_tuple(&cols, row, &mut buf, &mut scratch) {
                continue;
            }
            if !self.set.contains(buf.as_slice()) {
                delta += (buf.len() + SET_ENTRY_OVERHEAD) as i64;
                self.set.insert(buf.clone());
            }
        }
        delta
    }

    pub fn update_row(&mut self, fields: &[String], br: &Block, row: usize) -> i64 {
        let cols = target_columns(br, fields);
        let mut buf = Vec::new();
        let mut scratch = String::new();
        if !encode_row_tuple(&cols, row, &mut buf, &mut scratch) {
            return 0;
        }
        if self.set.contains(buf.as_slice()) {
            return 0;
        }
        let delta = (buf.len() + SET_ENTRY_OVERHEAD) as i64;
        self.set.insert(buf);
        delta
    }

    pub fn merge(&mut self, other: CountUniqAccum) {
        for k in other.set {
            self.set.insert(k);
        }
    }

    pub fn finalize(&mut self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(format_u64(self.set.len() as u64).as_bytes());
    }
}

/// Approximate distinct count: stores 64-bit hashes of the tuples instead
/// of the tuples themselves.
#[derive(Debug, Default)]
pub struct CountUniqHashAccum {
    set: AHashSet<u64>,
}

impl CountUniqHashAccum {
    pub fn update_all(&mut self, fields: &[String], br: &Block) -> i64 {
        let rows = br.row_count();
        let cols = target_columns(br, fields);
        let mut delta = 0i64;
        let mut buf = Vec::new();
        let mut scratch = String::new();
        for row in 0..rows {
            if row > 0 && cols.iter().all(|c| c.is_const()) {
                break;
            }
            if !encode_row_tuple(&cols, row, &mut buf, &mut scratch) {
                continue;
            }
            if self.set.insert(xxh64(&buf, 0)) {
                delta += (std::mem::size_of::<u64>() + SET_ENTRY_OVERHEAD) as i64;
            }
        }
        delta
    }

    pub fn update_row(&mut self, fields: &[String], br: &Block, row: usize) -> i64 {
        let cols = target_columns(br, fields);
        let mut buf = Vec::new();
        let mut scratch = String::new();
        if !encode_row_tuple(&cols, row, &mut buf, &mut scratch) {
            return 0;
        }
        if self.set.insert(xxh64(&buf, 0)) {
            (std::mem::size_of::<u64>() + SET_ENTRY_OVERHEAD) as i64
        } else {
            0
        }
    }

    pub fn merge(&mut self, other: CountUniqHashAccum) {
        self.set.extend(other.set);
    }

    pub fn finalize(&mut self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(format_u64(self.set.len() as u64).as_bytes());
    }
}

/// Set of distinct non-empty string values, rendered as a lexically
/// sorted JSON array.
#[derive(Debug, Default)]
pub struct UniqValuesAccum {
    set: AHashSet<String>,
}

impl UniqValuesAccum {
    pub fn update_all(&mut self, fields: &[String], br: &Block) -> i64 {
        let rows = br.row_count();
        let mut delta = 0i64;
        let mut buf = String::new();
        let set = &mut self.set;
        for_each_field_col(br, fields, |c| {
            if c.is_const() {
                let v = c.const_value();
                if !v.is_empty() && !set.contains(v) {
                    delta += (v.len() + SET_ENTRY_OVERHEAD) as i64;
                    set.insert(v.to_string());
                }
                return;
            }
            for row in 0..rows {
                let v = c.value_into(row, &mut buf);
                if !v.is_empty() && !set.contains(v) {
                    delta += (v.len() + SET_ENTRY_OVERHEAD) as i64;
                    set.insert(v.to_string());
                }
            }
        });
        delta
    }

    pub fn update_row(&mut self, fields: &[String], br: &Block, row: usize) -> i64 {
        let mut delta = 0i64;
        let mut buf = String::new();
        let set = &mut self.set;
        for_each_field_col(br, fields, |c| {
            let v = c.value_into(row, &mut buf);
            if !v.is_empty() && !set.contains(v) {
                delta += (v.len() + SET_ENTRY_OVERHEAD) as i64;
                set.insert(v.to_string());
            }
        });
        delta
    }

    pub fn merge(&mut self, other: UniqValuesAccum) {
        for v in other.set {
            self.set.insert(v);
        }
    }

    pub fn finalize(&mut self, dst: &mut Vec<u8>, cancel: &CancelToken) {
        let start = dst.len();
        let mut items: Vec<&str> = self.set.iter().map(String::as_str).collect();
        items.sort_unstable();
        dst.push(b'[');
        for (i, v) in items.iter().enumerate() {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Column;

    fn out(f: impl FnOnce(&mut Vec<u8>)) -> String {
        let mut dst = Vec::new();
        f(&mut dst);
        String::from_utf8(dst).unwrap()
    }

    #[test]
    fn test_count_uniq_single_field() {
        let br = Block::new(
            5,
            vec![Column::new_str(
                "x",
                vec!["a".into(), "b".into(), "a".into(), "".into(), "c".into()],
            )],
        );
        let f = vec!["x".to_string()];
        let mut a = CountUniqAccum::default();
        let delta = a.update_all(&f, &br);
        assert!(delta > 0);
        assert_eq!(out(|d| a.finalize(d)), "3");
    }

    #[test]
    fn test_count_uniq_tuples() {
        let br = Block::new(
            3,
            vec![
                Column::new_str("a", vec!["x".into(), "x".into(), "y".into()]),
                Column::new_str("b", vec!["1".into(), "2".into(), "1".into()]),
            ],
        );
        let f = vec!["a".to_string(), "b".to_string()];
        let mut a = CountUniqAccum::default();
        a.update_all(&f, &br);
        assert_eq!(out(|d| a.finalize(d)), "3");
    }

    #[test]
    fn test_count_uniq_merge() {
        let br = Block::new(2, vec![Column::new_str("x", vec!["a".into(), "b".into()])]);
        let f = vec!["x".to_string()];
        let mut a = CountUniqAccum::default();
        a.update_row(&f, &br, 0);
        let mut b = CountUniqAccum::default();
        b.update_row(&f, &br, 0);
        b.update_row(&f, &br, 1);
        a.merge(b);
        assert_eq!(out(|d| a.finalize(d)), "2");
    }

    #[test]
    fn test_count_uniq_hash() {
        let br = Block::new(
            4,
            vec![Column::new_str(
                "x",
                vec!["a".into(), "b".into(), "a".into(), "c".into()],
            )],
        );
        let f = vec!["x".to_string()];
        let mut a = CountUniqHashAccum::default();
        a.update_all(&f, &br);
        assert_eq!(out(|d| a.finalize(d)), "3");
    }

    #[test]
    fn test_uniq_values_sorted_json() {
        let br = Block::new(
            4,
            vec![Column::new_str(
                "x",
                vec!["b".into(), "a".into(), "b".into(), "".into()],
            )],
        );
        let f = vec!["x".to_string()];
        let mut a = UniqValuesAccum::default();
        a.update_all(&f, &br);
        let cancel = CancelToken::new();
        assert_eq!(out(|d| a.finalize(d, &cancel)), r#"["a","b"]"#);
    }

    #[test]
    fn test_uniq_values_cancelled_renders_nothing() {
        let br = Block::new(1, vec![Column::new_str("x", vec!["a".into()])]);
        let mut a = UniqValuesAccum::default();
        a.update_all(&["x".to_string()], &br);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(out(|d| a.finalize(d, &cancel)), "");
    }
}
