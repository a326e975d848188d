//! `count` and `count_empty`

use crate::data::values::format_u64;
use crate::data::{Block, Column, ColumnData};

use super::{is_star, target_columns};

/// `count(*)` counts rows; `count(f1, ...)` counts rows where at least
/// one named field is non-empty.
#[derive(Debug, Default)]
pub struct CountAccum {
    n: u64,
}

impl CountAccum {
    pub fn update_all(&mut self, fields: &[String], br: &Block) -> i64 {
        let rows = br.row_count();
        if is_star(fields) {
            self.n += rows as u64;
            return 0;
        }
        if let [field] = fields {
            self.n += count_non_empty(&br.get_column(field), rows);
            return 0;
        }
        let cols = target_columns(br, fields);
        for row in 0..rows {
            if cols.iter().any(|c| !c.is_empty_value(row)) {
                self.n += 1;
            }
        }
        0
    }

    pub fn update_row(&mut self, fields: &[String], br: &Block, row: usize) -> i64 {
        if is_star(fields) {
            self.n += 1;
            return 0;
        }
        let cols = target_columns(br, fields);
        if cols.iter().any(|c| !c.is_empty_value(row)) {
            self.n += 1;
        }
        0
    }

    pub fn merge(&mut self, other: CountAccum) {
        self.n += other.n;
    }

    pub fn finalize(&mut self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(format_u64(self.n).as_bytes());
    }
}

/// Counts rows where every named field is empty.
#[derive(Debug, Default)]
pub struct CountEmptyAccum {
    n: u64,
}

impl CountEmptyAccum {
    pub fn update_all(&mut self, fields: &[String], br: &Block) -> i64 {
        let rows = br.row_count();
        let cols = target_columns(br, fields);
        for row in 0..rows {
            if cols.iter().all(|c| c.is_empty_value(row)) {
                self.n += 1;
            }
        }
        0
    }

    pub fn update_row(&mut self, fields: &[String], br: &Block, row: usize) -> i64 {
        let cols = target_columns(br, fields);
        if cols.iter().all(|c| c.is_empty_value(row)) {
            self.n += 1;
        }
        0
    }

    pub fn merge(&mut self, other: CountEmptyAccum) {
        self.n += other.n;
    }

    pub fn finalize(&mut self, dst: &mut Vec<u8>) {
        dst.extend_from_slice(format_u64(self.n).as_bytes());
    }
}

fn count_non_empty(c: &Column, rows: usize) -> u64 {
    match &c.data {
        ColumnData::Const(v) => {
            if v.is_empty() {
                0
            } else {
                rows as u64
            }
        }
        ColumnData::Str(v) => v.iter().filter(|s| !s.is_empty()).count() as u64,
        ColumnData::Dict { dict, idxs } => {
            let non_empty: Vec<bool> = dict.iter().map(|s| !s.is_empty()).collect();
            idxs.iter().filter(|&&i| non_empty[i as usize]).count() as u64
        }
        _ => rows as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finalize_str(mut f: impl FnMut(&mut Vec<u8>)) -> String {
        let mut dst = Vec::new();
        f(&mut dst);
        String::from_utf8(dst).unwrap()
    }

    #[test]
    fn test_count_star() {
        let br = Block::new(3, vec![Column::new_str("a", vec!["".into(), "x".into(), "y".into()])]);
        let mut a = CountAccum::default();
        a.update_all(&["*".to_string()], &br);
        assert_eq!(finalize_str(|d| a.finalize(d)), "3");
    }

    #[test]
    fn test_count_named_fields() {
        let br = Block::new(
            3,
            vec![
                Column::new_str("a", vec!["".into(), "x".into(), "".into()]),
                Column::new_str("b", vec!["".into(), "".into(), "y".into()]),
            ],
        );
        let mut a = CountAccum::default();
        a.update_all(&["a".to_string(), "b".to_string()], &br);
        assert_eq!(finalize_str(|d| a.finalize(d)), "2");

        let mut a = CountAccum::default();
        a.update_all(&["a".to_string()], &br);
        assert_eq!(finalize_str(|d| a.finalize(d)), "1");
    }

    #[test]
    fn test_count_update_row_and_merge() {
        let br = Block::new(2, vec![Column::new_u64("n", vec![1, 2])]);
        let star = vec!["*".to_string()];
        let mut a = CountAccum::default();
        a.update_row(&star, &br, 0);
        let mut b = CountAccum::default();
        b.update_row(&star, &br, 1);
        a.merge(b);
        assert_eq!(finalize_str(|d| a.finalize(d)), "2");
    }

    #[test]
    fn test_count_empty() {
        let br = Block::new(
            3,
            vec![
                Column::new_str("a", vec!["".into(), "x".into(), "".into()]),
                Column::new_str("b", vec!["".into(), "".into(), "y".into()]),
            ],
        );
        let mut a = CountEmptyAccum::default();
        a.update_all(&["a".to_string(), "b".to_string()], &br);
        assert_eq!(finalize_str(|d| a.finalize(d)), "1");
    }

    #[test]
    fn test_count_empty_missing_column() {
        let br = Block::new(2, vec![Column::new_str("a", vec!["x".into(), "y".into()])]);
        let mut a = CountEmptyAccum::default();
        a.update_all(&["nosuch".to_string()], &br);
        assert_eq!(finalize_str(|d| a.finalize(d)), "2");
    }
}
