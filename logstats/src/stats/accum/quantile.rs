//! `quantile` and `median`

use crate::data::values::format_f64;
use crate::data::Block;

use super::{f64_at, for_each_f64, for_each_field_col};

/// Exact multiset of observed values; the memory budget is the guard
/// against unbounded growth. Quantiles are linearly interpolated between
/// order statistics, so the result is monotone in phi.
#[derive(Debug, Default)]
pub struct QuantileAccum {
    values: Vec<f64>,
}

impl QuantileAccum {
    pub fn update_all(&mut self, fields: &[String], br: &Block) -> i64 {
        let rows = br.row_count();
        let before = self.values.len();
        let values = &mut self.values;
        for_each_field_col(br, fields, |c| for_each_f64(c, rows, |x| values.push(x)));
        ((self.values.len() - before) * std::mem::size_of::<f64>()) as i64
    }

    pub fn update_row(&mut self, fields: &[String], br: &Block, row: usize) -> i64 {
        let before = self.values.len();
        let values = &mut self.values;
        for_each_field_col(br, fields, |c| {
            if let Some(x) = f64_at(c, row) {
                values.push(x);
            }
        });
        ((self.values.len() - before) * std::mem::size_of::<f64>()) as i64
    }

    pub fn merge(&mut self, other: QuantileAccum) {
        self.values.extend_from_slice(&other.values);
    }

    pub fn finalize(&mut self, phi: f64, dst: &mut Vec<u8>) {
        if self.values.is_empty() {
            return;
        }
        self.values.sort_unstable_by(|a, b| a.total_cmp(b));
        let phi = phi.clamp(0.0, 1.0);
        let n = self.values.len();
        let pos = phi * (n - 1) as f64;
        let lo = pos.floor() as usize;
        let hi = (lo + 1).min(n - 1);
        let frac = pos - lo as f64;
        let v = self.values[lo] * (1.0 - frac) + self.values[hi] * frac;
        dst.extend_from_slice(format_f64(v).as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Column;

    fn out(a: &mut QuantileAccum, phi: f64) -> String {
        let mut dst = Vec::new();
        a.finalize(phi, &mut dst);
        String::from_utf8(dst).unwrap()
    }

    #[test]
    fn test_quantile_small_inputs() {
        let br = Block::new(
            5,
            vec![Column::new_u64("x", vec![1, 2, 3, 4, 5])],
        );
        let f = vec!["x".to_string()];
        let mut a = QuantileAccum::default();
        let delta = a.update_all(&f, &br);
        assert_eq!(delta, 40);

        assert_eq!(out(&mut a, 0.0), "1");
        assert_eq!(out(&mut a, 0.5), "3");
        assert_eq!(out(&mut a, 1.0), "5");
    }

    #[test]
    fn test_quantile_interpolates() {
        let br = Block::new(2, vec![Column::new_u64("x", vec![1, 2])]);
        let f = vec!["x".to_string()];
        let mut a = QuantileAccum::default();
        a.update_all(&f, &br);
        assert_eq!(out(&mut a, 0.5), "1.5");
    }

    #[test]
    fn test_quantile_monotone_in_phi() {
        let br = Block::new(4, vec![Column::new_f64("x", vec![0.5, 9.0, 2.0, 4.25])]);
        let f = vec!["x".to_string()];
        let mut a = QuantileAccum::default();
        a.update_all(&f, &br);
        let mut prev = f64::NEG_INFINITY;
        for i in 0..=10 {
            let phi = i as f64 / 10.0;
            let v: f64 = out(&mut a, phi).parse().unwrap();
            assert!(v >= prev);
            prev = v;
        }
    }

    #[test]
    fn test_quantile_empty() {
        let mut a = QuantileAccum::default();
        assert_eq!(out(&mut a, 0.5), "");
    }

    #[test]
    fn test_quantile_merge() {
        let br = Block::new(3, vec![Column::new_u64("x", vec![1, 2, 3])]);
        let f = vec!["x".to_string()];
        let mut a = QuantileAccum::default();
        a.update_row(&f, &br, 0);
        let mut b = QuantileAccum::default();
        b.update_row(&f, &br, 1);
        b.update_row(&f, &br, 2);
        a.merge(b);
        assert_eq!(out(&mut a, 1.0), "3");
        assert_eq!(out(&mut a, 0.5), "2");
    }
}
