//! `row_any`, `row_min` and `row_max` — whole-row snapshots

use serde_json::{Map, Value};

use crate::data::Block;

use super::f64_at;

/// Which row the accumulator commits to keeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChoice {
    /// Some row among the matching ones; shard- and order-dependent.
    Any,
    /// The row minimizing the tracked field's numeric value.
    Min,
    /// The row maximizing the tracked field's numeric value.
    Max,
}

/// Snapshot of one entire row, plus the score that selected it for
/// `row_min`/`row_max`. Rows whose tracked field does not parse as a
/// finite number are never selected by min/max.
#[derive(Debug)]
pub struct RowAccum {
    choice: RowChoice,
    score: f64,
    has: bool,
    fields: Vec<(String, String)>,
}

impl RowAccum {
    pub fn new(choice: RowChoice) -> Self {
        Self {
            choice,
            score: 0.0,
            has: false,
            fields: Vec::new(),
        }
    }

    pub fn update_all(&mut self, score_field: Option<&str>, br: &Block) -> i64 {
        let rows = br.row_count();
        if rows == 0 {
            return 0;
        }
        match (self.choice, score_field) {
            (RowChoice::Any, _) => {
                if self.has {
                    0
                } else {
                    self.capture(br, 0, 0.0)
                }
            }
            (_, Some(field)) => {
                // Scan for the best row first so at most one capture runs
                // per block.
                let c = br.get_column(field);
                let mut best: Option<(usize, f64)> = None;
                for row in 0..rows {
                    let Some(score) = f64_at(&c, row) else {
                        continue;
                    };
                    let better = match best {
                        None => self.beats(score),
                        Some((_, b)) => self.better(score, b),
                    };
                    if better {
                        best = Some((row, score));
                    }
                }
                match best {
                    Some((row, score)) => self.capture(br, row, score),
                    None => 0,
                }
            }
            _ => panic!("BUG: row_min/row_max without a tracked field"),
        }
    }

    pub fn update_row(&mut self, score_field: Option<&str>, br: &Block, row: usize) -> i64 {
        match (self.choice, score_field) {
            (RowChoice::Any, _) => {
                if self.has {
                    0
                } else {
                    self.capture(br, row, 0.0)
                }
            }
            (_, Some(field)) => {
                let c = br.get_column(field);
                match f64_at(&c, row) {
                    Some(score) if self.beats(score) => self.capture(br, row, score),
                    _ => 0,
                }
            }
            _ => panic!("BUG: row_min/row_max without a tracked field"),
        }
    }

    /// Whether `score` would replace the currently held row.
    #[inline]
    fn beats(&self, score: f64) -> bool {
        !self.has || self.better(score, self.score)
    }

    #[inline]
    fn better(&self, a: f64, b: f64) -> bool {
        match self.choice {
            RowChoice::Any => false,
            RowChoice::Min => a < b,
            RowChoice::Max => a > b,
        }
    }

    fn capture(&mut self, br: &Block, row: usize, score: f64) -> i64 {
        let old: usize = self.fields.iter().map(|(n, v)| n.len() + v.len()).sum();
        self.fields.clear();
        let mut buf = String::new();
        for c in br.columns() {
            let v = c.value_into(row, &mut buf).to_string();
            self.fields.push((c.name.clone(), v));
        }
        self.score = score;
        self.has = true;
        let new: usize = self.fields.iter().map(|(n, v)| n.len() + v.len()).sum();
        new as i64 - old as i64
    }

    pub fn merge(&mut self, other: RowAccum) {
        if !other.has {
            return;
        }
        if !self.has || self.better(other.score, self.score) {
            self.score = other.score;
            self.fields = other.fields;
            self.has = true;
        }
    }

    /// Renders the captured row as a JSON object (keys sorted); empty when
    /// no row matched.
    pub fn finalize(&mut self, dst: &mut Vec<u8>) {
        if !self.has {
            return;
        }
        let mut obj = Map::new();
        for (name, value) in &self.fields {
            obj.insert(name.clone(), Value::String(value.clone()));
        }
        let start = dst.len();
        if serde_json::to_writer(&mut *dst, &Value::Object(obj)).is_err() {
            dst.truncate(start);
        }
    }
}
