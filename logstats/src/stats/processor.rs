//! Stats pipe processor: sharded ingestion under a global memory budget
//!
//! One shard per upstream worker; a worker only ever touches its own
//! shard, so the per-row path takes no locks beyond the shard's own
//! (uncontended) mutex. Shards draw memory budget from a shared atomic in
//! fixed chunks; when the global budget runs dry the pipeline is
//! cancelled and `flush` reports the overflow.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::data::values::{marshal_bytes, parse_canonical_neg_i64, parse_canonical_u64};
use crate::data::{Bitmap, Block, ColumnData};
use crate::pipe::{CancelToken, PipeProcessor};
use crate::stats::bucket;
use crate::stats::group_map::GroupMap;
use crate::stats::{FuncSpec, StatsPipe};
use crate::Result;

/// Budget slice a shard draws from the global counter at a time.
pub const STATE_SIZE_BUDGET_CHUNK: i64 = 1 << 20;

/// Pads each shard to a 128-byte boundary so adjacent shards never share
/// a cache line.
#[repr(align(128))]
pub(crate) struct Padded<T>(pub T);

/// The `| stats ...` pipe stage.
pub struct StatsProcessor {
    pub(crate) pipe: Arc<StatsPipe>,
    pub(crate) cancel: Arc<CancelToken>,
    pub(crate) next: Arc<dyn PipeProcessor>,
    pub(crate) shards: Vec<Padded<Mutex<StatsShard>>>,
    pub(crate) max_state_size: i64,
    pub(crate) state_size_budget: AtomicI64,
}

impl StatsProcessor {
    pub(crate) fn new(
        pipe: Arc<StatsPipe>,
        workers_count: usize,
        allowed_memory: usize,
        cancel: Arc<CancelToken>,
        next: Arc<dyn PipeProcessor>,
    ) -> Self {
        let mut max_state_size = (allowed_memory as f64 * 0.3) as i64;
        let n_funcs = pipe.funcs.len();
        let workers_count = workers_count.max(1);
        let mut shards = Vec::with_capacity(workers_count);
        for _ in 0..workers_count {
            shards.push(Padded(Mutex::new(StatsShard::new(n_funcs))));
            max_state_size -= STATE_SIZE_BUDGET_CHUNK;
        }
        let psp = Self {
            pipe,
            cancel,
            next,
            shards,
            max_state_size,
            state_size_budget: AtomicI64::new(0),
        };
        psp.state_size_budget.store(max_state_size, Ordering::SeqCst);
        psp
    }

    pub(crate) fn budget_error(&self) -> crate::StatsError {
        crate::StatsError::StateSizeBudgetExceeded {
            pipe: self.pipe.to_string(),
            limit_mb: self.max_state_size / (1 << 20),
        }
    }
}

impl PipeProcessor for StatsProcessor {
    fn write_block(&self, worker_id: usize, br: &Block) {
        if br.row_count() == 0 || self.cancel.is_cancelled() {
            return;
        }

        let mut shard = self.shards[worker_id].0.lock();

        while shard.state_size_budget < 0 {
            // Steal a budget chunk for the shard from the global counter.
            let prev = self
                .state_size_budget
                .fetch_sub(STATE_SIZE_BUDGET_CHUNK, Ordering::SeqCst);
            let remaining = prev - STATE_SIZE_BUDGET_CHUNK;
            if remaining < 0 {
                // The state size is too big; stop ingesting to avoid OOM.
                if prev >= 0 {
                    // This call crossed the threshold: tell the upstream
                    // workers to stop producing blocks.
                    self.cancel.cancel();
                }
                return;
            }
            shard.state_size_budget += STATE_SIZE_BUDGET_CHUNK;
        }

        shard.write_block(&self.pipe, br);
    }

    fn flush(&self) -> Result<()> {
        self.flush_impl()
    }
}

/// Per-worker aggregation state. Only its owning worker touches it during
/// ingestion.
pub(crate) struct StatsShard {
    pub(crate) map: GroupMap,
    bitmaps: Vec<Bitmap>,
    br_tmp: Block,
    column_values: Vec<Vec<String>>,
    key_buf: Vec<u8>,
    pub(crate) state_size_budget: i64,
}

impl StatsShard {
    fn new(n_funcs: usize) -> Self {
        Self {
            map: GroupMap::new(),
            bitmaps: vec![Bitmap::new(); n_funcs],
            br_tmp: Block::empty(),
            column_values: Vec::new(),
            key_buf: Vec::new(),
            state_size_budget: STATE_SIZE_BUDGET_CHUNK,
        }
    }

    fn write_block(&mut self, pipe: &StatsPipe, br: &Block) {
        // Refresh the per-function row masks before touching any group.
        for (i, spec) in pipe.funcs.iter().enumerate() {
            if let Some(iff) = &spec.iff {
                self.bitmaps[i] = iff.eval(br);
            }
        }

        let StatsShard {
            map,
            bitmaps,
            br_tmp,
            column_values,
            key_buf,
            state_size_budget,
        } = self;
        let funcs = &pipe.funcs;
        let by_fields = &pipe.by_fields;
        let rows = br.row_count();

        if by_fields.is_empty() {
            // Single group with the empty key.
            let (idx, d) = map.get_or_create_str(b"", funcs);
            *state_size_budget -= d;
            *state_size_budget -= map.group_mut(idx).update_all(funcs, br, bitmaps, br_tmp);
            return;
        }

        if let [bf] = by_fields.as_slice() {
            let c = br.get_column(&bf.name);
            if c.is_const() {
                let v = bucket::bucket_value(c.const_value(), bf);
                let (idx, d) = route_value(map, &v, funcs);
                *state_size_budget -= d;
                *state_size_budget -= map.group_mut(idx).update_all(funcs, br, bitmaps, br_tmp);
                return;
            }

            // Integer-typed column without a bucket config: group on the
            // native values, one probe per consecutive run.
            if !bf.has_bucket_config() {
                match &c.data {
                    ColumnData::Uint8(vs) => {
                        update_int_runs(
                            map,
                            funcs,
                            br,
                            bitmaps,
                            br_tmp,
                            state_size_budget,
                            vs.iter().map(|&v| i64::from(v)),
                        );
                        return;
                    }
                    ColumnData::Uint16(vs) => {
                        update_int_runs(
                            map,
                            funcs,
                            br,
                            bitmaps,
                            br_tmp,
                            state_size_budget,
                            vs.iter().map(|&v| i64::from(v)),
                        );
                        return;
                    }
                    ColumnData::Uint32(vs) => {
                        update_int_runs(
                            map,
                            funcs,
                            br,
                            bitmaps,
                            br_tmp,
                            state_size_budget,
                            vs.iter().map(|&v| i64::from(v)),
                        );
                        return;
                    }
                    ColumnData::Uint64(vs) if vs.iter().all(|&v| v <= i64::MAX as u64) => {
                        update_int_runs(
                            map,
                            funcs,
                            br,
                            bitmaps,
                            br_tmp,
                            state_size_budget,
                            vs.iter().map(|&v| v as i64),
                        );
                        return;
                    }
                    ColumnData::Int64(vs) => {
                        update_int_runs(
                            map,
                            funcs,
                            br,
                            bitmaps,
                            br_tmp,
                            state_size_budget,
                            vs.iter().copied(),
                        );
                        return;
                    }
                    _ => {}
                }
            }

            let values = bucket::bucketed_values(&c, rows, bf);
            if all_equal(&values) {
                let (idx, d) = route_value(map, &values[0], funcs);
                *state_size_budget -= d;
                *state_size_budget -= map.group_mut(idx).update_all(funcs, br, bitmaps, br_tmp);
                return;
            }

            // Generic path: one probe per consecutive run of equal values.
            let mut idx = 0u32;
            for row in 0..rows {
                if row == 0 || values[row - 1] != values[row] {
                    let (i, d) = route_value(map, &values[row], funcs);
                    idx = i;
                    *state_size_budget -= d;
                }
                *state_size_budget -= map.group_mut(idx).update_row(funcs, br, bitmaps, row);
            }
            return;
        }

        // Multiple by-fields: group on a composite length-prefixed key.
        column_values.clear();
        for bf in by_fields {
            let c = br.get_column(&bf.name);
            column_values.push(bucket::bucketed_values(&c, rows, bf));
        }

        if column_values.iter().all(|vs| all_equal(vs)) {
            key_buf.clear();
            for vs in column_values.iter() {
                marshal_bytes(key_buf, vs[0].as_bytes());
            }
            let (idx, d) = map.get_or_create_str(key_buf, funcs);
            *state_size_budget -= d;
            *state_size_budget -= map.group_mut(idx).update_all(funcs, br, bitmaps, br_tmp);
            return;
        }

        // The slowest path: rebuild the composite key only when the tuple
        // changes between consecutive rows.
        let mut idx = 0u32;
        for row in 0..rows {
            let same_tuple =
                row > 0 && column_values.iter().all(|vs| vs[row - 1] == vs[row]);
            if !same_tuple {
                key_buf.clear();
                for vs in column_values.iter() {
                    marshal_bytes(key_buf, vs[row].as_bytes());
                }
                let (i, d) = map.get_or_create_str(key_buf, funcs);
                idx = i;
                *state_size_budget -= d;
            }
            *state_size_budget -= map.group_mut(idx).update_row(funcs, br, bitmaps, row);
        }
    }
}

/// Route a bucketed value to its typed sub-map: canonical non-negative
/// integers to the u64 map, canonical negative integers to the negative
/// map, everything else to the string map.
fn route_value(map: &mut GroupMap, v: &str, funcs: &[FuncSpec]) -> (u32, i64) {
    if let Some(u) = parse_canonical_u64(v) {
        map.get_or_create_u64(u, funcs)
    } else if let Some(n) = parse_canonical_neg_i64(v) {
        map.get_or_create_neg(n, funcs)
    } else {
        map.get_or_create_str(v.as_bytes(), funcs)
    }
}

fn update_int_runs(
    map: &mut GroupMap,
    funcs: &[FuncSpec],
    br: &Block,
    bitmaps: &[Bitmap],
    br_tmp: &mut Block,
    state_size_budget: &mut i64,
    keys: impl Iterator<Item = i64>,
) {
    let mut idx = 0u32;
    let mut last: Option<i64> = None;
    for (row, key) in keys.enumerate() {
        if last != Some(key) {
            let (i, d) = if key >= 0 {
                map.get_or_create_u64(key as u64, funcs)
            } else {
                map.get_or_create_neg(key, funcs)
            };
            idx = i;
            *state_size_budget -= d;
            last = Some(key);
        }
        *state_size_budget -= map.group_mut(idx).update_row(funcs, br, bitmaps, row);
    }
}

fn all_equal(values: &[String]) -> bool {
    match values.split_first() {
        Some((first, rest)) => rest.iter().all(|v| v == first),
        None => false,
    }
}
