//! Flush-time merge and output
//!
//! After every upstream writer finishes, the per-shard maps are torn down
//! and re-sharded by key hash into one bucket per CPU, merged across
//! shards within each bucket, and written to the next pipe stage by one
//! writer per bucket. Shard arenas stay alive until the writers are done,
//! so group keys are only ever moved, never copied.

use std::mem;

use hashbrown::HashTable;
use rayon::prelude::*;
use xxhash_rust::xxh64::xxh64;

use crate::data::values::{format_i64, format_u64, unmarshal_bytes};
use crate::data::{Block, Column};
use crate::stats::group_map::{GroupKey, KeyArena, StatsGroup};
use crate::stats::processor::StatsProcessor;
use crate::Result;

/// Flush the accumulated value bytes to the next pipe once they cross
/// this threshold.
const MAX_VALUES_BLOCK_LEN: usize = 64_000;

/// One group in flight between the scatter and the writer.
struct MergedEntry {
    hash: u64,
    shard: u32,
    key: GroupKey,
    group: StatsGroup,
}

impl StatsProcessor {
    pub(crate) fn flush_impl(&self) -> Result<()> {
        if self.state_size_budget.load(std::sync::atomic::Ordering::SeqCst) <= 0 {
            return Err(self.budget_error());
        }

        // Tear the shard maps down; arenas must outlive the writers.
        let mut arenas: Vec<KeyArena> = Vec::with_capacity(self.shards.len());
        let mut per_shard: Vec<Vec<(GroupKey, StatsGroup)>> = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let map = mem::take(&mut shard.0.lock().map);
            let (arena, pairs) = map.into_parts();
            arenas.push(arena);
            per_shard.push(pairs);
        }
        let total_groups: usize = per_shard.iter().map(Vec::len).sum();

        let cpus = rayon::current_num_threads().max(1);

        // Step 1: re-shard every group by key hash into cpu-local buckets,
        // one scatter task per source shard.
        let scattered: Vec<Vec<Vec<MergedEntry>>> = per_shard
            .into_par_iter()
            .enumerate()
            .map(|(shard_idx, pairs)| {
                let arena = &arenas[shard_idx];
                let mut buckets: Vec<Vec<MergedEntry>> =
                    (0..cpus).map(|_| Vec::new()).collect();
                for (key, group) in pairs {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    let hash = key_hash(&key, arena);
                    buckets[(hash % cpus as u64) as usize].push(MergedEntry {
                        hash,
                        shard: shard_idx as u32,
                        key,
                        group,
                    });
                }
                buckets
            })
            .collect();

        if self.state_size_budget.load(std::sync::atomic::Ordering::SeqCst) <= 0 {
            return Err(self.budget_error());
        }
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        // Step 2: fan-in merge across shards, one task per cpu bucket.
        let mut by_cpu: Vec<Vec<Vec<MergedEntry>>> = (0..cpus).map(|_| Vec::new()).collect();
        for shard_buckets in scattered {
            for (cpu, bucket) in shard_buckets.into_iter().enumerate() {
                by_cpu[cpu].push(bucket);
            }
        }
        let mut merged: Vec<HashTable<MergedEntry>> = by_cpu
            .into_par_iter()
            .map(|lists| self.merge_bucket(lists, &arenas))
            .collect();

        if self.state_size_budget.load(std::sync::atomic::Ordering::SeqCst) <= 0 {
            return Err(self.budget_error());
        }
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        log::debug!(
            "stats flush: scattered {} groups from {} shards into {} buckets",
            total_groups,
            arenas.len(),
            cpus
        );

        // Step 3: a `by`-less pipe emits exactly one row even with no
        // matching input rows.
        if self.pipe.by_fields.is_empty() && merged.iter().all(|t| t.is_empty()) {
            let (group, _) = StatsGroup::new(&self.pipe.funcs);
            merged[0].insert_unique(
                0,
                MergedEntry {
                    hash: 0,
                    shard: 0,
                    key: GroupKey::U64(0),
                    group,
                },
                |e| e.hash,
            );
        }

        // Step 4: one writer per non-empty bucket, each with its own
        // downstream worker id.
        merged
            .into_par_iter()
            .enumerate()
            .for_each(|(cpu, table)| {
                if !table.is_empty() {
                    self.write_bucket(cpu, table, &arenas);
                }
            });

        Ok(())
    }

    fn merge_bucket(
        &self,
        lists: Vec<Vec<MergedEntry>>,
        arenas: &[KeyArena],
    ) -> HashTable<MergedEntry> {
        let mut table: HashTable<MergedEntry> = HashTable::new();
        for entries in lists {
            for e in entries {
                // Bucket maps can be large; bail out promptly once the
                // pipeline is cancelled.
                if self.cancel.is_cancelled() {
                    return table;
                }
                if let Some(m) = table.find_mut(e.hash, |m| {
                    same_key(&m.key, m.shard, &e.key, e.shard, arenas)
                }) {
                    m.group.merge(e.group);
                    continue;
                }
                table.insert_unique(e.hash, e, |m| m.hash);
            }
        }
        table
    }

    fn write_bucket(&self, cpu: usize, table: HashTable<MergedEntry>, arenas: &[KeyArena]) {
        let by_fields = &self.pipe.by_fields;
        let funcs = &self.pipe.funcs;

        let mut names: Vec<String> = Vec::with_capacity(by_fields.len() + funcs.len());
        for bf in by_fields {
            names.push(bf.name.clone());
        }
        for spec in funcs {
            names.push(spec.result_name.clone());
        }
        let mut columns: Vec<Vec<String>> = vec![Vec::new(); names.len()];

        let mut rows = 0usize;
        let mut values_len = 0usize;
        let mut finalize_buf: Vec<u8> = Vec::new();
        for mut e in table {
            if self.cancel.is_cancelled() {
                return;
            }

            match by_fields.len() {
                0 => {}
                1 => {
                    let v = match e.key {
                        GroupKey::U64(n) => format_u64(n),
                        GroupKey::Neg(n) => format_i64(n),
                        GroupKey::Str(r) => {
                            String::from_utf8_lossy(arenas[e.shard as usize].get(r)).into_owned()
                        }
                    };
                    values_len += v.len();
                    columns[0].push(v);
                }
                n_by => {
                    let GroupKey::Str(r) = e.key else {
                        panic!("BUG: composite group key stored outside the string map");
                    };
                    let mut key_bytes = arenas[e.shard as usize].get(r);
                    let mut decoded = 0usize;
                    while !key_bytes.is_empty() {
                        let Some((v, n)) = unmarshal_bytes(key_bytes) else {
                            panic!("BUG: cannot unmarshal by-field value from group key");
                        };
                        key_bytes = &key_bytes[n..];
                        if decoded == n_by {
                            break;
                        }
                        let v = String::from_utf8_lossy(v).into_owned();
                        values_len += v.len();
                        columns[decoded].push(v);
                        decoded += 1;
                    }
                    assert!(
                        decoded == n_by && key_bytes.is_empty(),
                        "BUG: decoded {decoded} by-field values from group key; want {n_by}"
                    );
                }
            }

            for (i, spec) in funcs.iter().enumerate() {
                finalize_buf.clear();
                let v = e.group.accums[i].finalize(
                    &spec.func,
                    self.pipe.step_seconds,
                    &mut finalize_buf,
                    &self.cancel,
                );
                values_len += v.len();
                columns[by_fields.len() + i].push(v.to_string());
            }
            rows += 1;

            if values_len >= MAX_VALUES_BLOCK_LEN {
                self.emit(cpu, &names, &mut columns, rows);
                rows = 0;
                values_len = 0;
            }
        }

        if rows > 0 {
            self.emit(cpu, &names, &mut columns, rows);
        }
    }

    fn emit(&self, cpu: usize, names: &[String], columns: &mut [Vec<String>], rows: usize) {
        let cols: Vec<Column> = names
            .iter()
            .zip(columns.iter_mut())
            .map(|(name, values)| Column::new_str(name.clone(), mem::take(values)))
            .collect();
        let br = Block::new(rows, cols);
        self.next.write_block(cpu, &br);
    }
}

fn key_hash(key: &GroupKey, arena: &KeyArena) -> u64 {
    match key {
        GroupKey::U64(v) => xxh64(&v.to_le_bytes(), 0),
        GroupKey::Neg(v) => xxh64(&v.to_le_bytes(), 0),
        GroupKey::Str(r) => xxh64(arena.get(*r), 0),
    }
}

fn same_key(a: &GroupKey, a_shard: u32, b: &GroupKey, b_shard: u32, arenas: &[KeyArena]) -> bool {
    match (a, b) {
        (GroupKey::U64(x), GroupKey::U64(y)) => x == y,
        (GroupKey::Neg(x), GroupKey::Neg(y)) => x == y,
        (GroupKey::Str(x), GroupKey::Str(y)) => {
            arenas[a_shard as usize].get(*x) == arenas[b_shard as usize].get(*y)
        }
        _ => false,
    }
}
