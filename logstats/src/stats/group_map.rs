//! Per-shard group storage
//!
//! Three parallel maps route a grouping key to its [`StatsGroup`]:
//! non-negative integers, negative integers, and byte strings. Exactly
//! one map holds any given group; multi-field composite keys always live
//! in the string map. String keys are interned in a chunked arena and the
//! hash table stores group indexes only, so creating a group costs one
//! arena copy and no per-key heap allocation.

use std::hash::BuildHasher;

use ahash::{AHashMap, RandomState};
use hashbrown::HashTable;

use crate::data::{Bitmap, Block};
use crate::stats::accum::StatsAccum;
use crate::stats::FuncSpec;

/// Arena chunk size; keys longer than this get a dedicated chunk.
const ARENA_CHUNK_SIZE: usize = 64 * 1024;

/// Estimated per-group map bookkeeping, charged to the state-size budget
/// on group creation.
const GROUP_ENTRY_OVERHEAD: usize = 48;

/// Handle to a byte string interned in a [`KeyArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRef {
    chunk: u32,
    offset: u32,
    len: u32,
}

/// Chunked append-only byte storage for group keys. All keys are released
/// together when the arena drops, after the flush writer is done with
/// them.
#[derive(Debug, Default)]
pub struct KeyArena {
    chunks: Vec<Vec<u8>>,
}

impl KeyArena {
    pub fn alloc(&mut self, b: &[u8]) -> KeyRef {
        let need = b.len();
        let fits = self
            .chunks
            .last()
            .is_some_and(|c| c.capacity() - c.len() >= need);
        if !fits {
            self.chunks
                .push(Vec::with_capacity(ARENA_CHUNK_SIZE.max(need)));
        }
        let chunk_idx = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_idx];
        let offset = chunk.len();
        chunk.extend_from_slice(b);
        KeyRef {
            chunk: chunk_idx as u32,
            offset: offset as u32,
            len: need as u32,
        }
    }

    #[inline]
    pub fn get(&self, r: KeyRef) -> &[u8] {
        let start = r.offset as usize;
        &self.chunks[r.chunk as usize][start..start + r.len as usize]
    }
}

/// The grouping key of one group, as stored in its shard.
#[derive(Debug, Clone, Copy)]
pub enum GroupKey {
    U64(u64),
    Neg(i64),
    Str(KeyRef),
}

/// Aggregation state for one group: one accumulator per stats function,
/// positionally aligned with the pipe's function specs.
#[derive(Debug)]
pub struct StatsGroup {
    pub accums: Vec<StatsAccum>,
}

impl StatsGroup {
    pub fn new(funcs: &[FuncSpec]) -> (Self, usize) {
        let mut accums = Vec::with_capacity(funcs.len());
        let mut size = std::mem::size_of::<StatsGroup>()
            + funcs.len() * std::mem::size_of::<StatsAccum>();
        for spec in funcs {
            let (a, n) = StatsAccum::new(&spec.func);
            accums.push(a);
            size += n;
        }
        (Self { accums }, size)
    }

    /// Advance every accumulator for all rows of `br`. Functions carrying
    /// an `if` predicate see a projection of the block through their
    /// bitmap instead of the raw block.
    pub fn update_all(
        &mut self,
        funcs: &[FuncSpec],
        br: &Block,
        bitmaps: &[Bitmap],
        br_tmp: &mut Block,
    ) -> i64 {
        let mut n = 0i64;
        for (i, spec) in funcs.iter().enumerate() {
            let a = &mut self.accums[i];
            if spec.iff.is_none() {
                n += a.update_all(&spec.func, br);
                continue;
            }
            let bm = &bitmaps[i];
            if !bm.any_set() {
                continue;
            }
            if bm.all_set() {
                n += a.update_all(&spec.func, br);
                continue;
            }
            br.project_into(bm, br_tmp);
            n += a.update_all(&spec.func, br_tmp);
        }
        n
    }

    /// Advance every accumulator for one row; functions whose bitmap bit
    /// is unset are skipped.
    pub fn update_row(
        &mut self,
        funcs: &[FuncSpec],
        br: &Block,
        bitmaps: &[Bitmap],
        row: usize,
    ) -> i64 {
        let mut n = 0i64;
        for (i, spec) in funcs.iter().enumerate() {
            if spec.iff.is_some() && !bitmaps[i].get(row) {
                continue;
            }
            n += self.accums[i].update_row(&spec.func, br, row);
        }
        n
    }

    /// Positional merge of another group's accumulators.
    pub fn merge(&mut self, other: StatsGroup) {
        if self.accums.len() != other.accums.len() {
            panic!(
                "BUG: merging groups with {} and {} accumulators",
                self.accums.len(),
                other.accums.len()
            );
        }
        for (a, b) in self.accums.iter_mut().zip(other.accums) {
            a.merge(b);
        }
    }
}

/// The per-shard key → group index. Group bodies live in a flat vector
/// addressed by `u32` handles; the sub-maps only store handles.
#[derive(Default)]
pub struct GroupMap {
    hasher: RandomState,
    u64_map: AHashMap<u64, u32>,
    neg_map: AHashMap<i64, u32>,
    str_map: HashTable<u32>,
    keys: Vec<GroupKey>,
    groups: Vec<StatsGroup>,
    arena: KeyArena,
}

impl GroupMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    #[inline]
    pub fn group_mut(&mut self, idx: u32) -> &mut StatsGroup {
        &mut self.groups[idx as usize]
    }

    /// Look up or create the group for a non-negative integer key.
    /// Returns the group handle and the state-size delta of any creation.
    pub fn get_or_create_u64(&mut self, key: u64, funcs: &[FuncSpec]) -> (u32, i64) {
        if let Some(&idx) = self.u64_map.get(&key) {
            return (idx, 0);
        }
        let (group, size) = StatsGroup::new(funcs);
        let idx = self.push_group(GroupKey::U64(key), group);
        self.u64_map.insert(key, idx);
        (idx, (size + GROUP_ENTRY_OVERHEAD + std::mem::size_of::<u64>()) as i64)
    }

    /// Look up or create the group for a negative integer key.
    pub fn get_or_create_neg(&mut self, key: i64, funcs: &[FuncSpec]) -> (u32, i64) {
        debug_assert!(key < 0, "BUG: non-negative key {key} in the negative map");
        if let Some(&idx) = self.neg_map.get(&key) {
            return (idx, 0);
        }
        let (group, size) = StatsGroup::new(funcs);
        let idx = self.push_group(GroupKey::Neg(key), group);
        self.neg_map.insert(key, idx);
        (idx, (size + GROUP_ENTRY_OVERHEAD + std::mem::size_of::<i64>()) as i64)
    }

    /// Look up or create the group for a byte-string key (single-field
    /// non-integer values and all composite keys).
    pub fn get_or_create_str(&mut self, key: &[u8], funcs: &[FuncSpec]) -> (u32, i64) {
        let hash = self.hasher.hash_one(key);
        let keys = &self.keys;
        let arena = &self.arena;
        if let Some(&idx) = self.str_map.find(hash, |&i| match keys[i as usize] {
            GroupKey::Str(r) => arena.get(r) == key,
            _ => false,
        }) {
            return (idx, 0);
        }

        let (group, size) = StatsGroup::new(funcs);
        let r = self.arena.alloc(key);
        let idx = self.push_group(GroupKey::Str(r), group);
        let (keys, arena, hasher) = (&self.keys, &self.arena, &self.hasher);
        self.str_map.insert_unique(hash, idx, |&i| match keys[i as usize] {
            GroupKey::Str(r) => hasher.hash_one(arena.get(r)),
            _ => panic!("BUG: non-string key in the string sub-map"),
        });
        (idx, (size + GROUP_ENTRY_OVERHEAD + key.len()) as i64)
    }

    fn push_group(&mut self, key: GroupKey, group: StatsGroup) -> u32 {
        let idx = self.groups.len() as u32;
        self.keys.push(key);
        self.groups.push(group);
        idx
    }

    /// Tear the map down into its arena and `(key, group)` pairs for the
    /// flush-time scatter. The index memory is released here; the arena
    /// must outlive every returned `KeyRef`.
    pub fn into_parts(self) -> (KeyArena, Vec<(GroupKey, StatsGroup)>) {
        let pairs = self.keys.into_iter().zip(self.groups).collect();
        (self.arena, pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsFunc;

    fn count_funcs() -> Vec<FuncSpec> {
        vec![FuncSpec {
            func: StatsFunc::Count {
                fields: vec!["*".to_string()],
            },
            iff: None,
            result_name: "n".to_string(),
        }]
    }

    #[test]
    fn test_key_arena_roundtrip() {
        let mut arena = KeyArena::default();
        let a = arena.alloc(b"hello");
        let b = arena.alloc(b"");
        let big = vec![7u8; ARENA_CHUNK_SIZE + 1];
        let c = arena.alloc(&big);
        let d = arena.alloc(b"after-big");

        assert_eq!(arena.get(a), b"hello");
        assert_eq!(arena.get(b), b"");
        assert_eq!(arena.get(c), big.as_slice());
        assert_eq!(arena.get(d), b"after-big");
    }

    #[test]
    fn test_group_map_routing() {
        let funcs = count_funcs();
        let mut m = GroupMap::new();

        let (a, d1) = m.get_or_create_u64(5, &funcs);
        let (b, d2) = m.get_or_create_u64(5, &funcs);
        assert_eq!(a, b);
        assert!(d1 > 0);
        assert_eq!(d2, 0);

        let (c, _) = m.get_or_create_neg(-5, &funcs);
        let (d, _) = m.get_or_create_str(b"5.5", &funcs);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn test_group_map_str_keys_distinct() {
        let funcs = count_funcs();
        let mut m = GroupMap::new();
        let (a, _) = m.get_or_create_str(b"foo", &funcs);
        let (b, _) = m.get_or_create_str(b"bar", &funcs);
        let (c, _) = m.get_or_create_str(b"foo", &funcs);
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_group_map_many_str_keys() {
        let funcs = count_funcs();
        let mut m = GroupMap::new();
        for i in 0..10_000 {
            let key = format!("key-{i}");
            m.get_or_create_str(key.as_bytes(), &funcs);
        }
        assert_eq!(m.len(), 10_000);
        // Every key still resolves to its original group.
        let (idx, delta) = m.get_or_create_str(b"key-1234", &funcs);
        assert_eq!(delta, 0);
        assert!(idx < 10_000);
    }

    #[test]
    fn test_group_map_into_parts() {
        let funcs = count_funcs();
        let mut m = GroupMap::new();
        m.get_or_create_u64(7, &funcs);
        m.get_or_create_str(b"x", &funcs);

        let (arena, pairs) = m.into_parts();
        assert_eq!(pairs.len(), 2);
        let mut saw_u64 = false;
        let mut saw_str = false;
        for (key, _) in &pairs {
            match key {
                GroupKey::U64(v) => {
                    assert_eq!(*v, 7);
                    saw_u64 = true;
                }
                GroupKey::Str(r) => {
                    assert_eq!(arena.get(*r), b"x");
                    saw_str = true;
                }
                GroupKey::Neg(_) => panic!("unexpected negative key"),
            }
        }
        assert!(saw_u64 && saw_str);
    }
}
