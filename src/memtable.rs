//! Multi-column-family memtable.
//!
//! Each column family owns a `crossbeam_skiplist::SkipMap` keyed by internal
//! key, so readers are lock-free and writers contend only on CAS inside the
//! skiplist. All column families charge their allocations into one shared
//! [`Arena`], whose running total is the published memtable size used for
//! rotation thresholds.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

use crate::error::{Error, Result};
use crate::format::{self, Value};

/// Accounting overhead charged per inserted node.
pub const ESTIMATED_NODE_SIZE: usize = 64;

/// Append-only allocation budget shared by all skiplists of one memtable.
/// Charges are rounded up to 8-byte alignment; allocation fails only once
/// the configured cap is exceeded.
pub struct Arena {
    offset: AtomicUsize,
    cap: usize,
}

impl Arena {
    pub fn new(cap: usize) -> Self {
        Self {
            offset: AtomicUsize::new(0),
            cap,
        }
    }

    pub fn alloc(&self, len: usize) -> Result<()> {
        let aligned = (len + 7) & !7;
        let end = self.offset.fetch_add(aligned, Ordering::SeqCst) + aligned;
        if end > self.cap {
            self.offset.fetch_sub(aligned, Ordering::SeqCst);
            return Err(Error::Alloc);
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.offset.load(Ordering::SeqCst)
    }
}

/// A write-batch entry routed into a memtable.
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: Bytes,
    pub value: Value,
}

impl Entry {
    pub fn new(key: Bytes, value: Value) -> Self {
        Self { key, value }
    }

    pub fn estimated_size(&self) -> usize {
        self.key.len() + self.value.encoded_size() + ESTIMATED_NODE_SIZE
    }
}

/// Memoized result of the previous lookup in one column family. Sequential
/// reads of the same user key (common when a transaction re-checks its own
/// write) skip the skiplist seek entirely.
#[derive(Default)]
pub struct Hint {
    key: Vec<u8>,
    version: u64,
    result: Option<Value>,
    valid: bool,
}

impl Hint {
    pub fn reset(&mut self) {
        self.valid = false;
    }
}

struct Skiplist {
    map: SkipMap<Bytes, Bytes>,
    managed: bool,
}

impl Skiplist {
    fn put(&self, arena: &Arena, key: &[u8], value: Value) -> Result<()> {
        arena.alloc(key.len() + value.encoded_size() + ESTIMATED_NODE_SIZE)?;
        let version = if self.managed { value.version } else { 0 };
        let ikey = format::encode_internal(key, version);
        self.map.insert(ikey, value.encode());
        Ok(())
    }

    fn get(&self, key: &[u8], version: u64) -> Option<Value> {
        let version = if self.managed { version } else { 0 };
        let seek = format::encode_internal(key, version);
        let entry = self
            .map
            .lower_bound(std::ops::Bound::Included(&seek[..]))?;
        let (user_key, _) = format::split_internal(entry.key());
        if user_key != key {
            return None;
        }
        Value::decode(entry.value().clone()).ok()
    }
}

/// One memtable: a skiplist per column family over a shared arena, a commit
/// version assigned when the table is sealed, and a one-way flushing flag.
pub struct CfTable {
    skls: Vec<Skiplist>,
    arena: Arc<Arena>,
    version: AtomicU64,
    flushing: AtomicBool,
}

impl CfTable {
    pub fn new(cf_managed: &[bool], arena_cap: usize) -> Self {
        let skls = cf_managed
            .iter()
            .map(|&managed| Skiplist {
                map: SkipMap::new(),
                managed,
            })
            .collect();
        Self {
            skls,
            arena: Arc::new(Arena::new(arena_cap)),
            version: AtomicU64::new(0),
            flushing: AtomicBool::new(false),
        }
    }

    pub fn num_cfs(&self) -> usize {
        self.skls.len()
    }

    pub fn put(&self, cf: usize, key: &[u8], value: Value) -> Result<()> {
        self.skls[cf].put(&self.arena, key, value)
    }

    pub fn put_entries(&self, cf: usize, entries: &[Entry]) -> Result<()> {
        let skl = &self.skls[cf];
        for entry in entries {
            skl.put(&self.arena, &entry.key, entry.value.clone())?;
        }
        Ok(())
    }

    /// Newest record with user key `key` and version at most `version`.
    /// Unmanaged column families ignore the version (logical version 0).
    pub fn get(&self, cf: usize, key: &[u8], version: u64) -> Option<Value> {
        self.skls[cf].get(key, version)
    }

    pub fn get_with_hint(
        &self,
        cf: usize,
        key: &[u8],
        version: u64,
        hint: &mut Hint,
    ) -> Option<Value> {
        if hint.valid && hint.version == version && hint.key == key {
            return hint.result.clone();
        }
        let result = self.skls[cf].get(key, version);
        hint.key.clear();
        hint.key.extend_from_slice(key);
        hint.version = version;
        hint.result = result.clone();
        hint.valid = true;
        result
    }

    pub fn size(&self) -> usize {
        self.arena.size()
    }

    pub fn empty(&self) -> bool {
        self.skls.iter().all(|s| s.map.is_empty())
    }

    pub fn cf_empty(&self, cf: usize) -> bool {
        self.skls[cf].map.is_empty()
    }

    /// Seal the table with its commit version. One-shot, performed by the
    /// shard while rotating.
    pub fn set_version(&self, version: u64) {
        debug_assert_eq!(self.version.load(Ordering::SeqCst), 0);
        self.version.store(version, Ordering::SeqCst);
    }

    /// Zero means the table has not been sealed yet.
    pub fn get_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Transition into the flushing state. Returns false if already flushing.
    pub fn mark_flushing(&self) -> bool {
        !self.flushing.swap(true, Ordering::SeqCst)
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    /// Iterate one column family in internal-key order (or reversed). The
    /// iterator sees a consistent prefix of the skiplist as of construction.
    pub fn iter(&self, cf: usize, reversed: bool) -> MemIter<'_> {
        MemIter {
            inner: if reversed {
                Box::new(self.skls[cf].map.iter().rev())
            } else {
                Box::new(self.skls[cf].map.iter())
            },
        }
    }
}

type SkipEntry<'a> = crossbeam_skiplist::map::Entry<'a, Bytes, Bytes>;

pub struct MemIter<'a> {
    inner: Box<dyn Iterator<Item = SkipEntry<'a>> + 'a>,
}

impl Iterator for MemIter<'_> {
    /// (internal key, encoded value record)
    type Item = (Bytes, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|e| (e.key().clone(), e.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn managed_table() -> CfTable {
        CfTable::new(&[true, false], 1 << 20)
    }

    #[test]
    fn test_put_get_versions() {
        let tbl = managed_table();
        tbl.put(0, b"k", Value::new(10, Bytes::from_static(b"v10")))
            .unwrap();
        tbl.put(0, b"k", Value::new(20, Bytes::from_static(b"v20")))
            .unwrap();

        let v = tbl.get(0, b"k", 15).unwrap();
        assert_eq!(v.value, Bytes::from_static(b"v10"));
        let v = tbl.get(0, b"k", 25).unwrap();
        assert_eq!(v.value, Bytes::from_static(b"v20"));
        assert!(tbl.get(0, b"k", 5).is_none());
        assert!(tbl.get(0, b"missing", u64::MAX).is_none());
    }

    #[test]
    fn test_overwrite_same_version() {
        let tbl = managed_table();
        tbl.put(0, b"k", Value::new(10, Bytes::from_static(b"a")))
            .unwrap();
        tbl.put(0, b"k", Value::new(10, Bytes::from_static(b"b")))
            .unwrap();
        assert_eq!(
            tbl.get(0, b"k", 10).unwrap().value,
            Bytes::from_static(b"b")
        );
        // Still a single record for (k, 10).
        assert_eq!(tbl.iter(0, false).count(), 1);
    }

    #[test]
    fn test_unmanaged_ignores_version() {
        let tbl = managed_table();
        tbl.put(1, b"k", Value::new(0, Bytes::from_static(b"v")))
            .unwrap();
        assert!(tbl.get(1, b"k", u64::MAX).is_some());
        assert!(tbl.get(1, b"k", 0).is_some());
    }

    #[test]
    fn test_iter_order() {
        let tbl = managed_table();
        tbl.put(0, b"b", Value::new(1, Bytes::from_static(b"1")))
            .unwrap();
        tbl.put(0, b"a", Value::new(2, Bytes::from_static(b"2")))
            .unwrap();
        tbl.put(0, b"a", Value::new(5, Bytes::from_static(b"5")))
            .unwrap();

        let keys: Vec<(Vec<u8>, u64)> = tbl
            .iter(0, false)
            .map(|(k, _)| {
                let (uk, v) = format::split_internal(&k);
                (uk.to_vec(), v)
            })
            .collect();
        // User keys ascending, versions descending per user key.
        assert_eq!(
            keys,
            vec![(b"a".to_vec(), 5), (b"a".to_vec(), 2), (b"b".to_vec(), 1)]
        );

        let rev: Vec<u64> = tbl
            .iter(0, true)
            .map(|(k, _)| format::split_internal(&k).1)
            .collect();
        assert_eq!(rev, vec![1, 2, 5]);
    }

    #[test]
    fn test_arena_cap() {
        let tbl = CfTable::new(&[true], 128);
        let big = Bytes::from(vec![0u8; 256]);
        assert!(matches!(
            tbl.put(0, b"k", Value::new(1, big)),
            Err(Error::Alloc)
        ));
    }

    #[test]
    fn test_size_grows() {
        let tbl = managed_table();
        assert_eq!(tbl.size(), 0);
        tbl.put(0, b"key", Value::new(1, Bytes::from_static(b"value")))
            .unwrap();
        assert!(tbl.size() >= b"key".len() + b"value".len());
        assert!(!tbl.empty());
    }

    #[test]
    fn test_seal_and_flush_flags() {
        let tbl = managed_table();
        assert_eq!(tbl.get_version(), 0);
        tbl.set_version(7);
        assert_eq!(tbl.get_version(), 7);

        assert!(tbl.mark_flushing());
        assert!(!tbl.mark_flushing());
        assert!(tbl.is_flushing());
    }

    #[test]
    fn test_hint_memoizes() {
        let tbl = managed_table();
        tbl.put(0, b"k", Value::new(10, Bytes::from_static(b"v")))
            .unwrap();
        let mut hint = Hint::default();
        let first = tbl.get_with_hint(0, b"k", 20, &mut hint).unwrap();
        let second = tbl.get_with_hint(0, b"k", 20, &mut hint).unwrap();
        assert_eq!(first.value, second.value);
        assert!(tbl.get_with_hint(0, b"other", 20, &mut hint).is_none());
    }
}
