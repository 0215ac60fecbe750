//! Shards: the unit of LSM instantiation and isolation.
//!
//! A shard owns an atomically-published memtable slice (index 0 is the
//! writable table), an L0 slice sorted by commit version descending, and a
//! level-handler stack per column family. Readers capture `Arc`s to the
//! published slices and never block writers; all metadata edits serialize
//! on the shard mutex and swap whole slices.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::levels::LevelHandler;
use crate::manifest::ShardMeta;
use crate::memtable::CfTable;
use crate::sstable::L0Table;
use crate::write_batch::WriteBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SplitStage {
    Initial = 0,
    PreSplit = 1,
    SplitFileDone = 2,
    SplitDone = 3,
}

impl SplitStage {
    pub fn from_u8(v: u8) -> SplitStage {
        match v {
            0 => SplitStage::Initial,
            1 => SplitStage::PreSplit,
            2 => SplitStage::SplitFileDone,
            _ => SplitStage::SplitDone,
        }
    }
}

/// Present only between pre-split and finish-split: the ordered split keys
/// and one memtable per prospective child shard.
pub struct SplitContext {
    pub keys: Vec<Bytes>,
    pub mem_tbls: Vec<Arc<CfTable>>,
}

pub struct ShardCf {
    levels: Vec<RwLock<Arc<LevelHandler>>>,
}

impl ShardCf {
    fn new(max_levels: usize) -> Self {
        Self {
            levels: (1..=max_levels)
                .map(|l| RwLock::new(Arc::new(LevelHandler::new(l))))
                .collect(),
        }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Level numbering starts at 1.
    pub fn level(&self, level: usize) -> Arc<LevelHandler> {
        self.levels[level - 1].read().clone()
    }

    pub fn set_level(&self, handler: LevelHandler) {
        let slot = &self.levels[handler.level() - 1];
        *slot.write() = Arc::new(handler);
    }
}

pub struct Shard {
    pub id: u64,
    pub ver: u64,
    pub start: Bytes,
    /// Empty means unbounded.
    pub end: Bytes,

    cf_managed: Vec<bool>,
    max_mem_table_size: usize,
    arena_cap: usize,

    mem_tbls: RwLock<Arc<Vec<Arc<CfTable>>>>,
    l0_tbls: RwLock<Arc<Vec<Arc<L0Table>>>>,
    cfs: Vec<ShardCf>,

    split_ctx: RwLock<Option<Arc<SplitContext>>>,
    split_stage: AtomicU8,

    passive: AtomicBool,
    initial_flushed: AtomicBool,
    unusable: AtomicBool,
    being_compacted: AtomicBool,

    base_version: u64,
    /// Last commit version handed out by [`Shard::alloc_commit_version`].
    commit_version: AtomicU64,

    properties: Mutex<HashMap<String, Bytes>>,

    /// Serializes metadata edits: rotation, L0 publication, compaction
    /// installs and split transitions.
    pub(crate) meta_lock: Mutex<()>,
}

impl Shard {
    pub fn new(meta: &ShardMeta, opts: &Options) -> Shard {
        let cf_managed: Vec<bool> = opts.cfs.iter().map(|c| c.managed).collect();
        let arena_cap = opts.max_mem_table_size * 2;
        let active = Arc::new(CfTable::new(&cf_managed, arena_cap));
        let cfs = opts
            .cfs
            .iter()
            .map(|c| ShardCf::new(c.max_levels))
            .collect();
        Shard {
            id: meta.id,
            ver: meta.ver,
            start: meta.start.clone(),
            end: meta.end.clone(),
            cf_managed,
            max_mem_table_size: opts.max_mem_table_size,
            arena_cap,
            mem_tbls: RwLock::new(Arc::new(vec![active])),
            l0_tbls: RwLock::new(Arc::new(Vec::new())),
            cfs,
            split_ctx: RwLock::new(None),
            split_stage: AtomicU8::new(meta.split_stage),
            passive: AtomicBool::new(false),
            initial_flushed: AtomicBool::new(meta.initial_flushed),
            unusable: AtomicBool::new(false),
            being_compacted: AtomicBool::new(false),
            base_version: meta.base_version,
            commit_version: AtomicU64::new(meta.base_version.max(meta.data_version)),
            properties: Mutex::new(
                meta.properties
                    .iter()
                    .map(|(k, v)| (k.clone(), Bytes::from(v.clone())))
                    .collect(),
            ),
            meta_lock: Mutex::new(()),
        }
    }

    // ----- published slices -----

    pub fn mem_tbls(&self) -> Arc<Vec<Arc<CfTable>>> {
        self.mem_tbls.read().clone()
    }

    pub fn l0_tbls(&self) -> Arc<Vec<Arc<L0Table>>> {
        self.l0_tbls.read().clone()
    }

    pub(crate) fn set_l0_tbls(&self, l0s: Vec<Arc<L0Table>>) {
        debug_assert!(l0s
            .windows(2)
            .all(|w| w[0].commit_version() >= w[1].commit_version()));
        *self.l0_tbls.write() = Arc::new(l0s);
    }

    pub(crate) fn set_mem_tbls(&self, tbls: Vec<Arc<CfTable>>) {
        *self.mem_tbls.write() = Arc::new(tbls);
    }

    pub fn cf(&self, cf: usize) -> &ShardCf {
        &self.cfs[cf]
    }

    pub fn num_cfs(&self) -> usize {
        self.cfs.len()
    }

    pub fn cf_managed(&self) -> &[bool] {
        &self.cf_managed
    }

    pub(crate) fn new_mem_table(&self) -> Arc<CfTable> {
        Arc::new(CfTable::new(&self.cf_managed, self.arena_cap))
    }

    // ----- flags -----

    pub fn is_passive(&self) -> bool {
        self.passive.load(Ordering::Acquire)
    }

    pub fn set_passive(&self, v: bool) {
        self.passive.store(v, Ordering::Release);
    }

    pub fn is_initial_flushed(&self) -> bool {
        self.initial_flushed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_initial_flushed(&self) {
        self.initial_flushed.store(true, Ordering::Release);
    }

    pub fn is_unusable(&self) -> bool {
        self.unusable.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unusable(&self) {
        self.unusable.store(true, Ordering::Release);
    }

    pub(crate) fn mark_compacting(&self) -> bool {
        !self.being_compacted.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_compacting(&self) -> bool {
        self.being_compacted.load(Ordering::SeqCst)
    }

    pub(crate) fn done_compacting(&self) {
        self.being_compacted.store(false, Ordering::SeqCst);
    }

    // ----- versions -----

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    /// Strictly increasing commit versions, scoped to this shard. When the
    /// engine is driven by a consensus layer, the layer seeds
    /// `base_version` and versions continue from there.
    pub fn alloc_commit_version(&self) -> u64 {
        self.commit_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last_commit_version(&self) -> u64 {
        self.commit_version.load(Ordering::SeqCst)
    }

    // ----- split state machine -----

    pub fn split_stage(&self) -> SplitStage {
        SplitStage::from_u8(self.split_stage.load(Ordering::Acquire))
    }

    pub fn is_splitting(&self) -> bool {
        matches!(
            self.split_stage(),
            SplitStage::PreSplit | SplitStage::SplitFileDone
        )
    }

    pub fn split_ctx(&self) -> Option<Arc<SplitContext>> {
        self.split_ctx.read().clone()
    }

    /// Index of the child memtable responsible for `key`: the number of
    /// split keys at or below it.
    pub fn get_splitting_index(&self, key: &[u8]) -> usize {
        match self.split_ctx.read().as_ref() {
            Some(ctx) => ctx.keys.partition_point(|k| k.as_ref() <= key),
            None => 0,
        }
    }

    /// Initial -> PreSplit: install the split keys and one splitting
    /// memtable per prospective child.
    pub(crate) fn set_split_keys(&self, keys: Vec<Bytes>) -> Result<()> {
        let _guard = self.meta_lock.lock();
        if self.split_stage() != SplitStage::Initial {
            return Err(Error::PreSplitWrongStage);
        }
        if keys.is_empty() || !keys.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::Config("split keys must be sorted and non-empty".into()));
        }
        let mem_tbls = (0..=keys.len())
            .map(|_| Arc::new(CfTable::new(&self.cf_managed, self.arena_cap)))
            .collect();
        *self.split_ctx.write() = Some(Arc::new(SplitContext { keys, mem_tbls }));
        self.split_stage
            .store(SplitStage::PreSplit as u8, Ordering::Release);
        Ok(())
    }

    pub(crate) fn set_split_stage(&self, stage: SplitStage) {
        self.split_stage.store(stage as u8, Ordering::Release);
    }

    /// Swap in a new split context. Used by the split-files job to replace
    /// captured splitting memtables with fresh ones.
    pub(crate) fn install_split_ctx(&self, ctx: SplitContext) {
        *self.split_ctx.write() = Some(Arc::new(ctx));
    }

    // ----- write admission -----

    /// Insert a batch into the proper memtables. The engine has already
    /// checked epoch, passive and closed states.
    pub(crate) fn apply_batch(&self, wb: &WriteBatch) -> Result<()> {
        let split_ctx = self.is_splitting().then(|| self.split_ctx()).flatten();
        if let Some(ctx) = split_ctx {
            for cf in 0..wb.num_cfs() {
                for entry in wb.entries(cf) {
                    let idx = ctx.keys.partition_point(|k| k.as_ref() <= entry.key.as_ref());
                    ctx.mem_tbls[idx].put(cf, &entry.key, entry.value.clone())?;
                }
            }
        } else {
            let tbls = self.mem_tbls();
            let active = &tbls[0];
            for cf in 0..wb.num_cfs() {
                active.put_entries(cf, wb.entries(cf))?;
            }
        }
        if !wb.properties().is_empty() {
            let mut props = self.properties.lock();
            for (k, v) in wb.properties() {
                props.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }

    /// Whether the active memtable has crossed the rotation threshold.
    pub(crate) fn needs_rotate(&self) -> bool {
        self.mem_tbls()[0].size() >= self.max_mem_table_size
    }

    /// Seal the active memtable and publish a fresh one at index 0. Returns
    /// the sealed table, now carrying its commit version, or None if a
    /// concurrent writer already rotated.
    pub(crate) fn try_rotate_mem_table(&self) -> Option<Arc<CfTable>> {
        let _guard = self.meta_lock.lock();
        let old = {
            let mut tbls = self.mem_tbls.write();
            if tbls[0].size() < self.max_mem_table_size {
                return None;
            }
            let fresh = self.new_mem_table();
            let mut next = Vec::with_capacity(tbls.len() + 1);
            next.push(fresh);
            next.extend(tbls.iter().cloned());
            let old = tbls[0].clone();
            *tbls = Arc::new(next);
            old
        };
        old.set_version(self.alloc_commit_version());
        Some(old)
    }

    /// Remove a flushed memtable (always the oldest ones) from the
    /// published slice. Called by the flush result worker under the shard
    /// mutex.
    pub(crate) fn remove_mem_table(&self, version: u64) -> Option<Arc<CfTable>> {
        let mut tbls = self.mem_tbls.write();
        let pos = tbls.iter().position(|t| t.get_version() == version)?;
        let mut next: Vec<Arc<CfTable>> = tbls.iter().cloned().collect();
        let removed = next.remove(pos);
        *tbls = Arc::new(next);
        Some(removed)
    }

    // ----- properties / stats -----

    pub fn get_property(&self, name: &str) -> Option<Bytes> {
        self.properties.lock().get(name).cloned()
    }

    pub fn set_property(&self, name: impl Into<String>, value: impl Into<Bytes>) {
        self.properties.lock().insert(name.into(), value.into());
    }

    pub fn properties(&self) -> HashMap<String, Bytes> {
        self.properties.lock().clone()
    }

    /// Whether `key` falls inside this shard's range.
    pub fn overlaps_key(&self, key: &[u8]) -> bool {
        key >= self.start.as_ref() && (self.end.is_empty() || key < self.end.as_ref())
    }

    pub fn estimated_size(&self) -> u64 {
        let mem: u64 = self.mem_tbls().iter().map(|t| t.size() as u64).sum();
        let l0: u64 = self.l0_tbls().iter().map(|t| t.size()).sum();
        let levels: u64 = self
            .cfs
            .iter()
            .flat_map(|cf| (1..=cf.num_levels()).map(|l| cf.level(l).total_size()))
            .sum();
        mem + l0 + levels
    }

    /// Current metadata image of this shard, used for manifest records.
    pub(crate) fn to_meta(&self) -> ShardMeta {
        let mut meta = ShardMeta::new(
            self.id,
            self.ver,
            self.start.clone(),
            self.end.clone(),
            self.base_version,
        );
        meta.data_version = self.last_commit_version();
        meta.split_stage = self.split_stage.load(Ordering::Acquire);
        meta.initial_flushed = self.is_initial_flushed();
        meta.properties = self
            .properties
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.to_vec()))
            .collect();
        meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CfConfig;
    use crate::format::Value;

    fn test_shard(max_mem_table_size: usize) -> Shard {
        let opts = Options::default()
            .cfs(vec![CfConfig::new(true, 3), CfConfig::new(false, 2)])
            .max_mem_table_size(max_mem_table_size);
        let meta = ShardMeta::new(1, 1, Bytes::new(), Bytes::new(), 100);
        Shard::new(&meta, &opts)
    }

    fn put_batch(shard: &Shard, key: &[u8], version: u64) {
        let mut wb = WriteBatch::new(
            shard.id,
            shard.ver,
            vec![CfConfig::new(true, 3), CfConfig::new(false, 2)],
        );
        wb.put(0, key.to_vec(), Value::new(version, &b"v"[..])).unwrap();
        shard.apply_batch(&wb).unwrap();
    }

    #[test]
    fn test_commit_versions_monotonic() {
        let shard = test_shard(1024);
        let a = shard.alloc_commit_version();
        let b = shard.alloc_commit_version();
        assert!(a > shard.base_version());
        assert!(b > a);
    }

    #[test]
    fn test_rotate_publishes_fresh_active() {
        let shard = test_shard(64);
        put_batch(&shard, b"k", 200);
        assert!(shard.needs_rotate());

        let sealed = shard.try_rotate_mem_table().unwrap();
        assert!(sealed.get_version() > 0);
        let tbls = shard.mem_tbls();
        assert_eq!(tbls.len(), 2);
        // Index 0 is the fresh writable table; the sealed one follows.
        assert_eq!(tbls[0].size(), 0);
        assert_eq!(tbls[1].get_version(), sealed.get_version());

        // A second rotation attempt on the empty active table is a no-op.
        assert!(shard.try_rotate_mem_table().is_none());
    }

    #[test]
    fn test_remove_mem_table() {
        let shard = test_shard(64);
        put_batch(&shard, b"k", 200);
        let sealed = shard.try_rotate_mem_table().unwrap();
        let removed = shard.remove_mem_table(sealed.get_version()).unwrap();
        assert_eq!(removed.get_version(), sealed.get_version());
        assert_eq!(shard.mem_tbls().len(), 1);
        assert!(shard.remove_mem_table(sealed.get_version()).is_none());
    }

    #[test]
    fn test_split_stage_transitions() {
        let shard = test_shard(1024);
        assert_eq!(shard.split_stage(), SplitStage::Initial);

        shard.set_split_keys(vec![Bytes::from_static(b"m")]).unwrap();
        assert_eq!(shard.split_stage(), SplitStage::PreSplit);
        assert!(shard.is_splitting());

        // Pre-splitting twice is a stage violation.
        assert!(matches!(
            shard.set_split_keys(vec![Bytes::from_static(b"x")]),
            Err(Error::PreSplitWrongStage)
        ));
    }

    #[test]
    fn test_splitting_index_routing() {
        let shard = test_shard(1024);
        shard
            .set_split_keys(vec![Bytes::from_static(b"h"), Bytes::from_static(b"q")])
            .unwrap();
        assert_eq!(shard.get_splitting_index(b"a"), 0);
        assert_eq!(shard.get_splitting_index(b"h"), 1);
        assert_eq!(shard.get_splitting_index(b"m"), 1);
        assert_eq!(shard.get_splitting_index(b"q"), 2);
        assert_eq!(shard.get_splitting_index(b"z"), 2);
    }

    #[test]
    fn test_splitting_writes_fan_out() {
        let shard = test_shard(1 << 20);
        shard.set_split_keys(vec![Bytes::from_static(b"m")]).unwrap();

        put_batch(&shard, b"a", 200);
        put_batch(&shard, b"n", 201);

        let ctx = shard.split_ctx().unwrap();
        assert!(ctx.mem_tbls[0].get(0, b"a", u64::MAX).is_some());
        assert!(ctx.mem_tbls[0].get(0, b"n", u64::MAX).is_none());
        assert!(ctx.mem_tbls[1].get(0, b"n", u64::MAX).is_some());
        // The shared active memtable saw nothing.
        assert!(shard.mem_tbls()[0].empty());
    }

    #[test]
    fn test_overlaps_key() {
        let opts = Options::default();
        let meta = ShardMeta::new(
            2,
            1,
            Bytes::from_static(b"f"),
            Bytes::from_static(b"p"),
            0,
        );
        let shard = Shard::new(&meta, &opts);
        assert!(!shard.overlaps_key(b"a"));
        assert!(shard.overlaps_key(b"f"));
        assert!(shard.overlaps_key(b"m"));
        assert!(!shard.overlaps_key(b"p"));
    }

    #[test]
    fn test_batch_properties_merge() {
        let shard = test_shard(1024);
        let mut wb = WriteBatch::new(
            shard.id,
            shard.ver,
            vec![CfConfig::new(true, 3), CfConfig::new(false, 2)],
        );
        wb.set_property("split-checkpoint", &b"ck1"[..]);
        shard.apply_batch(&wb).unwrap();
        assert_eq!(
            shard.get_property("split-checkpoint").unwrap(),
            Bytes::from_static(b"ck1")
        );
    }
}
