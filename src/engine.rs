//! Engine facade: opens the directory, maps shard ids to shards, and
//! exposes the write / snapshot / split / flush APIs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::blob::{blob_key, BlobStore};
use crate::cache::BlockCache;
use crate::compaction::{self, CompactionTask, RemoteCompactor};
use crate::config::Options;
use crate::epoch::{Deletion, EpochFramework, Guard, ReclaimTask, Resource};
use crate::error::{Error, Result};
use crate::flush::{self, FlushTask};
use crate::format::Value;
use crate::levels::LevelHandler;
use crate::manifest::{Change, ChangeSet, FileMeta, Manifest, ShardMeta, CF_L0};
use crate::memtable::{CfTable, Hint};
use crate::scheduler::Scheduler;
use crate::shard::{Shard, SplitContext, SplitStage};
use crate::sstable::{l0_filename, sst_filename, L0Table, SsTable, TableFile};
use crate::write_batch::WriteBatch;

const LOCK_FILE: &str = "LOCK";

/// Produces runs of globally unique file ids.
pub trait IdAllocator: Send + Sync {
    /// Returns the first id of a run of `count` fresh ids.
    fn alloc(&self, count: usize) -> Result<u64>;
}

/// Process-local id allocator seeded from the manifest watermark.
pub struct LocalIdAllocator {
    latest: AtomicU64,
}

impl LocalIdAllocator {
    pub fn new(latest: u64) -> Self {
        Self {
            latest: AtomicU64::new(latest),
        }
    }
}

impl IdAllocator for LocalIdAllocator {
    fn alloc(&self, count: usize) -> Result<u64> {
        Ok(self.latest.fetch_add(count as u64, Ordering::SeqCst) + 1)
    }
}

/// Notified of every published meta change, in publication order.
pub trait MetaChangeListener: Send + Sync {
    fn on_change(&self, cs: &ChangeSet);
}

/// Replays shard memtable state from an external log (e.g. the consensus
/// layer's) after the files listed in the meta have been loaded.
#[async_trait::async_trait]
pub trait RecoverHandler: Send + Sync {
    async fn recover(&self, engine: &Engine, shard: &Arc<Shard>, meta: &ShardMeta) -> Result<()>;
}

/// Supplies shard metadata at open time, overriding the local manifest.
pub trait MetaReader: Send + Sync {
    fn read_metas(&self) -> Result<Vec<ShardMeta>>;
}

/// Capability hooks implemented by the embedder. Every hook has a local
/// default so the engine runs stand-alone.
#[derive(Default)]
pub struct Hooks {
    pub id_allocator: Option<Arc<dyn IdAllocator>>,
    pub meta_change_listener: Option<Arc<dyn MetaChangeListener>>,
    pub recover_handler: Option<Arc<dyn RecoverHandler>>,
    pub meta_reader: Option<Arc<dyn MetaReader>>,
    pub blob_store: Option<Arc<dyn BlobStore>>,
    pub remote_compactor: Option<Arc<dyn RemoteCompactor>>,
}

pub(crate) struct EngineCore {
    pub(crate) opts: Options,
    pub(crate) shards: DashMap<u64, Arc<Shard>>,
    pub(crate) cache: Option<Arc<BlockCache>>,
    pub(crate) epoch: EpochFramework,
    pub(crate) flush_tx: Mutex<Option<mpsc::Sender<FlushTask>>>,
    pub(crate) manifest: Mutex<Manifest>,
    pub(crate) id_alloc: Arc<dyn IdAllocator>,
    pub(crate) listener: Option<Arc<dyn MetaChangeListener>>,
    pub(crate) blob: Option<Arc<dyn BlobStore>>,
    pub(crate) remote_compactor: Option<Arc<dyn RemoteCompactor>>,
    pub(crate) safe_ts: AtomicU64,
    pub(crate) closed: AtomicBool,
    pub(crate) l0_notify: Notify,
    _dir_lock: crate::flock::FileLock,
}

impl EngineCore {
    pub(crate) fn get_shard(&self, shard_id: u64) -> Result<Arc<Shard>> {
        self.shards
            .get(&shard_id)
            .map(|s| s.clone())
            .ok_or(Error::ShardNotFound)
    }

    pub(crate) async fn send_flush(&self, task: FlushTask) -> Result<()> {
        let tx = self.flush_tx.lock().clone();
        match tx {
            Some(tx) => tx.send(task).await.map_err(|_| Error::Closed),
            None => Err(Error::Closed),
        }
    }

    /// Append a change-set to the manifest and notify the listener.
    pub(crate) fn publish_change(&self, shard_id: u64, shard_ver: u64, change: Change) -> Result<ChangeSet> {
        let cs = {
            let mut manifest = self.manifest.lock();
            let cs = ChangeSet {
                shard_id,
                shard_ver,
                seq: manifest.next_seq(),
                change,
            };
            manifest.append(&cs)?;
            cs
        };
        if let Some(listener) = &self.listener {
            listener.on_change(&cs);
        }
        Ok(cs)
    }

    pub(crate) fn use_mmap(&self) -> bool {
        self.cache.is_none()
    }

    /// Open a table file from disk, fetching it from the blob store first
    /// if it is missing locally.
    pub(crate) async fn open_table_file(&self, fm: &FileMeta) -> Result<Arc<TableFile>> {
        let path = if fm.cf == CF_L0 {
            l0_filename(&self.opts.dir, fm.id)
        } else {
            sst_filename(&self.opts.dir, fm.id)
        };
        if !path.exists() {
            let Some(blob) = &self.blob else {
                return Err(Error::Io(format!("missing table file {}", fm.id)));
            };
            let data = blob
                .get(blob_key(self.opts.instance_id, fm.id))
                .await?;
            std::fs::write(&path, &data)?;
        }
        TableFile::open(fm.id, path, self.use_mmap())
    }

    /// Write a finished L0 image to disk (and the blob store, when
    /// configured) and open it for reading.
    pub(crate) async fn persist_l0(
        &self,
        builder: crate::sstable::L0Builder,
    ) -> Result<(Arc<L0Table>, FileMeta)> {
        let file_id = self.id_alloc.alloc(1)?;
        let commit_version = builder.commit_version();
        let (smallest, biggest) = builder.bounds();
        let image = builder.finish();

        let path = l0_filename(&self.opts.dir, file_id);
        std::fs::write(&path, &image)?;
        if self.opts.sync_write {
            std::fs::File::open(&path)?.sync_data()?;
        }
        if let Some(blob) = &self.blob {
            blob.put(blob_key(self.opts.instance_id, file_id), image.clone())
                .await?;
        }
        let file = TableFile::open(file_id, path, self.use_mmap())?;
        let l0 = L0Table::open(file, self.cache.clone())?;
        let meta = FileMeta {
            id: file_id,
            cf: CF_L0,
            level: 0,
            smallest,
            biggest,
            commit_version,
            size: image.len() as u64,
        };
        Ok((l0, meta))
    }

    /// Write a finished `.sst` image for `cf` at `level` and open it.
    pub(crate) async fn persist_sst(
        &self,
        image: Bytes,
        smallest: Bytes,
        biggest: Bytes,
        commit_version: u64,
        cf: i32,
        level: u32,
    ) -> Result<(Arc<SsTable>, FileMeta)> {
        let file_id = self.id_alloc.alloc(1)?;
        let path = sst_filename(&self.opts.dir, file_id);
        std::fs::write(&path, &image)?;
        if self.opts.sync_write {
            std::fs::File::open(&path)?.sync_data()?;
        }
        if let Some(blob) = &self.blob {
            blob.put(blob_key(self.opts.instance_id, file_id), image.clone())
                .await?;
        }
        let file = TableFile::open(file_id, path, self.use_mmap())?;
        let len = file.size();
        let table = SsTable::open(file, 0, len, self.cache.clone())?;
        let meta = FileMeta {
            id: file_id,
            cf,
            level,
            smallest,
            biggest,
            commit_version,
            size: image.len() as u64,
        };
        Ok((table, meta))
    }

    /// Schedule the shard's files for destruction once concurrent readers
    /// have departed.
    pub(crate) fn retire_shard_files(&self, shard: &Shard, remove_files: bool) {
        let l0s = shard.l0_tbls();
        let mut tables: Vec<Arc<SsTable>> = Vec::new();
        for cf in 0..shard.num_cfs() {
            let scf = shard.cf(cf);
            for level in 1..=scf.num_levels() {
                tables.extend(scf.level(level).tables().iter().cloned());
            }
        }
        let blob = self.blob.clone();
        let instance_id = self.opts.instance_id;
        let guard = self.epoch.acquire();
        guard.delete(vec![Box::new(Deletion::new(move || {
            for l0 in l0s.iter() {
                if remove_files {
                    if let Some(blob) = &blob {
                        blob.set_expired(blob_key(instance_id, l0.id()));
                    }
                    l0.delete();
                } else {
                    l0.close();
                }
            }
            for tbl in &tables {
                if remove_files {
                    if let Some(blob) = &blob {
                        blob.set_expired(blob_key(instance_id, tbl.id()));
                    }
                    tbl.file().delete();
                } else {
                    tbl.file().close();
                }
            }
        }))]);
        guard.done();
    }
}

/// A read-only item returned by snapshot gets.
#[derive(Debug, Clone)]
pub struct Item {
    key: Bytes,
    value: Value,
}

impl Item {
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value.value
    }

    pub fn version(&self) -> u64 {
        self.value.version
    }

    pub fn user_meta(&self) -> &[u8] {
        &self.value.user_meta
    }

    pub fn meta(&self) -> u8 {
        self.value.meta
    }
}

/// A pinned, consistent view over one shard. The epoch guard it holds keeps
/// every captured memtable and table file alive until [`SnapAccess::discard`]
/// (or drop). Snapshots never block writes or flushes.
pub struct SnapAccess {
    _guard: Guard,
    shard: Arc<Shard>,
    mem_tbls: Arc<Vec<Arc<CfTable>>>,
    l0_tbls: Arc<Vec<Arc<L0Table>>>,
    splitting: Option<Arc<SplitContext>>,
    levels: Vec<Vec<Arc<LevelHandler>>>,
    hints: Vec<Hint>,
    managed_read_ts: u64,
}

impl SnapAccess {
    fn new(epoch: &EpochFramework, shard: Arc<Shard>) -> Self {
        let guard = epoch.acquire();
        let mem_tbls = shard.mem_tbls();
        let l0_tbls = shard.l0_tbls();
        let splitting = if shard.is_splitting() {
            shard.split_ctx()
        } else {
            None
        };
        let levels = (0..shard.num_cfs())
            .map(|cf| {
                let scf = shard.cf(cf);
                (1..=scf.num_levels()).map(|l| scf.level(l)).collect()
            })
            .collect();
        let hints = (0..shard.num_cfs()).map(|_| Hint::default()).collect();
        Self {
            _guard: guard,
            shard,
            mem_tbls,
            l0_tbls,
            splitting,
            levels,
            hints,
            managed_read_ts: 0,
        }
    }

    pub fn set_managed_read_ts(&mut self, ts: u64) {
        self.managed_read_ts = ts;
    }

    /// Point read. A zero version reads the newest visible record. Returns
    /// `KeyNotFound` when no record is visible or the newest one is a
    /// tombstone.
    pub fn get(&mut self, cf: usize, key: &[u8], version: u64) -> Result<Item> {
        let version = if version == 0 { u64::MAX } else { version };
        let found = self.get_value(cf, key, version).map_err(|e| {
            if matches!(e, Error::CorruptFile(_)) {
                self.shard.mark_unusable();
            }
            e
        })?;
        match found {
            Some(value) if !value.is_deleted() => Ok(Item {
                key: Bytes::copy_from_slice(key),
                value,
            }),
            _ => Err(Error::KeyNotFound),
        }
    }

    fn get_value(&mut self, cf: usize, key: &[u8], version: u64) -> Result<Option<Value>> {
        let key_hash = farmhash::fingerprint64(key);
        if let Some(ctx) = &self.splitting {
            let idx = ctx.keys.partition_point(|k| k.as_ref() <= key);
            if let Some(v) = ctx.mem_tbls[idx].get(cf, key, version) {
                return Ok(Some(v));
            }
        }
        for (i, tbl) in self.mem_tbls.iter().enumerate() {
            let v = if i == 0 {
                tbl.get_with_hint(cf, key, version, &mut self.hints[cf])
            } else {
                tbl.get(cf, key, version)
            };
            if v.is_some() {
                return Ok(v);
            }
        }
        for l0 in self.l0_tbls.iter() {
            if let Some(v) = l0.get(cf, key, version, key_hash)? {
                return Ok(Some(v));
            }
        }
        for handler in &self.levels[cf] {
            if let Some(v) = handler.get(key, version, key_hash)? {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    /// Get for each key; missing keys yield `None` in the result, any other
    /// error short-circuits.
    pub fn multi_get(
        &mut self,
        cf: usize,
        keys: &[&[u8]],
        version: u64,
    ) -> Result<Vec<Option<Item>>> {
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get(cf, key, version) {
                Ok(item) => items.push(Some(item)),
                Err(Error::KeyNotFound) => items.push(None),
                Err(e) => return Err(e),
            }
        }
        Ok(items)
    }

    /// Release the snapshot, allowing deferred file deletion to proceed.
    pub fn discard(self) {}
}

pub struct Engine {
    core: Arc<EngineCore>,
    scheduler: Mutex<Option<Scheduler>>,
    flush_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Open the engine: lock the directory, replay metadata, load shards,
    /// run recovery and start the background workers.
    pub async fn open(opts: Options, hooks: Hooks) -> Result<Engine> {
        opts.check()?;
        std::fs::create_dir_all(&opts.dir)?;
        let dir_lock = crate::flock::FileLock::lock(opts.dir.join(LOCK_FILE))
            .map_err(|e| Error::Config(format!("directory lock: {e}")))?;
        tracing::info!(dir = %opts.dir.display(), "opening engine");

        let cache = (opts.block_cache_size > 0)
            .then(|| Arc::new(BlockCache::new(opts.block_cache_size, None)));

        let (mut manifest, state) = Manifest::open(&opts.dir)?;

        let mut metas: Vec<ShardMeta> = match &hooks.meta_reader {
            Some(reader) => reader.read_metas()?,
            None => state.shards.values().cloned().collect(),
        };
        let max_file_id = state
            .max_file_id
            .max(metas.iter().flat_map(|m| m.files.iter().map(|f| f.id)).max().unwrap_or(0));

        // When the embedder supplies the metas, seed the local manifest with
        // them so later replays and orphan sweeps agree with reality.
        if hooks.meta_reader.is_some() {
            let seeded = crate::manifest::ManifestState {
                shards: metas.iter().map(|m| (m.id, m.clone())).collect(),
                max_file_id,
                seq: state.seq,
            };
            manifest.rewrite(&seeded)?;
        }

        let id_alloc = hooks
            .id_allocator
            .unwrap_or_else(|| Arc::new(LocalIdAllocator::new(max_file_id)));

        let (flush_tx, flush_rx) = mpsc::channel(opts.num_mem_tables);
        let core = Arc::new(EngineCore {
            shards: DashMap::new(),
            cache,
            epoch: EpochFramework::new(),
            flush_tx: Mutex::new(Some(flush_tx)),
            manifest: Mutex::new(manifest),
            id_alloc,
            listener: hooks.meta_change_listener,
            blob: hooks.blob_store,
            remote_compactor: hooks.remote_compactor,
            safe_ts: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            l0_notify: Notify::new(),
            _dir_lock: dir_lock,
            opts,
        });

        // A fresh directory starts with one shard over the whole key space.
        if metas.is_empty() {
            let meta = ShardMeta::new(1, 1, Bytes::new(), Bytes::new(), 0);
            core.publish_change(meta.id, meta.ver, Change::ShardCreate(meta.clone()))?;
            metas.push(meta);
        }

        for meta in &metas {
            match load_shard(&core, meta).await {
                Ok(shard) => {
                    core.shards.insert(shard.id, shard);
                }
                Err(e @ Error::CorruptFile(_)) => {
                    tracing::error!(shard = meta.id, error = %e, "shard unusable");
                    let shard = Arc::new(Shard::new(meta, &core.opts));
                    shard.mark_unusable();
                    core.shards.insert(shard.id, shard);
                }
                Err(e) => return Err(e),
            }
        }

        remove_orphan_files(&core, &metas)?;

        let (result_tx, result_rx) = mpsc::channel(core.opts.num_mem_tables);
        let flush_handles = vec![
            tokio::spawn(flush::run_flush_worker(core.clone(), flush_rx, result_tx)),
            tokio::spawn(flush::run_flush_result_worker(core.clone(), result_rx)),
        ];

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(ReclaimTask::new(
            core.epoch.clone(),
            core.opts.reclaim_interval,
        )));
        if !core.opts.do_not_compact {
            for _ in 0..core.opts.num_compactors.max(1) {
                scheduler.register(Arc::new(CompactionTask::new(
                    core.clone(),
                    core.opts.compaction_interval,
                )));
            }
        }

        let engine = Engine {
            core,
            scheduler: Mutex::new(Some(scheduler)),
            flush_handles: Mutex::new(flush_handles),
        };

        if let Some(recover) = &hooks.recover_handler {
            for meta in &metas {
                if let Ok(shard) = engine.core.get_shard(meta.id) {
                    recover.recover(&engine, &shard, meta).await?;
                }
            }
        }

        Ok(engine)
    }

    pub fn get_shard(&self, shard_id: u64) -> Result<Arc<Shard>> {
        self.core.get_shard(shard_id)
    }

    pub fn num_shards(&self) -> usize {
        self.core.shards.len()
    }

    pub fn num_cfs(&self) -> usize {
        self.core.opts.cfs.len()
    }

    pub fn opts(&self) -> &Options {
        &self.core.opts
    }

    /// Move the MVCC garbage-collection safe point forward. Compaction may
    /// drop shadowed versions at or below it.
    pub fn set_safe_ts(&self, ts: u64) {
        let prev = self.core.safe_ts.swap(ts, Ordering::SeqCst);
        debug_assert!(prev <= ts);
    }

    pub fn new_write_batch(&self, shard_id: u64) -> Result<WriteBatch> {
        let shard = self.core.get_shard(shard_id)?;
        Ok(
            WriteBatch::new(shard.id, shard.ver, self.core.opts.cfs.clone())
                .with_value_threshold(self.core.opts.value_threshold),
        )
    }

    /// Apply a write batch to its shard. The batch becomes visible to new
    /// snapshots immediately and durable once its flush result publishes.
    pub async fn write(&self, wb: &WriteBatch) -> Result<()> {
        let core = &self.core;
        if core.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let shard = core.get_shard(wb.shard_id())?;
        if shard.ver != wb.shard_ver() || shard.is_passive() {
            return Err(Error::ShardNotMatch);
        }
        if shard.is_unusable() {
            return Err(Error::CorruptFile(format!("shard {} unusable", shard.id)));
        }

        // The L0 hard cap stalls ingest until compaction catches up.
        while shard.l0_tbls().len() >= core.opts.num_l0_tables_stall {
            if core.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            let _ =
                tokio::time::timeout(Duration::from_millis(50), core.l0_notify.notified()).await;
        }

        shard.apply_batch(wb)?;

        if !shard.is_splitting() && shard.needs_rotate() {
            if let Some(sealed) = shard.try_rotate_mem_table() {
                sealed.mark_flushing();
                core.send_flush(FlushTask {
                    shard_id: shard.id,
                    shard_ver: shard.ver,
                    mem_tbl: sealed,
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Acquire a consistent snapshot over `shard`.
    pub fn new_snap_access(&self, shard: &Arc<Shard>) -> SnapAccess {
        SnapAccess::new(&self.core.epoch, shard.clone())
    }

    /// Queue immutable memtables for flushing, oldest first, skipping the
    /// most recent `skip` (clamped to the immutable count). An empty,
    /// never-flushed shard enqueues a placeholder so its recovery state
    /// becomes durable.
    pub async fn trigger_flush(&self, shard: &Arc<Shard>, skip: usize) -> Result<()> {
        let mems = shard.mem_tbls();
        let immutables = &mems[1..];
        // Immutables are newest-first; skipping the most recent N means
        // skipping the head of the slice.
        let skip = skip.min(immutables.len());
        for tbl in immutables[skip..].iter().rev() {
            if !tbl.mark_flushing() {
                continue;
            }
            self.core
                .send_flush(FlushTask {
                    shard_id: shard.id,
                    shard_ver: shard.ver,
                    mem_tbl: tbl.clone(),
                })
                .await?;
        }
        if mems.len() == 1 && mems[0].empty() && !shard.is_initial_flushed() {
            let placeholder = shard.new_mem_table();
            placeholder.set_version(shard.alloc_commit_version());
            placeholder.mark_flushing();
            self.core
                .send_flush(FlushTask {
                    shard_id: shard.id,
                    shard_ver: shard.ver,
                    mem_tbl: placeholder,
                })
                .await?;
        }
        Ok(())
    }

    /// Seal the active memtable regardless of size and queue it. Used by
    /// forced checkpoints and tests.
    pub async fn rotate_and_flush(&self, shard: &Arc<Shard>) -> Result<()> {
        {
            let _guard = shard.meta_lock.lock();
            let tbls = shard.mem_tbls();
            if !tbls[0].empty() {
                let fresh = shard.new_mem_table();
                let mut next = Vec::with_capacity(tbls.len() + 1);
                next.push(fresh);
                next.extend(tbls.iter().cloned());
                shard.set_mem_tbls(next);
                tbls[0].set_version(shard.alloc_commit_version());
            }
        }
        self.trigger_flush(shard, 0).await
    }

    /// Initial -> PreSplit: install the split keys; subsequent writes fan
    /// out to the splitting memtables.
    pub fn pre_split(&self, shard_id: u64, shard_ver: u64, keys: Vec<Bytes>) -> Result<()> {
        let shard = self.core.get_shard(shard_id)?;
        if shard.ver != shard_ver {
            return Err(Error::ShardNotMatch);
        }
        shard.set_split_keys(keys.clone())?;
        self.core
            .publish_change(shard.id, shard.ver, Change::PreSplit { keys })?;
        Ok(())
    }

    /// PreSplit -> SplitFileDone: flush the splitting memtables and
    /// physically partition every file at a split-key boundary.
    pub async fn finish_split_files(&self, shard_id: u64, shard_ver: u64) -> Result<()> {
        let shard = self.core.get_shard(shard_id)?;
        if shard.ver != shard_ver {
            return Err(Error::ShardNotMatch);
        }
        if shard.split_stage() != SplitStage::PreSplit {
            return Err(Error::SplitFilesWrongStage);
        }
        crate::split::split_shard_files(&self.core, &shard).await
    }

    /// SplitFileDone -> SplitDone: instantiate the child shards, hand them
    /// the partitioned files and the unflushed splitting memtables, and
    /// retire the passive parent.
    pub fn finish_split(
        &self,
        shard_id: u64,
        shard_ver: u64,
        new_shard_ids: &[(u64, u64)],
    ) -> Result<Vec<Arc<Shard>>> {
        let shard = self.core.get_shard(shard_id)?;
        if shard.ver != shard_ver {
            return Err(Error::ShardNotMatch);
        }
        if shard.split_stage() != SplitStage::SplitFileDone {
            return Err(Error::FinishSplitWrongStage);
        }
        crate::split::finish_split(&self.core, &shard, new_shard_ids)
    }

    /// Remove a shard, optionally scheduling deletion of its files.
    pub fn remove_shard(&self, shard_id: u64, remove_files: bool) -> Result<()> {
        let (_, shard) = self
            .core
            .shards
            .remove(&shard_id)
            .ok_or(Error::ShardNotFound)?;
        shard.set_passive(true);
        self.core
            .publish_change(shard.id, shard.ver, Change::ShardRemove)?;
        self.core.retire_shard_files(&shard, remove_files);
        Ok(())
    }

    /// Total estimated size across shards.
    pub fn size(&self) -> u64 {
        self.core
            .shards
            .iter()
            .map(|entry| entry.value().estimated_size())
            .sum()
    }

    /// Close the engine: stop accepting writes, finish in-flight flushes,
    /// stop the background workers and run final reclamation.
    pub async fn close(self) -> Result<()> {
        tracing::info!("closing engine");
        self.core.closed.store(true, Ordering::Release);

        if self.core.opts.compact_l0_when_close {
            let shards: Vec<Arc<Shard>> = self
                .core
                .shards
                .iter()
                .map(|e| e.value().clone())
                .collect();
            for shard in shards {
                if shard.mark_compacting() {
                    if let Err(e) = compaction::compact_l0(&self.core, &shard).await {
                        tracing::warn!(shard = shard.id, error = %e, "final L0 compaction failed");
                    }
                    shard.done_compacting();
                }
            }
        }

        // Dropping the sender drains the flush pipeline and stops both
        // workers in order.
        self.core.flush_tx.lock().take();
        let handles: Vec<JoinHandle<()>> = self.flush_handles.lock().drain(..).collect();
        for handle in handles {
            handle.await?;
        }

        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown().await?;
        }
        self.core.epoch.collect_all();
        Ok(())
    }
}

async fn load_shard(core: &Arc<EngineCore>, meta: &ShardMeta) -> Result<Arc<Shard>> {
    let shard = Arc::new(Shard::new(meta, &core.opts));
    let mut l0s: Vec<Arc<L0Table>> = Vec::new();
    let mut levels: HashMap<(usize, usize), Vec<Arc<SsTable>>> = HashMap::new();
    for fm in &meta.files {
        let file = core.open_table_file(fm).await?;
        if fm.cf == CF_L0 {
            l0s.push(L0Table::open(file, core.cache.clone())?);
        } else {
            let len = file.size();
            let table = SsTable::open(file, 0, len, core.cache.clone())?;
            levels
                .entry((fm.cf as usize, fm.level as usize))
                .or_default()
                .push(table);
        }
    }
    l0s.sort_by(|a, b| b.commit_version().cmp(&a.commit_version()));
    shard.set_l0_tbls(l0s);
    for ((cf, level), tables) in levels {
        shard
            .cf(cf)
            .set_level(LevelHandler::with_tables(level, tables));
    }
    if !meta.split_keys.is_empty()
        && matches!(
            SplitStage::from_u8(meta.split_stage),
            SplitStage::PreSplit | SplitStage::SplitFileDone
        )
    {
        let target = SplitStage::from_u8(meta.split_stage);
        shard.set_split_stage(SplitStage::Initial);
        shard.set_split_keys(meta.split_keys.clone())?;
        shard.set_split_stage(target);
    }
    tracing::info!(shard = shard.id, ver = shard.ver, "loaded shard");
    Ok(shard)
}

fn remove_orphan_files(core: &Arc<EngineCore>, metas: &[ShardMeta]) -> Result<()> {
    let referenced: std::collections::HashSet<u64> = metas
        .iter()
        .flat_map(|m| m.files.iter().map(|f| f.id))
        .collect();
    for entry in std::fs::read_dir(&core.opts.dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_table = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("sst") | Some("l0")
        );
        if !is_table {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(id) = id {
            if !referenced.contains(&id) {
                tracing::info!(file_id = id, "removing orphan table file");
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    Ok(())
}

/// Build an [`crate::epoch::Resource`] that retires a memtable.
pub(crate) fn retire_mem_table(tbl: Arc<CfTable>) -> Box<dyn Resource> {
    Box::new(Deletion::new(move || drop(tbl)))
}
