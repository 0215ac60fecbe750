//! Compaction coordinator.
//!
//! Each runner periodically scores every shard (L0 count against the soft
//! cap, level sizes against their targets), claims the top candidate and
//! compacts it, either locally with a k-way merge or by delegating to a
//! remote compaction worker. Results install atomically under the shard
//! mutex; inputs are retired through the epoch reclaimer.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use itertools::Itertools;

use crate::blob::blob_key;
use crate::engine::EngineCore;
use crate::epoch::Deletion;
use crate::error::{Error, Result};
use crate::format::{self, BIT_DELETE};
use crate::levels::LevelHandler;
use crate::manifest::{Change, FileMeta};
use crate::scheduler::{BackgroundTask, Context};
use crate::shard::Shard;
use crate::sstable::{L0Table, SsTable, TableBuilder, TableIter};

/// A compaction job shipped to a remote worker. Input files must already be
/// visible in the shared blob store; the worker returns the manifest of the
/// files it produced there.
#[derive(Debug, Clone)]
pub struct CompactionRequest {
    pub shard_id: u64,
    pub shard_ver: u64,
    pub cf: i32,
    /// Source level; outputs land one level deeper.
    pub level: u32,
    pub inputs: Vec<u64>,
    pub safe_ts: u64,
}

#[async_trait::async_trait]
pub trait RemoteCompactor: Send + Sync {
    async fn compact(&self, req: CompactionRequest) -> Result<Vec<FileMeta>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Target {
    L0,
    Level { cf: usize, level: usize },
}

pub(crate) struct CompactionTask {
    core: Arc<EngineCore>,
    interval: Duration,
}

impl CompactionTask {
    pub(crate) fn new(core: Arc<EngineCore>, interval: Duration) -> Self {
        Self { core, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        run_once(&self.core).await
    }
}

pub(crate) async fn run_once(core: &Arc<EngineCore>) -> Result<()> {
    let Some((shard, target)) = pick_candidate(core) else {
        return Ok(());
    };
    if !shard.mark_compacting() {
        return Ok(());
    }
    let result = match target {
        Target::L0 => compact_l0(core, &shard).await,
        Target::Level { cf, level } => compact_level(core, &shard, cf, level).await,
    };
    shard.done_compacting();
    core.l0_notify.notify_waiters();
    if let Err(e) = result {
        // Inputs stay intact; the next scan re-queues the shard.
        tracing::warn!(shard = shard.id, error = %e, "compaction failed");
    }
    Ok(())
}

fn level_max_size(core: &EngineCore, level: usize) -> u64 {
    core.opts.l1_size.saturating_mul(10u64.saturating_pow(level as u32 - 1))
}

fn pick_candidate(core: &Arc<EngineCore>) -> Option<(Arc<Shard>, Target)> {
    let mut best: Option<(Arc<Shard>, Target, f64)> = None;
    for entry in core.shards.iter() {
        let shard = entry.value();
        if shard.is_splitting()
            || shard.is_passive()
            || shard.is_unusable()
            || shard.is_compacting()
        {
            continue;
        }
        let l0_count = shard.l0_tbls().len();
        let mut score = l0_count as f64 / core.opts.num_l0_tables as f64;
        let mut target = Target::L0;
        for cf in 0..shard.num_cfs() {
            let scf = shard.cf(cf);
            // The bottom level has nowhere to push data down to.
            for level in 1..scf.num_levels() {
                let size = scf.level(level).total_size();
                let level_score = size as f64 / level_max_size(core, level) as f64;
                if level_score > score {
                    score = level_score;
                    target = Target::Level { cf, level };
                }
            }
        }
        if score >= 1.0 {
            match &best {
                Some((_, _, best_score)) if *best_score >= score => {}
                _ => best = Some((shard.clone(), target, score)),
            }
        }
    }
    best.map(|(shard, target, _)| (shard, target))
}

/// Merge all L0 tables with the overlapping part of each column family's L1
/// into fresh L1 tables.
pub(crate) async fn compact_l0(core: &Arc<EngineCore>, shard: &Arc<Shard>) -> Result<()> {
    if shard.is_splitting() || shard.is_passive() || shard.is_unusable() {
        return Ok(());
    }
    let l0s = shard.l0_tbls();
    if l0s.is_empty() {
        return Ok(());
    }
    let safe_ts = core.safe_ts.load(Ordering::SeqCst);
    let commit_version = l0s
        .iter()
        .map(|t| t.commit_version())
        .max()
        .unwrap_or_default();

    let mut deleted: Vec<u64> = l0s.iter().map(|t| t.id()).collect();
    let mut added: Vec<FileMeta> = Vec::new();
    let mut installs: Vec<(usize, LevelHandler)> = Vec::new();
    let mut replaced_l1: Vec<Arc<SsTable>> = Vec::new();

    for cf in 0..shard.num_cfs() {
        let mut iters: Vec<TableIter> = Vec::new();
        let mut smallest: Option<Bytes> = None;
        let mut biggest: Option<Bytes> = None;
        // L0s are newest-first, which keeps the newest duplicate the one
        // the merge sees first.
        for l0 in l0s.iter() {
            let Some(sub) = l0.cf_table(cf) else { continue };
            iters.push(sub.iter(false));
            smallest = Some(match smallest {
                Some(s) => s.min(sub.smallest().clone()),
                None => sub.smallest().clone(),
            });
            biggest = Some(match biggest {
                Some(b) => b.max(sub.biggest().clone()),
                None => sub.biggest().clone(),
            });
        }
        let (Some(smallest), Some(biggest)) = (smallest, biggest) else {
            continue;
        };

        let scf = shard.cf(cf);
        let l1 = scf.level(1);
        let overlap = l1.overlapping(&smallest, &biggest);
        let inputs_l1: Vec<Arc<SsTable>> = l1.tables()[overlap].to_vec();
        for table in &inputs_l1 {
            iters.push(table.iter(false));
        }
        let is_bottom = (2..=scf.num_levels()).all(|l| scf.level(l).is_empty());
        let outputs = merge_tables(
            iters,
            safe_ts,
            is_bottom,
            commit_version,
            1 < core.opts.surf_start_level,
            core.opts.max_table_size,
        )?;

        let mut new_tables = Vec::with_capacity(outputs.len());
        for (image, smallest, biggest) in outputs {
            let (table, meta) = core
                .persist_sst(image, smallest, biggest, commit_version, cf as i32, 1)
                .await?;
            new_tables.push(table);
            added.push(meta);
        }
        let replaced_ids: Vec<u64> = inputs_l1.iter().map(|t| t.id()).collect();
        deleted.extend(replaced_ids.iter().copied());
        installs.push((cf, l1.replace(&replaced_ids, new_tables)));
        replaced_l1.extend(inputs_l1);
    }

    {
        let _guard = shard.meta_lock.lock();
        // A split that began mid-compaction owns the file set now.
        if shard.is_splitting() || shard.is_passive() {
            for meta in &added {
                let path = crate::sstable::sst_filename(&core.opts.dir, meta.id);
                let _ = std::fs::remove_file(path);
            }
            tracing::info!(shard = shard.id, "discarding compaction outputs, shard is splitting");
            return Ok(());
        }
        core.publish_change(
            shard.id,
            shard.ver,
            Change::Compaction {
                cf: -1,
                level: 0,
                deleted: deleted.clone(),
                added,
            },
        )?;
        let current = shard.l0_tbls();
        let remaining: Vec<Arc<L0Table>> = current
            .iter()
            .filter(|t| !deleted.contains(&t.id()))
            .cloned()
            .collect();
        shard.set_l0_tbls(remaining);
        for (cf, handler) in installs {
            shard.cf(cf).set_level(handler);
        }
    }

    retire_tables(core, l0s.to_vec(), replaced_l1);
    tracing::info!(
        shard = shard.id,
        l0_count = deleted.len(),
        "compacted L0 into L1"
    );
    Ok(())
}

/// Push one table from `level` into `level + 1`.
async fn compact_level(
    core: &Arc<EngineCore>,
    shard: &Arc<Shard>,
    cf: usize,
    level: usize,
) -> Result<()> {
    if shard.is_splitting() || shard.is_passive() || shard.is_unusable() {
        return Ok(());
    }
    let scf = shard.cf(cf);
    let upper = scf.level(level);
    let Some(input) = upper.tables().iter().max_by_key(|t| t.size()).cloned() else {
        return Ok(());
    };
    let lower = scf.level(level + 1);
    let overlap = lower.overlapping(input.smallest(), input.biggest());
    let inputs_lower: Vec<Arc<SsTable>> = lower.tables()[overlap].to_vec();

    let safe_ts = core.safe_ts.load(Ordering::SeqCst);
    let commit_version = input.commit_version();
    let deleted: Vec<u64> = std::iter::once(input.id())
        .chain(inputs_lower.iter().map(|t| t.id()))
        .collect();

    let (new_tables, added) = if let Some(remote) = &core.remote_compactor {
        let req = CompactionRequest {
            shard_id: shard.id,
            shard_ver: shard.ver,
            cf: cf as i32,
            level: level as u32,
            inputs: deleted.clone(),
            safe_ts,
        };
        let metas = remote.compact(req).await?;
        let mut tables = Vec::with_capacity(metas.len());
        for meta in &metas {
            let file = core.open_table_file(meta).await?;
            let len = file.size();
            tables.push(SsTable::open(file, 0, len, core.cache.clone())?);
        }
        (tables, metas)
    } else {
        let mut iters = vec![input.iter(false)];
        for table in &inputs_lower {
            iters.push(table.iter(false));
        }
        let is_bottom = (level + 2..=scf.num_levels()).all(|l| scf.level(l).is_empty());
        let outputs = merge_tables(
            iters,
            safe_ts,
            is_bottom,
            commit_version,
            level + 1 < core.opts.surf_start_level,
            core.opts.max_table_size,
        )?;
        let mut tables = Vec::with_capacity(outputs.len());
        let mut metas = Vec::with_capacity(outputs.len());
        for (image, smallest, biggest) in outputs {
            let (table, meta) = core
                .persist_sst(
                    image,
                    smallest,
                    biggest,
                    commit_version,
                    cf as i32,
                    (level + 1) as u32,
                )
                .await?;
            tables.push(table);
            metas.push(meta);
        }
        (tables, metas)
    };

    {
        let _guard = shard.meta_lock.lock();
        if shard.is_splitting() || shard.is_passive() {
            for meta in &added {
                let path = crate::sstable::sst_filename(&core.opts.dir, meta.id);
                let _ = std::fs::remove_file(path);
            }
            return Ok(());
        }
        core.publish_change(
            shard.id,
            shard.ver,
            Change::Compaction {
                cf: cf as i32,
                level: level as u32,
                deleted: deleted.clone(),
                added,
            },
        )?;
        scf.set_level(upper.replace(&[input.id()], Vec::new()));
        let lower_ids: Vec<u64> = inputs_lower.iter().map(|t| t.id()).collect();
        scf.set_level(lower.replace(&lower_ids, new_tables));
    }

    let mut retired = vec![input];
    retired.extend(inputs_lower);
    retire_tables(core, Vec::new(), retired);
    tracing::info!(shard = shard.id, cf, level, "compacted level");
    Ok(())
}

fn retire_tables(core: &Arc<EngineCore>, l0s: Vec<Arc<L0Table>>, tables: Vec<Arc<SsTable>>) {
    let blob = core.blob.clone();
    let instance_id = core.opts.instance_id;
    let guard = core.epoch.acquire();
    guard.delete(vec![Box::new(Deletion::new(move || {
        for l0 in &l0s {
            if let Some(blob) = &blob {
                blob.set_expired(blob_key(instance_id, l0.id()));
            }
            l0.delete();
        }
        for table in &tables {
            if let Some(blob) = &blob {
                blob.set_expired(blob_key(instance_id, table.id()));
            }
            table.file().delete();
        }
    }))]);
    guard.done();
}

/// K-way merge honoring MVCC retention: the newest version of every user
/// key survives, older versions survive only above the gc safe point, and
/// tombstones are dropped at the bottom of the tree once nothing below can
/// resurrect older data. Output tables cut at user-key boundaries so level
/// ranges stay disjoint.
fn merge_tables(
    iters: Vec<TableIter>,
    safe_ts: u64,
    is_bottom: bool,
    commit_version: u64,
    with_filter: bool,
    max_table_size: usize,
) -> Result<Vec<(Bytes, Bytes, Bytes)>> {
    struct NoErr {
        inner: TableIter,
        err: Rc<RefCell<Option<Error>>>,
    }
    impl Iterator for NoErr {
        type Item = (Bytes, Bytes);
        fn next(&mut self) -> Option<Self::Item> {
            match self.inner.next() {
                Some(Ok(kv)) => Some(kv),
                Some(Err(e)) => {
                    *self.err.borrow_mut() = Some(e);
                    None
                }
                None => None,
            }
        }
    }

    let err = Rc::new(RefCell::new(None));
    let sources: Vec<NoErr> = iters
        .into_iter()
        .map(|inner| NoErr {
            inner,
            err: err.clone(),
        })
        .collect();

    let mut outputs = Vec::new();
    let mut builder = TableBuilder::new(commit_version, with_filter);
    let mut prev_ikey: Vec<u8> = Vec::new();
    let mut last_user_key: Vec<u8> = Vec::new();
    let mut seen_any = false;

    for (ikey, value) in sources
        .into_iter()
        .kmerge_by(|a: &(Bytes, Bytes), b: &(Bytes, Bytes)| a.0 < b.0)
    {
        if seen_any && ikey.as_ref() == prev_ikey.as_slice() {
            continue;
        }
        let (user_key, version) = format::split_internal(&ikey);
        let first_of_key = !seen_any || user_key != last_user_key.as_slice();
        let keep = if first_of_key {
            let is_tombstone = value.first().is_some_and(|m| m & BIT_DELETE != 0);
            !(is_bottom && is_tombstone && version <= safe_ts)
        } else {
            version > safe_ts
        };
        if first_of_key {
            last_user_key.clear();
            last_user_key.extend_from_slice(user_key);
            if builder.estimated_size() >= max_table_size {
                let smallest = Bytes::copy_from_slice(builder.smallest());
                let biggest = Bytes::copy_from_slice(builder.biggest());
                let full = std::mem::replace(&mut builder, TableBuilder::new(commit_version, with_filter));
                outputs.push((full.finish(), smallest, biggest));
            }
        }
        if keep {
            builder.add(&ikey, &value);
        }
        prev_ikey.clear();
        prev_ikey.extend_from_slice(&ikey);
        seen_any = true;
    }

    if let Some(e) = err.borrow_mut().take() {
        return Err(e);
    }
    if !builder.is_empty() {
        let smallest = Bytes::copy_from_slice(builder.smallest());
        let biggest = Bytes::copy_from_slice(builder.biggest());
        outputs.push((builder.finish(), smallest, biggest));
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Value;
    use crate::sstable::TableFile;
    use crate::tmpfs::TempDir;

    fn table_from_entries(
        dir: &TempDir,
        id: u64,
        entries: &[(&[u8], u64, Option<&[u8]>)],
    ) -> Arc<SsTable> {
        let mut builder = TableBuilder::new(id, true);
        for (key, version, value) in entries {
            let ikey = format::encode_internal(key, *version);
            let record = match value {
                Some(v) => Value::new(*version, Bytes::copy_from_slice(v)),
                None => Value::tombstone(*version),
            };
            builder.add(&ikey, &record.encode());
        }
        let image = builder.finish();
        let path = dir.path().join(format!("{id:08}.sst"));
        std::fs::write(&path, &image).unwrap();
        let file = TableFile::open(id, path, false).unwrap();
        let len = file.size();
        SsTable::open(file, 0, len, None).unwrap()
    }

    fn merged_user_versions(outputs: &[(Bytes, Bytes, Bytes)], dir: &TempDir) -> Vec<(Vec<u8>, u64)> {
        let mut result = Vec::new();
        for (i, (image, _, _)) in outputs.iter().enumerate() {
            let path = dir.path().join(format!("out-{i:04}.sst"));
            std::fs::write(&path, image).unwrap();
            let file = TableFile::open(1000 + i as u64, path, false).unwrap();
            let len = file.size();
            let table = SsTable::open(file, 0, len, None).unwrap();
            for item in table.iter(false) {
                let (ikey, _) = item.unwrap();
                let (uk, ver) = format::split_internal(&ikey);
                result.push((uk.to_vec(), ver));
            }
        }
        result
    }

    #[test]
    fn test_merge_keeps_newest_version() {
        let dir = TempDir::new().unwrap();
        let t1 = table_from_entries(&dir, 1, &[(b"k", 30, Some(b"v30")), (b"k", 20, Some(b"v20"))]);
        let t2 = table_from_entries(&dir, 2, &[(b"k", 10, Some(b"v10"))]);

        // Everything is below the safe point: only the newest survives.
        let outputs = merge_tables(
            vec![t1.iter(false), t2.iter(false)],
            100,
            false,
            30,
            true,
            1 << 20,
        )
        .unwrap();
        assert_eq!(
            merged_user_versions(&outputs, &dir),
            vec![(b"k".to_vec(), 30)]
        );
    }

    #[test]
    fn test_merge_keeps_versions_above_safe_point() {
        let dir = TempDir::new().unwrap();
        let t1 = table_from_entries(
            &dir,
            1,
            &[(b"k", 30, Some(b"v30")), (b"k", 20, Some(b"v20")), (b"k", 10, Some(b"v10"))],
        );
        let outputs = merge_tables(vec![t1.iter(false)], 15, false, 30, true, 1 << 20).unwrap();
        // Versions 30 and 20 are above the safe point; 10 is shadowed.
        assert_eq!(
            merged_user_versions(&outputs, &dir),
            vec![(b"k".to_vec(), 30), (b"k".to_vec(), 20)]
        );
    }

    #[test]
    fn test_merge_drops_bottom_tombstones() {
        let dir = TempDir::new().unwrap();
        let t1 = table_from_entries(&dir, 1, &[(b"dead", 20, None), (b"live", 20, Some(b"v"))]);
        let t2 = table_from_entries(&dir, 2, &[(b"dead", 10, Some(b"old"))]);

        let outputs =
            merge_tables(vec![t1.iter(false), t2.iter(false)], 50, true, 20, true, 1 << 20)
                .unwrap();
        assert_eq!(
            merged_user_versions(&outputs, &dir),
            vec![(b"live".to_vec(), 20)]
        );
    }

    #[test]
    fn test_merge_retains_tombstone_above_safe_point() {
        let dir = TempDir::new().unwrap();
        let t1 = table_from_entries(&dir, 1, &[(b"dead", 20, None)]);
        let outputs = merge_tables(vec![t1.iter(false)], 5, true, 20, true, 1 << 20).unwrap();
        // A reader at version 10 must still see through to nothing; the
        // tombstone stays until the safe point passes it.
        assert_eq!(
            merged_user_versions(&outputs, &dir),
            vec![(b"dead".to_vec(), 20)]
        );
    }

    #[test]
    fn test_merge_not_bottom_keeps_tombstones() {
        let dir = TempDir::new().unwrap();
        let t1 = table_from_entries(&dir, 1, &[(b"dead", 20, None)]);
        let outputs = merge_tables(vec![t1.iter(false)], 50, false, 20, true, 1 << 20).unwrap();
        assert_eq!(
            merged_user_versions(&outputs, &dir),
            vec![(b"dead".to_vec(), 20)]
        );
    }

    #[test]
    fn test_merge_dedupes_identical_internal_keys() {
        let dir = TempDir::new().unwrap();
        let t1 = table_from_entries(&dir, 1, &[(b"k", 10, Some(b"new"))]);
        let t2 = table_from_entries(&dir, 2, &[(b"k", 10, Some(b"old"))]);
        let outputs =
            merge_tables(vec![t1.iter(false), t2.iter(false)], 0, false, 10, true, 1 << 20)
                .unwrap();
        assert_eq!(
            merged_user_versions(&outputs, &dir),
            vec![(b"k".to_vec(), 10)]
        );
    }

    #[test]
    fn test_merge_splits_output_at_user_key_boundary() {
        let dir = TempDir::new().unwrap();
        let entries: Vec<(Vec<u8>, u64)> = (0..200u64)
            .map(|i| (format!("key-{i:04}").into_bytes(), 5))
            .collect();
        let refs: Vec<(&[u8], u64, Option<&[u8]>)> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), *v, Some(&b"payload-payload"[..])))
            .collect();
        let t1 = table_from_entries(&dir, 1, &refs);
        let outputs = merge_tables(vec![t1.iter(false)], 0, false, 5, true, 1024).unwrap();
        assert!(outputs.len() > 1);
        // No user key spans two output tables.
        let mut boundaries = Vec::new();
        for (_, smallest, biggest) in &outputs {
            boundaries.push((
                format::user_key(smallest).to_vec(),
                format::user_key(biggest).to_vec(),
            ));
        }
        for w in boundaries.windows(2) {
            assert!(w[0].1 < w[1].0);
        }
    }
}
