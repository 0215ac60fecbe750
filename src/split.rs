//! Split jobs: the file-partitioning work between the shard split stages.
//!
//! `split_shard_files` drives PreSplit -> SplitFileDone by flushing every
//! captured memtable and rewriting any file that straddles a split key, so
//! afterwards each file fits entirely inside one prospective child range.
//! `finish_split` then instantiates the children, handing each one its
//! files and its still-writable splitting memtable.

use std::sync::Arc;

use bytes::Bytes;

use crate::engine::{retire_mem_table, EngineCore};
use crate::epoch::Deletion;
use crate::error::{Error, Result};
use crate::format;
use crate::levels::LevelHandler;
use crate::manifest::{Change, FileMeta, ShardMeta, CF_L0};
use crate::shard::{Shard, SplitContext, SplitStage};
use crate::sstable::{L0Builder, L0Table, SsTable, TableBuilder};

/// Child index for a user key given the ordered split keys.
fn child_index(keys: &[Bytes], user_key: &[u8]) -> usize {
    keys.partition_point(|k| k.as_ref() <= user_key)
}

/// Child index for a whole file by its internal-key bounds. After file
/// splitting every file fits a single child.
fn child_index_for_bounds(keys: &[Bytes], smallest: &[u8], biggest: &[u8]) -> usize {
    let idx = child_index(keys, format::user_key(smallest));
    debug_assert_eq!(idx, child_index(keys, format::user_key(biggest)));
    idx
}

pub(crate) async fn split_shard_files(core: &Arc<EngineCore>, shard: &Arc<Shard>) -> Result<()> {
    // Capture the current state and swap in fresh splitting memtables so
    // concurrent writes keep landing somewhere writable. Writes in the
    // pre-split stages only ever touch the splitting memtables, so the
    // shared memtables below are frozen from here on.
    let (ctx, shared_mems, l0s) = {
        let _guard = shard.meta_lock.lock();
        let ctx = shard.split_ctx().ok_or(Error::SplitFilesWrongStage)?;
        let fresh_mems = (0..=ctx.keys.len()).map(|_| shard.new_mem_table()).collect();
        shard.install_split_ctx(SplitContext {
            keys: ctx.keys.clone(),
            mem_tbls: fresh_mems,
        });
        let shared_mems = shard.mem_tbls();
        shard.set_mem_tbls(vec![shard.new_mem_table()]);
        (ctx, shared_mems, shard.l0_tbls())
    };
    let keys = &ctx.keys;
    let num_children = keys.len() + 1;
    let num_cfs = shard.num_cfs();

    let mut new_l0s: Vec<Arc<L0Table>> = Vec::new();
    let mut added: Vec<FileMeta> = Vec::new();
    let mut deleted: Vec<u64> = Vec::new();

    // Shared memtables, oldest first, each partitioned into per-child L0s.
    for mem in shared_mems.iter().rev() {
        if mem.empty() {
            continue;
        }
        if mem.get_version() == 0 {
            mem.set_version(shard.alloc_commit_version());
        }
        let version = mem.get_version();
        let mut builders: Vec<L0Builder> = (0..num_children)
            .map(|_| L0Builder::new(num_cfs, version))
            .collect();
        for cf in 0..num_cfs {
            for (ikey, value) in mem.iter(cf, false) {
                let idx = child_index(keys, format::user_key(&ikey));
                builders[idx].add(cf, &ikey, &value);
            }
        }
        persist_l0_builders(core, builders, &mut new_l0s, &mut added).await?;
    }

    // Captured splitting memtables are per-child already.
    for mem in ctx.mem_tbls.iter() {
        if mem.empty() {
            continue;
        }
        let version = shard.alloc_commit_version();
        mem.set_version(version);
        let mut builder = L0Builder::new(num_cfs, version);
        for cf in 0..num_cfs {
            for (ikey, value) in mem.iter(cf, false) {
                builder.add(cf, &ikey, &value);
            }
        }
        persist_l0_builders(core, vec![builder], &mut new_l0s, &mut added).await?;
    }

    // Existing L0 files, each partitioned at the split keys.
    for l0 in l0s.iter() {
        deleted.push(l0.id());
        let version = l0.commit_version();
        let mut builders: Vec<L0Builder> = (0..num_children)
            .map(|_| L0Builder::new(num_cfs, version))
            .collect();
        for cf in 0..num_cfs {
            let Some(iter) = l0.iter(cf, false) else {
                continue;
            };
            for item in iter {
                let (ikey, value) = item?;
                let idx = child_index(keys, format::user_key(&ikey));
                builders[idx].add(cf, &ikey, &value);
            }
        }
        persist_l0_builders(core, builders, &mut new_l0s, &mut added).await?;
    }

    // Level tables: rewrite only the ones straddling a split key.
    let mut replaced_levels: Vec<(usize, LevelHandler)> = Vec::new();
    for cf in 0..num_cfs {
        let scf = shard.cf(cf);
        for level in 1..=scf.num_levels() {
            let handler = scf.level(level);
            if handler.is_empty() {
                continue;
            }
            let mut kept: Vec<Arc<SsTable>> = Vec::new();
            let mut level_deleted: Vec<u64> = Vec::new();
            for table in handler.tables() {
                let lo = child_index(keys, format::user_key(table.smallest()));
                let hi = child_index(keys, format::user_key(table.biggest()));
                if lo == hi {
                    kept.push(table.clone());
                    continue;
                }
                level_deleted.push(table.id());
                let mut builders: Vec<TableBuilder> = (0..num_children)
                    .map(|_| {
                        TableBuilder::new(
                            table.commit_version(),
                            level < core.opts.surf_start_level,
                        )
                    })
                    .collect();
                for item in table.iter(false) {
                    let (ikey, value) = item?;
                    let idx = child_index(keys, format::user_key(&ikey));
                    builders[idx].add(&ikey, &value);
                }
                for builder in builders {
                    if builder.is_empty() {
                        continue;
                    }
                    let smallest = Bytes::copy_from_slice(builder.smallest());
                    let biggest = Bytes::copy_from_slice(builder.biggest());
                    let commit_version = builder.commit_version();
                    let (new_table, meta) = core
                        .persist_sst(
                            builder.finish(),
                            smallest,
                            biggest,
                            commit_version,
                            cf as i32,
                            level as u32,
                        )
                        .await?;
                    kept.push(new_table);
                    added.push(meta);
                }
            }
            if !level_deleted.is_empty() {
                deleted.extend(level_deleted);
                replaced_levels.push((cf, LevelHandler::with_tables(level, kept)));
            }
        }
    }

    new_l0s.sort_by(|a, b| b.commit_version().cmp(&a.commit_version()));

    // Publish: manifest record, then the swapped-in state.
    {
        let _guard = shard.meta_lock.lock();
        core.publish_change(
            shard.id,
            shard.ver,
            Change::SplitFiles {
                deleted: deleted.clone(),
                added,
            },
        )?;
        shard.set_l0_tbls(new_l0s);
        for (cf, handler) in replaced_levels {
            shard.cf(cf).set_level(handler);
        }
        shard.mark_initial_flushed();
        shard.set_split_stage(SplitStage::SplitFileDone);
    }

    // Retire the rewritten files and the flushed memtables.
    let guard = core.epoch.acquire();
    let mut resources: Vec<Box<dyn crate::epoch::Resource>> = Vec::new();
    for l0 in l0s.iter() {
        let l0 = l0.clone();
        resources.push(Box::new(Deletion::new(move || l0.delete())));
    }
    for mem in shared_mems.iter().chain(ctx.mem_tbls.iter()) {
        resources.push(retire_mem_table(mem.clone()));
    }
    guard.delete(resources);
    guard.done();

    tracing::info!(shard = shard.id, children = num_children, "split files done");
    Ok(())
}

async fn persist_l0_builders(
    core: &Arc<EngineCore>,
    builders: Vec<L0Builder>,
    new_l0s: &mut Vec<Arc<L0Table>>,
    added: &mut Vec<FileMeta>,
) -> Result<()> {
    for builder in builders {
        if builder.is_empty() {
            continue;
        }
        let (l0, meta) = core.persist_l0(builder).await?;
        new_l0s.push(l0);
        added.push(meta);
    }
    Ok(())
}

pub(crate) fn finish_split(
    core: &Arc<EngineCore>,
    shard: &Arc<Shard>,
    new_shard_ids: &[(u64, u64)],
) -> Result<Vec<Arc<Shard>>> {
    let _guard = shard.meta_lock.lock();
    let ctx = shard.split_ctx().ok_or(Error::FinishSplitWrongStage)?;
    let num_children = ctx.keys.len() + 1;
    if new_shard_ids.len() != num_children {
        return Err(Error::Config(format!(
            "expected {num_children} child shard ids, got {}",
            new_shard_ids.len()
        )));
    }

    let mut bounds: Vec<Bytes> = Vec::with_capacity(num_children + 1);
    bounds.push(shard.start.clone());
    bounds.extend(ctx.keys.iter().cloned());
    bounds.push(shard.end.clone());

    // Partition the parent's open tables by child range.
    let mut child_l0s: Vec<Vec<Arc<L0Table>>> = vec![Vec::new(); num_children];
    let mut child_files: Vec<Vec<FileMeta>> = vec![Vec::new(); num_children];
    for l0 in shard.l0_tbls().iter() {
        let (smallest, biggest) = l0.bounds();
        let idx = child_index_for_bounds(&ctx.keys, &smallest, &biggest);
        child_files[idx].push(FileMeta {
            id: l0.id(),
            cf: CF_L0,
            level: 0,
            smallest,
            biggest,
            commit_version: l0.commit_version(),
            size: l0.size(),
        });
        child_l0s[idx].push(l0.clone());
    }

    let mut child_levels: Vec<Vec<Vec<Arc<SsTable>>>> =
        vec![vec![Vec::new(); shard.num_cfs()]; num_children];
    for cf in 0..shard.num_cfs() {
        let scf = shard.cf(cf);
        for level in 1..=scf.num_levels() {
            for table in scf.level(level).tables() {
                let idx =
                    child_index_for_bounds(&ctx.keys, table.smallest(), table.biggest());
                child_files[idx].push(FileMeta {
                    id: table.id(),
                    cf: cf as i32,
                    level: level as u32,
                    smallest: table.smallest().clone(),
                    biggest: table.biggest().clone(),
                    commit_version: table.commit_version(),
                    size: table.size(),
                });
                child_levels[idx][cf].push(table.clone());
            }
        }
    }

    let base_version = shard.last_commit_version();
    let mut children = Vec::with_capacity(num_children);
    let mut child_metas = Vec::with_capacity(num_children);
    for (i, &(id, ver)) in new_shard_ids.iter().enumerate() {
        let mut meta = ShardMeta::new(
            id,
            ver,
            bounds[i].clone(),
            bounds[i + 1].clone(),
            base_version,
        );
        meta.data_version = base_version;
        meta.initial_flushed = shard.is_initial_flushed();
        meta.files = std::mem::take(&mut child_files[i]);
        let child = Arc::new(Shard::new(&meta, &core.opts));
        // The still-writable splitting memtable becomes the child's active
        // memtable, carrying the writes that arrived after split-files.
        child.set_mem_tbls(vec![ctx.mem_tbls[i].clone()]);
        child.set_l0_tbls(std::mem::take(&mut child_l0s[i]));
        child_metas.push(meta);
        children.push(child);
    }

    // Install the level tables per child.
    for (i, child) in children.iter().enumerate() {
        for cf in 0..shard.num_cfs() {
            let mut per_level: Vec<Vec<Arc<SsTable>>> =
                vec![Vec::new(); child.cf(cf).num_levels()];
            for meta in child_metas[i].files.iter().filter(|f| f.cf == cf as i32) {
                if let Some(table) = child_levels[i][cf].iter().find(|t| t.id() == meta.id) {
                    per_level[meta.level as usize - 1].push(table.clone());
                }
            }
            for (level_idx, tables) in per_level.into_iter().enumerate() {
                if !tables.is_empty() {
                    child
                        .cf(cf)
                        .set_level(LevelHandler::with_tables(level_idx + 1, tables));
                }
            }
        }
    }

    core.publish_change(
        shard.id,
        shard.ver,
        Change::FinishSplit {
            children: child_metas,
        },
    )?;

    shard.set_split_stage(SplitStage::SplitDone);
    shard.set_passive(true);
    core.shards.remove(&shard.id);
    for child in &children {
        core.shards.insert(child.id, child.clone());
    }
    tracing::info!(
        parent = shard.id,
        children = ?new_shard_ids.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
        "finished split"
    );
    Ok(children)
}
