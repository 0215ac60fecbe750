//! Flush pipeline: two single-consumer stages connected by bounded
//! channels. The build worker turns sealed memtables into L0 files; the
//! result worker publishes them into their shard in submission order and
//! retires the flushed memtables through the epoch reclaimer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::engine::{retire_mem_table, EngineCore};
use crate::error::Result;
use crate::manifest::{Change, FileMeta};
use crate::memtable::CfTable;
use crate::sstable::{L0Builder, L0Table};

pub(crate) struct FlushTask {
    pub shard_id: u64,
    pub shard_ver: u64,
    pub mem_tbl: Arc<CfTable>,
}

pub(crate) struct FlushResult {
    shard_id: u64,
    shard_ver: u64,
    mem_tbl: Arc<CfTable>,
    /// None for the empty placeholder flush of a fresh shard.
    l0: Option<(Arc<L0Table>, FileMeta)>,
}

pub(crate) async fn run_flush_worker(
    core: Arc<EngineCore>,
    mut rx: mpsc::Receiver<FlushTask>,
    result_tx: mpsc::Sender<FlushResult>,
) {
    while let Some(task) = rx.recv().await {
        match build_l0(&core, &task).await {
            Ok(result) => {
                if result_tx.send(result).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                // The memtable stays immutable and visible; re-queue the
                // build after a short pause.
                tracing::error!(shard = task.shard_id, error = %e, "flush build failed, requeueing");
                tokio::time::sleep(Duration::from_millis(100)).await;
                if core.send_flush(task).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn build_l0(core: &Arc<EngineCore>, task: &FlushTask) -> Result<FlushResult> {
    let mem_tbl = &task.mem_tbl;
    let commit_version = mem_tbl.get_version();
    debug_assert!(commit_version > 0, "flushing an unsealed memtable");

    if mem_tbl.empty() {
        return Ok(FlushResult {
            shard_id: task.shard_id,
            shard_ver: task.shard_ver,
            mem_tbl: mem_tbl.clone(),
            l0: None,
        });
    }

    let mut builder = L0Builder::new(mem_tbl.num_cfs(), commit_version);
    for cf in 0..mem_tbl.num_cfs() {
        for (ikey, value) in mem_tbl.iter(cf, false) {
            builder.add(cf, &ikey, &value);
        }
    }
    let (l0, meta) = core.persist_l0(builder).await?;
    tracing::info!(
        shard = task.shard_id,
        file_id = meta.id,
        commit_version,
        size = meta.size,
        "built L0 table"
    );
    Ok(FlushResult {
        shard_id: task.shard_id,
        shard_ver: task.shard_ver,
        mem_tbl: mem_tbl.clone(),
        l0: Some((l0, meta)),
    })
}

pub(crate) async fn run_flush_result_worker(
    core: Arc<EngineCore>,
    mut rx: mpsc::Receiver<FlushResult>,
) {
    while let Some(result) = rx.recv().await {
        if let Err(e) = install_flush_result(&core, result) {
            tracing::error!(error = %e, "failed to install flush result");
        }
    }
}

fn install_flush_result(core: &Arc<EngineCore>, result: FlushResult) -> Result<()> {
    let Ok(shard) = core.get_shard(result.shard_id) else {
        tracing::info!(shard = result.shard_id, "dropping flush result for removed shard");
        return Ok(());
    };
    if shard.ver != result.shard_ver {
        tracing::info!(shard = shard.id, "dropping flush result for stale shard version");
        return Ok(());
    }
    let mem_version = result.mem_tbl.get_version();

    {
        let _guard = shard.meta_lock.lock();
        // A shard that entered a split owns its memtables now; the split
        // job re-flushes them into partitioned files itself.
        if shard.is_splitting() {
            if let Some((l0, _)) = &result.l0 {
                l0.delete();
            }
            tracing::info!(shard = shard.id, "dropping flush result, shard is splitting");
            return Ok(());
        }
        let change = match &result.l0 {
            Some((_, meta)) => Change::Flush {
                l0: meta.clone(),
                mem_table_version: mem_version,
            },
            None => Change::InitialFlush {
                commit_version: mem_version,
            },
        };
        core.publish_change(shard.id, shard.ver, change)?;

        if let Some((l0, _)) = &result.l0 {
            let existing = shard.l0_tbls();
            let mut next = Vec::with_capacity(existing.len() + 1);
            next.push(l0.clone());
            next.extend(existing.iter().cloned());
            shard.set_l0_tbls(next);
        }
        shard.mark_initial_flushed();
    }

    if let Some(removed) = shard.remove_mem_table(mem_version) {
        let guard = core.epoch.acquire();
        guard.delete(vec![retire_mem_table(removed)]);
        guard.done();
    }
    Ok(())
}
