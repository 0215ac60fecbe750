//! Epoch-based resource reclamation.
//!
//! Readers pin the current epoch through a [`Guard`]; anything scheduled for
//! destruction is tagged with the epoch at enqueue time and destroyed only
//! once no guard acquired at or before that epoch remains active. This lets
//! snapshots keep reading memtables and table files that have already been
//! replaced, without reference counting every block access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context};

/// A deferred-destruction resource. `destroy` is invoked exactly once by the
/// reclaimer, but must itself be idempotent with respect to repeated close
/// calls on the underlying handle.
pub trait Resource: Send + Sync {
    fn destroy(&self);
}

/// Wraps a closure as a [`Resource`].
pub struct Deletion {
    f: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Deletion {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            f: Mutex::new(Some(Box::new(f))),
        }
    }
}

impl Resource for Deletion {
    fn destroy(&self) {
        if let Some(f) = self.f.lock().take() {
            f();
        }
    }
}

struct Pending {
    epoch: u64,
    resources: Vec<Box<dyn Resource>>,
}

struct Inner {
    epoch: AtomicU64,
    next_guard_id: AtomicU64,
    /// guard id -> epoch at acquire time.
    active: Mutex<HashMap<u64, u64>>,
    pending: Mutex<Vec<Pending>>,
}

/// Shared handle to the reclamation framework.
#[derive(Clone)]
pub struct EpochFramework {
    inner: Arc<Inner>,
}

impl Default for EpochFramework {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochFramework {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                epoch: AtomicU64::new(1),
                next_guard_id: AtomicU64::new(1),
                active: Mutex::new(HashMap::new()),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a reader at the current epoch. The returned guard must be
    /// released with [`Guard::done`]; dropping it releases as a backstop.
    pub fn acquire(&self) -> Guard {
        let id = self.inner.next_guard_id.fetch_add(1, Ordering::Relaxed);
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.active.lock().insert(id, epoch);
        Guard {
            inner: self.inner.clone(),
            id,
            released: AtomicBool::new(false),
        }
    }

    /// Advance the epoch one step and destroy every pending resource whose
    /// enqueue epoch precedes all active guards.
    pub fn advance_and_collect(&self) -> usize {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.collect()
    }

    fn collect(&self) -> usize {
        let floor = {
            let active = self.inner.active.lock();
            active
                .values()
                .min()
                .copied()
                .unwrap_or_else(|| self.inner.epoch.load(Ordering::SeqCst))
        };
        let ready: Vec<Pending> = {
            let mut pending = self.inner.pending.lock();
            let (ready, keep) = pending.drain(..).partition(|p| p.epoch < floor);
            *pending = keep;
            ready
        };
        let mut n = 0;
        for batch in ready {
            for res in batch.resources {
                res.destroy();
                n += 1;
            }
        }
        n
    }

    /// Destroy everything still pending. Called at close after all guards
    /// have been released.
    pub fn collect_all(&self) {
        debug_assert!(self.inner.active.lock().is_empty());
        let drained: Vec<Pending> = self.inner.pending.lock().drain(..).collect();
        for batch in drained {
            for res in batch.resources {
                res.destroy();
            }
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().iter().map(|p| p.resources.len()).sum()
    }
}

/// An active-reader registration.
pub struct Guard {
    inner: Arc<Inner>,
    id: u64,
    released: AtomicBool,
}

impl Guard {
    /// Enqueue resources for destruction once every guard at or before the
    /// current epoch has departed.
    pub fn delete(&self, resources: Vec<Box<dyn Resource>>) {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.pending.lock().push(Pending { epoch, resources });
    }

    /// Release the registration. Idempotent.
    pub fn done(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.inner.active.lock().remove(&self.id);
        }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.done();
    }
}

/// Periodic background task that drives the reclaimer.
pub struct ReclaimTask {
    framework: EpochFramework,
    interval: Duration,
}

impl ReclaimTask {
    pub fn new(framework: EpochFramework, interval: Duration) -> Self {
        Self {
            framework,
            interval,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for ReclaimTask {
    fn name(&self) -> &'static str {
        "epoch-reclaim"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let destroyed = self.framework.advance_and_collect();
        if destroyed > 0 {
            tracing::debug!(destroyed, "reclaimed resources");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_resource(counter: &Arc<AtomicUsize>) -> Box<dyn Resource> {
        let counter = counter.clone();
        Box::new(Deletion::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_delete_waits_for_older_guard() {
        let fw = EpochFramework::new();
        let destroyed = Arc::new(AtomicUsize::new(0));

        let reader = fw.acquire();
        let writer = fw.acquire();
        writer.delete(vec![counter_resource(&destroyed)]);
        writer.done();

        // The reader was acquired at the enqueue epoch, so nothing may be
        // destroyed however often the epoch advances.
        for _ in 0..3 {
            fw.advance_and_collect();
        }
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);

        reader.done();
        fw.advance_and_collect();
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_destroy_after_all_guards_depart() {
        let fw = EpochFramework::new();
        let destroyed = Arc::new(AtomicUsize::new(0));

        let g = fw.acquire();
        g.delete(vec![
            counter_resource(&destroyed),
            counter_resource(&destroyed),
        ]);
        g.done();
        assert_eq!(fw.advance_and_collect(), 2);
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(fw.pending_len(), 0);
    }

    #[test]
    fn test_guard_drop_releases() {
        let fw = EpochFramework::new();
        let destroyed = Arc::new(AtomicUsize::new(0));
        {
            let g = fw.acquire();
            g.delete(vec![counter_resource(&destroyed)]);
        }
        fw.advance_and_collect();
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fuzz_overlapping_readers_and_deletes() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let fw = EpochFramework::new();
        let destroyed = Arc::new(AtomicUsize::new(0));
        let mut rng = StdRng::seed_from_u64(0xe9);
        let mut guards: Vec<Guard> = Vec::new();
        let mut scheduled = 0usize;

        for _ in 0..1000 {
            match rng.gen_range(0..4) {
                0 => guards.push(fw.acquire()),
                1 => {
                    if !guards.is_empty() {
                        let idx = rng.gen_range(0..guards.len());
                        guards.swap_remove(idx).done();
                    }
                }
                2 => {
                    let g = fw.acquire();
                    g.delete(vec![counter_resource(&destroyed)]);
                    scheduled += 1;
                    g.done();
                }
                _ => {
                    fw.advance_and_collect();
                    // Destruction never outruns scheduling.
                    assert!(destroyed.load(Ordering::SeqCst) <= scheduled);
                }
            }
        }
        for g in guards {
            g.done();
        }
        fw.advance_and_collect();
        assert_eq!(destroyed.load(Ordering::SeqCst), scheduled);
    }

    #[tokio::test]
    async fn test_reclaim_task_runs() {
        let fw = EpochFramework::new();
        let destroyed = Arc::new(AtomicUsize::new(0));
        let g = fw.acquire();
        g.delete(vec![counter_resource(&destroyed)]);
        g.done();

        let sched = crate::scheduler::Scheduler::new();
        sched.register(Arc::new(ReclaimTask::new(
            fw.clone(),
            Duration::from_millis(5),
        )));
        tokio::time::sleep(Duration::from_millis(50)).await;
        sched.shutdown().await.unwrap();
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}
