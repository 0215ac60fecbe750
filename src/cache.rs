//! Cost-bounded concurrent block cache.
//!
//! Keys are `(file id, block offset)` pairs, cost is the block length in
//! bytes. Each of the lock-sharded segments runs an S3-FIFO style policy:
//! new blocks enter a small probationary queue, blocks touched again get
//! promoted into the main queue, and evicted probationary keys leave a ghost
//! entry so a quick re-miss promotes directly. Concurrent misses for the
//! same key coalesce so at most one read is outstanding per block.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::error::Result;

const NUM_SEGMENTS: usize = 16;
const MAX_FREQUENCY_LIMIT: u8 = 3;

pub type EvictFn = Box<dyn Fn(u64, u64, Bytes) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BlockKey {
    file_id: u64,
    offset: u64,
}

struct CacheEntry {
    data: Bytes,
    freq: u8,
}

struct LoadState {
    done: Mutex<bool>,
    cv: Condvar,
}

struct Segment {
    small: VecDeque<BlockKey>,
    main: VecDeque<BlockKey>,
    ghost: VecDeque<BlockKey>,
    entries: HashMap<BlockKey, CacheEntry>,
    ghost_set: HashMap<BlockKey, ()>,
    loading: HashMap<BlockKey, Arc<LoadState>>,
    cost: usize,
    max_cost: usize,
}

impl Segment {
    fn new(max_cost: usize) -> Self {
        Self {
            small: VecDeque::new(),
            main: VecDeque::new(),
            ghost: VecDeque::new(),
            entries: HashMap::new(),
            ghost_set: HashMap::new(),
            loading: HashMap::new(),
            cost: 0,
            max_cost,
        }
    }

    fn get(&mut self, key: &BlockKey) -> Option<Bytes> {
        let entry = self.entries.get_mut(key)?;
        entry.freq = (entry.freq + 1).min(MAX_FREQUENCY_LIMIT);
        Some(entry.data.clone())
    }

    fn insert(&mut self, key: BlockKey, data: Bytes, evict_fn: &Option<EvictFn>) {
        if self.entries.contains_key(&key) {
            return;
        }
        self.cost += data.len();
        self.entries.insert(key, CacheEntry { data, freq: 0 });
        if self.ghost_set.remove(&key).is_some() {
            self.main.push_back(key);
        } else {
            self.small.push_back(key);
        }
        while self.cost > self.max_cost {
            if !self.evict_one(evict_fn) {
                break;
            }
        }
    }

    fn evict_one(&mut self, evict_fn: &Option<EvictFn>) -> bool {
        // Prefer draining the probationary queue; promote hot entries.
        while let Some(key) = self.small.pop_front() {
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            if entry.freq > 1 {
                self.main.push_back(key);
            } else {
                self.remove(key, evict_fn);
                self.ghost_set.insert(key, ());
                self.ghost.push_back(key);
                if self.ghost.len() > self.entries.len().max(16) {
                    if let Some(old) = self.ghost.pop_front() {
                        self.ghost_set.remove(&old);
                    }
                }
                return true;
            }
        }
        while let Some(key) = self.main.pop_front() {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            if entry.freq > 0 {
                entry.freq -= 1;
                self.main.push_back(key);
            } else {
                self.remove(key, evict_fn);
                return true;
            }
        }
        false
    }

    fn remove(&mut self, key: BlockKey, evict_fn: &Option<EvictFn>) {
        if let Some(entry) = self.entries.remove(&key) {
            self.cost -= entry.data.len();
            if let Some(f) = evict_fn {
                f(key.file_id, key.offset, entry.data);
            }
        }
    }
}

pub struct BlockCache {
    segments: Vec<Mutex<Segment>>,
    evict_fn: Option<EvictFn>,
}

impl BlockCache {
    pub fn new(max_cost: usize, evict_fn: Option<EvictFn>) -> Self {
        let per_segment = (max_cost / NUM_SEGMENTS).max(1);
        Self {
            segments: (0..NUM_SEGMENTS)
                .map(|_| Mutex::new(Segment::new(per_segment)))
                .collect(),
            evict_fn,
        }
    }

    fn segment(&self, key: &BlockKey) -> &Mutex<Segment> {
        let h = key
            .file_id
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(key.offset);
        &self.segments[(h as usize) % NUM_SEGMENTS]
    }

    pub fn get(&self, file_id: u64, offset: u64) -> Option<Bytes> {
        let key = BlockKey { file_id, offset };
        self.segment(&key).lock().get(&key)
    }

    /// Return the cached block or run `load` to fetch it, coalescing
    /// concurrent misses for the same key into a single read.
    pub fn get_or_load(
        &self,
        file_id: u64,
        offset: u64,
        load: impl FnOnce() -> Result<Bytes>,
    ) -> Result<Bytes> {
        let key = BlockKey { file_id, offset };
        let seg = self.segment(&key);
        loop {
            let mut guard = seg.lock();
            if let Some(data) = guard.get(&key) {
                return Ok(data);
            }
            if let Some(state) = guard.loading.get(&key).cloned() {
                drop(guard);
                let mut done = state.done.lock();
                while !*done {
                    state.cv.wait(&mut done);
                }
                // The loader may have failed; retry the whole sequence.
                continue;
            }
            let state = Arc::new(LoadState {
                done: Mutex::new(false),
                cv: Condvar::new(),
            });
            guard.loading.insert(key, state.clone());
            drop(guard);

            let result = load();
            let mut guard = seg.lock();
            guard.loading.remove(&key);
            if let Ok(data) = &result {
                guard.insert(key, data.clone(), &self.evict_fn);
            }
            drop(guard);
            *state.done.lock() = true;
            state.cv.notify_all();
            return result;
        }
    }

    pub fn total_cost(&self) -> usize {
        self.segments.iter().map(|s| s.lock().cost).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_get_or_load_caches() {
        let cache = BlockCache::new(1 << 20, None);
        let loads = AtomicUsize::new(0);
        for _ in 0..5 {
            let data = cache
                .get_or_load(1, 0, || {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(Bytes::from_static(b"block"))
                })
                .unwrap();
            assert_eq!(data, Bytes::from_static(b"block"));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.total_cost(), 5);
    }

    #[test]
    fn test_load_error_not_cached() {
        let cache = BlockCache::new(1 << 20, None);
        let err = cache.get_or_load(1, 0, || Err(crate::error::Error::Io("boom".into())));
        assert!(err.is_err());
        assert!(cache.get(1, 0).is_none());
        // A later successful load still works.
        cache
            .get_or_load(1, 0, || Ok(Bytes::from_static(b"ok")))
            .unwrap();
        assert_eq!(cache.get(1, 0).unwrap(), Bytes::from_static(b"ok"));
    }

    #[test]
    fn test_cost_bound_evicts() {
        let cache = BlockCache::new(NUM_SEGMENTS * 64, None);
        for i in 0..256u64 {
            let data = Bytes::from(vec![0u8; 32]);
            cache.get_or_load(i, 0, || Ok(data)).unwrap();
        }
        assert!(cache.total_cost() <= NUM_SEGMENTS * 64);
    }

    #[test]
    fn test_evict_hook_fires() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let hook = {
            let evicted = evicted.clone();
            Box::new(move |_f: u64, _o: u64, _d: Bytes| {
                evicted.fetch_add(1, Ordering::SeqCst);
            })
        };
        let cache = BlockCache::new(NUM_SEGMENTS * 64, Some(hook));
        for i in 0..256u64 {
            cache
                .get_or_load(i, 0, || Ok(Bytes::from(vec![0u8; 32])))
                .unwrap();
        }
        assert!(evicted.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_concurrent_miss_coalescing() {
        let cache = Arc::new(BlockCache::new(1 << 20, None));
        let loads = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let loads = loads.clone();
            handles.push(std::thread::spawn(move || {
                cache
                    .get_or_load(9, 128, || {
                        loads.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(10));
                        Ok(Bytes::from_static(b"once"))
                    })
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.join().unwrap(), Bytes::from_static(b"once"));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
