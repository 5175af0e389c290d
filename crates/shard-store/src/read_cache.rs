use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use shard_types::{Address, ChunkId, Index, SharedChunk};

use crate::error::StoreResult;
use crate::stats::{CacheStats, LayerStats, StatsCounter};
use crate::traits::{ChunkLock, ChunkStore};

/// Read-through LRU cache of whole chunks.
///
/// Misses are filled under the identifier's lock in the layer beneath and
/// re-checked after the lock is taken. Mutations keep the cached value in
/// step under the same lock; a failed mutation drops the entry.
pub struct ReadCache<S> {
    inner: S,
    entries: Mutex<LruCache<ChunkId, SharedChunk>>,
    stats: StatsCounter,
}

impl<S: ChunkStore> ReadCache<S> {
    pub fn new(inner: S, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            entries: Mutex::new(LruCache::new(capacity)),
            stats: StatsCounter::default(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn cached(&self, id: &ChunkId) -> Option<SharedChunk> {
        self.entries.lock().get(id).cloned()
    }

    fn remember(&self, id: ChunkId, chunk: SharedChunk) {
        // `push` hands back either the old value of `id` or an evicted entry.
        let displaced = self.entries.lock().push(id.clone(), chunk);
        if displaced.is_some_and(|(old, _)| old != id) {
            self.stats.evicted();
        }
    }
}

impl<S: ChunkStore> ChunkStore for ReadCache<S> {
    fn lock(&self, id: &ChunkId) -> StoreResult<()> {
        self.inner.lock(id)
    }

    fn try_lock(&self, id: &ChunkId) -> StoreResult<bool> {
        self.inner.try_lock(id)
    }

    fn try_lock_for(&self, id: &ChunkId, timeout: Duration) -> StoreResult<bool> {
        self.inner.try_lock_for(id, timeout)
    }

    fn unlock(&self, id: &ChunkId) -> StoreResult<()> {
        self.inner.unlock(id)
    }

    fn contains(&self, id: &ChunkId) -> StoreResult<bool> {
        if self.cached(id).is_some() {
            return Ok(true);
        }
        self.inner.contains(id)
    }

    fn get_index(&self, id: &ChunkId) -> StoreResult<Option<Index>> {
        if let Some(chunk) = self.cached(id) {
            return Ok(Some(chunk.index()));
        }
        self.inner.get_index(id)
    }

    fn get_indices(&self, min: &Address, max: &Address) -> StoreResult<BTreeMap<ChunkId, Index>> {
        self.inner.get_indices(min, max)
    }

    fn read(&self, id: &ChunkId) -> StoreResult<Option<SharedChunk>> {
        if let Some(chunk) = self.cached(id) {
            self.stats.hit();
            return Ok(Some(chunk));
        }
        let _guard = ChunkLock::acquire(&self.inner, id)?;
        if let Some(chunk) = self.cached(id) {
            self.stats.hit();
            return Ok(Some(chunk));
        }
        self.stats.miss();
        let loaded = self.inner.read(id)?;
        if let Some(chunk) = &loaded {
            self.remember(id.clone(), chunk.clone());
        }
        Ok(loaded)
    }

    fn write(&self, chunk: &SharedChunk) -> StoreResult<bool> {
        let id = chunk.id();
        let _guard = ChunkLock::acquire(&self.inner, &id)?;
        match self.inner.write(chunk) {
            Ok(changed) => {
                self.remember(id, chunk.clone());
                Ok(changed)
            }
            Err(e) => {
                self.entries.lock().pop(&id);
                Err(e)
            }
        }
    }

    fn force_write(&self, chunk: &SharedChunk) -> StoreResult<()> {
        let id = chunk.id();
        let _guard = ChunkLock::acquire(&self.inner, &id)?;
        match self.inner.force_write(chunk) {
            Ok(()) => {
                self.remember(id, chunk.clone());
                Ok(())
            }
            Err(e) => {
                self.entries.lock().pop(&id);
                Err(e)
            }
        }
    }

    fn delete(&self, id: &ChunkId) -> StoreResult<bool> {
        let _guard = ChunkLock::acquire(&self.inner, id)?;
        self.entries.lock().pop(id);
        self.inner.delete(id)
    }

    fn close(&self) -> StoreResult<()> {
        self.entries.lock().clear();
        self.inner.close()
    }

    fn layer_stats(&self) -> Vec<LayerStats> {
        let mut out = vec![LayerStats {
            layer: "read",
            entries: self.len(),
            dirty: 0,
            stats: self.stats(),
        }];
        out.extend(self.inner.layer_stats());
        out
    }
}
