use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use shard_types::{Address, ChunkId, Index, SharedChunk};

use crate::error::StoreResult;
use crate::stats::{CacheStats, LayerStats, StatsCounter};
use crate::traits::{ChunkLock, ChunkStore};

/// What the cache knows about one identifier.
#[derive(Clone, Debug, PartialEq)]
enum Known {
    Absent,
    /// Exists beneath, index not loaded yet.
    Present,
    Loaded(Index),
}

/// LRU cache of [`Index`] projections.
///
/// Answers `contains` and `get_index` without touching the layer beneath
/// and turns writes of an unchanged chunk into no-ops. Chunk bodies are
/// never cached here. Any error drops the key, leaving it unknown.
pub struct IndexCache<S> {
    inner: S,
    entries: Mutex<LruCache<ChunkId, Known>>,
    stats: StatsCounter,
}

impl<S: ChunkStore> IndexCache<S> {
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

    fn known(&self, id: &ChunkId) -> Option<Known> {
        self.entries.lock().get(id).cloned()
    }

    fn learn(&self, id: ChunkId, known: Known) {
        let displaced = self.entries.lock().push(id.clone(), known);
        if displaced.is_some_and(|(old, _)| old != id) {
            self.stats.evicted();
        }
    }

    fn forget(&self, id: &ChunkId) {
        self.entries.lock().pop(id);
    }

    /// Record the outcome of an operation beneath, or forget `id` on error.
    fn track<T>(&self, id: &ChunkId, result: StoreResult<T>, known: impl FnOnce(&T) -> Known) -> StoreResult<T> {
        match &result {
            Ok(value) => self.learn(id.clone(), known(value)),
            Err(_) => self.forget(id),
        }
        result
    }
}

impl<S: ChunkStore> ChunkStore for IndexCache<S> {
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
        match self.known(id) {
            Some(Known::Absent) => {
                self.stats.hit();
                return Ok(false);
            }
            Some(_) => {
                self.stats.hit();
                return Ok(true);
            }
            None => {}
        }
        let _guard = ChunkLock::acquire(&self.inner, id)?;
        if let Some(known) = self.known(id) {
            self.stats.hit();
            return Ok(known != Known::Absent);
        }
        self.stats.miss();
        let result = self.inner.contains(id);
        self.track(id, result, |&present| if present { Known::Present } else { Known::Absent })
    }

    fn get_index(&self, id: &ChunkId) -> StoreResult<Option<Index>> {
        match self.known(id) {
            Some(Known::Loaded(index)) => {
                self.stats.hit();
                return Ok(Some(index));
            }
            Some(Known::Absent) => {
                self.stats.hit();
                return Ok(None);
            }
            _ => {}
        }
        let _guard = ChunkLock::acquire(&self.inner, id)?;
        match self.known(id) {
            Some(Known::Loaded(index)) => {
                self.stats.hit();
                return Ok(Some(index));
            }
            Some(Known::Absent) => {
                self.stats.hit();
                return Ok(None);
            }
            _ => {}
        }
        self.stats.miss();
        let result = self.inner.get_index(id);
        self.track(id, result, |index| match index {
            Some(index) => Known::Loaded(index.clone()),
            None => Known::Absent,
        })
    }

    fn get_indices(&self, min: &Address, max: &Address) -> StoreResult<BTreeMap<ChunkId, Index>> {
        self.inner.get_indices(min, max)
    }

    fn read(&self, id: &ChunkId) -> StoreResult<Option<SharedChunk>> {
        let _guard = ChunkLock::acquire(&self.inner, id)?;
        let result = self.inner.read(id);
        self.track(id, result, |chunk| match chunk {
            Some(chunk) => Known::Loaded(chunk.index()),
            None => Known::Absent,
        })
    }

    fn write(&self, chunk: &SharedChunk) -> StoreResult<bool> {
        let id = chunk.id();
        let _guard = ChunkLock::acquire(&self.inner, &id)?;
        let index = chunk.index();
        if let Some(Known::Loaded(cached)) = self.known(&id) {
            if cached == index {
                self.stats.hit();
                return Ok(false);
            }
        }
        let result = self.inner.write(chunk);
        self.track(&id, result, |_| Known::Loaded(index))
    }

    fn force_write(&self, chunk: &SharedChunk) -> StoreResult<()> {
        let id = chunk.id();
        let _guard = ChunkLock::acquire(&self.inner, &id)?;
        let result = self.inner.force_write(chunk);
        self.track(&id, result, |_| Known::Loaded(chunk.index()))
    }

    fn delete(&self, id: &ChunkId) -> StoreResult<bool> {
        let _guard = ChunkLock::acquire(&self.inner, id)?;
        let result = self.inner.delete(id);
        self.track(id, result, |_| Known::Absent)
    }

    fn close(&self) -> StoreResult<()> {
        self.entries.lock().clear();
        self.inner.close()
    }

    fn layer_stats(&self) -> Vec<LayerStats> {
        let mut out = vec![LayerStats {
            layer: "index",
            entries: self.len(),
            dirty: 0,
            stats: self.stats(),
        }];
        out.extend(self.inner.layer_stats());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileStore;
    use crate::layout::Layout;
    use crate::memory::MemoryStore;
    use crate::testkit::{named, registry};
    use std::fs;
    use tempfile::TempDir;

    fn cache(capacity: usize) -> IndexCache<MemoryStore> {
        IndexCache::new(MemoryStore::new(), NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn absent_is_remembered() {
        let cache = cache(8);
        let id = named("ghost", b"").id();
        assert!(!cache.contains(&id).unwrap());
        assert!(!cache.contains(&id).unwrap());
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.get_index(&id).unwrap(), None);
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn present_then_loaded() {
        let cache = cache(8);
        let chunk = named("a", b"1");
        cache.inner().write(&chunk).unwrap();
        assert!(cache.contains(&chunk.id()).unwrap());
        assert_eq!(cache.known(&chunk.id()), Some(Known::Present));
        assert_eq!(cache.get_index(&chunk.id()).unwrap(), Some(chunk.index()));
        assert_eq!(cache.known(&chunk.id()), Some(Known::Loaded(chunk.index())));
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn unchanged_write_skips_layer_beneath() {
        let dir = TempDir::new().unwrap();
        let file = FileStore::open(dir.path(), Layout::default(), registry()).unwrap();
        let cache = IndexCache::new(file, NonZeroUsize::new(8).unwrap());
        let chunk = named("a", b"1");
        assert!(cache.write(&chunk).unwrap());

        // Remove the file behind the cache's back; the cached index still
        // turns the repeat write into a no-op.
        fs::remove_file(cache.inner().path_of(&chunk.id())).unwrap();
        assert!(!cache.write(&chunk).unwrap());
        assert!(cache.write(&named("a", b"2")).unwrap());
    }

    #[test]
    fn read_refreshes_and_delete_marks_absent() {
        let cache = cache(8);
        let chunk = named("a", b"1");
        cache.inner().write(&chunk).unwrap();
        cache.read(&chunk.id()).unwrap();
        assert_eq!(cache.known(&chunk.id()), Some(Known::Loaded(chunk.index())));
        assert!(cache.delete(&chunk.id()).unwrap());
        assert_eq!(cache.known(&chunk.id()), Some(Known::Absent));
        assert!(!cache.contains(&chunk.id()).unwrap());
    }

    #[test]
    fn error_forgets_key() {
        let dir = TempDir::new().unwrap();
        let file = FileStore::open(dir.path(), Layout::default(), registry())
            .unwrap()
            .with_max_chunk_size(128);
        let cache = IndexCache::new(file, NonZeroUsize::new(8).unwrap());
        let small = named("a", b"1");
        cache.write(&small).unwrap();
        assert!(cache.known(&small.id()).is_some());
        let big = named("a", &[7u8; 256]);
        assert!(cache.write(&big).is_err());
        assert_eq!(cache.known(&small.id()), None);
        assert_eq!(cache.get_index(&small.id()).unwrap(), Some(small.index()));
    }

    #[test]
    fn capacity_bounds_entries() {
        let cache = cache(2);
        for i in 0..5 {
            cache.write(&named(&format!("k{i}"), b"v")).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 3);
    }
}
