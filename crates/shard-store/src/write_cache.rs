//! Write-back caching layer.
//!
//! Whole chunks are held in an access-ordered map. Writes land in the map
//! marked dirty and reach the layer beneath only when the entry is evicted
//! or the store is closed. Eviction of a key always happens under that
//! key's lock in the layer beneath, and only after the operation that
//! triggered it has released its own key. Ordinary operations never wait
//! for a key another thread holds in order to evict it.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use shard_types::{Address, ChunkId, Index, SharedChunk};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::stats::{CacheStats, LayerStats, StatsCounter};
use crate::traits::{ChunkLock, ChunkStore};

struct Entry {
    chunk: SharedChunk,
    dirty: bool,
}

/// Write-back LRU cache in front of another [`ChunkStore`].
pub struct WriteCache<S> {
    inner: S,
    capacity: usize,
    entries: Mutex<LruCache<ChunkId, Entry>>,
    stats: StatsCounter,
}

impl<S: ChunkStore> WriteCache<S> {
    /// Wrap `inner`, keeping at most `capacity` chunks after each operation.
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            entries: Mutex::new(LruCache::unbounded()),
            stats: StatsCounter::default(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached chunks.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of cached chunks not yet written to the layer beneath.
    pub fn dirty_count(&self) -> usize {
        self.entries.lock().iter().filter(|(_, e)| e.dirty).count()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Write every dirty entry to the layer beneath, keeping them cached.
    pub fn flush(&self) -> StoreResult<()> {
        let dirty: Vec<ChunkId> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(id, _)| id.clone())
            .collect();
        for id in dirty {
            let _guard = ChunkLock::acquire(&self.inner, &id)?;
            let pending = self
                .entries
                .lock()
                .peek(&id)
                .filter(|e| e.dirty)
                .map(|e| e.chunk.clone());
            if let Some(chunk) = pending {
                self.inner.force_write(&chunk)?;
                if let Some(entry) = self.entries.lock().peek_mut(&id) {
                    entry.dirty = false;
                }
            }
        }
        Ok(())
    }

    fn cached(&self, id: &ChunkId) -> Option<SharedChunk> {
        let hit = self.entries.lock().get(id).map(|e| e.chunk.clone());
        match hit {
            Some(_) => self.stats.hit(),
            None => self.stats.miss(),
        }
        hit
    }

    /// Evict least recently used entries until at most `limit` remain.
    ///
    /// Victims are flushed under their own lock in the layer beneath.
    /// Without `wait`, a victim locked by another thread is passed over for
    /// the next least recently used entry, so a caller holding one key never
    /// blocks on another; if every candidate is locked the cache stays over
    /// capacity until a later operation.
    ///
    /// A victim that fails to flush stays cached and is passed over for the
    /// rest of this call. Its error is returned only with `wait`, after every
    /// other victim has been tried.
    fn evict_to(&self, limit: usize, wait: bool) -> StoreResult<()> {
        let mut failed: BTreeSet<ChunkId> = BTreeSet::new();
        let mut first_error: Option<StoreError> = None;
        'rounds: loop {
            let candidates: Vec<ChunkId> = {
                let entries = self.entries.lock();
                if entries.len() <= limit {
                    break 'rounds;
                }
                entries
                    .iter()
                    .rev()
                    .map(|(id, _)| id)
                    .filter(|id| !failed.contains(*id))
                    .cloned()
                    .collect()
            };

            let mut evicted_any = false;
            for victim in candidates {
                let _guard = if wait {
                    ChunkLock::acquire(&self.inner, &victim)?
                } else {
                    match ChunkLock::try_acquire(&self.inner, &victim)? {
                        Some(guard) => guard,
                        None => continue,
                    }
                };
                let pending = {
                    let entries = self.entries.lock();
                    if entries.len() <= limit {
                        break 'rounds;
                    }
                    match entries.peek(&victim) {
                        Some(entry) => entry.dirty.then(|| entry.chunk.clone()),
                        None => continue,
                    }
                };
                if let Some(chunk) = &pending {
                    if let Err(e) = self.inner.force_write(chunk) {
                        warn!(id = %victim, error = %e, "failed to flush evicted chunk, keeping it cached");
                        failed.insert(victim);
                        first_error.get_or_insert(e);
                        continue;
                    }
                }
                self.entries.lock().pop(&victim);
                self.stats.evicted();
                evicted_any = true;
                debug!(id = %victim, flushed = pending.is_some(), "evicted from write cache");
            }

            if !evicted_any {
                debug!(limit, failed = failed.len(), "no eviction candidate could be evicted");
                break;
            }
        }
        match first_error {
            Some(e) if wait => Err(e),
            _ => Ok(()),
        }
    }
}

impl<S: ChunkStore> ChunkStore for WriteCache<S> {
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
        // Taken before the layer beneath is listed: an entry evicted in
        // between is then either in this copy or already flushed.
        let pending: Vec<(ChunkId, Index)> = self
            .entries
            .lock()
            .iter()
            .filter(|(id, entry)| entry.dirty && id.address() >= *min && id.address() <= *max)
            .map(|(id, entry)| (id.clone(), entry.chunk.index()))
            .collect();
        let mut out = self.inner.get_indices(min, max)?;
        out.extend(pending);
        Ok(out)
    }

    fn read(&self, id: &ChunkId) -> StoreResult<Option<SharedChunk>> {
        if let Some(chunk) = self.cached(id) {
            return Ok(Some(chunk));
        }
        let loaded = {
            let _guard = ChunkLock::acquire(&self.inner, id)?;
            if let Some(chunk) = self.entries.lock().get(id) {
                return Ok(Some(chunk.chunk.clone()));
            }
            let loaded = self.inner.read(id)?;
            if let Some(chunk) = &loaded {
                self.entries.lock().put(
                    id.clone(),
                    Entry {
                        chunk: chunk.clone(),
                        dirty: false,
                    },
                );
            }
            loaded
        };
        self.evict_to(self.capacity, false)?;
        Ok(loaded)
    }

    fn write(&self, chunk: &SharedChunk) -> StoreResult<bool> {
        let id = chunk.id();
        let changed = {
            let _guard = ChunkLock::acquire(&self.inner, &id)?;
            let index = chunk.index();
            let cached = self.entries.lock().get(&id).map(|e| e.chunk.index());
            let current = match cached {
                Some(index) => Some(index),
                None => self.inner.get_index(&id)?,
            };
            let changed = current.as_ref() != Some(&index);
            if changed {
                self.entries.lock().put(
                    id,
                    Entry {
                        chunk: chunk.clone(),
                        dirty: true,
                    },
                );
            }
            changed
        };
        self.evict_to(self.capacity, false)?;
        Ok(changed)
    }

    fn force_write(&self, chunk: &SharedChunk) -> StoreResult<()> {
        let id = chunk.id();
        {
            let _guard = ChunkLock::acquire(&self.inner, &id)?;
            self.entries.lock().put(
                id,
                Entry {
                    chunk: chunk.clone(),
                    dirty: true,
                },
            );
        }
        self.evict_to(self.capacity, false)
    }

    fn delete(&self, id: &ChunkId) -> StoreResult<bool> {
        let deleted = {
            let _guard = ChunkLock::acquire(&self.inner, id)?;
            let was_dirty = self.entries.lock().pop(id).is_some_and(|e| e.dirty);
            let deleted = self.inner.delete(id)?;
            was_dirty || deleted
        };
        self.evict_to(self.capacity, false)?;
        Ok(deleted)
    }

    /// Flush and drop every entry, then close the layer beneath. The layer
    /// beneath is closed even if some entry fails to flush; that entry's
    /// error is returned and the entry stays cached.
    fn close(&self) -> StoreResult<()> {
        let drained = self.evict_to(0, true);
        let closed = self.inner.close();
        drained.and(closed)
    }

    fn layer_stats(&self) -> Vec<LayerStats> {
        let (entries, dirty) = {
            let map = self.entries.lock();
            (map.len(), map.iter().filter(|(_, e)| e.dirty).count())
        };
        let mut out = vec![LayerStats {
            layer: "write",
            entries,
            dirty,
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
    use crate::testkit::{counter, counter_value, named, registry};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn cache(capacity: usize) -> WriteCache<MemoryStore> {
        WriteCache::new(MemoryStore::new(), capacity)
    }

    #[test]
    fn writes_stay_in_cache_until_evicted() {
        let cache = cache(4);
        let chunk = named("a", b"1");
        assert!(cache.write(&chunk).unwrap());
        assert!(cache.inner().is_empty());
        assert_eq!(cache.dirty_count(), 1);
        assert!(cache.contains(&chunk.id()).unwrap());
        assert_eq!(cache.get_index(&chunk.id()).unwrap(), Some(chunk.index()));
    }

    #[test]
    fn unchanged_write_reports_false() {
        let cache = cache(4);
        let chunk = named("a", b"1");
        assert!(cache.write(&chunk).unwrap());
        assert!(!cache.write(&chunk).unwrap());
        assert!(cache.write(&named("a", b"2")).unwrap());
    }

    #[test]
    fn unchanged_write_consults_layer_beneath() {
        let cache = cache(4);
        let chunk = named("a", b"1");
        cache.inner().write(&chunk).unwrap();
        assert!(!cache.write(&chunk).unwrap());
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn eviction_flushes_least_recently_used() {
        let cache = cache(2);
        let chunks: Vec<_> = (0..3).map(|i| named(&format!("c{i}"), b"v")).collect();
        for c in &chunks {
            cache.write(c).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.inner().ids(), vec![chunks[0].id()]);
        assert_eq!(cache.stats().evictions, 1);
        // Still readable through the cache.
        assert!(cache.read(&chunks[0].id()).unwrap().is_some());
        assert!(cache.len() <= 2);
    }

    #[test]
    fn recently_read_entry_survives_eviction() {
        let cache = cache(2);
        let a = named("a", b"1");
        let b = named("b", b"1");
        cache.write(&a).unwrap();
        cache.write(&b).unwrap();
        cache.read(&a.id()).unwrap();
        cache.write(&named("c", b"1")).unwrap();
        assert!(cache.inner().contains(&b.id()).unwrap());
        assert!(!cache.inner().contains(&a.id()).unwrap());
    }

    #[test]
    fn read_miss_is_cached_clean() {
        let cache = cache(4);
        let chunk = named("a", b"1");
        cache.inner().write(&chunk).unwrap();
        assert!(cache.read(&chunk.id()).unwrap().is_some());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(cache.stats().misses, 1);
        cache.read(&chunk.id()).unwrap();
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn delete_reports_unflushed_value() {
        let cache = cache(4);
        let chunk = named("a", b"1");
        cache.write(&chunk).unwrap();
        assert!(cache.delete(&chunk.id()).unwrap());
        assert!(!cache.contains(&chunk.id()).unwrap());
        assert!(!cache.delete(&chunk.id()).unwrap());
    }

    #[test]
    fn delete_of_flushed_value() {
        let cache = cache(4);
        let chunk = named("a", b"1");
        cache.write(&chunk).unwrap();
        cache.flush().unwrap();
        assert_eq!(cache.dirty_count(), 0);
        assert!(cache.delete(&chunk.id()).unwrap());
        assert!(cache.inner().is_empty());
    }

    #[test]
    fn get_indices_overlays_dirty_entries() {
        let cache = cache(8);
        let on_disk = named("disk", b"d");
        cache.inner().write(&on_disk).unwrap();
        let pending = named("pending", b"p");
        cache.write(&pending).unwrap();
        let all = cache.get_indices(&Address::MIN, &Address::MAX).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.get(&pending.id()), Some(&pending.index()));
    }

    #[test]
    fn close_drains_everything() {
        let dir = TempDir::new().unwrap();
        let file = FileStore::open(dir.path(), Layout::default(), registry()).unwrap();
        let cache = WriteCache::new(file, 16);
        for i in 0..10 {
            cache.write(&counter(&format!("n{i}"), i)).unwrap();
        }
        assert_eq!(cache.dirty_count(), 10);
        cache.close().unwrap();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.dirty_count(), 0);

        let reopened = FileStore::open(dir.path(), Layout::default(), registry()).unwrap();
        let all = reopened.get_indices(&Address::MIN, &Address::MAX).unwrap();
        assert_eq!(all.len(), 10);
    }

    #[test]
    fn failed_flush_is_skipped_until_close() {
        let dir = TempDir::new().unwrap();
        let file = FileStore::open(dir.path(), Layout::default(), registry())
            .unwrap()
            .with_max_chunk_size(256);
        let cache = WriteCache::new(file, 1);
        let big = named("big", &[0u8; 1024]);
        let small = named("small", b"s");
        let later = named("later", b"l");

        // The oversized entry cannot be flushed, so eviction passes it over
        // and later writes are unaffected.
        assert!(cache.write(&big).unwrap());
        assert!(cache.write(&small).unwrap());
        assert!(cache.write(&later).unwrap());
        assert!(cache.inner().contains(&small.id()).unwrap());
        assert!(cache.read(&big.id()).unwrap().is_some());

        let err = cache.close().unwrap_err();
        assert!(matches!(err, StoreError::ChunkTooLarge { max: 256, .. }));
        assert!(cache.inner().contains(&later.id()).unwrap());
        assert!(!cache.inner().contains(&big.id()).unwrap());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.dirty_count(), 1);
    }

    /// Memory store whose next listing pauses after reading until released.
    struct PausingStore {
        inner: MemoryStore,
        armed: AtomicBool,
        listed: Barrier,
        resume: Barrier,
    }

    impl PausingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                armed: AtomicBool::new(false),
                listed: Barrier::new(2),
                resume: Barrier::new(2),
            }
        }
    }

    impl ChunkStore for PausingStore {
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
            self.inner.contains(id)
        }

        fn get_index(&self, id: &ChunkId) -> StoreResult<Option<Index>> {
            self.inner.get_index(id)
        }

        fn get_indices(&self, min: &Address, max: &Address) -> StoreResult<BTreeMap<ChunkId, Index>> {
            let out = self.inner.get_indices(min, max)?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.listed.wait();
                self.resume.wait();
            }
            Ok(out)
        }

        fn read(&self, id: &ChunkId) -> StoreResult<Option<SharedChunk>> {
            self.inner.read(id)
        }

        fn write(&self, chunk: &SharedChunk) -> StoreResult<bool> {
            self.inner.write(chunk)
        }

        fn force_write(&self, chunk: &SharedChunk) -> StoreResult<()> {
            self.inner.force_write(chunk)
        }

        fn delete(&self, id: &ChunkId) -> StoreResult<bool> {
            self.inner.delete(id)
        }

        fn close(&self) -> StoreResult<()> {
            self.inner.close()
        }
    }

    #[test]
    fn pending_write_evicted_during_listing_stays_visible() {
        let cache = WriteCache::new(PausingStore::new(), 1);
        let pending = named("pending", b"p");
        cache.write(&pending).unwrap();
        cache.inner().armed.store(true, Ordering::SeqCst);

        std::thread::scope(|s| {
            let listing = s.spawn(|| cache.get_indices(&Address::MIN, &Address::MAX).unwrap());
            cache.inner().listed.wait();
            // Evicts `pending` after the layer beneath was listed without it.
            cache.write(&named("other", b"o")).unwrap();
            assert!(cache.inner().inner.contains(&pending.id()).unwrap());
            cache.inner().resume.wait();

            let listed = listing.join().unwrap();
            assert_eq!(listed.get(&pending.id()), Some(&pending.index()));
        });
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let cache = Arc::new(WriteCache::new(MemoryStore::new(), 2));
        let id = counter("shared", 0).id();
        cache.write(&counter("shared", 0)).unwrap();
        let threads = 4;
        let rounds = 50;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let id = id.clone();
                std::thread::spawn(move || {
                    for _ in 0..rounds {
                        let _guard = ChunkLock::acquire(&*cache, &id).unwrap();
                        let current = cache.read(&id).unwrap().unwrap();
                        let next = counter("shared", counter_value(&current) + 1);
                        cache.write(&next).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let last = cache.read(&id).unwrap().unwrap();
        assert_eq!(counter_value(&last), (threads * rounds) as u64);
    }
}
