use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::RwLock;
use shard_types::{Address, ChunkId, Index, SharedChunk};

use crate::error::StoreResult;
use crate::lock::LockPool;
use crate::traits::ChunkStore;

/// In-memory, map-based chunk store.
///
/// Intended for tests and embedding. Chunks are held behind a `RwLock` in an
/// ordered map, so range queries are a plain map range. Its behaviour is the
/// reference every other [`ChunkStore`] is checked against.
pub struct MemoryStore {
    chunks: RwLock<BTreeMap<ChunkId, SharedChunk>>,
    locks: LockPool<ChunkId>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(BTreeMap::new()),
            locks: LockPool::new(),
        }
    }

    /// Number of chunks currently stored.
    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.chunks.read().is_empty()
    }

    /// Remove all chunks from the store.
    pub fn clear(&self) {
        self.chunks.write().clear();
    }

    /// All stored identifiers in address order.
    pub fn ids(&self) -> Vec<ChunkId> {
        self.chunks.read().keys().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkStore for MemoryStore {
    fn lock(&self, id: &ChunkId) -> StoreResult<()> {
        self.locks.lock(id)
    }

    fn try_lock(&self, id: &ChunkId) -> StoreResult<bool> {
        self.locks.try_lock(id)
    }

    fn try_lock_for(&self, id: &ChunkId, timeout: Duration) -> StoreResult<bool> {
        self.locks.try_lock_for(id, timeout)
    }

    fn unlock(&self, id: &ChunkId) -> StoreResult<()> {
        self.locks.unlock(id)
    }

    fn contains(&self, id: &ChunkId) -> StoreResult<bool> {
        Ok(self.chunks.read().contains_key(id))
    }

    fn get_index(&self, id: &ChunkId) -> StoreResult<Option<Index>> {
        Ok(self.chunks.read().get(id).map(|c| c.index()))
    }

    fn get_indices(&self, min: &Address, max: &Address) -> StoreResult<BTreeMap<ChunkId, Index>> {
        if min > max {
            return Ok(BTreeMap::new());
        }
        let map = self.chunks.read();
        Ok(map
            .iter()
            .skip_while(|(id, _)| id.address() < *min)
            .take_while(|(id, _)| id.address() <= *max)
            .map(|(id, chunk)| (id.clone(), chunk.index()))
            .collect())
    }

    fn read(&self, id: &ChunkId) -> StoreResult<Option<SharedChunk>> {
        Ok(self.chunks.read().get(id).cloned())
    }

    fn write(&self, chunk: &SharedChunk) -> StoreResult<bool> {
        let id = chunk.id();
        let mut map = self.chunks.write();
        if map.get(&id).is_some_and(|existing| existing.index() == chunk.index()) {
            return Ok(false);
        }
        map.insert(id, chunk.clone());
        Ok(true)
    }

    fn force_write(&self, chunk: &SharedChunk) -> StoreResult<()> {
        self.chunks.write().insert(chunk.id(), chunk.clone());
        Ok(())
    }

    fn delete(&self, id: &ChunkId) -> StoreResult<bool> {
        Ok(self.chunks.write().remove(id).is_some())
    }

    fn close(&self) -> StoreResult<()> {
        self.locks.interrupt();
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("chunk_count", &self.len())
            .finish()
    }
}
