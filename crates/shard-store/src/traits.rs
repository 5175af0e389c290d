use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use shard_types::{Address, ChunkId, Index, SharedChunk};
use tracing::warn;

use crate::error::StoreResult;
use crate::stats::LayerStats;

/// Uniform access contract shared by the file store, the in-memory store
/// and every caching layer.
///
/// All implementations must satisfy these invariants:
/// - Lock operations are keyed by identifier and re-entrant per thread.
///   Caching layers delegate locking to the layer they wrap, so every layer
///   of a composed store serializes on the same underlying lock.
/// - Chunks are immutable values; `write` replaces the stored value whole.
/// - A missing chunk is `Ok(None)` / `Ok(false)`, never an error.
/// - `get_indices` bounds are inclusive and the result is ordered by
///   address, then tag.
pub trait ChunkStore: Send + Sync {
    /// Block until the calling thread holds the lock for `id`.
    fn lock(&self, id: &ChunkId) -> StoreResult<()>;

    /// Acquire the lock for `id` only if it is free or already ours.
    fn try_lock(&self, id: &ChunkId) -> StoreResult<bool>;

    /// Acquire the lock for `id`, waiting at most `timeout`.
    fn try_lock_for(&self, id: &ChunkId, timeout: Duration) -> StoreResult<bool>;

    /// Release one level of the lock for `id`.
    fn unlock(&self, id: &ChunkId) -> StoreResult<()>;

    fn contains(&self, id: &ChunkId) -> StoreResult<bool>;

    /// Load only the index record of `id`.
    fn get_index(&self, id: &ChunkId) -> StoreResult<Option<Index>>;

    /// Indices of every stored chunk whose address lies in `[min, max]`.
    fn get_indices(&self, min: &Address, max: &Address) -> StoreResult<BTreeMap<ChunkId, Index>>;

    fn read(&self, id: &ChunkId) -> StoreResult<Option<SharedChunk>>;

    /// Store `chunk` unless an identical index is already stored.
    ///
    /// Returns `true` if the stored value changed.
    fn write(&self, chunk: &SharedChunk) -> StoreResult<bool>;

    /// Store `chunk` unconditionally.
    fn force_write(&self, chunk: &SharedChunk) -> StoreResult<()>;

    /// Remove `id`. Returns `true` if something was removed.
    fn delete(&self, id: &ChunkId) -> StoreResult<bool>;

    /// Flush pending state and release resources.
    fn close(&self) -> StoreResult<()>;

    /// Cache statistics of this layer followed by the layers beneath it.
    fn layer_stats(&self) -> Vec<LayerStats> {
        Vec::new()
    }
}

/// Forward every [`ChunkStore`] method through a smart pointer.
macro_rules! forward_chunk_store {
    ($($ptr:ident),*) => {$(
        impl<S: ?Sized + ChunkStore> ChunkStore for $ptr<S> {
            fn lock(&self, id: &ChunkId) -> StoreResult<()> {
                (**self).lock(id)
            }

            fn try_lock(&self, id: &ChunkId) -> StoreResult<bool> {
                (**self).try_lock(id)
            }

            fn try_lock_for(&self, id: &ChunkId, timeout: Duration) -> StoreResult<bool> {
                (**self).try_lock_for(id, timeout)
            }

            fn unlock(&self, id: &ChunkId) -> StoreResult<()> {
                (**self).unlock(id)
            }

            fn contains(&self, id: &ChunkId) -> StoreResult<bool> {
                (**self).contains(id)
            }

            fn get_index(&self, id: &ChunkId) -> StoreResult<Option<Index>> {
                (**self).get_index(id)
            }

            fn get_indices(&self, min: &Address, max: &Address) -> StoreResult<BTreeMap<ChunkId, Index>> {
                (**self).get_indices(min, max)
            }

            fn read(&self, id: &ChunkId) -> StoreResult<Option<SharedChunk>> {
                (**self).read(id)
            }

            fn write(&self, chunk: &SharedChunk) -> StoreResult<bool> {
                (**self).write(chunk)
            }

            fn force_write(&self, chunk: &SharedChunk) -> StoreResult<()> {
                (**self).force_write(chunk)
            }

            fn delete(&self, id: &ChunkId) -> StoreResult<bool> {
                (**self).delete(id)
            }

            fn close(&self) -> StoreResult<()> {
                (**self).close()
            }

            fn layer_stats(&self) -> Vec<LayerStats> {
                (**self).layer_stats()
            }
        }
    )*};
}

forward_chunk_store!(Box, Arc);

/// RAII handle on one identifier's lock in a [`ChunkStore`].
///
/// The lock is released on every exit path when the guard drops.
pub struct ChunkLock<'a, S: ?Sized + ChunkStore> {
    store: &'a S,
    id: ChunkId,
}

impl<'a, S: ?Sized + ChunkStore> ChunkLock<'a, S> {
    /// Block until `id` is locked in `store`.
    pub fn acquire(store: &'a S, id: &ChunkId) -> StoreResult<Self> {
        store.lock(id)?;
        Ok(Self {
            store,
            id: id.clone(),
        })
    }

    /// Lock `id` only if it is free or already held by this thread.
    pub fn try_acquire(store: &'a S, id: &ChunkId) -> StoreResult<Option<Self>> {
        if store.try_lock(id)? {
            Ok(Some(Self {
                store,
                id: id.clone(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Lock `id` only if possible within `timeout`.
    pub fn try_acquire_for(store: &'a S, id: &ChunkId, timeout: Duration) -> StoreResult<Option<Self>> {
        if store.try_lock_for(id, timeout)? {
            Ok(Some(Self {
                store,
                id: id.clone(),
            }))
        } else {
            Ok(None)
        }
    }

    pub fn id(&self) -> &ChunkId {
        &self.id
    }
}

impl<S: ?Sized + ChunkStore> Drop for ChunkLock<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.store.unlock(&self.id) {
            warn!(id = %self.id, error = %e, "failed to release chunk lock");
        }
    }
}
