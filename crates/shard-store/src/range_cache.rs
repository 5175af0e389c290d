//! Range-query caching layer.
//!
//! Results of `get_indices(min, max)` are cached under the exact
//! `(min, max)` pair. Cached spans never overlap: storing a new range first
//! drops every cached range it intersects, so a point mutation has at most
//! one cached range to update. Ranges are evicted oldest-first.
//!
//! A range computed while a point mutation ran concurrently may or may not
//! include that mutation. Such a result is returned but not cached; a
//! generation counter bumped by every mutation detects the overlap.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use shard_types::{Address, ChunkId, Index, SharedChunk};
use tracing::debug;

use crate::error::StoreResult;
use crate::stats::{CacheStats, LayerStats, StatsCounter};
use crate::traits::{ChunkLock, ChunkStore};

type Span = (Address, Address);

#[derive(Default)]
struct RangeState {
    results: HashMap<Span, BTreeMap<ChunkId, Index>>,
    /// Cached spans by start address, pairwise disjoint.
    spans: BTreeMap<Address, Address>,
    /// Insertion order, oldest first.
    order: VecDeque<Span>,
    generation: u64,
}

impl RangeState {
    fn remove(&mut self, span: Span) {
        self.results.remove(&span);
        self.spans.remove(&span.0);
        self.order.retain(|s| *s != span);
    }

    /// Cached spans intersecting `[min, max]`.
    fn overlapping(&self, min: &Address, max: &Address) -> Vec<Span> {
        // Disjoint spans sorted by start are also sorted by end.
        self.spans
            .range(..=*max)
            .rev()
            .take_while(|(_, end)| *end >= min)
            .map(|(start, end)| (*start, *end))
            .collect()
    }

    /// The cached span containing `address`, if any.
    fn containing(&self, address: &Address) -> Option<Span> {
        self.spans
            .range(..=*address)
            .next_back()
            .filter(|(_, end)| *end >= address)
            .map(|(start, end)| (*start, *end))
    }
}

/// Cache of range-query results in front of another [`ChunkStore`].
pub struct RangeCache<S> {
    inner: S,
    capacity: usize,
    state: Mutex<RangeState>,
    stats: StatsCounter,
}

impl<S: ChunkStore> RangeCache<S> {
    /// Wrap `inner`, caching at most `capacity` ranges.
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            state: Mutex::new(RangeState::default()),
            stats: StatsCounter::default(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of cached ranges.
    pub fn len(&self) -> usize {
        self.state.lock().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn store(&self, state: &mut RangeState, span: Span, result: BTreeMap<ChunkId, Index>) {
        if self.capacity == 0 {
            return;
        }
        for old in state.overlapping(&span.0, &span.1) {
            state.remove(old);
        }
        state.results.insert(span, result);
        state.spans.insert(span.0, span.1);
        state.order.push_back(span);
        while state.results.len() > self.capacity {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.results.remove(&oldest);
            state.spans.remove(&oldest.0);
            self.stats.evicted();
        }
    }

    /// Apply a completed point mutation to the range containing `id`.
    fn apply(&self, id: &ChunkId, index: Option<Index>) {
        let mut state = self.state.lock();
        state.generation += 1;
        if let Some(span) = state.containing(&id.address()) {
            if let Some(result) = state.results.get_mut(&span) {
                match index {
                    Some(index) => {
                        result.insert(id.clone(), index);
                    }
                    None => {
                        result.remove(id);
                    }
                }
            }
        }
    }

    /// Remove `id` from the cached range listing it when the layer beneath
    /// reports it missing, as happens when an unreadable file is
    /// quarantined during a point lookup.
    fn forget_missing(&self, id: &ChunkId) -> StoreResult<()> {
        let listed = {
            let state = self.state.lock();
            state
                .containing(&id.address())
                .and_then(|span| state.results.get(&span))
                .is_some_and(|result| result.contains_key(id))
        };
        if !listed {
            return Ok(());
        }
        let _guard = ChunkLock::acquire(&self.inner, id)?;
        if self.inner.get_index(id)?.is_none() {
            self.apply(id, None);
            debug!(id = %id, "dropped missing chunk from cached range");
        }
        Ok(())
    }

    /// Drop the range containing `id` after a failed mutation.
    fn invalidate(&self, id: &ChunkId) {
        let mut state = self.state.lock();
        state.generation += 1;
        if let Some(span) = state.containing(&id.address()) {
            state.remove(span);
            debug!(id = %id, "dropped cached range after failed mutation");
        }
    }
}

impl<S: ChunkStore> ChunkStore for RangeCache<S> {
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
        let found = self.inner.contains(id)?;
        if !found {
            self.forget_missing(id)?;
        }
        Ok(found)
    }

    fn get_index(&self, id: &ChunkId) -> StoreResult<Option<Index>> {
        let index = self.inner.get_index(id)?;
        if index.is_none() {
            self.forget_missing(id)?;
        }
        Ok(index)
    }

    fn get_indices(&self, min: &Address, max: &Address) -> StoreResult<BTreeMap<ChunkId, Index>> {
        if min > max {
            return Ok(BTreeMap::new());
        }
        let span = (*min, *max);
        let generation = {
            let state = self.state.lock();
            if let Some(result) = state.results.get(&span) {
                self.stats.hit();
                return Ok(result.clone());
            }
            state.generation
        };
        self.stats.miss();
        let result = self.inner.get_indices(min, max)?;
        let mut state = self.state.lock();
        if state.generation == generation {
            self.store(&mut state, span, result.clone());
        }
        Ok(result)
    }

    fn read(&self, id: &ChunkId) -> StoreResult<Option<SharedChunk>> {
        let chunk = self.inner.read(id)?;
        if chunk.is_none() {
            self.forget_missing(id)?;
        }
        Ok(chunk)
    }

    fn write(&self, chunk: &SharedChunk) -> StoreResult<bool> {
        let id = chunk.id();
        let _guard = ChunkLock::acquire(&self.inner, &id)?;
        match self.inner.write(chunk) {
            Ok(changed) => {
                if changed {
                    self.apply(&id, Some(chunk.index()));
                }
                Ok(changed)
            }
            Err(e) => {
                self.invalidate(&id);
                Err(e)
            }
        }
    }

    fn force_write(&self, chunk: &SharedChunk) -> StoreResult<()> {
        let id = chunk.id();
        let _guard = ChunkLock::acquire(&self.inner, &id)?;
        match self.inner.force_write(chunk) {
            Ok(()) => {
                self.apply(&id, Some(chunk.index()));
                Ok(())
            }
            Err(e) => {
                self.invalidate(&id);
                Err(e)
            }
        }
    }

    fn delete(&self, id: &ChunkId) -> StoreResult<bool> {
        let _guard = ChunkLock::acquire(&self.inner, id)?;
        match self.inner.delete(id) {
            Ok(deleted) => {
                if deleted {
                    self.apply(id, None);
                }
                Ok(deleted)
            }
            Err(e) => {
                self.invalidate(id);
                Err(e)
            }
        }
    }

    fn close(&self) -> StoreResult<()> {
        *self.state.lock() = RangeState::default();
        self.inner.close()
    }

    fn layer_stats(&self) -> Vec<LayerStats> {
        let mut out = vec![LayerStats {
            layer: "range",
            entries: self.len(),
            dirty: 0,
            stats: self.stats(),
        }];
        out.extend(self.inner.layer_stats());
        out
    }
}
