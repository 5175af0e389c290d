//! The storage facade.
//!
//! [`StorageBuilder`] collects chunk type registrations and composes the
//! configured caching layers around a [`FileStore`]. From the outside in:
//!
//! ```text
//! WriteCache -> ReadCache -> RangeCache -> IndexCache -> FileStore
//! ```
//!
//! A layer whose capacity is zero is left out. Every layer locks through
//! the file store's path-keyed pool.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use shard_types::{
    Address, ChunkDecode, ChunkId, ChunkKind, IdKind, IdentifierDecode, Index, Registry, RegistryBuilder,
    SharedChunk, TypeTag,
};
use tracing::{info, warn};

use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};
use crate::file::FileStore;
use crate::index_cache::IndexCache;
use crate::kinds::register_builtin;
use crate::range_cache::RangeCache;
use crate::read_cache::ReadCache;
use crate::stats::LayerStats;
use crate::traits::ChunkStore;
use crate::write_cache::WriteCache;

/// Collects chunk type registrations, then opens a [`Storage`].
pub struct StorageBuilder {
    config: StorageConfig,
    registry: RegistryBuilder,
}

impl StorageBuilder {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            registry: RegistryBuilder::new(),
        }
    }

    /// Register the built-in `Blob` and `Named` kinds under their
    /// conventional tags.
    pub fn with_builtin_kinds(mut self) -> StoreResult<Self> {
        register_builtin(&mut self.registry)?;
        Ok(self)
    }

    /// Register the parsers for `tag`. Each tag may be registered once.
    pub fn register_chunk(&mut self, tag: TypeTag, chunk: ChunkKind, id: IdKind) -> StoreResult<&mut Self> {
        self.registry.register(tag, chunk, id)?;
        Ok(self)
    }

    pub fn register_type<C: ChunkDecode, I: IdentifierDecode>(&mut self, tag: TypeTag) -> StoreResult<&mut Self> {
        self.registry.register_type::<C, I>(tag)?;
        Ok(self)
    }

    /// Validate the configuration, freeze the registry and compose the
    /// layers.
    pub fn open(self) -> StoreResult<Storage> {
        let registry = self.registry.freeze();
        let files = Arc::new(FileStore::from_config(&self.config, Arc::clone(&registry))?);
        let layers = &self.config.layers;

        let mut stack: Box<dyn ChunkStore> = Box::new(Arc::clone(&files));
        if let Some(capacity) = NonZeroUsize::new(layers.index_cache) {
            stack = Box::new(IndexCache::new(stack, capacity));
        }
        if layers.range_cache > 0 {
            stack = Box::new(RangeCache::new(stack, layers.range_cache));
        }
        if let Some(capacity) = NonZeroUsize::new(layers.read_cache) {
            stack = Box::new(ReadCache::new(stack, capacity));
        }
        if layers.write_cache > 0 {
            stack = Box::new(WriteCache::new(stack, layers.write_cache));
        }

        info!(
            root = %self.config.root.display(),
            tags = registry.tags().count(),
            write_cache = layers.write_cache,
            read_cache = layers.read_cache,
            index_cache = layers.index_cache,
            range_cache = layers.range_cache,
            "opened storage"
        );
        Ok(Storage {
            config: self.config,
            registry,
            files,
            stack,
            closed: AtomicBool::new(false),
        })
    }
}

/// Result of [`Storage::fsck`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct FsckReport {
    /// Chunk files that parsed cleanly.
    pub checked: usize,
    /// Chunks whose recomputed content hash differs from their index.
    pub hash_mismatches: Vec<String>,
    /// Every file under the quarantine directory after the check.
    pub quarantined: Vec<PathBuf>,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.hash_mismatches.is_empty() && self.quarantined.is_empty()
    }
}

/// A configured stack of caching layers over a [`FileStore`].
///
/// Every operation fails with [`StoreError::Closed`] once [`close`] has run,
/// except `unlock`, so that guards taken before closing can still drop.
/// Identifiers with an unregistered tag, and chunks too large for one
/// chunk file, are rejected before reaching any cache.
///
/// [`close`]: ChunkStore::close
pub struct Storage {
    config: StorageConfig,
    registry: Arc<Registry>,
    files: Arc<FileStore>,
    stack: Box<dyn ChunkStore>,
    closed: AtomicBool,
}

impl Storage {
    /// Open `config` with only the built-in chunk kinds registered.
    pub fn open(config: StorageConfig) -> StoreResult<Self> {
        StorageBuilder::new(config).with_builtin_kinds()?.open()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        self.files.root()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The file store at the bottom of the stack.
    ///
    /// Reading through it bypasses every cache and misses pending writes.
    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Parse every chunk file on disk, quarantining the ones that fail.
    ///
    /// Only flushed state is checked; writes still held by the write cache
    /// are not.
    pub fn fsck(&self) -> StoreResult<FsckReport> {
        self.check_open()?;
        let mut report = FsckReport::default();
        let indices = self.files.get_indices(&Address::MIN, &Address::MAX)?;
        for (id, index) in indices {
            let Some(chunk) = self.files.read(&id)? else {
                continue;
            };
            report.checked += 1;
            if chunk.content_hash() != index.hash() {
                report.hash_mismatches.push(id.to_string());
            }
        }
        report.quarantined = self.files.scan_quarantine()?;
        if !report.is_clean() {
            warn!(
                mismatches = report.hash_mismatches.len(),
                quarantined = report.quarantined.len(),
                "fsck found problems"
            );
        }
        Ok(report)
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_id(&self, id: &ChunkId) -> StoreResult<()> {
        self.check_open()?;
        if self.registry.contains(id.tag()) {
            Ok(())
        } else {
            Err(StoreError::UnknownTag(id.tag()))
        }
    }
}

impl ChunkStore for Storage {
    fn lock(&self, id: &ChunkId) -> StoreResult<()> {
        self.check_open()?;
        self.stack.lock(id)
    }

    fn try_lock(&self, id: &ChunkId) -> StoreResult<bool> {
        self.check_open()?;
        self.stack.try_lock(id)
    }

    fn try_lock_for(&self, id: &ChunkId, timeout: Duration) -> StoreResult<bool> {
        self.check_open()?;
        self.stack.try_lock_for(id, timeout)
    }

    fn unlock(&self, id: &ChunkId) -> StoreResult<()> {
        self.stack.unlock(id)
    }

    fn contains(&self, id: &ChunkId) -> StoreResult<bool> {
        self.check_id(id)?;
        self.stack.contains(id)
    }

    fn get_index(&self, id: &ChunkId) -> StoreResult<Option<Index>> {
        self.check_id(id)?;
        self.stack.get_index(id)
    }

    fn get_indices(&self, min: &Address, max: &Address) -> StoreResult<BTreeMap<ChunkId, Index>> {
        self.check_open()?;
        self.stack.get_indices(min, max)
    }

    fn read(&self, id: &ChunkId) -> StoreResult<Option<SharedChunk>> {
        self.check_id(id)?;
        self.stack.read(id)
    }

    fn write(&self, chunk: &SharedChunk) -> StoreResult<bool> {
        self.check_id(&chunk.id())?;
        self.files.check_size(chunk)?;
        self.stack.write(chunk)
    }

    fn force_write(&self, chunk: &SharedChunk) -> StoreResult<()> {
        self.check_id(&chunk.id())?;
        self.files.check_size(chunk)?;
        self.stack.force_write(chunk)
    }

    fn delete(&self, id: &ChunkId) -> StoreResult<bool> {
        self.check_id(id)?;
        self.stack.delete(id)
    }

    /// Flush pending writes, interrupt lock waiters and close every layer.
    /// Closing twice is a no-op.
    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stack.close()?;
        info!(root = %self.root().display(), "closed storage");
        Ok(())
    }

    fn layer_stats(&self) -> Vec<LayerStats> {
        self.stack.layer_stats()
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close storage on drop");
        }
    }
}
