//! Sharded, file-backed chunk storage with composable caching layers.
//!
//! Every chunk lives in its own file. The file's directory and name are
//! derived from the chunk's 160-bit address and type tag, so listing an
//! address range only opens the shard directories that range covers.
//! Caching layers wrap the file store and each other through the one
//! [`ChunkStore`] trait.
//!
//! # Stores
//!
//! - [`FileStore`] -- one chunk per file, quarantine for unreadable files
//! - [`MemoryStore`] -- ordered in-memory map for tests and embedding
//! - [`WriteCache`] -- write-back LRU of whole chunks
//! - [`ReadCache`] -- read-through LRU of whole chunks
//! - [`IndexCache`] -- LRU of existence and index records
//! - [`RangeCache`] -- range-query results with overlap invalidation
//! - [`Storage`] -- the configured stack behind one facade
//!
//! # Design Rules
//!
//! 1. Chunks are immutable values; a write replaces the stored value whole.
//! 2. Every layer locks through the file store's per-file lock pool, so one
//!    identifier's operations are totally ordered across all layers.
//! 3. Cache fills happen under the identifier's lock and re-check the cache
//!    once the lock is held.
//! 4. After any error a cache holds nothing for the affected key.
//! 5. A corrupt file is quarantined and treated as absent; it is never
//!    deleted.
//! 6. I/O errors on single-chunk operations are always propagated.

pub mod config;
pub mod error;
pub mod file;
pub mod index_cache;
pub mod kinds;
pub mod layout;
pub mod lock;
pub mod memory;
pub mod range_cache;
pub mod read_cache;
pub mod stats;
pub mod storage;
pub mod traits;
pub mod write_cache;

#[cfg(test)]
mod testkit;

// Re-export primary types at crate root for ergonomic imports.
pub use config::{LayerConfig, StorageConfig};
pub use error::{StoreError, StoreResult};
pub use file::{FileStore, DEFAULT_MAX_CHUNK_SIZE};
pub use index_cache::IndexCache;
pub use kinds::{register_builtin, Blob, ContentId, NameId, Named, BLOB_TAG, NAMED_TAG};
pub use layout::{Layout, NameEncoding};
pub use lock::{LockPool, PoolGuard};
pub use memory::MemoryStore;
pub use range_cache::RangeCache;
pub use read_cache::ReadCache;
pub use stats::{CacheStats, LayerStats};
pub use storage::{FsckReport, Storage, StorageBuilder};
pub use traits::{ChunkLock, ChunkStore};
pub use write_cache::WriteCache;
