use std::path::PathBuf;

use shard_types::{TypeError, TypeTag};

/// Errors from chunk store operations.
///
/// Ordinary misses are never errors: a missing chunk is `Ok(None)` or
/// `Ok(false)`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error from the underlying file system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored file could not be parsed.
    #[error("malformed chunk file {}: {reason}", .path.display())]
    Format { path: PathBuf, reason: String },

    /// The encoded chunk exceeds the configured size limit.
    #[error("encoded chunk is {size} bytes, limit is {max}")]
    ChunkTooLarge { size: usize, max: usize },

    /// A blocking lock acquisition was cancelled by `interrupt`.
    #[error("interrupted while waiting for a chunk lock")]
    Interrupted,

    /// `unlock` called by a thread that does not hold the lock.
    #[error("unlock by a thread that does not own the lock")]
    NotLockOwner,

    #[error("no chunk type registered for tag {0}")]
    UnknownTag(TypeTag),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Codec or registry failure outside of a stored file.
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
