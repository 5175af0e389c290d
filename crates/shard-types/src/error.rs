use thiserror::Error;

use crate::chunk::TypeTag;

/// Errors produced by type, codec, and registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Malformed bytes, or a record larger than the remaining byte budget.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("{0} bytes left over after decoding")]
    TrailingBytes(usize),

    #[error("no chunk type registered for tag {0}")]
    UnknownTag(TypeTag),

    #[error("tag {0} is already registered")]
    DuplicateTag(TypeTag),

    #[error("tag mismatch: expected {expected}, got {actual}")]
    TagMismatch { expected: TypeTag, actual: TypeTag },
}

/// Result alias for type operations.
pub type TypeResult<T> = Result<T, TypeError>;
