//! Foundation types for shardstore.
//!
//! This crate provides the value types every other shardstore crate builds
//! on: the 160-bit [`Address`] used as the universal sort and shard key, the
//! chunk model ([`Chunk`], [`ChunkId`], [`Index`]), the bounded binary
//! [`codec`], and the tag-keyed type [`Registry`] that lets the store parse
//! persisted chunks without knowing their concrete types.
//!
//! # Key Types
//!
//! - [`Address`] -- 160-bit unsigned integer, reduced modulo 2^160
//! - [`Digest`] -- 160-bit content hash
//! - [`Timestamp`] -- millisecond wall-clock update time
//! - [`ChunkId`] -- shared handle to a concrete [`Identifier`]
//! - [`Index`] -- lightweight (identifier, update time, hash) projection
//! - [`Registry`] -- frozen tag → parser table

pub mod address;
pub mod chunk;
pub mod codec;
pub mod digest;
pub mod error;
pub mod registry;
pub mod temporal;

pub use address::Address;
pub use chunk::{Chunk, ChunkId, Identifier, Index, SharedChunk, TypeTag};
pub use codec::{Decoder, Encoder};
pub use digest::Digest;
pub use error::{TypeError, TypeResult};
pub use registry::{ChunkDecode, ChunkKind, IdKind, IdentifierDecode, Registry, RegistryBuilder};
pub use temporal::Timestamp;
