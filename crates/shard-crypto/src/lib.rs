//! Hashing primitives for shardstore.
//!
//! Provides domain-separated BLAKE3 hashing truncated to the 160-bit
//! [`Digest`](shard_types::Digest) width used for content hashes and
//! derived addresses.
//!
//! All crypto operations wrap established libraries; there is no custom cryptography.

pub mod hasher;

pub use hasher::ContentHasher;
