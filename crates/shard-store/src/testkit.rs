//! Shared fixtures for the store's unit tests.

use std::sync::Arc;

use shard_types::{Registry, RegistryBuilder, SharedChunk};

use crate::kinds::{register_builtin, Named, NAMED_TAG};

/// Registry with the built-in chunk kinds.
pub(crate) fn registry() -> Arc<Registry> {
    let mut builder = RegistryBuilder::new();
    register_builtin(&mut builder).unwrap();
    builder.freeze()
}

/// A named record stamped now.
pub(crate) fn named(name: &str, payload: &[u8]) -> SharedChunk {
    Named::new(NAMED_TAG, name, payload.to_vec()).shared()
}

/// A named `u64` counter stamped now.
pub(crate) fn counter(name: &str, value: u64) -> SharedChunk {
    Named::counter(NAMED_TAG, name, value).shared()
}

/// The counter value held by a stored chunk.
pub(crate) fn counter_value(chunk: &SharedChunk) -> u64 {
    chunk.downcast_ref::<Named>().unwrap().counter_value().unwrap()
}
