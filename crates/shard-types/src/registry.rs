//! Tag-keyed type registry.
//!
//! Persisted chunks only carry a numeric [`TypeTag`]; the registry maps that
//! tag back to the parser for the concrete chunk kind and the parser for its
//! identifier kind. Both are registered together, once, at start-up through
//! a [`RegistryBuilder`]; [`RegistryBuilder::freeze`] then hands out a
//! read-only [`Registry`] that the store shares between layers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::chunk::{Chunk, ChunkId, Identifier, SharedChunk, TypeTag};
use crate::codec::Decoder;
use crate::error::{TypeError, TypeResult};

type ChunkParseFn = dyn Fn(&mut Decoder<'_>, TypeTag) -> TypeResult<SharedChunk> + Send + Sync;
type IdParseFn = dyn Fn(&mut Decoder<'_>, TypeTag) -> TypeResult<ChunkId> + Send + Sync;

/// A chunk type that knows how to parse itself.
pub trait ChunkDecode: Chunk + Sized {
    /// Human-readable kind name, used in logs and listings.
    const KIND: &'static str;

    fn decode(dec: &mut Decoder<'_>, tag: TypeTag) -> TypeResult<Self>;
}

/// An identifier type that knows how to parse itself.
pub trait IdentifierDecode: Identifier + Sized {
    const KIND: &'static str;

    fn decode(dec: &mut Decoder<'_>, tag: TypeTag) -> TypeResult<Self>;
}

/// Registry entry for a chunk kind: name plus parser.
#[derive(Clone)]
pub struct ChunkKind {
    name: &'static str,
    parser: Arc<ChunkParseFn>,
}

impl ChunkKind {
    pub fn new<F>(name: &'static str, parser: F) -> Self
    where
        F: Fn(&mut Decoder<'_>, TypeTag) -> TypeResult<SharedChunk> + Send + Sync + 'static,
    {
        Self {
            name,
            parser: Arc::new(parser),
        }
    }

    /// Entry for a type implementing [`ChunkDecode`].
    pub fn of<T: ChunkDecode>() -> Self {
        Self::new(T::KIND, |dec, tag| {
            T::decode(dec, tag).map(|c| Arc::new(c) as SharedChunk)
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parse(&self, dec: &mut Decoder<'_>, tag: TypeTag) -> TypeResult<SharedChunk> {
        (self.parser)(dec, tag)
    }
}

impl fmt::Debug for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkKind").field("name", &self.name).finish()
    }
}

/// Registry entry for an identifier kind: name plus parser.
#[derive(Clone)]
pub struct IdKind {
    name: &'static str,
    parser: Arc<IdParseFn>,
}

impl IdKind {
    pub fn new<F>(name: &'static str, parser: F) -> Self
    where
        F: Fn(&mut Decoder<'_>, TypeTag) -> TypeResult<ChunkId> + Send + Sync + 'static,
    {
        Self {
            name,
            parser: Arc::new(parser),
        }
    }

    /// Entry for a type implementing [`IdentifierDecode`].
    pub fn of<T: IdentifierDecode>() -> Self {
        Self::new(T::KIND, |dec, tag| T::decode(dec, tag).map(ChunkId::new))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parse(&self, dec: &mut Decoder<'_>, tag: TypeTag) -> TypeResult<ChunkId> {
        (self.parser)(dec, tag)
    }
}

impl fmt::Debug for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdKind").field("name", &self.name).finish()
    }
}

/// Mutable registry used during start-up.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    chunks: BTreeMap<TypeTag, ChunkKind>,
    ids: BTreeMap<TypeTag, IdKind>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `tag` to a chunk kind and its identifier kind.
    ///
    /// Each tag may be registered once; a second registration is rejected
    /// with [`TypeError::DuplicateTag`].
    pub fn register(&mut self, tag: TypeTag, chunk: ChunkKind, id: IdKind) -> TypeResult<&mut Self> {
        if self.chunks.contains_key(&tag) || self.ids.contains_key(&tag) {
            return Err(TypeError::DuplicateTag(tag));
        }
        self.chunks.insert(tag, chunk);
        self.ids.insert(tag, id);
        Ok(self)
    }

    /// Typed shorthand for [`register`](Self::register).
    pub fn register_type<C: ChunkDecode, I: IdentifierDecode>(&mut self, tag: TypeTag) -> TypeResult<&mut Self> {
        self.register(tag, ChunkKind::of::<C>(), IdKind::of::<I>())
    }

    /// Finish registration and return the shared read-only view.
    pub fn freeze(self) -> Arc<Registry> {
        Arc::new(Registry {
            chunks: self.chunks,
            ids: self.ids,
        })
    }
}

/// Frozen tag → parser table.
#[derive(Debug)]
pub struct Registry {
    chunks: BTreeMap<TypeTag, ChunkKind>,
    ids: BTreeMap<TypeTag, IdKind>,
}

impl Registry {
    /// A registry with no tags, for stores that only hold ids they never parse.
    pub fn empty() -> Arc<Self> {
        RegistryBuilder::new().freeze()
    }

    pub fn chunk_kind(&self, tag: TypeTag) -> TypeResult<&ChunkKind> {
        self.chunks.get(&tag).ok_or(TypeError::UnknownTag(tag))
    }

    pub fn id_kind(&self, tag: TypeTag) -> TypeResult<&IdKind> {
        self.ids.get(&tag).ok_or(TypeError::UnknownTag(tag))
    }

    pub fn contains(&self, tag: TypeTag) -> bool {
        self.chunks.contains_key(&tag)
    }

    /// Registered tags in ascending order.
    pub fn tags(&self) -> impl Iterator<Item = TypeTag> + '_ {
        self.chunks.keys().copied()
    }

    /// Parse a chunk of the kind registered for `tag`.
    pub fn parse_chunk(&self, dec: &mut Decoder<'_>, tag: TypeTag) -> TypeResult<SharedChunk> {
        let chunk = self.chunk_kind(tag)?.parse(dec, tag)?;
        let actual = chunk.id().tag();
        if actual != tag {
            return Err(TypeError::TagMismatch {
                expected: tag,
                actual,
            });
        }
        Ok(chunk)
    }
}
