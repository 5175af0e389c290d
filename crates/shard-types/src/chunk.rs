use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::codec::{Decoder, Encoder};
use crate::digest::Digest;
use crate::error::{TypeError, TypeResult};
use crate::registry::Registry;
use crate::temporal::Timestamp;

/// Persisted numeric tag naming a concrete chunk/identifier kind.
///
/// Tags are caller-assigned and must stay stable across restarts: they are
/// part of every file name and every stored [`Index`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct TypeTag(pub u8);

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A concrete identifier kind.
///
/// Implementations carry the chunk's [`Address`] and [`TypeTag`] and may
/// carry extra payload (for example the name an address was derived from).
/// Identity is the (address, tag) pair only; it is exactly what decides
/// where the chunk lives on disk.
pub trait Identifier: Send + Sync + fmt::Debug + 'static {
    fn tag(&self) -> TypeTag;

    fn address(&self) -> Address;

    /// Serialize the identifier's own fields. The tag is written by the
    /// caller and handed back to the registered parser on decode.
    fn encode(&self, enc: &mut Encoder) -> TypeResult<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Shared, immutable handle to a concrete [`Identifier`].
///
/// Equality, hashing and ordering use the identifying fields only, ordered
/// by address first so that maps keyed by `ChunkId` iterate in address
/// order.
#[derive(Clone)]
pub struct ChunkId(Arc<dyn Identifier>);

impl ChunkId {
    pub fn new<I: Identifier>(id: I) -> Self {
        Self(Arc::new(id))
    }

    pub fn tag(&self) -> TypeTag {
        self.0.tag()
    }

    pub fn address(&self) -> Address {
        self.0.address()
    }

    /// The identifying (address, tag) pair.
    pub fn key(&self) -> (Address, TypeTag) {
        (self.0.address(), self.0.tag())
    }

    /// Access the concrete identifier.
    pub fn downcast_ref<T: Identifier>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    /// Write the tag followed by the identifier's own fields.
    pub fn encode(&self, enc: &mut Encoder) -> TypeResult<()> {
        enc.write(&self.tag())?;
        self.0.encode(enc)
    }

    /// Read a tag and dispatch to the parser registered for it.
    pub fn decode(dec: &mut Decoder<'_>, registry: &Registry) -> TypeResult<Self> {
        let tag: TypeTag = dec.read()?;
        let id = registry.id_kind(tag)?.parse(dec, tag)?;
        if id.tag() != tag {
            return Err(TypeError::TagMismatch {
                expected: tag,
                actual: id.tag(),
            });
        }
        Ok(id)
    }
}

impl PartialEq for ChunkId {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ChunkId {}

impl Hash for ChunkId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for ChunkId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChunkId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag(), self.address().short_hex())
    }
}

/// One immutable, independently addressable unit of stored content.
///
/// A chunk is never mutated after construction; "updating" a chunk means
/// building a new value and writing it over the old one. Implementations
/// typically compute [`content_hash`](Chunk::content_hash) lazily and cache
/// it.
pub trait Chunk: Send + Sync + fmt::Debug + 'static {
    fn id(&self) -> ChunkId;

    fn updated_at(&self) -> Timestamp;

    fn content_hash(&self) -> Digest;

    /// Serialize the chunk's full state.
    fn encode(&self, enc: &mut Encoder) -> TypeResult<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Chunks travel between layers behind an `Arc`.
pub type SharedChunk = Arc<dyn Chunk>;

impl dyn Chunk {
    /// Access the concrete chunk type.
    pub fn downcast_ref<T: Chunk>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// The lightweight projection of this chunk.
    pub fn index(&self) -> Index {
        Index::of(self)
    }
}

/// Lightweight (identifier, update time, content hash) projection of a
/// chunk, cheap to load and compare.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Index {
    id: ChunkId,
    updated_at: Timestamp,
    hash: Digest,
}

impl Index {
    pub fn new(id: ChunkId, updated_at: Timestamp, hash: Digest) -> Self {
        Self {
            id,
            updated_at,
            hash,
        }
    }

    /// Derive the index of a chunk.
    pub fn of(chunk: &dyn Chunk) -> Self {
        Self {
            id: chunk.id(),
            updated_at: chunk.updated_at(),
            hash: chunk.content_hash(),
        }
    }

    pub fn id(&self) -> &ChunkId {
        &self.id
    }

    pub fn address(&self) -> Address {
        self.id.address()
    }

    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    pub fn hash(&self) -> Digest {
        self.hash
    }

    /// Returns `true` if this index describes exactly the given chunk.
    pub fn matches(&self, chunk: &dyn Chunk) -> bool {
        self.id == chunk.id()
            && self.updated_at == chunk.updated_at()
            && self.hash == chunk.content_hash()
    }

    pub fn encode(&self, enc: &mut Encoder) -> TypeResult<()> {
        self.id.encode(enc)?;
        enc.write(&self.updated_at)?;
        enc.write(&self.hash)
    }

    pub fn decode(dec: &mut Decoder<'_>, registry: &Registry) -> TypeResult<Self> {
        let id = ChunkId::decode(dec, registry)?;
        let updated_at = dec.read()?;
        let hash = dec.read()?;
        Ok(Self {
            id,
            updated_at,
            hash,
        })
    }
}
