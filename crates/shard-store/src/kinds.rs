use std::any::Any;
use std::sync::{Arc, OnceLock};

use shard_crypto::ContentHasher;
use shard_types::{
    Address, Chunk, ChunkDecode, ChunkId, Decoder, Digest, Encoder, Identifier, IdentifierDecode,
    RegistryBuilder, SharedChunk, Timestamp, TypeResult, TypeTag,
};

/// Conventional tag of [`Blob`] chunks.
pub const BLOB_TAG: TypeTag = TypeTag(1);
/// Conventional tag of [`Named`] chunks.
pub const NAMED_TAG: TypeTag = TypeTag(2);

/// Register [`Blob`] and [`Named`] under their conventional tags.
pub fn register_builtin(builder: &mut RegistryBuilder) -> TypeResult<()> {
    builder
        .register_type::<Blob, ContentId>(BLOB_TAG)?
        .register_type::<Named, NameId>(NAMED_TAG)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Blob
// ---------------------------------------------------------------------------

/// Identifier of a content-addressed chunk: the address is the content digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentId {
    tag: TypeTag,
    address: Address,
}

impl ContentId {
    pub fn new(tag: TypeTag, address: Address) -> Self {
        Self { tag, address }
    }

    /// Identifier of the blob that would hold `data`.
    pub fn for_content(tag: TypeTag, data: &[u8]) -> Self {
        Self::new(tag, Address::from(ContentHasher::CONTENT.hash(data)))
    }
}

impl Identifier for ContentId {
    fn tag(&self) -> TypeTag {
        self.tag
    }

    fn address(&self) -> Address {
        self.address
    }

    fn encode(&self, enc: &mut Encoder) -> TypeResult<()> {
        enc.write(&self.address)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl IdentifierDecode for ContentId {
    const KIND: &'static str = "content-id";

    fn decode(dec: &mut Decoder<'_>, tag: TypeTag) -> TypeResult<Self> {
        Ok(Self {
            tag,
            address: dec.read()?,
        })
    }
}

/// Raw content addressed by its own digest.
///
/// Writing the same bytes twice always lands on the same file; only the
/// update time can differ.
#[derive(Debug)]
pub struct Blob {
    id: ContentId,
    hash: Digest,
    updated_at: Timestamp,
    data: Vec<u8>,
}

impl Blob {
    pub fn new(tag: TypeTag, data: Vec<u8>) -> Self {
        Self::with_timestamp(tag, data, Timestamp::now())
    }

    pub fn with_timestamp(tag: TypeTag, data: Vec<u8>, updated_at: Timestamp) -> Self {
        let hash = ContentHasher::CONTENT.hash(&data);
        Self {
            id: ContentId::new(tag, Address::from(hash)),
            hash,
            updated_at,
            data,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn shared(self) -> SharedChunk {
        Arc::new(self)
    }
}

impl Chunk for Blob {
    fn id(&self) -> ChunkId {
        ChunkId::new(self.id.clone())
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn content_hash(&self) -> Digest {
        self.hash
    }

    fn encode(&self, enc: &mut Encoder) -> TypeResult<()> {
        enc.write(&self.updated_at)?;
        enc.write(&self.data)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ChunkDecode for Blob {
    const KIND: &'static str = "blob";

    fn decode(dec: &mut Decoder<'_>, tag: TypeTag) -> TypeResult<Self> {
        let updated_at = dec.read()?;
        let data = dec.read()?;
        Ok(Self::with_timestamp(tag, data, updated_at))
    }
}

// ---------------------------------------------------------------------------
// Named
// ---------------------------------------------------------------------------

/// Identifier whose address is derived from a caller-chosen name.
///
/// The name travels with the identifier but does not take part in
/// equality: two names colliding on the same address are the same chunk.
#[derive(Clone, Debug)]
pub struct NameId {
    tag: TypeTag,
    name: String,
    address: Address,
}

impl NameId {
    pub fn new(tag: TypeTag, name: impl Into<String>) -> Self {
        let name = name.into();
        let address = ContentHasher::NAME.address(name.as_bytes());
        Self { tag, name, address }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chunk_id(&self) -> ChunkId {
        ChunkId::new(self.clone())
    }
}

impl Identifier for NameId {
    fn tag(&self) -> TypeTag {
        self.tag
    }

    fn address(&self) -> Address {
        self.address
    }

    fn encode(&self, enc: &mut Encoder) -> TypeResult<()> {
        enc.write(&self.name)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl IdentifierDecode for NameId {
    const KIND: &'static str = "name-id";

    fn decode(dec: &mut Decoder<'_>, tag: TypeTag) -> TypeResult<Self> {
        let name: String = dec.read()?;
        Ok(Self::new(tag, name))
    }
}

/// A named, replaceable record with an opaque payload.
///
/// Successive writes under the same name replace the record whole.
#[derive(Debug)]
pub struct Named {
    id: NameId,
    updated_at: Timestamp,
    payload: Vec<u8>,
    hash: OnceLock<Digest>,
}

impl Named {
    pub fn new(tag: TypeTag, name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::with_timestamp(NameId::new(tag, name), payload, Timestamp::now())
    }

    pub fn with_timestamp(id: NameId, payload: Vec<u8>, updated_at: Timestamp) -> Self {
        Self {
            id,
            updated_at,
            payload,
            hash: OnceLock::new(),
        }
    }

    /// A record whose payload is a little-endian `u64` counter.
    pub fn counter(tag: TypeTag, name: impl Into<String>, value: u64) -> Self {
        Self::new(tag, name, value.to_le_bytes().to_vec())
    }

    /// The counter value, if the payload is exactly eight bytes.
    pub fn counter_value(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.payload.as_slice().try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    /// A replacement record under the same name, stamped now.
    pub fn replaced(&self, payload: Vec<u8>) -> Self {
        Self::with_timestamp(self.id.clone(), payload, Timestamp::now())
    }

    pub fn name_id(&self) -> &NameId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn shared(self) -> SharedChunk {
        Arc::new(self)
    }
}

impl Chunk for Named {
    fn id(&self) -> ChunkId {
        self.id.chunk_id()
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn content_hash(&self) -> Digest {
        *self
            .hash
            .get_or_init(|| ContentHasher::CONTENT.hash(&self.payload))
    }

    fn encode(&self, enc: &mut Encoder) -> TypeResult<()> {
        enc.write(self.id.name())?;
        enc.write(&self.updated_at)?;
        enc.write(&self.payload)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ChunkDecode for Named {
    const KIND: &'static str = "named";

    fn decode(dec: &mut Decoder<'_>, tag: TypeTag) -> TypeResult<Self> {
        let name: String = dec.read()?;
        let updated_at = dec.read()?;
        let payload = dec.read()?;
        Ok(Self::with_timestamp(NameId::new(tag, name), payload, updated_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_chunk(chunk: &dyn Chunk) -> Vec<u8> {
        let mut enc = Encoder::new();
        chunk.encode(&mut enc).unwrap();
        enc.into_bytes()
    }

    #[test]
    fn blob_address_is_content_digest() {
        let blob = Blob::new(BLOB_TAG, b"hello".to_vec());
        let expected = ContentId::for_content(BLOB_TAG, b"hello");
        assert_eq!(blob.id(), ChunkId::new(expected));
        assert_eq!(blob.content_hash(), ContentHasher::CONTENT.hash(b"hello"));
    }

    #[test]
    fn same_name_same_id_regardless_of_payload() {
        let a = Named::new(NAMED_TAG, "alpha", vec![1]);
        let b = Named::new(NAMED_TAG, "alpha", vec![2]);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn named_decode_restores_fields() {
        let original = Named::with_timestamp(
            NameId::new(NAMED_TAG, "config/main"),
            b"payload".to_vec(),
            Timestamp::from_millis(99),
        );
        let bytes = encode_chunk(&original);
        let decoded = Named::decode(&mut Decoder::new(&bytes, 1024), NAMED_TAG).unwrap();
        assert_eq!(decoded.name(), "config/main");
        assert_eq!(decoded.payload(), b"payload");
        assert_eq!(decoded.updated_at(), Timestamp::from_millis(99));
        assert_eq!(decoded.id(), original.id());
    }

    #[test]
    fn blob_decode_keeps_address() {
        let original = Blob::with_timestamp(BLOB_TAG, vec![7; 32], Timestamp::from_millis(5));
        let bytes = encode_chunk(&original);
        let decoded = Blob::decode(&mut Decoder::new(&bytes, 1024), BLOB_TAG).unwrap();
        assert_eq!(decoded.id(), original.id());
        assert_eq!(decoded.data(), original.data());
    }

    #[test]
    fn counter_helpers() {
        let c = Named::counter(NAMED_TAG, "hits", 41);
        assert_eq!(c.counter_value(), Some(41));
        let next = c.replaced(42u64.to_le_bytes().to_vec());
        assert_eq!(next.counter_value(), Some(42));
        assert_eq!(next.id(), c.id());
        assert_eq!(Named::new(NAMED_TAG, "x", vec![1, 2]).counter_value(), None);
    }

    #[test]
    fn builtin_registration() {
        let mut builder = RegistryBuilder::new();
        register_builtin(&mut builder).unwrap();
        let registry = builder.freeze();
        assert_eq!(registry.chunk_kind(BLOB_TAG).unwrap().name(), "blob");
        assert_eq!(registry.id_kind(NAMED_TAG).unwrap().name(), "name-id");
    }
}
