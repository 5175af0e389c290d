use shard_types::{Address, Digest};

/// Domain-separated BLAKE3 hasher producing 160-bit digests.
///
/// Each hasher carries a domain tag (e.g. `"shard-content-v1"`) that is
/// prepended to every hash computation, so a chunk's content hash and an
/// address derived from a name with the same bytes never collide. The
/// output is the first 20 bytes of BLAKE3's extendable output.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for chunk content.
    pub const CONTENT: Self = Self {
        domain: "shard-content-v1",
    };
    /// Hasher for deriving addresses from caller-chosen names.
    pub const NAME: Self = Self {
        domain: "shard-name-v1",
    };

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        let mut out = [0u8; 20];
        hasher.finalize_xof().fill(&mut out);
        Digest::from_hash(out)
    }

    /// Hash raw bytes and use the digest as an address.
    pub fn address(&self, data: &[u8]) -> Address {
        Address::from(self.hash(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let data = b"hello world";
        assert_eq!(ContentHasher::CONTENT.hash(data), ContentHasher::CONTENT.hash(data));
    }

    #[test]
    fn different_domains_produce_different_hashes() {
        let data = b"same content";
        assert_ne!(ContentHasher::CONTENT.hash(data), ContentHasher::NAME.hash(data));
    }

    #[test]
    fn digest_is_prefix_of_domain_separated_blake3() {
        let full = blake3::hash(b"shard-content-v1:abc");
        let short = ContentHasher::CONTENT.hash(b"abc");
        assert_eq!(short.as_bytes()[..], full.as_bytes()[..20]);
    }

    #[test]
    fn address_matches_digest_bytes() {
        let digest = ContentHasher::NAME.hash(b"board/general");
        let address = ContentHasher::NAME.address(b"board/general");
        assert_eq!(address.to_bytes(), *digest.as_bytes());
    }
}
