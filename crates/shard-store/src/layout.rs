//! On-disk placement of chunks.
//!
//! Every chunk is identified on disk by a 21-byte key: the 20-byte
//! big-endian address followed by the one-byte type tag. The key is
//! rendered through a reversible text encoding; the leading
//! `directory_bits` of the key name the shard directory and the remaining
//! characters name the file inside it.
//!
//! ```text
//! <root>/<shard>/<file>          chunk file: [Index][Chunk]
//! <root>/<shard>/<file>.tmp      in-flight write
//! <root>/.quarantine/<shard>/<file>[.N]
//! ```
//!
//! Neither `.` nor anything after it belongs to an encoding alphabet, so
//! temporary files and the quarantine directory never parse as chunk names.

use std::fmt;
use std::path::PathBuf;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use shard_types::{Address, ChunkId, TypeTag};

use crate::error::{StoreError, StoreResult};

/// Length of a placement key in bytes.
pub const KEY_LEN: usize = Address::BYTES + 1;

/// Name of the quarantine directory under the store root.
pub const QUARANTINE_DIR: &str = ".quarantine";

/// Suffix of in-flight temporary files.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Upper bound on `directory_bits`.
pub const MAX_DIRECTORY_BITS: u32 = 24;

const HEX_ALPHABET: &[u8] = b"0123456789abcdef";
const BASE64_URL_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Reversible text encoding used for shard directory and file names.
///
/// Only [`Hex`](Self::Hex) is case-safe. [`Base64Url`](Self::Base64Url)
/// names differ by letter case alone, so two chunks can map to the same
/// file on a case-insensitive filesystem; use it only on case-sensitive
/// ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameEncoding {
    /// Lowercase hexadecimal, 4 bits per character.
    #[default]
    Hex,
    /// URL-safe unpadded Base64, 6 bits per character. Case-sensitive.
    Base64Url,
}

impl NameEncoding {
    pub fn bits_per_digit(self) -> u32 {
        match self {
            Self::Hex => 4,
            Self::Base64Url => 6,
        }
    }

    fn alphabet(self) -> &'static [u8] {
        match self {
            Self::Hex => HEX_ALPHABET,
            Self::Base64Url => BASE64_URL_ALPHABET,
        }
    }

    pub fn encode(self, bytes: &[u8]) -> String {
        match self {
            Self::Hex => hex::encode(bytes),
            Self::Base64Url => URL_SAFE_NO_PAD.encode(bytes),
        }
    }

    /// Decode `text`, accepting only the canonical form `encode` produces.
    pub fn decode(self, text: &str) -> Option<Vec<u8>> {
        let bytes = match self {
            Self::Hex => hex::decode(text).ok()?,
            Self::Base64Url => URL_SAFE_NO_PAD.decode(text).ok()?,
        };
        (self.encode(&bytes) == text).then_some(bytes)
    }

    fn digit_char(self, value: u64) -> char {
        self.alphabet()[value as usize] as char
    }

    fn digit_value(self, c: char) -> Option<u64> {
        let byte = u8::try_from(c).ok()?;
        self.alphabet().iter().position(|&a| a == byte).map(|p| p as u64)
    }
}

impl fmt::Display for NameEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hex => write!(f, "hex"),
            Self::Base64Url => write!(f, "base64url"),
        }
    }
}

/// Maps identifiers to relative paths and back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    encoding: NameEncoding,
    directory_bits: u32,
}

impl Layout {
    /// Validate and build a layout.
    ///
    /// `directory_bits` must be a positive multiple of the encoding's bits
    /// per digit and at most [`MAX_DIRECTORY_BITS`].
    pub fn new(encoding: NameEncoding, directory_bits: u32) -> StoreResult<Self> {
        let per_digit = encoding.bits_per_digit();
        if directory_bits == 0 || directory_bits > MAX_DIRECTORY_BITS || directory_bits % per_digit != 0 {
            return Err(StoreError::InvalidConfig(format!(
                "directory_bits must be a positive multiple of {per_digit} no greater than \
                 {MAX_DIRECTORY_BITS} for {encoding} names, got {directory_bits}"
            )));
        }
        Ok(Self {
            encoding,
            directory_bits,
        })
    }

    pub fn encoding(&self) -> NameEncoding {
        self.encoding
    }

    pub fn directory_bits(&self) -> u32 {
        self.directory_bits
    }

    /// Characters in a shard directory name.
    pub fn prefix_chars(&self) -> usize {
        (self.directory_bits / self.encoding.bits_per_digit()) as usize
    }

    /// The 21-byte placement key of (address, tag).
    pub fn key_bytes(address: &Address, tag: TypeTag) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        key[..Address::BYTES].copy_from_slice(&address.to_bytes());
        key[Address::BYTES] = tag.0;
        key
    }

    /// Shard prefix (the leading `directory_bits` of the key) of an address.
    pub fn shard_prefix(&self, address: &Address) -> u64 {
        address.prefix(self.directory_bits)
    }

    /// Directory name for a shard prefix.
    pub fn shard_name(&self, prefix: u64) -> String {
        let per_digit = self.encoding.bits_per_digit();
        let mask = (1u64 << per_digit) - 1;
        let chars = self.prefix_chars() as u32;
        (0..chars)
            .map(|i| {
                let shift = per_digit * (chars - 1 - i);
                self.encoding.digit_char((prefix >> shift) & mask)
            })
            .collect()
    }

    /// Parse a shard directory name back to its prefix.
    pub fn parse_shard_name(&self, name: &str) -> Option<u64> {
        if name.len() != self.prefix_chars() {
            return None;
        }
        let per_digit = self.encoding.bits_per_digit();
        name.chars().try_fold(0u64, |acc, c| {
            self.encoding.digit_value(c).map(|d| (acc << per_digit) | d)
        })
    }

    /// (shard directory, file name) of an identifier.
    pub fn names(&self, address: &Address, tag: TypeTag) -> (String, String) {
        let mut full = self.encoding.encode(&Self::key_bytes(address, tag));
        let file = full.split_off(self.prefix_chars());
        (full, file)
    }

    /// Path of `id` relative to the store root.
    pub fn relative_path(&self, id: &ChunkId) -> PathBuf {
        let (shard, file) = self.names(&id.address(), id.tag());
        [shard, file].iter().collect()
    }

    /// Decode a (shard directory, file name) pair back to (address, tag).
    ///
    /// Returns `None` for anything `names` would not have produced, which
    /// includes temporary files.
    pub fn parse_names(&self, shard: &str, file: &str) -> Option<(Address, TypeTag)> {
        if shard.len() != self.prefix_chars() {
            return None;
        }
        let bytes = self.encoding.decode(&format!("{shard}{file}"))?;
        if bytes.len() != KEY_LEN {
            return None;
        }
        let address = Address::from_be_slice(&bytes[..Address::BYTES]);
        Some((address, TypeTag(bytes[Address::BYTES])))
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            encoding: NameEncoding::Hex,
            directory_bits: 8,
        }
    }
}
